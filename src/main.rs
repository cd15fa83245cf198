//! Binary entry point for metricstore.
//!
//! Opens the configured storage backend for the collector and keeps it alive until
//! interrupted, or runs one-shot maintenance commands against it.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use metricstore::config::{StorageConfig, parse_store_interval};
use metricstore::observability::{self, LoggingConfig};
use metricstore::storage::open_storage;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Metricstore - storage engine for the metrics collector.
#[derive(Parser)]
#[command(name = "metricstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Relational database DSN (selects the PostgreSQL backend).
    #[arg(short = 'd', long = "database-dsn", global = true)]
    database_dsn: Option<String>,

    /// Dump log path (empty disables file persistence).
    #[arg(short = 'f', long = "file-storage-path", global = true)]
    file_storage_path: Option<PathBuf>,

    /// Dump flush interval in seconds (0 flushes every write).
    #[arg(short = 'i', long = "store-interval", global = true, value_parser = parse_interval_arg)]
    store_interval: Option<Duration>,

    /// Replay the dump log at startup.
    #[arg(short = 'r', long, global = true)]
    restore: Option<bool>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Open the backend and hold it until Ctrl-C, then shut down gracefully.
    Serve,

    /// Print every counter and gauge as JSON.
    Inspect,

    /// Check that the backend is reachable.
    Ping,
}

fn parse_interval_arg(value: &str) -> Result<Duration, String> {
    parse_store_interval(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if let Err(e) = observability::init_logging(LoggingConfig::from_env(cli.verbose)) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        },
    };

    match run_command(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

/// Layers defaults, config file, environment and flags.
fn load_config(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let base = match &cli.config {
        Some(path) => StorageConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StorageConfig::default(),
    };
    let mut config = base.with_env_overrides()?;

    if let Some(dsn) = &cli.database_dsn {
        config = config.with_database_dsn(dsn.clone());
    }
    if let Some(path) = &cli.file_storage_path {
        config = config.with_file_storage_path(path.clone());
    }
    if let Some(interval) = cli.store_interval {
        config = config.with_store_interval(interval);
    }
    if let Some(restore) = cli.restore {
        config = config.with_restore(restore);
    }
    Ok(config)
}

/// Runs the selected command.
async fn run_command(command: Commands, config: StorageConfig) -> anyhow::Result<()> {
    match command {
        Commands::Serve => cmd_serve(&config).await,
        Commands::Inspect => cmd_inspect(&config).await,
        Commands::Ping => cmd_ping(&config).await,
    }
}

async fn cmd_serve(config: &StorageConfig) -> anyhow::Result<()> {
    let storage = open_storage(config)
        .await
        .context("storage failed to start")?;
    tracing::info!(backend = storage.backend_name(), "Metrics storage ready");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    storage.close().await.context("closing storage")?;
    Ok(())
}

async fn cmd_inspect(config: &StorageConfig) -> anyhow::Result<()> {
    let storage = open_storage(config)
        .await
        .context("storage failed to start")?;

    let mut counters = storage.get_counters().await?;
    let mut gauges = storage.get_gauges().await?;
    counters.sort_by(|a, b| a.name.cmp(&b.name));
    gauges.sort_by(|a, b| a.name.cmp(&b.name));

    let snapshot = serde_json::json!({
        "backend": storage.backend_name(),
        "counters": counters,
        "gauges": gauges,
    });
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    storage.close().await?;
    Ok(())
}

async fn cmd_ping(config: &StorageConfig) -> anyhow::Result<()> {
    let storage = open_storage(config)
        .await
        .context("storage failed to start")?;
    storage.ping().await.context("ping failed")?;
    println!("{}: ok", storage.backend_name());
    storage.close().await?;
    Ok(())
}
