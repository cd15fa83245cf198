//! Configuration management.
//!
//! Values are layered, lowest precedence first:
//!
//! 1. Built-in defaults
//! 2. Optional TOML file (`--config`)
//! 3. Environment: `DATABASE_DSN`, `FILE_STORAGE_PATH`, `STORE_INTERVAL` (seconds),
//!    `RESTORE`, plus the retry overrides read by
//!    [`ConnectionRetryConfig`](crate::storage::resilience::ConnectionRetryConfig)
//! 4. Command-line flags, applied by the binary
//!
//! ```toml
//! database_dsn = "postgres://collector@localhost/metrics"
//! file_storage_path = "/var/lib/metricstore/metrics.json"
//! store_interval_secs = 0
//! restore = true
//!
//! [postgres]
//! pool_max_size = 10
//! table_prefix = "metrics"
//!
//! [retry]
//! max_retries = 5
//! ```

use crate::storage::postgresql::{DEFAULT_POOL_MAX_SIZE, DEFAULT_TABLE_PREFIX, PostgresOptions};
use crate::storage::resilience::ConnectionRetryConfig;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default dump log location.
pub const DEFAULT_FILE_STORAGE_PATH: &str = "/tmp/metrics-db.json";

/// Default flush interval for the dump log.
pub const DEFAULT_STORE_INTERVAL: Duration = Duration::from_secs(300);

/// Storage engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Relational DSN. Selects the PostgreSQL backend when set.
    pub database_dsn: Option<String>,
    /// Dump log path. `None` disables file persistence.
    pub file_storage_path: Option<PathBuf>,
    /// Flush interval for the dump log. Zero flushes every write.
    pub store_interval: Duration,
    /// Replay the dump log at startup.
    pub restore: bool,
    /// Maximum pooled relational connections.
    pub pool_max_size: usize,
    /// Prefix for relational table names.
    pub table_prefix: String,
    /// Retry policy for the first relational connection.
    pub retry: ConnectionRetryConfig,
}

/// Backend chosen for a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSelection {
    /// PostgreSQL at `dsn`.
    Postgres {
        /// Connection string.
        dsn: String,
    },
    /// Memory storage with a dump log.
    Persistent {
        /// Dump log path.
        path: PathBuf,
        /// Flush interval (zero is synchronous).
        store_interval: Duration,
        /// Replay the log before serving.
        restore: bool,
    },
    /// Plain memory storage.
    Memory,
}

impl BackendSelection {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Postgres { .. } => "postgres",
            Self::Persistent { .. } => "persistent",
            Self::Memory => "memory",
        }
    }
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Relational DSN.
    pub database_dsn: Option<String>,
    /// Dump log path (empty disables).
    pub file_storage_path: Option<String>,
    /// Flush interval in seconds.
    pub store_interval_secs: Option<u64>,
    /// Restore at startup.
    pub restore: Option<bool>,
    /// Relational pool section.
    pub postgres: Option<ConfigFilePostgres>,
    /// Connection retry section.
    pub retry: Option<ConnectionRetryConfig>,
}

/// Postgres section in config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFilePostgres {
    /// Maximum pooled connections.
    pub pool_max_size: Option<usize>,
    /// Table prefix.
    pub table_prefix: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_dsn: None,
            file_storage_path: Some(PathBuf::from(DEFAULT_FILE_STORAGE_PATH)),
            store_interval: DEFAULT_STORE_INTERVAL,
            restore: true,
            pool_max_size: DEFAULT_POOL_MAX_SIZE,
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            retry: ConnectionRetryConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a TOML file on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
            operation: "read_config_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;

        let file: ConfigFile = toml::from_str(&contents).map_err(|e| Error::InvalidInput(
            format!("{}: {e}", path.display()),
        ))?;

        Ok(Self::default().merge_file(file))
    }

    fn merge_file(mut self, file: ConfigFile) -> Self {
        if let Some(dsn) = file.database_dsn {
            self = self.with_database_dsn(dsn);
        }
        if let Some(path) = file.file_storage_path {
            self = self.with_file_storage_path(path);
        }
        if let Some(secs) = file.store_interval_secs {
            self.store_interval = Duration::from_secs(secs);
        }
        if let Some(restore) = file.restore {
            self.restore = restore;
        }
        if let Some(postgres) = file.postgres {
            if let Some(size) = postgres.pool_max_size {
                self.pool_max_size = size;
            }
            if let Some(prefix) = postgres.table_prefix {
                self.table_prefix = prefix;
            }
        }
        if let Some(retry) = file.retry {
            self.retry = retry;
        }
        self
    }

    /// Applies overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if a variable is set but unparseable.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if a value is set but unparseable.
    pub fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        if let Some(dsn) = lookup("DATABASE_DSN") {
            self = self.with_database_dsn(dsn);
        }
        if let Some(path) = lookup("FILE_STORAGE_PATH") {
            self = self.with_file_storage_path(path);
        }
        if let Some(interval) = lookup("STORE_INTERVAL") {
            self.store_interval = parse_store_interval(&interval)?;
        }
        if let Some(restore) = lookup("RESTORE") {
            self.restore = parse_bool("RESTORE", &restore)?;
        }
        self.retry = self.retry.with_overrides_from(&lookup)?;
        Ok(self)
    }

    /// Sets the relational DSN. An empty string clears it.
    #[must_use]
    pub fn with_database_dsn(mut self, dsn: impl Into<String>) -> Self {
        let dsn = dsn.into();
        self.database_dsn = if dsn.trim().is_empty() { None } else { Some(dsn) };
        self
    }

    /// Sets the dump log path. An empty path disables file persistence.
    #[must_use]
    pub fn with_file_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.file_storage_path = if path.as_os_str().is_empty() { None } else { Some(path) };
        self
    }

    /// Sets the flush interval.
    #[must_use]
    pub const fn with_store_interval(mut self, interval: Duration) -> Self {
        self.store_interval = interval;
        self
    }

    /// Sets restore-on-start.
    #[must_use]
    pub const fn with_restore(mut self, restore: bool) -> Self {
        self.restore = restore;
        self
    }

    /// Options for the relational backend.
    #[must_use]
    pub fn postgres_options(&self) -> PostgresOptions {
        PostgresOptions {
            table_prefix: self.table_prefix.clone(),
            pool_max_size: self.pool_max_size,
            retry: self.retry.clone(),
        }
    }

    /// The backend this configuration selects, without opening anything.
    ///
    /// A DSN wins over a file path; neither means plain memory.
    #[must_use]
    pub fn selection(&self) -> BackendSelection {
        if let Some(dsn) = &self.database_dsn {
            return BackendSelection::Postgres { dsn: dsn.clone() };
        }
        if let Some(path) = &self.file_storage_path {
            return BackendSelection::Persistent {
                path: path.clone(),
                store_interval: self.store_interval,
                restore: self.restore,
            };
        }
        BackendSelection::Memory
    }
}

/// Parses a store interval in whole seconds, optionally suffixed with `s`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for anything else.
pub fn parse_store_interval(value: &str) -> Result<Duration> {
    let trimmed = value.trim();
    let digits = trimmed.strip_suffix('s').unwrap_or(trimmed);
    digits
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| Error::InvalidInput(format!("STORE_INTERVAL '{value}': {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidInput(format!("{key} '{value}' is not a boolean"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use test_case::test_case;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_select_persistent() {
        let config = StorageConfig::default();
        assert_eq!(
            config.selection(),
            BackendSelection::Persistent {
                path: PathBuf::from(DEFAULT_FILE_STORAGE_PATH),
                store_interval: Duration::from_secs(300),
                restore: true,
            }
        );
    }

    #[test]
    fn test_dsn_wins_over_path() {
        let config = StorageConfig::default().with_database_dsn("postgres://localhost/m");
        assert_eq!(
            config.selection(),
            BackendSelection::Postgres {
                dsn: "postgres://localhost/m".to_string()
            }
        );
    }

    #[test]
    fn test_empty_path_selects_memory() {
        let config = StorageConfig::default().with_file_storage_path("");
        assert_eq!(config.selection(), BackendSelection::Memory);
        assert_eq!(config.selection().name(), "memory");
    }

    #[test]
    fn test_env_overrides() {
        let config = StorageConfig::default()
            .with_overrides_from(env(&[
                ("FILE_STORAGE_PATH", "/var/lib/m.json"),
                ("STORE_INTERVAL", "0"),
                ("RESTORE", "false"),
            ]))
            .unwrap();

        assert_eq!(config.file_storage_path, Some(PathBuf::from("/var/lib/m.json")));
        assert_eq!(config.store_interval, Duration::ZERO);
        assert!(!config.restore);
        assert_eq!(config.database_dsn, None);
    }

    #[test]
    fn test_empty_dsn_env_is_ignored() {
        let config = StorageConfig::default()
            .with_overrides_from(env(&[("DATABASE_DSN", "  ")]))
            .unwrap();
        assert_eq!(config.database_dsn, None);
    }

    #[test]
    fn test_bad_env_value_is_rejected() {
        let result = StorageConfig::default().with_overrides_from(env(&[("RESTORE", "maybe")]));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_retry_env_goes_through_same_layer() {
        let config = StorageConfig::default()
            .with_overrides_from(env(&[("METRICSTORE_DB_MAX_RETRIES", "9")]))
            .unwrap();
        assert_eq!(config.retry.max_retries, 9);

        let result = StorageConfig::default()
            .with_overrides_from(env(&[("METRICSTORE_DB_RETRY_BASE_MS", "soon")]));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test_case("300", 300 ; "plain seconds")]
    #[test_case("10s", 10 ; "suffixed")]
    #[test_case(" 0 ", 0 ; "padded zero")]
    fn test_parse_store_interval(input: &str, secs: u64) {
        assert_eq!(parse_store_interval(input).unwrap(), Duration::from_secs(secs));
    }

    #[test_case("-1" ; "negative")]
    #[test_case("5m" ; "minutes")]
    #[test_case("" ; "empty")]
    fn test_parse_store_interval_rejects(input: &str) {
        assert!(parse_store_interval(input).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "store_interval_secs = 5\nrestore = false\n\n[postgres]\ntable_prefix = \"acme\"\n\n[retry]\nmax_retries = 7"
        )
        .unwrap();

        let config = StorageConfig::load_from_file(file.path()).unwrap();

        assert_eq!(config.store_interval, Duration::from_secs(5));
        assert!(!config.restore);
        assert_eq!(config.table_prefix, "acme");
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.pool_max_size, DEFAULT_POOL_MAX_SIZE);
    }

    #[test]
    fn test_unknown_file_key_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "stroe_interval_secs = 5").unwrap();

        assert!(matches!(
            StorageConfig::load_from_file(file.path()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_postgres_options_follow_config() {
        let mut config = StorageConfig::default();
        config.table_prefix = "ci".to_string();
        config.pool_max_size = 4;

        let options = config.postgres_options();

        assert_eq!(options.table_prefix, "ci");
        assert_eq!(options.pool_max_size, 4);
    }
}
