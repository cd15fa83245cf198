//! Structured logging configuration.

use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info";

/// Filter used by `--verbose`.
const VERBOSE_FILTER: &str = "debug";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Parses a format name, falling back to [`LogFormat::Pretty`].
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Logging configuration, built by the binary and handed to
/// [`init_logging`](super::init_logging).
#[derive(Debug)]
pub struct LoggingConfig {
    /// Event filter.
    pub filter: EnvFilter,
    /// Output format.
    pub format: LogFormat,
    /// Append to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    /// Builds a configuration from `RUST_LOG`, `METRICSTORE_LOG_FORMAT` and
    /// `METRICSTORE_LOG_FILE`.
    ///
    /// `verbose` raises the default level to `debug`; an explicit `RUST_LOG` still wins.
    #[must_use]
    pub fn from_env(verbose: bool) -> Self {
        Self::from_lookup(verbose, |key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable lookup.
    #[must_use]
    pub fn from_lookup(verbose: bool, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default_directive = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
        let filter = lookup("RUST_LOG")
            .and_then(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new(default_directive));
        let format = lookup("METRICSTORE_LOG_FORMAT")
            .map(|s| LogFormat::parse(&s))
            .unwrap_or_default();
        let file = lookup("METRICSTORE_LOG_FILE")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Self {
            filter,
            format,
            file,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: EnvFilter::new(DEFAULT_FILTER),
            format: LogFormat::default(),
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("unknown"), LogFormat::Pretty);
    }

    #[test]
    fn test_verbose_default_filter() {
        let config = LoggingConfig::from_lookup(true, |_| None);
        assert_eq!(config.filter.to_string(), "debug");
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.file.is_none());
    }

    #[test]
    fn test_rust_log_wins_over_verbose() {
        let config = LoggingConfig::from_lookup(true, |key| match key {
            "RUST_LOG" => Some("warn".to_string()),
            "METRICSTORE_LOG_FORMAT" => Some("json".to_string()),
            "METRICSTORE_LOG_FILE" => Some("/var/log/metricstore.log".to_string()),
            _ => None,
        });
        assert_eq!(config.filter.to_string(), "warn");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file, Some(PathBuf::from("/var/log/metricstore.log")));
    }
}
