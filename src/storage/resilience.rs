//! Connection retry with exponential backoff.
//!
//! Backends that talk to a remote server acquire their first connection through
//! [`retry_connection`]. Only errors classified as retryable by
//! [`is_retryable_storage_error`] are retried; anything else is returned immediately.
//!
//! ```text
//! attempt 1 --fail--> sleep base --> attempt 2 --fail--> sleep 2*base --> ... --> give up
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use metricstore::storage::resilience::{ConnectionRetryConfig, retry_connection};
//!
//! let config = ConnectionRetryConfig::default().with_overrides_from(|k| std::env::var(k).ok())?;
//! let client = retry_connection(&config, "postgres", "connect", || async {
//!     pool.get().await.map_err(map_pool_error)
//! })
//! .await?;
//! ```

use crate::{Error, Result};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

/// Retry configuration for connection acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionRetryConfig {
    /// Retries after the first attempt (the ceiling).
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for ConnectionRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
        }
    }
}

impl ConnectionRetryConfig {
    /// Applies `METRICSTORE_DB_MAX_RETRIES` and `METRICSTORE_DB_RETRY_BASE_MS` from
    /// `lookup`, which maps a variable name to its value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if a value is set but unparseable.
    pub fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        if let Some(v) = lookup("METRICSTORE_DB_MAX_RETRIES") {
            self.max_retries = parse_env("METRICSTORE_DB_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("METRICSTORE_DB_RETRY_BASE_MS") {
            self.base_delay_ms = parse_env("METRICSTORE_DB_RETRY_BASE_MS", &v)?;
        }
        Ok(self)
    }

    /// Sets the retry ceiling.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the base delay in milliseconds.
    #[must_use]
    pub const fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// Formula: `base_delay_ms * 2^(attempt - 1)`, capped at `max_delay_ms`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let ms = self
            .base_delay_ms
            .saturating_mul(1 << (attempt - 1).min(16))
            .min(self.max_delay_ms.max(self.base_delay_ms));
        Duration::from_millis(ms)
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::InvalidInput(format!("{key} '{value}': {e}")))
}

/// Returns `true` for errors worth retrying (the backend could not be reached).
#[must_use]
pub const fn is_retryable_storage_error(err: &Error) -> bool {
    matches!(err, Error::ConnectionFailure { .. })
}

/// Runs `call` until it succeeds, fails with a non-retryable error, or the retry
/// ceiling is reached.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last retryable error once
/// `config.max_retries` retries have been spent.
pub async fn retry_connection<T, F, Fut>(
    config: &ConnectionRetryConfig,
    backend: &'static str,
    operation: &'static str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match call().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(backend, operation, attempt, "Connection established after retry");
                }
                return Ok(value);
            },
            Err(err) if is_retryable_storage_error(&err) && attempt < config.max_retries => {
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                tracing::warn!(
                    backend,
                    operation,
                    attempt,
                    max_retries = config.max_retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Connection failed, retrying"
                );
                metrics::counter!(
                    "metricstore_connection_retries_total",
                    "backend" => backend,
                    "operation" => operation
                )
                .increment(1);
                tokio::time::sleep(delay).await;
            },
            Err(err) => {
                tracing::error!(backend, operation, attempt, error = %err, "Connection failed");
                return Err(err);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn connection_error() -> Error {
        Error::ConnectionFailure {
            operation: "connect".to_string(),
            cause: "connection refused".to_string(),
        }
    }

    fn fast_config(max_retries: u32) -> ConnectionRetryConfig {
        ConnectionRetryConfig::default()
            .with_max_retries(max_retries)
            .with_base_delay_ms(1)
    }

    /// Returns a call that fails with `err` for the first `failures` attempts.
    fn flaky(
        calls: Arc<AtomicU32>,
        failures: u32,
        err: fn() -> Error,
    ) -> impl FnMut() -> std::future::Ready<Result<u32>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if n < failures { Err(err()) } else { Ok(n) })
        }
    }

    #[test]
    fn test_config_default_values() {
        let config = ConnectionRetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 1_000);
        assert_eq!(config.max_delay_ms, 5_000);
    }

    #[test]
    fn test_overrides_apply_parsed_values() {
        let config = ConnectionRetryConfig::default()
            .with_overrides_from(|key| match key {
                "METRICSTORE_DB_MAX_RETRIES" => Some("7".to_string()),
                "METRICSTORE_DB_RETRY_BASE_MS" => Some(" 250 ".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.max_retries, 7);
        assert_eq!(config.base_delay_ms, 250);
        assert_eq!(config.max_delay_ms, 5_000);
    }

    #[test_case::test_case("METRICSTORE_DB_MAX_RETRIES", "many" ; "max retries not a number")]
    #[test_case::test_case("METRICSTORE_DB_MAX_RETRIES", "-1" ; "negative max retries")]
    #[test_case::test_case("METRICSTORE_DB_RETRY_BASE_MS", "1.5" ; "fractional base delay")]
    fn test_unparseable_override_is_rejected(key: &'static str, value: &'static str) {
        let result = ConnectionRetryConfig::default()
            .with_overrides_from(|k| (k == key).then(|| value.to_string()));

        let err = result.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(err.to_string().contains(key));
    }

    #[test]
    fn test_delay_grows_exponentially_and_caps() {
        let config = ConnectionRetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1_000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(2_000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(4_000));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(5_000));
        assert_eq!(config.delay_for_attempt(40), Duration::from_millis(5_000));
    }

    #[test]
    fn test_only_connection_failures_are_retryable() {
        assert!(is_retryable_storage_error(&connection_error()));
        assert!(!is_retryable_storage_error(&Error::InvalidInput("x".into())));
        assert!(!is_retryable_storage_error(&Error::OperationFailed {
            operation: "query".into(),
            cause: "syntax error".into(),
        }));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures_below_ceiling() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry_connection(
            &fast_config(3),
            "test",
            "connect",
            flaky(Arc::clone(&calls), 3, connection_error),
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_gives_up_at_ceiling() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry_connection(
            &fast_config(2),
            "test",
            "connect",
            flaky(Arc::clone(&calls), 10, connection_error),
        )
        .await;

        assert!(matches!(result, Err(Error::ConnectionFailure { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry_connection(
            &fast_config(5),
            "test",
            "connect",
            flaky(Arc::clone(&calls), 10, || {
                Error::OperationFailed {
                    operation: "auth".into(),
                    cause: "password authentication failed".into(),
                }
            }),
        )
        .await;

        assert!(matches!(result, Err(Error::OperationFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_ceiling_tries_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry_connection(
            &fast_config(0),
            "test",
            "connect",
            flaky(Arc::clone(&calls), 1, connection_error),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
