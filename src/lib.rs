//! # Metricstore
//!
//! Storage engine for a metrics collector.
//!
//! Agents push counter and gauge samples to the collector, which keeps them in one of
//! three interchangeable backends behind the [`MetricsStorage`] contract:
//!
//! - **Memory**: lock-protected maps, lost on restart
//! - **Persistent**: memory backend plus an append-only JSON log, replayed on boot
//! - **PostgreSQL**: relational tables with upserts and native transactions
//!
//! ## Example
//!
//! ```rust,ignore
//! use metricstore::config::StorageConfig;
//! use metricstore::storage::open_storage;
//!
//! let storage = open_storage(&StorageConfig::default().with_env_overrides()?).await?;
//! storage.increment_counter("requests_total", 1).await?;
//! storage.create_or_update_gauge("cpu_load", 0.42).await?;
//! storage.close().await?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

pub mod config;
pub mod models;
pub mod observability;
pub mod storage;

pub use config::{BackendSelection, StorageConfig};
pub use models::{Counter, Gauge, MetricKind, PersistedRecord};
pub use storage::{
    MemoryStorage, MetricsStorage, PersistentStorage, PostgresStorage, Transaction, TxOp,
    open_storage,
};

/// Error type for metricstore operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `NotFound` | Reading a counter or gauge name that was never written |
/// | `ConnectionFailure` | Database unreachable, connection dropped, pool timed out |
/// | `SerializationFailure` | Malformed dump-log line, JSON encode failure |
/// | `TransactionFailure` | One operation of a `tx` batch failed (carries the cause) |
/// | `OperationFailed` | I/O errors, query errors, migration errors |
/// | `InvalidInput` | Bad configuration values, counter overflow |
/// | `FeatureNotEnabled` | Relational backend requested without the `postgres` feature |
#[derive(Debug, ThisError)]
pub enum Error {
    /// The requested metric does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Kind of the metric that was looked up.
        kind: MetricKind,
        /// Name of the metric.
        name: String,
    },

    /// The backend could not be reached.
    ///
    /// Retryable for the relational backend (see `storage::retry_connection`).
    #[error("connection failure during '{operation}': {cause}")]
    ConnectionFailure {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// A record could not be encoded or decoded.
    #[error("serialization failure during '{operation}': {cause}")]
    SerializationFailure {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// An operation inside a transaction failed; the batch was aborted.
    #[error("transaction aborted: {source}")]
    TransactionFailure {
        /// The error returned by the failing operation.
        #[source]
        source: Box<Self>,
    },

    /// An operation failed.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Feature not enabled (requires feature flag).
    #[error("feature not enabled: {0} (compile with --features {0})")]
    FeatureNotEnabled(String),
}

impl Error {
    /// Wraps an error as the cause of an aborted transaction.
    ///
    /// Errors that are already `TransactionFailure` are returned unchanged.
    #[must_use]
    pub fn transaction(cause: Self) -> Self {
        match cause {
            Self::TransactionFailure { .. } => cause,
            other => Self::TransactionFailure {
                source: Box::new(other),
            },
        }
    }

    /// Returns `true` for `NotFound`.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type alias for metricstore operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotFound {
            kind: MetricKind::Counter,
            name: "hits".to_string(),
        };
        assert_eq!(err.to_string(), "counter 'hits' not found");

        let err = Error::OperationFailed {
            operation: "test".to_string(),
            cause: "failed".to_string(),
        };
        assert_eq!(err.to_string(), "operation 'test' failed: failed");

        let err = Error::transaction(Error::InvalidInput("bad".to_string()));
        assert_eq!(err.to_string(), "transaction aborted: invalid input: bad");
    }

    #[test]
    fn test_transaction_does_not_double_wrap() {
        let inner = Error::transaction(Error::InvalidInput("x".to_string()));
        let outer = Error::transaction(inner);
        match outer {
            Error::TransactionFailure { source } => {
                assert!(matches!(*source, Error::InvalidInput(_)));
            },
            other => panic!("unexpected error: {other}"),
        }
    }
}
