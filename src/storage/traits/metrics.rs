//! Metrics storage trait.

use super::TxOp;
use crate::models::{Counter, Gauge};
use crate::Result;
use async_trait::async_trait;

/// Contract every storage backend satisfies.
///
/// Backends are shared across request handlers behind an `Arc<dyn MetricsStorage>`.
/// Every method is a future: dropping it cancels the call, and callers apply deadlines
/// with `tokio::time::timeout`.
///
/// # Transactions
///
/// [`tx`](Self::tx) applies a batch of [`TxOp`]s against one consistency boundary. Every
/// backend in this crate treats a batch as all-or-nothing: the memory backend keeps an
/// undo journal for the duration of the batch, the relational backend uses a database
/// transaction. When an op fails, earlier ops of the batch are rolled back and the
/// error is returned as [`Error::TransactionFailure`](crate::Error::TransactionFailure).
#[async_trait]
pub trait MetricsStorage: Send + Sync {
    /// Overwrites the gauge `name` with `value`.
    async fn create_or_update_gauge(&self, name: &str, value: f64) -> Result<()>;

    /// Adds `delta` to the counter `name`, creating it at zero if absent.
    ///
    /// Concurrent calls for the same name are serialized; every successful call is
    /// reflected exactly once.
    async fn increment_counter(&self, name: &str, delta: i64) -> Result<()>;

    /// Returns the counter `name`, or [`Error::NotFound`](crate::Error::NotFound).
    async fn get_counter(&self, name: &str) -> Result<Counter>;

    /// Returns the gauge `name`, or [`Error::NotFound`](crate::Error::NotFound).
    async fn get_gauge(&self, name: &str) -> Result<Gauge>;

    /// Returns every counter. Order is not significant.
    async fn get_counters(&self) -> Result<Vec<Counter>>;

    /// Returns every gauge. Order is not significant.
    async fn get_gauges(&self) -> Result<Vec<Gauge>>;

    /// Applies `ops` as a single atomic batch.
    async fn tx(&self, ops: Vec<TxOp>) -> Result<()>;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Releases background resources (dump pipeline, connection pool).
    ///
    /// Writes accepted before `close` returns are durable for backends that persist.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Short backend name used in logs.
    fn backend_name(&self) -> &'static str;
}
