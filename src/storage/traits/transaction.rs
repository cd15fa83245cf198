//! Transaction handle and batch operations.
//!
//! Instead of flagging "transaction in progress" on some ambient context, a batch op
//! receives an explicit `&mut dyn Transaction`. Writes made through the handle run
//! inside the batch's consistency boundary without touching the backend's own lock.
//!
//! ```rust,ignore
//! use metricstore::storage::{counter_op, gauge_op, tx_op};
//!
//! storage
//!     .tx(vec![
//!         counter_op("requests_total", 3),
//!         gauge_op("cpu_load", 0.7),
//!         tx_op(|tx| Box::pin(async move { tx.increment_counter("errors", 1).await })),
//!     ])
//!     .await?;
//! ```

use crate::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;

/// Write access granted to the operations of one batch.
#[async_trait]
pub trait Transaction: Send {
    /// Overwrites the gauge `name` inside the batch.
    async fn create_or_update_gauge(&mut self, name: &str, value: f64) -> Result<()>;

    /// Adds `delta` to the counter `name` inside the batch.
    async fn increment_counter(&mut self, name: &str, delta: i64) -> Result<()>;
}

/// One operation of a batch submitted to [`MetricsStorage::tx`](super::MetricsStorage::tx).
pub type TxOp = Box<dyn for<'t> FnOnce(&'t mut dyn Transaction) -> BoxFuture<'t, Result<()>> + Send>;

/// Boxes a closure as a [`TxOp`].
///
/// Taking the closure through a generic bound lets the compiler infer the
/// higher-ranked signature, which `Box::new` on its own cannot.
pub fn tx_op<F>(f: F) -> TxOp
where
    F: for<'t> FnOnce(&'t mut dyn Transaction) -> BoxFuture<'t, Result<()>> + Send + 'static,
{
    Box::new(f)
}

/// Op that overwrites a gauge.
pub fn gauge_op(name: impl Into<String>, value: f64) -> TxOp {
    let name = name.into();
    tx_op(move |tx| Box::pin(async move { tx.create_or_update_gauge(&name, value).await }))
}

/// Op that increments a counter.
pub fn counter_op(name: impl Into<String>, delta: i64) -> TxOp {
    let name = name.into();
    tx_op(move |tx| Box::pin(async move { tx.increment_counter(&name, delta).await }))
}
