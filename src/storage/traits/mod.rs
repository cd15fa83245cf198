//! Storage backend traits.

mod metrics;
mod transaction;

pub use metrics::MetricsStorage;
pub use transaction::{Transaction, TxOp, counter_op, gauge_op, tx_op};
