//! Storage layer.
//!
//! Three interchangeable backends satisfy [`MetricsStorage`]:
//! - [`MemoryStorage`]: lock-protected maps, the baseline
//! - [`PersistentStorage`]: memory plus an append-only dump log replayed at startup
//! - [`PostgresStorage`]: upserts into one table per metric kind
//!
//! [`open_storage`] picks one from configuration.

// Allow significant_drop_tightening - transaction guards are held for the whole batch.
#![allow(clippy::significant_drop_tightening)]
// Allow match_same_arms for explicit enum handling.
#![allow(clippy::match_same_arms)]

pub mod dump;
pub mod memory;
pub mod migrations;
pub mod persistent;
pub mod postgresql;
pub mod resilience;
pub mod restore;
pub mod selector;
pub mod traits;

pub use memory::{MemoryStorage, MemoryTx};
pub use persistent::PersistentStorage;
pub use postgresql::{PostgresOptions, PostgresStorage};
pub use resilience::{ConnectionRetryConfig, is_retryable_storage_error, retry_connection};
pub use restore::restore_from_file;
pub use selector::open_storage;
pub use traits::{MetricsStorage, Transaction, TxOp, counter_op, gauge_op, tx_op};
