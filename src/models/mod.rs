//! Data models for metricstore.
//!
//! Two metric shapes are stored: monotonic counters and last-write gauges. The dump log
//! uses its own record type, [`PersistedRecord`].

mod metric;
mod record;

pub use metric::{Counter, Gauge, MetricKind};
pub use record::{PersistedRecord, coerce_counter_value, coerce_gauge_value};
