//! In-memory storage backend.
//!
//! Holds the current value of every metric in two maps guarded by a single
//! `tokio::sync::RwLock`. Reads share the lock, writes take it exclusively, and a
//! transaction holds the write guard for the whole batch.
//!
//! # Transaction Semantics
//!
//! Ops of a batch write through a [`MemoryTx`] handle that borrows the locked maps
//! directly, so nested writes never re-acquire the lock. Each write records the value it
//! replaced in an undo journal. If an op fails, the journal is replayed in reverse and
//! the maps are back to their pre-batch state before the lock is released: readers never
//! observe a partially applied batch.

use super::traits::{MetricsStorage, Transaction, TxOp};
use crate::models::{Counter, Gauge, MetricKind, PersistedRecord};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Current metric values.
#[derive(Debug, Default)]
struct MetricMaps {
    counters: HashMap<String, i64>,
    gauges: HashMap<String, f64>,
}

impl MetricMaps {
    /// Adds `delta` to a counter, returning the value it replaced.
    fn add_counter(&mut self, name: &str, delta: i64) -> Result<Option<i64>> {
        let previous = self.counters.get(name).copied();
        let next = previous
            .unwrap_or(0)
            .checked_add(delta)
            .ok_or_else(|| {
                Error::InvalidInput(format!("counter '{name}' overflows i64 when adding {delta}"))
            })?;
        self.counters.insert(name.to_string(), next);
        Ok(previous)
    }

    /// Overwrites a gauge, returning the value it replaced.
    fn set_gauge(&mut self, name: &str, value: f64) -> Option<f64> {
        self.gauges.insert(name.to_string(), value)
    }
}

/// Prior value of a metric touched inside a batch.
#[derive(Debug)]
enum UndoEntry {
    Counter { name: String, previous: Option<i64> },
    Gauge { name: String, previous: Option<f64> },
}

/// Transaction handle over the locked maps.
pub struct MemoryTx<'a> {
    maps: &'a mut MetricMaps,
    journal: Vec<UndoEntry>,
    applied: Vec<PersistedRecord>,
}

impl<'a> MemoryTx<'a> {
    fn new(maps: &'a mut MetricMaps) -> Self {
        Self {
            maps,
            journal: Vec::new(),
            applied: Vec::new(),
        }
    }

    /// Restores every value touched by this batch, newest first.
    fn rollback(self) -> usize {
        let undone = self.journal.len();
        for entry in self.journal.into_iter().rev() {
            match entry {
                UndoEntry::Counter { name, previous } => match previous {
                    Some(value) => {
                        self.maps.counters.insert(name, value);
                    },
                    None => {
                        self.maps.counters.remove(&name);
                    },
                },
                UndoEntry::Gauge { name, previous } => match previous {
                    Some(value) => {
                        self.maps.gauges.insert(name, value);
                    },
                    None => {
                        self.maps.gauges.remove(&name);
                    },
                },
            }
        }
        undone
    }
}

#[async_trait]
impl Transaction for MemoryTx<'_> {
    async fn create_or_update_gauge(&mut self, name: &str, value: f64) -> Result<()> {
        let previous = self.maps.set_gauge(name, value);
        self.journal.push(UndoEntry::Gauge {
            name: name.to_string(),
            previous,
        });
        self.applied.push(PersistedRecord::gauge(name, value));
        Ok(())
    }

    async fn increment_counter(&mut self, name: &str, delta: i64) -> Result<()> {
        let previous = self.maps.add_counter(name, delta)?;
        self.journal.push(UndoEntry::Counter {
            name: name.to_string(),
            previous,
        });
        self.applied.push(PersistedRecord::counter(name, delta));
        Ok(())
    }
}

/// In-memory metrics storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<MetricMaps>,
}

impl MemoryStorage {
    /// Creates an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one write and appends its record to `log` before the lock is released.
    ///
    /// Holding the lock while logging keeps the log in the order writes were applied.
    pub(crate) async fn write_logged(
        &self,
        record: PersistedRecord,
        log: &impl WriteLog,
    ) -> Result<()> {
        let mut maps = self.state.write().await;
        log.admit()?;
        let kind = match &record {
            PersistedRecord::Counter { name, value } => {
                maps.add_counter(name, *value)?;
                "counter"
            },
            PersistedRecord::Gauge { name, value } => {
                maps.set_gauge(name, *value);
                "gauge"
            },
        };
        log.append(record);
        drop(maps);

        metrics::counter!("metricstore_writes_total", "backend" => "memory", "kind" => kind)
            .increment(1);
        Ok(())
    }

    /// Runs a batch. On commit, the mutations it applied are appended to `log` in op
    /// order while the lock is still held; a rolled back batch logs nothing.
    pub(crate) async fn tx_logged(&self, ops: Vec<TxOp>, log: &impl WriteLog) -> Result<()> {
        let op_count = ops.len();
        let mut guard = self.state.write().await;
        log.admit()?;
        let mut txn = MemoryTx::new(&mut guard);

        for (index, op) in ops.into_iter().enumerate() {
            let handle: &mut dyn Transaction = &mut txn;
            if let Err(err) = op(handle).await {
                let undone = txn.rollback();
                tracing::warn!(
                    backend = "memory",
                    failed_op = index,
                    op_count,
                    undone,
                    error = %err,
                    "Transaction rolled back"
                );
                metrics::counter!("metricstore_tx_total", "backend" => "memory", "status" => "rolled_back")
                    .increment(1);
                return Err(Error::transaction(err));
            }
        }

        for record in txn.applied {
            log.append(record);
        }
        metrics::counter!("metricstore_tx_total", "backend" => "memory", "status" => "committed")
            .increment(1);
        Ok(())
    }

    /// Runs `f` while holding the write lock, so no write is in flight around it.
    pub(crate) async fn with_writes_blocked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _maps = self.state.write().await;
        f()
    }
}

/// Destination for the records of applied writes.
///
/// Both methods run under the memory write lock.
pub(crate) trait WriteLog: Sync {
    /// Checked before a write is applied; an error rejects it untouched.
    fn admit(&self) -> Result<()> {
        Ok(())
    }

    /// Receives the record of an applied write.
    fn append(&self, record: PersistedRecord);
}

/// Discards records.
struct Unlogged;

impl WriteLog for Unlogged {
    fn append(&self, _record: PersistedRecord) {}
}

#[async_trait]
impl MetricsStorage for MemoryStorage {
    async fn create_or_update_gauge(&self, name: &str, value: f64) -> Result<()> {
        self.write_logged(PersistedRecord::gauge(name, value), &Unlogged).await
    }

    async fn increment_counter(&self, name: &str, delta: i64) -> Result<()> {
        self.write_logged(PersistedRecord::counter(name, delta), &Unlogged).await
    }

    async fn get_counter(&self, name: &str) -> Result<Counter> {
        self.state
            .read()
            .await
            .counters
            .get(name)
            .map(|value| Counter::new(name, *value))
            .ok_or_else(|| Error::NotFound {
                kind: MetricKind::Counter,
                name: name.to_string(),
            })
    }

    async fn get_gauge(&self, name: &str) -> Result<Gauge> {
        self.state
            .read()
            .await
            .gauges
            .get(name)
            .map(|value| Gauge::new(name, *value))
            .ok_or_else(|| Error::NotFound {
                kind: MetricKind::Gauge,
                name: name.to_string(),
            })
    }

    async fn get_counters(&self) -> Result<Vec<Counter>> {
        Ok(self
            .state
            .read()
            .await
            .counters
            .iter()
            .map(|(name, value)| Counter::new(name.clone(), *value))
            .collect())
    }

    async fn get_gauges(&self) -> Result<Vec<Gauge>> {
        Ok(self
            .state
            .read()
            .await
            .gauges
            .iter()
            .map(|(name, value)| Gauge::new(name.clone(), *value))
            .collect())
    }

    async fn tx(&self, ops: Vec<TxOp>) -> Result<()> {
        self.tx_logged(ops, &Unlogged).await
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
