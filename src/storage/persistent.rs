//! File-backed storage: the memory backend plus a dump log.
//!
//! Startup order is restore first, dump pipeline second. Restored records go straight
//! into the inner [`MemoryStorage`], so they are not logged a second time. The log is
//! opened for appending and keeps its history across restarts.
//!
//! Records are published while the memory write lock is held, so the log order is the
//! order in which writes were applied. Once the pipeline is closed, writes are refused
//! with an error instead of being applied without a log record.
//!
//! # Durability
//!
//! With a zero store interval every record is flushed before the subscriber takes the
//! next one. With a positive interval records are flushed in batches, and anything
//! still queued is written by [`close`](MetricsStorage::close). A crash between flushes
//! loses at most one interval of writes.

use super::dump::{DumpHandle, DumpPublisher, DumpSummary, FlushMode, start_dump_pipeline};
use super::memory::{MemoryStorage, WriteLog};
use super::restore::restore_from_file;
use super::traits::{MetricsStorage, TxOp};
use crate::models::{Counter, Gauge, PersistedRecord};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;

/// Memory storage whose writes are appended to a dump log.
pub struct PersistentStorage {
    inner: MemoryStorage,
    publisher: DumpPublisher,
    handle: Mutex<Option<DumpHandle>>,
    path: PathBuf,
}

impl PersistentStorage {
    /// Opens the storage, restoring from `path` first when `restore` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the restore fails (startup must not continue with partial
    /// state) or the log cannot be opened for appending.
    pub async fn open(
        path: impl Into<PathBuf>,
        store_interval: Duration,
        restore: bool,
    ) -> Result<Self> {
        let path = path.into();
        let inner = MemoryStorage::new();

        if restore {
            restore_from_file(&path, &inner).await?;
        }

        let mode = FlushMode::from_store_interval(store_interval);
        let (publisher, handle) = start_dump_pipeline(&path, mode).await?;

        Ok(Self {
            inner,
            publisher,
            handle: Mutex::new(Some(handle)),
            path,
        })
    }

    /// Closes the pipeline and waits for the final flush.
    ///
    /// Returns `None` if the storage was already shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriber ended without signalling completion.
    pub async fn shutdown(&self) -> Result<Option<DumpSummary>> {
        self.inner
            .with_writes_blocked(|| self.publisher.close())
            .await;
        let Some(handle) = self.handle.lock().await.take() else {
            return Ok(None);
        };
        handle.wait().await.map(Some)
    }
}

impl WriteLog for DumpPublisher {
    fn admit(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::OperationFailed {
                operation: "persistent_write".to_string(),
                cause: "dump pipeline is closed".to_string(),
            });
        }
        Ok(())
    }

    fn append(&self, record: PersistedRecord) {
        self.dump(record);
    }
}

#[async_trait]
impl MetricsStorage for PersistentStorage {
    async fn create_or_update_gauge(&self, name: &str, value: f64) -> Result<()> {
        self.inner
            .write_logged(PersistedRecord::gauge(name, value), &self.publisher)
            .await
    }

    async fn increment_counter(&self, name: &str, delta: i64) -> Result<()> {
        self.inner
            .write_logged(PersistedRecord::counter(name, delta), &self.publisher)
            .await
    }

    async fn get_counter(&self, name: &str) -> Result<Counter> {
        self.inner.get_counter(name).await
    }

    async fn get_gauge(&self, name: &str) -> Result<Gauge> {
        self.inner.get_gauge(name).await
    }

    async fn get_counters(&self) -> Result<Vec<Counter>> {
        self.inner.get_counters().await
    }

    async fn get_gauges(&self) -> Result<Vec<Gauge>> {
        self.inner.get_gauges().await
    }

    async fn tx(&self, ops: Vec<TxOp>) -> Result<()> {
        self.inner.tx_logged(ops, &self.publisher).await
    }

    async fn ping(&self) -> Result<()> {
        if self.publisher.is_closed() {
            return Err(Error::OperationFailed {
                operation: "persistent_ping".to_string(),
                cause: format!("dump pipeline for {} is closed", self.path.display()),
            });
        }
        self.inner.ping().await
    }

    async fn close(&self) -> Result<()> {
        if let Some(summary) = self.shutdown().await? {
            tracing::info!(
                path = %self.path.display(),
                written = summary.records_written,
                dropped = summary.records_dropped,
                "Persistent storage closed"
            );
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "persistent"
    }
}
