//! Background writer of the dump pipeline.
//!
//! # Flush Modes
//!
//! - [`FlushMode::Sync`]: each record is written and flushed before the next one is
//!   received.
//! - [`FlushMode::Interval`]: records wait in a FIFO queue; every tick the queue is
//!   written out and flushed as one batch.
//!
//! # Shutdown
//!
//! The subscriber runs until the publisher side of the channel is closed and every
//! queued record has been received. It then writes what is pending, flushes, syncs and
//! closes the file, and only then fires the done signal that [`DumpHandle::wait`]
//! awaits. The drain runs on the subscriber's own task, so a caller that stops waiting
//! does not cut it short.

use super::pool::BufferPool;
use crate::models::PersistedRecord;
use crate::{Error, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};

/// When queued records reach the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Write and flush every record immediately.
    Sync,
    /// Write and flush queued records once per period.
    Interval(Duration),
}

impl FlushMode {
    /// Zero selects [`FlushMode::Sync`], anything else [`FlushMode::Interval`].
    #[must_use]
    pub const fn from_store_interval(store_interval: Duration) -> Self {
        if store_interval.is_zero() {
            Self::Sync
        } else {
            Self::Interval(store_interval)
        }
    }
}

/// Counters reported by the subscriber when it finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpSummary {
    /// Records written to the file.
    pub records_written: u64,
    /// Records dropped because they could not be encoded or written.
    pub records_dropped: u64,
    /// Flushes performed.
    pub flushes: u64,
}

/// Completion handle of a running subscriber.
#[derive(Debug)]
pub struct DumpHandle {
    done: oneshot::Receiver<DumpSummary>,
}

impl DumpHandle {
    /// Waits until the subscriber has drained, flushed and closed the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriber task ended without signalling completion.
    pub async fn wait(self) -> Result<DumpSummary> {
        self.done.await.map_err(|_| Error::OperationFailed {
            operation: "dump_wait".to_string(),
            cause: "dump subscriber exited without completing".to_string(),
        })
    }
}

/// Opens the dump file for appending, creating it and its parent directories.
pub(super) async fn open_dump_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::OperationFailed {
                operation: "create_dump_dir".to_string(),
                cause: format!("{}: {e}", parent.display()),
            })?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| Error::OperationFailed {
            operation: "open_dump_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })
}

/// Consumes queued records and appends them to the dump file.
pub struct DumpSubscriber {
    receiver: UnboundedReceiver<PersistedRecord>,
    writer: BufWriter<File>,
    path: PathBuf,
    pool: Arc<BufferPool>,
    mode: FlushMode,
    summary: DumpSummary,
}

impl DumpSubscriber {
    pub(super) fn new(
        receiver: UnboundedReceiver<PersistedRecord>,
        file: File,
        path: PathBuf,
        pool: Arc<BufferPool>,
        mode: FlushMode,
    ) -> Self {
        Self {
            receiver,
            writer: BufWriter::new(file),
            path,
            pool,
            mode,
            summary: DumpSummary::default(),
        }
    }

    /// Spawns the subscriber on the current tokio runtime.
    pub(super) fn spawn(self) -> DumpHandle {
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let summary = self.run().await;
            // Nobody waiting is fine: the file is already closed.
            let _ = done_tx.send(summary);
        });
        DumpHandle { done: done_rx }
    }

    async fn run(mut self) -> DumpSummary {
        tracing::debug!(path = %self.path.display(), mode = ?self.mode, "Dump subscriber started");

        match self.mode {
            FlushMode::Sync => self.run_sync().await,
            FlushMode::Interval(period) => self.run_interval(period).await,
        }

        self.finish().await
    }

    async fn run_sync(&mut self) {
        while let Some(record) = self.receiver.recv().await {
            self.write_record(&record).await;
            self.flush().await;
        }
    }

    async fn run_interval(&mut self, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending: VecDeque<PersistedRecord> = VecDeque::new();

        loop {
            tokio::select! {
                received = self.receiver.recv() => match received {
                    Some(record) => pending.push_back(record),
                    None => break,
                },
                _ = ticker.tick() => self.write_batch(&mut pending).await,
            }
        }

        // Channel closed and empty: everything still queued goes out now.
        self.write_batch(&mut pending).await;
    }

    async fn write_batch(&mut self, pending: &mut VecDeque<PersistedRecord>) {
        if pending.is_empty() {
            return;
        }
        let batch = pending.len();
        while let Some(record) = pending.pop_front() {
            self.write_record(&record).await;
        }
        self.flush().await;
        tracing::debug!(batch, path = %self.path.display(), "Flushed dump batch");
    }

    /// Encodes and writes one record. Failures drop the record and are logged.
    async fn write_record(&mut self, record: &PersistedRecord) {
        let mut buf = self.pool.get();
        let outcome = match record.encode_into(&mut buf) {
            Ok(()) => self
                .writer
                .write_all(&buf)
                .await
                .map_err(|e| Error::OperationFailed {
                    operation: "write_dump_record".to_string(),
                    cause: e.to_string(),
                }),
            Err(err) => Err(err),
        };
        self.pool.put(buf);

        match outcome {
            Ok(()) => {
                self.summary.records_written += 1;
                metrics::counter!("metricstore_dump_records_total").increment(1);
            },
            Err(err) => {
                self.summary.records_dropped += 1;
                tracing::error!(
                    kind = %record.kind(),
                    name = record.name(),
                    error = %err,
                    "Dropping record that could not be dumped"
                );
                metrics::counter!("metricstore_dump_errors_total").increment(1);
            },
        }
    }

    async fn flush(&mut self) {
        match self.writer.flush().await {
            Ok(()) => {
                self.summary.flushes += 1;
                metrics::counter!("metricstore_dump_flushes_total").increment(1);
            },
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Dump flush failed");
                metrics::counter!("metricstore_dump_errors_total").increment(1);
            },
        }
    }

    async fn finish(mut self) -> DumpSummary {
        self.flush().await;
        let file = self.writer.into_inner();
        if let Err(e) = file.sync_all().await {
            tracing::error!(path = %self.path.display(), error = %e, "Dump file sync failed");
        }
        drop(file);

        tracing::info!(
            path = %self.path.display(),
            written = self.summary.records_written,
            dropped = self.summary.records_dropped,
            flushes = self.summary.flushes,
            "Dump subscriber finished"
        );
        self.summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_mode_from_store_interval() {
        assert_eq!(FlushMode::from_store_interval(Duration::ZERO), FlushMode::Sync);
        assert_eq!(
            FlushMode::from_store_interval(Duration::from_secs(300)),
            FlushMode::Interval(Duration::from_secs(300))
        );
    }

    #[tokio::test]
    async fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("metrics.json");

        open_dump_file(&path).await.unwrap();

        assert!(path.exists());
    }
}
