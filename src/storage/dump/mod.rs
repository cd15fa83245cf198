//! Durable dump pipeline.
//!
//! Every accepted write is projected into a [`PersistedRecord`] and appended to a
//! newline-delimited JSON log that is only read back by restore at startup.
//!
//! ```text
//! write path --dump()--> DumpPublisher --mpsc--> DumpSubscriber --BufWriter--> log file
//!                              |                        |
//!                           close()  ---------------->  drain, flush, sync, close
//!                                                       |
//!                                  DumpHandle::wait() <-+ done signal
//! ```
//!
//! The publisher never blocks on disk I/O; the subscriber owns the file exclusively.

mod pool;
mod publisher;
mod subscriber;

pub use pool::BufferPool;
pub use publisher::DumpPublisher;
pub use subscriber::{DumpHandle, DumpSubscriber, DumpSummary, FlushMode};

use crate::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

#[cfg(doc)]
use crate::models::PersistedRecord;

/// Opens `path` for appending and spawns its subscriber.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns an error if the file or its parent directory cannot be created.
pub async fn start_dump_pipeline(
    path: &Path,
    mode: FlushMode,
) -> Result<(DumpPublisher, DumpHandle)> {
    let file = subscriber::open_dump_file(path).await?;
    let (sender, receiver) = mpsc::unbounded_channel();
    let pool = Arc::new(BufferPool::default());

    let handle = DumpSubscriber::new(receiver, file, path.to_path_buf(), pool, mode).spawn();
    tracing::info!(path = %path.display(), mode = ?mode, "Dump pipeline started");

    Ok((DumpPublisher::new(sender), handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PersistedRecord;
    use std::time::Duration;

    async fn read_lines(path: &Path) -> Vec<String> {
        tokio::fs::read_to_string(path)
            .await
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_sync_mode_writes_before_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        let (publisher, handle) = start_dump_pipeline(&path, FlushMode::Sync).await.unwrap();

        assert!(publisher.dump(PersistedRecord::counter("hits", 1)));

        // Sync mode flushes per record; poll until the subscriber caught up.
        let mut lines = Vec::new();
        for _ in 0..200 {
            lines = read_lines(&path).await;
            if !lines.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(lines, vec![r#"{"type":"counter","name":"hits","value":1}"#]);

        publisher.close();
        let summary = handle.wait().await.unwrap();
        assert_eq!(summary.records_written, 1);
    }

    #[tokio::test]
    async fn test_interval_mode_drains_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        let mode = FlushMode::Interval(Duration::from_secs(3600));
        let (publisher, handle) = start_dump_pipeline(&path, mode).await.unwrap();

        publisher.dump(PersistedRecord::gauge("load", 0.5));
        publisher.dump(PersistedRecord::counter("hits", 2));
        publisher.close();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.records_written, 2);
        assert_eq!(
            read_lines(&path).await,
            vec![
                r#"{"type":"gauge","name":"load","value":0.5}"#.to_string(),
                r#"{"type":"counter","name":"hits","value":2}"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_interval_mode_flushes_on_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        let mode = FlushMode::Interval(Duration::from_millis(20));
        let (publisher, handle) = start_dump_pipeline(&path, mode).await.unwrap();

        publisher.dump(PersistedRecord::counter("hits", 1));

        // Still open: only a tick can have written the record.
        let mut lines = Vec::new();
        for _ in 0..400 {
            lines = read_lines(&path).await;
            if !lines.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(lines.len(), 1);
        assert!(!publisher.is_closed());

        publisher.close();
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_record_is_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        let (publisher, handle) = start_dump_pipeline(&path, FlushMode::Sync).await.unwrap();

        publisher.dump(PersistedRecord::gauge("broken", f64::INFINITY));
        publisher.dump(PersistedRecord::gauge("fine", 1.0));
        publisher.close();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.records_dropped, 1);
        assert_eq!(summary.records_written, 1);
        assert_eq!(read_lines(&path).await.len(), 1);
    }

    #[tokio::test]
    async fn test_dump_after_close_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        let (publisher, handle) = start_dump_pipeline(&path, FlushMode::Sync).await.unwrap();

        assert!(publisher.close());
        assert!(!publisher.close());
        assert!(publisher.is_closed());
        assert!(!publisher.dump(PersistedRecord::counter("late", 1)));

        let summary = handle.wait().await.unwrap();
        assert_eq!(summary.records_written, 0);
    }

    #[tokio::test]
    async fn test_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        tokio::fs::write(&path, "{\"type\":\"counter\",\"name\":\"old\",\"value\":1}\n")
            .await
            .unwrap();

        let (publisher, handle) = start_dump_pipeline(&path, FlushMode::Sync).await.unwrap();
        publisher.dump(PersistedRecord::counter("new", 1));
        publisher.close();
        handle.wait().await.unwrap();

        assert_eq!(read_lines(&path).await.len(), 2);
    }
}
