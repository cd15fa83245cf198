//! Backend selection.
//!
//! Chosen once at startup from [`StorageConfig::selection`]; backends are never swapped
//! while the process runs.

use super::memory::MemoryStorage;
use super::persistent::PersistentStorage;
use super::postgresql::PostgresStorage;
use super::traits::MetricsStorage;
use crate::Result;
use crate::config::{BackendSelection, StorageConfig};
use std::sync::Arc;

/// Opens the backend selected by `config`.
///
/// A relational DSN connects (with retry) and migrates; a file path restores the dump
/// log and starts the dump pipeline; otherwise the storage is plain memory.
///
/// # Errors
///
/// Returns the backend's startup error. The caller must not serve traffic on error.
pub async fn open_storage(config: &StorageConfig) -> Result<Arc<dyn MetricsStorage>> {
    let selection = config.selection();
    tracing::info!(backend = selection.name(), "Opening metrics storage");

    let storage: Arc<dyn MetricsStorage> = match selection {
        BackendSelection::Postgres { dsn } => {
            Arc::new(PostgresStorage::connect(&dsn, config.postgres_options()).await?)
        },
        BackendSelection::Persistent {
            path,
            store_interval,
            restore,
        } => Arc::new(PersistentStorage::open(path, store_interval, restore).await?),
        BackendSelection::Memory => Arc::new(MemoryStorage::new()),
    };

    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_no_path_opens_memory() {
        let config = StorageConfig::default().with_file_storage_path("");

        let storage = open_storage(&config).await.unwrap();

        assert_eq!(storage.backend_name(), "memory");
        assert!(storage.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_path_opens_persistent_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        tokio::fs::write(&path, "{\"type\":\"counter\",\"name\":\"boots\",\"value\":2}\n")
            .await
            .unwrap();
        let config = StorageConfig::default()
            .with_file_storage_path(&path)
            .with_store_interval(Duration::ZERO);

        let storage = open_storage(&config).await.unwrap();

        assert_eq!(storage.backend_name(), "persistent");
        assert_eq!(storage.get_counter("boots").await.unwrap().value, 2);
        storage.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_dsn_fails_startup() {
        let config = StorageConfig::default().with_database_dsn("postgres://host:notaport/db");

        assert!(open_storage(&config).await.is_err());
    }
}
