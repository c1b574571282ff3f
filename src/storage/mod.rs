//! Storage module: result buffering and pluggable persistence adapters.

mod file;
mod manager;
mod sqlite;

pub use file::*;
pub use manager::*;
pub use sqlite::*;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::StorageConfig;
use crate::model::ProbeResult;

/// Storage error types.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] refinery::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("adapter {0} is not connected")]
    NotConnected(&'static str),
    #[error("no storage adapter could be connected")]
    NoAdapters,
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A persistence backend.
///
/// `store` is all-or-nothing per call: either every result of the batch is
/// persisted or none is.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<(), StorageError>;

    async fn disconnect(&self) -> Result<(), StorageError>;

    async fn store(&self, results: Arc<[ProbeResult]>) -> Result<(), StorageError>;

    /// Cheap in-memory connected flag.
    fn health_check(&self) -> bool;

    /// Real round trip against the backend.
    async fn is_healthy(&self) -> bool;
}

/// Builds the adapters named by a storage configuration.
pub type AdapterFactory = Arc<dyn Fn(&StorageConfig) -> Vec<Arc<dyn StorageAdapter>> + Send + Sync>;

/// One adapter per enabled storage section.
pub fn build_adapters(config: &StorageConfig) -> Vec<Arc<dyn StorageAdapter>> {
    let mut adapters: Vec<Arc<dyn StorageAdapter>> = Vec::new();

    if let Some(sqlite) = config.sqlite.as_ref().filter(|c| c.enabled) {
        adapters.push(Arc::new(SqliteAdapter::new(&sqlite.path)));
    }
    if let Some(file) = config.file.as_ref().filter(|c| c.enabled) {
        adapters.push(Arc::new(FileAdapter::new(&file.path, &file.rotation)));
    }

    adapters
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Adapter keeping batches in memory, optionally failing on demand.
    #[derive(Default)]
    pub struct MemoryAdapter {
        pub batches: Mutex<Vec<Vec<ProbeResult>>>,
        pub fail_store: AtomicBool,
        pub fail_connect: AtomicBool,
        pub connected: AtomicBool,
        pub disconnects: AtomicUsize,
    }

    impl MemoryAdapter {
        pub fn failing() -> Self {
            let adapter = Self::default();
            adapter.fail_store.store(true, Ordering::SeqCst);
            adapter
        }

        pub fn unreachable() -> Self {
            let adapter = Self::default();
            adapter.fail_connect.store(true, Ordering::SeqCst);
            adapter
        }

        pub fn stored(&self) -> Vec<ProbeResult> {
            self.batches.lock().unwrap().iter().flatten().cloned().collect()
        }

        pub fn batch_count(&self) -> usize {
            self.batches.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl StorageAdapter for MemoryAdapter {
        fn name(&self) -> &'static str {
            if self.fail_store.load(Ordering::SeqCst) {
                "failing"
            } else {
                "memory"
            }
        }

        async fn connect(&self) -> Result<(), StorageError> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(StorageError::NotConnected("memory"));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), StorageError> {
            self.connected.store(false, Ordering::SeqCst);
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn store(&self, results: Arc<[ProbeResult]>) -> Result<(), StorageError> {
            if self.fail_store.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire")));
            }
            self.batches.lock().unwrap().push(results.to_vec());
            Ok(())
        }

        fn health_check(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn is_healthy(&self) -> bool {
            self.connected.load(Ordering::SeqCst) && !self.fail_store.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileStorageConfig, SqliteStorageConfig};

    #[test]
    fn test_build_adapters_only_enabled() {
        let config = StorageConfig {
            sqlite: Some(SqliteStorageConfig::default()),
            file: Some(FileStorageConfig {
                enabled: false,
                ..Default::default()
            }),
        };
        let adapters = build_adapters(&config);
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].name(), "sqlite");
    }
}
