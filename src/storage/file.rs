//! JSON-lines file adapter with size-based rotation.

use std::ffi::OsString;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{StorageAdapter, StorageError};
use crate::config::RotationConfig;
use crate::model::ProbeResult;

/// Appends one JSON document per result. A batch is written with a single
/// write; on failure the file is cut back to its previous length.
pub struct FileAdapter {
    path: PathBuf,
    max_bytes: u64,
    max_files: u32,
    file: Mutex<Option<File>>,
    connected: AtomicBool,
}

fn numbered(path: &Path, n: u32) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(format!(".{}", n));
    PathBuf::from(name)
}

async fn open_append(path: &Path) -> Result<File, StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path).await?)
}

impl FileAdapter {
    pub fn new<P: AsRef<Path>>(path: P, rotation: &RotationConfig) -> Self {
        Self::with_limits(path, rotation.max_size_mb.saturating_mul(1024 * 1024), rotation.max_files)
    }

    pub fn with_limits<P: AsRef<Path>>(path: P, max_bytes: u64, max_files: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_bytes: max_bytes.max(1),
            max_files,
            file: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Shift `path.N-1 .. path.1` up by one and move the live file to `path.1`.
    async fn rotate(&self) -> Result<(), StorageError> {
        if self.max_files == 0 {
            tokio::fs::remove_file(&self.path).await?;
        } else {
            for n in (1..self.max_files).rev() {
                let from = numbered(&self.path, n);
                if tokio::fs::try_exists(&from).await? {
                    tokio::fs::rename(&from, numbered(&self.path, n + 1)).await?;
                }
            }
            tokio::fs::rename(&self.path, numbered(&self.path, 1)).await?;
        }
        tracing::info!(path = %self.path.display(), "Rotated result file");
        Ok(())
    }

    /// Rotate and swap in a fresh live file. The current handle is kept when
    /// rotation fails; the adapter is marked disconnected only if no handle
    /// can be restored.
    async fn rotate_live(&self, live: &mut Option<File>) {
        if let Err(e) = self.rotate().await {
            tracing::warn!(path = %self.path.display(), error = %e, "Rotation failed, appending to current file");
            return;
        }
        match open_append(&self.path).await {
            Ok(file) => *live = Some(file),
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Failed to reopen result file after rotation");
                *live = None;
                self.connected.store(false, Ordering::SeqCst);
            }
        }
    }
}

#[async_trait]
impl StorageAdapter for FileAdapter {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn connect(&self) -> Result<(), StorageError> {
        let file = open_append(&self.path).await?;
        *self.file.lock().await = Some(file);
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(path = %self.path.display(), "File adapter connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    async fn store(&self, results: Arc<[ProbeResult]>) -> Result<(), StorageError> {
        if results.is_empty() {
            return Ok(());
        }

        // Serialize everything before touching the file.
        let mut payload = Vec::with_capacity(results.len() * 512);
        for r in results.iter() {
            serde_json::to_writer(&mut payload, r)?;
            payload.push(b'\n');
        }

        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(StorageError::NotConnected("file"))?;

        let before = file.seek(SeekFrom::End(0)).await?;
        let written = async {
            file.write_all(&payload).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = written {
            if let Err(truncate) = file.set_len(before).await {
                tracing::error!(error = %truncate, "Failed to roll back partial write");
            }
            return Err(e.into());
        }

        // The batch is on disk from here on; rotation problems must not
        // turn it into a failed store.
        if before + payload.len() as u64 >= self.max_bytes {
            if let Err(e) = file.sync_all().await {
                tracing::warn!(error = %e, "Failed to sync result file before rotation");
            }
            self.rotate_live(&mut guard).await;
        }

        Ok(())
    }

    fn health_check(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn is_healthy(&self) -> bool {
        match self.file.lock().await.as_ref() {
            Some(file) => file.metadata().await.is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{monitor_id, AgentIdentity, ErrorType, MonitorType};
    use tempfile::TempDir;

    fn results(n: usize) -> Arc<[ProbeResult]> {
        let identity = AgentIdentity {
            agent_id: "edge-1@node-a".into(),
            region: None,
        };
        (0..n)
            .map(|i| {
                let name = format!("target {}", i);
                ProbeResult::begin(&identity, MonitorType::Dns, monitor_id("dns", &name), &name, "example.com")
                    .fail(ErrorType::Timeout, "DNS lookup timeout")
            })
            .collect::<Vec<_>>()
            .into()
    }

    #[tokio::test]
    async fn test_appends_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("results.jsonl");
        let adapter = FileAdapter::new(&path, &RotationConfig::default());
        adapter.connect().await.unwrap();

        adapter.store(results(2)).await.unwrap();
        adapter.store(results(3)).await.unwrap();
        assert!(adapter.is_healthy().await);
        adapter.disconnect().await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0]["monitorId"], "dns-target-0");
        assert_eq!(lines[0]["errorType"], "TIMEOUT");
        assert!(!adapter.health_check());
    }

    #[tokio::test]
    async fn test_rotates_when_size_reached() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.jsonl");
        let adapter = FileAdapter::with_limits(&path, 200, 2);
        adapter.connect().await.unwrap();

        adapter.store(results(1)).await.unwrap();
        assert!(numbered(&path, 1).exists());
        adapter.store(results(1)).await.unwrap();
        adapter.store(results(1)).await.unwrap();
        assert!(numbered(&path, 2).exists());
        assert!(!numbered(&path, 3).exists());

        // the live file was reopened empty after the last rotation
        let live = tokio::fs::metadata(&path).await.unwrap();
        assert_eq!(live.len(), 0);
        adapter.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_rotation_failure_keeps_appending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.jsonl");
        // a non-empty directory where the rotated file should go
        let blocker = numbered(&path, 1);
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), b"x").unwrap();

        let adapter = FileAdapter::with_limits(&path, 10, 1);
        adapter.connect().await.unwrap();

        adapter.store(results(1)).await.unwrap();
        adapter.store(results(2)).await.unwrap();
        assert!(adapter.health_check());
        assert!(adapter.is_healthy().await);
        adapter.disconnect().await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(blocker.is_dir());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_write_is_reported() {
        // every write to /dev/full fails with ENOSPC
        if !Path::new("/dev/full").exists() {
            return;
        }
        let adapter = FileAdapter::new("/dev/full", &RotationConfig::default());
        adapter.connect().await.unwrap();

        assert!(matches!(adapter.store(results(2)).await, Err(StorageError::Io(_))));
        // the handle survives a failed batch
        assert!(adapter.health_check());
        assert!(adapter.is_healthy().await);
        assert!(adapter.store(results(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_store_without_connect_fails() {
        let dir = TempDir::new().unwrap();
        let adapter = FileAdapter::new(dir.path().join("x.jsonl"), &RotationConfig::default());
        assert!(matches!(
            adapter.store(results(1)).await,
            Err(StorageError::NotConnected("file"))
        ));
        assert!(!adapter.is_healthy().await);
    }
}
