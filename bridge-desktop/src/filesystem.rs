//! File System Access Implementation using Tokio

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::{FileMetadata, FileSystemAccess},
};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tokio::fs;
use tracing::debug;

/// Tokio-based file system implementation
///
/// Provides async file I/O operations using:
/// - `tokio::fs` for async operations
/// - `dirs` for the platform data directory
/// - `sysinfo` for free-space queries
pub struct TokioFileSystem {
    data_dir: PathBuf,
}

impl TokioFileSystem {
    /// Create a new file system accessor rooted at the platform data directory
    pub fn new() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".local")
                    .join("share")
            })
            .join("offline-sync-core");

        Self { data_dir }
    }

    /// Create a new file system accessor with a custom data directory
    pub fn with_data_directory(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    fn absolute(path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(std::env::current_dir()?.join(path))
        }
    }
}

impl Default for TokioFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystemAccess for TokioFileSystem {
    async fn get_data_directory(&self) -> Result<PathBuf> {
        if !fs::try_exists(&self.data_dir).await? {
            fs::create_dir_all(&self.data_dir).await?;
            debug!(path = ?self.data_dir, "Created data directory");
        }
        Ok(self.data_dir.clone())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(fs::try_exists(path).await?)
    }

    async fn metadata(&self, path: &Path) -> Result<FileMetadata> {
        let metadata = fs::metadata(path).await?;

        Ok(FileMetadata {
            size: metadata.len(),
            modified_at: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64),
            is_directory: metadata.is_dir(),
        })
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> Result<Bytes> {
        let data = fs::read(path).await?;
        debug!(path = ?path, size = data.len(), "Read file");
        Ok(Bytes::from(data))
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent).await?;
        }

        fs::write(path, data.as_ref()).await?;
        debug!(path = ?path, size = data.len(), "Wrote file");
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).await?;
        debug!(path = ?path, "Deleted file");
        Ok(())
    }

    async fn delete_dir_all(&self, path: &Path) -> Result<()> {
        fs::remove_dir_all(path).await?;
        debug!(path = ?path, "Deleted directory");
        Ok(())
    }

    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(path).await?;

        while let Some(entry) = read_dir.next_entry().await? {
            entries.push(entry.path());
        }

        Ok(entries)
    }

    async fn open_write_stream(
        &self,
        path: &Path,
    ) -> Result<Box<dyn tokio::io::AsyncWrite + Send + Unpin>> {
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent).await?;
        }

        let file = fs::File::create(path).await?;
        debug!(path = ?path, "Opened file for writing");
        Ok(Box::new(file))
    }

    async fn available_space(&self, path: &Path) -> Result<u64> {
        let target = Self::absolute(path)?;

        // Disk enumeration reads mount tables synchronously.
        let free = tokio::task::spawn_blocking(move || {
            let disks = Disks::new_with_refreshed_list();
            disks
                .list()
                .iter()
                .filter(|disk| target.starts_with(disk.mount_point()))
                .max_by_key(|disk| disk.mount_point().as_os_str().len())
                .map(|disk| disk.available_space())
                .ok_or_else(|| {
                    BridgeError::NotAvailable(format!(
                        "No mounted volume contains {}",
                        target.display()
                    ))
                })
        })
        .await
        .map_err(|e| BridgeError::OperationFailed(format!("Disk query panicked: {}", e)))??;

        debug!(free_bytes = free, "Queried available space");
        Ok(free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::env;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn scratch_dir() -> PathBuf {
        env::temp_dir().join(format!("offline-fs-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_custom_data_directory_is_created() {
        let root = scratch_dir();
        let fs = TokioFileSystem::with_data_directory(root.clone());

        let data_dir = fs.get_data_directory().await.unwrap();
        assert_eq!(data_dir, root);
        assert!(fs.exists(&root).await.unwrap());

        fs.delete_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let root = scratch_dir();
        let fs = TokioFileSystem::with_data_directory(root.clone());
        let test_file = root.join("nested").join("notes.txt");

        let data = Bytes::from("Hello, World!");
        fs.write_file(&test_file, data.clone()).await.unwrap();

        let read_data = fs.read_file(&test_file).await.unwrap();
        assert_eq!(data, read_data);

        fs.delete_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_stream_reports_cumulative_progress() {
        let root = scratch_dir();
        let fs = TokioFileSystem::with_data_directory(root.clone());
        let path = root.join("course-1").join("file.bin");

        let chunks = vec![
            Ok(Bytes::from_static(b"abcd")),
            Ok(Bytes::from_static(b"efgh")),
            Ok(Bytes::from_static(b"ij")),
        ];
        let last = AtomicU64::new(0);
        let written = fs
            .write_stream(&path, Box::pin(stream::iter(chunks)), &|n| {
                last.store(n, Ordering::SeqCst)
            })
            .await
            .unwrap();

        assert_eq!(written, 10);
        assert_eq!(last.load(Ordering::SeqCst), 10);
        assert_eq!(fs.directory_size(&root).await.unwrap(), 10);

        fs.delete_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_stream_passes_network_errors_through() {
        let root = scratch_dir();
        let fs = TokioFileSystem::with_data_directory(root.clone());
        let path = root.join("broken.bin");

        let chunks = vec![
            Ok(Bytes::from_static(b"abcd")),
            Err(BridgeError::OperationFailed("reset by peer".to_string())),
        ];
        let err = fs
            .write_stream(&path, Box::pin(stream::iter(chunks)), &|_| {})
            .await
            .unwrap_err();

        assert!(!err.is_storage_error());
        let _ = fs.delete_dir_all(&root).await;
    }

    #[tokio::test]
    async fn test_available_space_for_temp_dir() {
        let fs = TokioFileSystem::new();
        // Containers without a visible mount table report NotAvailable.
        match fs.available_space(&env::temp_dir()).await {
            Ok(free) => assert!(free > 0),
            Err(err) => assert!(matches!(err, BridgeError::NotAvailable(_))),
        }
    }
}
