//! File System Abstraction
//!
//! Platform-agnostic file I/O used by the offline download pipeline: byte-stream
//! writes with progress reporting, free-space queries, and recursive deletes.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::http::ByteStream;

/// File metadata information
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub size: u64,
    pub modified_at: Option<i64>,
    pub is_directory: bool,
}

/// Progress callback receiving the cumulative number of bytes written.
pub type ProgressFn<'a> = &'a (dyn Fn(u64) + Send + Sync);

/// File system access trait
///
/// Abstracts file I/O so the core can run against sandboxed mobile
/// directories, desktop paths, or an in-memory fake in tests.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::FileSystemAccess;
///
/// async fn save(fs: &dyn FileSystemAccess, data: &[u8]) -> Result<()> {
///     let root = fs.get_data_directory().await?;
///     fs.write_file(&root.join("syllabus.html"), data.to_vec().into()).await
/// }
/// ```
#[async_trait]
pub trait FileSystemAccess: Send + Sync {
    /// Get the application's persistent data directory
    async fn get_data_directory(&self) -> Result<PathBuf>;

    /// Check if a file or directory exists
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Get metadata for a file or directory
    async fn metadata(&self, path: &Path) -> Result<FileMetadata>;

    /// Create a directory and all parent directories if they don't exist
    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Read entire file contents into memory
    async fn read_file(&self, path: &Path) -> Result<Bytes>;

    /// Write data to a file, creating it if it doesn't exist
    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()>;

    /// Delete a file
    async fn delete_file(&self, path: &Path) -> Result<()>;

    /// Delete a directory and all its contents
    async fn delete_dir_all(&self, path: &Path) -> Result<()>;

    /// List all entries in a directory
    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Open a file for streaming writes, truncating existing content
    async fn open_write_stream(
        &self,
        path: &Path,
    ) -> Result<Box<dyn tokio::io::AsyncWrite + Send + Unpin>>;

    /// Free bytes on the volume holding `path`
    async fn available_space(&self, path: &Path) -> Result<u64>;

    /// Drain `stream` into `path`, reporting cumulative bytes after every chunk.
    ///
    /// Chunk errors are returned unchanged (they originate from the network);
    /// write failures surface as [`BridgeError::Io`](crate::error::BridgeError::Io).
    async fn write_stream(
        &self,
        path: &Path,
        mut stream: ByteStream,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64> {
        let mut writer = self.open_write_stream(path).await?;
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
            on_progress(written);
        }

        writer.flush().await?;
        writer.shutdown().await?;
        Ok(written)
    }

    /// Calculate total size of a directory recursively
    async fn directory_size(&self, path: &Path) -> Result<u64> {
        let mut total = 0u64;
        let entries = self.list_directory(path).await?;

        for entry in entries {
            let metadata = self.metadata(&entry).await?;
            if metadata.is_directory {
                total += self.directory_size(&entry).await?;
            } else {
                total += metadata.size;
            }
        }

        Ok(total)
    }
}
