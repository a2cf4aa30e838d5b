//! Fakes shared by the download pipeline integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::{
    BridgeError, ByteStream, DownloadStream, FileMetadata, FileSystemAccess, HttpClient,
    HttpRequest, HttpResponse, ProgressFn,
};
use bytes::Bytes;
use core_offline::{
    ContentResolver, CourseSyncPipeline, DownloadItem, DownloadStatus, DownloadTree, ItemKey,
    OfflineConfig, OfflineError,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const ROOT: &str = "/offline";
pub const CHUNK: usize = 5;

pub fn test_config() -> OfflineConfig {
    OfflineConfig::default()
        .with_root_directory(ROOT)
        .with_max_retry_attempts(2)
        .with_retry_base_delay(Duration::from_millis(1))
        .with_download_timeout(Duration::from_secs(5))
}

pub fn file_url(id: &str) -> String {
    format!("https://files.test/{}", id)
}

// ============================================================================
// Content
// ============================================================================

/// course → m1 → i1 → (f1, f2); course → m2 → f3, with the given file sizes.
pub fn course_tree(course_id: &str, sizes: [u64; 3]) -> DownloadTree {
    let course = ItemKey::course(course_id);
    let m1 = ItemKey::module(course_id, "m1");
    let m2 = ItemKey::module(course_id, "m2");
    let i1 = ItemKey::item(course_id, "i1");

    let mut tree =
        DownloadTree::new(DownloadItem::new(course.clone(), format!("Course {}", course_id)))
            .unwrap();
    tree.insert(DownloadItem::new(m1.clone(), "Week 1").with_parent(course.clone()))
        .unwrap();
    tree.insert(
        DownloadItem::new(m2.clone(), "Week 2")
            .with_parent(course)
            .with_position(1),
    )
    .unwrap();
    tree.insert(DownloadItem::new(i1.clone(), "Readings").with_parent(m1))
        .unwrap();

    let files = [("f1", i1.clone()), ("f2", i1), ("f3", m2)];
    for ((id, parent), size) in files.into_iter().zip(sizes) {
        let file_id = format!("{}{}", course_id, id);
        tree.insert(
            DownloadItem::file(
                course_id,
                &file_id,
                format!("{}.pdf", id),
                file_url(&file_id),
                size,
            )
            .with_parent(parent),
        )
        .unwrap();
    }
    tree
}

pub fn file_key(course_id: &str, id: &str) -> ItemKey {
    ItemKey::file(course_id, format!("{}{}", course_id, id))
}

#[derive(Default)]
pub struct StaticResolver {
    trees: Mutex<HashMap<String, DownloadTree>>,
}

impl StaticResolver {
    pub fn with(trees: impl IntoIterator<Item = DownloadTree>) -> Self {
        let resolver = Self::default();
        for tree in trees {
            resolver
                .trees
                .lock()
                .insert(tree.course_id().to_string(), tree);
        }
        resolver
    }
}

#[async_trait]
impl ContentResolver for StaticResolver {
    async fn resolve(&self, course_id: &str) -> core_offline::Result<DownloadTree> {
        self.trees
            .lock()
            .get(course_id)
            .cloned()
            .ok_or_else(|| OfflineError::CourseNotSelected(course_id.to_string()))
    }
}

// ============================================================================
// HTTP
// ============================================================================

#[derive(Debug, Clone)]
pub enum Script {
    /// Serves `size` bytes in chunks of [`CHUNK`].
    Body(usize),
    /// Serves `sent` of `size` bytes, then drops the connection.
    Broken { sent: usize, size: usize },
    /// Answers 503 for the first `failures` requests, then serves `size` bytes.
    Flaky { failures: usize, size: usize },
    /// Serves one chunk, then never finishes.
    Stall { size: usize },
    /// Answers with a fixed status.
    Status(u16),
}

#[derive(Default)]
pub struct ScriptedHttp {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<BTreeMap<String, usize>>,
}

impl ScriptedHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, url: impl Into<String>, script: Script) {
        self.scripts.lock().insert(url.into(), script);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

fn chunks(size: usize) -> Vec<bridge_traits::error::Result<Bytes>> {
    let body = vec![b'x'; size];
    body.chunks(CHUNK)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect()
}

#[async_trait]
impl HttpClient for ScriptedHttp {
    async fn execute(&self, request: HttpRequest) -> bridge_traits::error::Result<HttpResponse> {
        Err(BridgeError::NotAvailable(format!(
            "unexpected request to {}",
            request.url
        )))
    }

    async fn download_stream(&self, url: String) -> bridge_traits::error::Result<DownloadStream> {
        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry(url.clone()).or_default();
            *count += 1;
            *count
        };
        let script = self
            .scripts
            .lock()
            .get(&url)
            .cloned()
            .unwrap_or(Script::Status(404));

        let (size, stream): (usize, ByteStream) = match script {
            Script::Body(size) => (size, futures::stream::iter(chunks(size)).boxed()),
            Script::Broken { sent, size } => {
                let mut parts = chunks(sent);
                parts.push(Err(BridgeError::OperationFailed(
                    "connection reset by peer".to_string(),
                )));
                (size, futures::stream::iter(parts).boxed())
            }
            Script::Flaky { failures, .. } if call <= failures => {
                return Err(BridgeError::Http {
                    status: 503,
                    message: "service unavailable".to_string(),
                });
            }
            Script::Flaky { size, .. } => (size, futures::stream::iter(chunks(size)).boxed()),
            Script::Stall { size } => {
                let first = chunks(CHUNK.min(size));
                let stream = futures::stream::iter(first).chain(futures::stream::pending());
                (size, stream.boxed())
            }
            Script::Status(status) => {
                return Err(BridgeError::Http {
                    status,
                    message: format!("status {}", status),
                })
            }
        };

        Ok(DownloadStream {
            content_length: Some(size as u64),
            stream,
        })
    }
}

// ============================================================================
// File System
// ============================================================================

/// In-memory volume with a scripted amount of free space.
pub struct MemoryFs {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
    dirs: Mutex<HashSet<PathBuf>>,
    free: AtomicU64,
    /// File names whose writes fail with an I/O error after the first chunk.
    failing_writes: Mutex<HashSet<String>>,
}

impl MemoryFs {
    pub fn new(free: u64) -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            dirs: Mutex::new(HashSet::new()),
            free: AtomicU64::new(free),
            failing_writes: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_free(&self, bytes: u64) {
        self.free.store(bytes, Ordering::SeqCst);
    }

    pub fn fail_writes_to(&self, file_name: impl Into<String>) {
        self.failing_writes.lock().insert(file_name.into());
    }

    /// Leaves `len` bytes at `path`, as an earlier process would have.
    pub fn put(&self, path: impl Into<PathBuf>, len: usize) {
        self.files.lock().insert(path.into(), vec![0; len]);
    }

    pub fn file(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.lock().keys().cloned().collect()
    }

    pub fn file_count_under(&self, dir: &Path) -> usize {
        self.files
            .lock()
            .keys()
            .filter(|path| path.starts_with(dir))
            .count()
    }

    fn fails(&self, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.failing_writes.lock().contains(&name)
    }
}

#[async_trait]
impl FileSystemAccess for MemoryFs {
    async fn get_data_directory(&self) -> bridge_traits::error::Result<PathBuf> {
        Ok(PathBuf::from(ROOT))
    }

    async fn exists(&self, path: &Path) -> bridge_traits::error::Result<bool> {
        Ok(self.files.lock().contains_key(path) || self.dirs.lock().contains(path))
    }

    async fn metadata(&self, path: &Path) -> bridge_traits::error::Result<FileMetadata> {
        if let Some(data) = self.files.lock().get(path) {
            return Ok(FileMetadata {
                size: data.len() as u64,
                modified_at: None,
                is_directory: false,
            });
        }
        if self.dirs.lock().contains(path) {
            return Ok(FileMetadata {
                size: 0,
                modified_at: None,
                is_directory: true,
            });
        }
        Err(not_found(path))
    }

    async fn create_dir_all(&self, path: &Path) -> bridge_traits::error::Result<()> {
        let mut dirs = self.dirs.lock();
        for ancestor in path.ancestors() {
            dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> bridge_traits::error::Result<Bytes> {
        self.file(path).map(Bytes::from).ok_or_else(|| not_found(path))
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> bridge_traits::error::Result<()> {
        self.files.lock().insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> bridge_traits::error::Result<()> {
        self.files
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    async fn delete_dir_all(&self, path: &Path) -> bridge_traits::error::Result<()> {
        self.files.lock().retain(|file, _| !file.starts_with(path));
        self.dirs.lock().retain(|dir| !dir.starts_with(path));
        Ok(())
    }

    async fn list_directory(&self, path: &Path) -> bridge_traits::error::Result<Vec<PathBuf>> {
        Ok(self
            .files
            .lock()
            .keys()
            .filter(|file| file.parent() == Some(path))
            .cloned()
            .collect())
    }

    async fn open_write_stream(
        &self,
        path: &Path,
    ) -> bridge_traits::error::Result<Box<dyn tokio::io::AsyncWrite + Send + Unpin>> {
        Err(BridgeError::NotAvailable(format!(
            "streaming writers are not faked: {}",
            path.display()
        )))
    }

    async fn available_space(&self, _path: &Path) -> bridge_traits::error::Result<u64> {
        Ok(self.free.load(Ordering::SeqCst))
    }

    async fn write_stream(
        &self,
        path: &Path,
        mut stream: ByteStream,
        on_progress: ProgressFn<'_>,
    ) -> bridge_traits::error::Result<u64> {
        self.files.lock().insert(path.to_path_buf(), Vec::new());
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if written > 0 && self.fails(path) {
                return Err(BridgeError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "no space left on device",
                )));
            }
            if let Some(data) = self.files.lock().get_mut(path) {
                data.extend_from_slice(&chunk);
            }
            written += chunk.len() as u64;
            on_progress(written);
        }
        Ok(written)
    }
}

fn not_found(path: &Path) -> BridgeError {
    BridgeError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        path.display().to_string(),
    ))
}

// ============================================================================
// Waiting
// ============================================================================

/// Polls the pipeline until `key` reaches `status`.
pub async fn wait_for_status(pipeline: &CourseSyncPipeline, key: &ItemKey, status: DownloadStatus) {
    for _ in 0..400 {
        let tree = pipeline.load_tree(&key.course_id).await.unwrap();
        if tree.and_then(|tree| tree.get(key).map(|file| file.status)) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{} never reached {}", key, status);
}
