//! # Course Sync Pipeline
//!
//! Downloads whole courses for offline use.
//!
//! ## Flow
//!
//! 1. **Select**: resolve each course's content tree and persist it. Files
//!    completed by an earlier run are carried over.
//! 2. **Admit**: reserve the summed size of every pending file in one
//!    [`DiskBudget::try_reserve`]. A batch that does not fit is rejected
//!    whole with [`OfflineError::InsufficientSpace`].
//! 3. **Schedule**: at most `max_concurrent_courses` courses and
//!    `max_concurrent_files` files transfer at once.
//! 4. **Track**: every chunk updates the file and its ancestors and emits a
//!    progress event; every status transition is persisted.
//! 5. **Fail per file**: a failed file does not stop its siblings. A disk
//!    write failure re-checks the budget and, when it no longer holds, holds
//!    back every queued file of the batch.
//!
//! [`retry`](CourseSyncPipeline::retry) re-runs failed files only.
//! [`remove`](CourseSyncPipeline::remove) deletes a course from disk and the
//! Local Store and returns its bytes to the budget.

use bridge_traits::{FileSystemAccess, HttpClient};
use core_runtime::events::{CoreEvent, DownloadEvent, EventBus};
use core_runtime::logging::strip_path;
use core_store::LocalStore;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::budget::{DiskBudget, Reservation};
use crate::config::{is_within, OfflineConfig};
use crate::content::ContentResolver;
use crate::downloader::FileDownloader;
use crate::error::{OfflineError, Result};
use crate::item::{DownloadItem, DownloadStatus, ItemKey, ItemKind};
use crate::repository::DownloadRepository;
use crate::tree::DownloadTree;

/// State of one course, as reported after a run or on request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseSyncSummary {
    pub course_id: String,
    pub name: String,
    pub status: DownloadStatus,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    pub total_files: u64,
    pub completed_files: u64,
    pub failed_files: u64,
    pub cancelled_files: u64,
    /// Queued files were held back after the disk budget ran out.
    pub paused: bool,
}

impl CourseSyncSummary {
    pub fn from_tree(tree: &DownloadTree, paused: bool) -> Self {
        let files = tree.files();
        let count = |status: DownloadStatus| files.iter().filter(|f| f.status == status).count() as u64;
        let (bytes_downloaded, bytes_total) = tree.bytes();

        Self {
            course_id: tree.course_id().to_string(),
            name: tree.root().name.clone(),
            status: tree.status(),
            bytes_downloaded,
            bytes_total,
            total_files: files.len() as u64,
            completed_files: count(DownloadStatus::Completed),
            failed_files: count(DownloadStatus::Failed),
            cancelled_files: count(DownloadStatus::Cancelled),
            paused,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == DownloadStatus::Completed
    }

    pub fn progress(&self) -> f64 {
        match self.bytes_total {
            0 if self.is_complete() => 1.0,
            0 => 0.0,
            total => (self.bytes_downloaded as f64 / total as f64).min(1.0),
        }
    }
}

/// A running download batch.
///
/// Dropping the handle leaves the batch running; call
/// [`cancel`](Self::cancel) to stop it.
pub struct SyncHandle {
    course_ids: Vec<String>,
    reserved_bytes: u64,
    token: CancellationToken,
    task: JoinHandle<Vec<CourseSyncSummary>>,
}

impl SyncHandle {
    pub fn course_ids(&self) -> &[String] {
        &self.course_ids
    }

    /// Bytes admitted against the disk budget for this batch.
    pub fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes
    }

    /// Aborts in-flight transfers and cancels every queued file of the batch.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// One summary per course, in admission order.
    pub async fn wait(self) -> Result<Vec<CourseSyncSummary>> {
        self.task
            .await
            .map_err(|e| OfflineError::DownloadFailed(format!("download task ended abnormally: {}", e)))
    }
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("course_ids", &self.course_ids)
            .field("reserved_bytes", &self.reserved_bytes)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Which files a run picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    /// Not started or failed.
    Resumable,
    FailedOnly,
}

impl Pending {
    fn includes(self, status: DownloadStatus) -> bool {
        match self {
            Pending::Resumable => {
                matches!(status, DownloadStatus::NotStarted | DownloadStatus::Failed)
            }
            Pending::FailedOnly => status == DownloadStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOutcome {
    Completed,
    Failed,
    Cancelled,
    /// No longer pending when its turn came.
    Skipped,
    /// Not started because the batch was paused.
    HeldBack,
}

/// A course with a run in flight.
struct ActiveCourse {
    course_id: String,
    token: CancellationToken,
    tree: Mutex<DownloadTree>,
    /// Transfer tokens of files currently downloading. Lock after `tree`.
    in_flight: Mutex<HashMap<ItemKey, CancellationToken>>,
    done: watch::Sender<bool>,
}

impl ActiveCourse {
    fn new(tree: DownloadTree, token: CancellationToken) -> Self {
        Self {
            course_id: tree.course_id().to_string(),
            token,
            tree: Mutex::new(tree),
            in_flight: Mutex::new(HashMap::new()),
            done: watch::channel(false).0,
        }
    }
}

struct CourseRun {
    course: Arc<ActiveCourse>,
    files: Vec<ItemKey>,
    reservation: Reservation,
}

struct PipelineInner {
    config: OfflineConfig,
    resolver: Arc<dyn ContentResolver>,
    downloader: FileDownloader,
    repository: DownloadRepository,
    budget: DiskBudget,
    fs: Arc<dyn FileSystemAccess>,
    events: Option<EventBus>,
    course_slots: Arc<Semaphore>,
    file_slots: Arc<Semaphore>,
    active: Mutex<HashMap<String, Arc<ActiveCourse>>>,
}

#[derive(Clone)]
pub struct CourseSyncPipeline {
    inner: Arc<PipelineInner>,
}

impl CourseSyncPipeline {
    pub fn new(
        config: OfflineConfig,
        resolver: Arc<dyn ContentResolver>,
        http: Arc<dyn HttpClient>,
        fs: Arc<dyn FileSystemAccess>,
        store: Arc<dyn LocalStore>,
        budget: DiskBudget,
        events: Option<EventBus>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(PipelineInner {
                downloader: FileDownloader::new(http, fs.clone(), &config),
                repository: DownloadRepository::new(store),
                course_slots: Arc::new(Semaphore::new(config.max_concurrent_courses)),
                file_slots: Arc::new(Semaphore::new(config.max_concurrent_files)),
                active: Mutex::new(HashMap::new()),
                config,
                resolver,
                budget,
                fs,
                events,
            }),
        })
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.inner.config
    }

    pub fn budget(&self) -> &DiskBudget {
        &self.inner.budget
    }

    pub fn repository(&self) -> &DownloadRepository {
        &self.inner.repository
    }

    pub fn is_running(&self, course_id: &str) -> bool {
        self.inner.active_course(course_id).is_some()
    }

    /// Resolves and stores the download tree of each course.
    #[instrument(skip(self))]
    pub async fn select(&self, course_ids: &[String]) -> Result<Vec<CourseSyncSummary>> {
        let mut summaries = Vec::with_capacity(course_ids.len());

        for course_id in dedup(course_ids) {
            if self.is_running(&course_id) {
                return Err(OfflineError::AlreadyRunning(course_id));
            }

            let mut tree = self.inner.resolver.resolve(&course_id).await?;
            if let Some(previous) = self.inner.repository.load_tree(&course_id).await? {
                tree.adopt_completed(&previous);
                self.inner.discard_orphans(&previous, &tree).await;
            }
            self.inner.repository.save_tree(&tree).await?;

            let summary = CourseSyncSummary::from_tree(&tree, false);
            info!(
                course_id = %course_id,
                files = summary.total_files,
                bytes_total = summary.bytes_total,
                "Course selected for offline use"
            );
            summaries.push(summary);
        }

        Ok(summaries)
    }

    /// Admits every pending file of the courses and starts downloading.
    pub async fn download(&self, course_ids: &[String]) -> Result<SyncHandle> {
        self.start(course_ids, Pending::Resumable).await
    }

    /// Downloads the failed files of a course again.
    pub async fn retry(&self, course_id: &str) -> Result<SyncHandle> {
        self.start(&[course_id.to_string()], Pending::FailedOnly).await
    }

    #[instrument(skip(self))]
    async fn start(&self, course_ids: &[String], pending: Pending) -> Result<SyncHandle> {
        let course_ids = dedup(course_ids);

        let mut plans = Vec::with_capacity(course_ids.len());
        for course_id in &course_ids {
            if self.is_running(course_id) {
                return Err(OfflineError::AlreadyRunning(course_id.clone()));
            }
            let mut tree = self
                .inner
                .repository
                .load_tree(course_id)
                .await?
                .ok_or_else(|| OfflineError::CourseNotSelected(course_id.clone()))?;
            self.inner.recover_interrupted(&mut tree).await?;

            let files: Vec<&DownloadItem> = tree
                .files()
                .into_iter()
                .filter(|file| pending.includes(file.status))
                .collect();
            let bytes: u64 = files.iter().map(|file| file.bytes_total).sum();
            let files: Vec<ItemKey> = files.into_iter().map(|file| file.key.clone()).collect();
            plans.push((tree, files, bytes));
        }

        let requested: u64 = plans.iter().map(|(_, _, bytes)| bytes).sum();
        let mut reservation = self.inner.budget.try_reserve(requested)?;

        let token = CancellationToken::new();
        let runs: Vec<CourseRun> = {
            let mut active = self.inner.active.lock();
            if let Some(busy) = course_ids.iter().find(|id| active.contains_key(*id)) {
                return Err(OfflineError::AlreadyRunning(busy.clone()));
            }

            plans
                .into_iter()
                .map(|(tree, files, bytes)| {
                    let course = Arc::new(ActiveCourse::new(tree, token.child_token()));
                    active.insert(course.course_id.clone(), course.clone());
                    CourseRun {
                        course,
                        files,
                        reservation: reservation.split(bytes),
                    }
                })
                .collect()
        };

        info!(
            courses = course_ids.len(),
            reserved_bytes = requested,
            "Download batch admitted"
        );
        self.inner.emit(DownloadEvent::Admitted {
            course_ids: course_ids.clone(),
            reserved_bytes: requested,
        });

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let paused = Arc::new(AtomicBool::new(false));
            let courses = runs
                .into_iter()
                .map(|run| inner.clone().run_course(run, pending, paused.clone()));
            join_all(courses).await
        });

        Ok(SyncHandle {
            course_ids,
            reserved_bytes: requested,
            token,
            task,
        })
    }

    /// Cancels every unfinished file of a course.
    #[instrument(skip(self))]
    pub async fn cancel_course(&self, course_id: &str) -> Result<()> {
        if let Some(course) = self.inner.active_course(course_id) {
            info!("Cancelling course download");
            course.token.cancel();
            return Ok(());
        }

        let mut tree = self.inner.load(course_id).await?;
        let root = tree.root().key.clone();
        if !tree.cancel(&root)?.is_empty() {
            self.inner.repository.save_items(tree.items()).await?;
            self.inner.emit(progress_event(&tree));
        }
        Ok(())
    }

    /// Cancels the files at or below one item, leaving its siblings running.
    #[instrument(skip(self), fields(item = %key))]
    pub async fn cancel_item(&self, key: &ItemKey) -> Result<()> {
        if key.kind == ItemKind::Course {
            return self.cancel_course(&key.course_id).await;
        }

        if let Some(course) = self.inner.active_course(&key.course_id) {
            let (changed, progress) = {
                let mut tree = course.tree.lock();
                if !tree.contains(key) {
                    return Err(OfflineError::ItemNotFound(key.to_string()));
                }
                let in_flight = course.in_flight.lock();

                let mut changed = Vec::new();
                for file in tree.files_under(key) {
                    if let Some(transfer) = in_flight.get(&file) {
                        // The transfer marks itself cancelled when it unwinds.
                        transfer.cancel();
                        continue;
                    }
                    let live = tree.get(&file).is_some_and(|f| !f.status.is_terminal());
                    if live {
                        tree.transition(&file, DownloadStatus::Cancelled, None)?;
                        changed.extend(tree.ancestry(&file));
                    }
                }
                (changed, progress_event(&tree))
            };

            self.inner.repository.save_items(&changed).await?;
            self.inner.emit(progress);
            return Ok(());
        }

        let mut tree = self.inner.load(&key.course_id).await?;
        if !tree.contains(key) {
            return Err(OfflineError::ItemNotFound(key.to_string()));
        }
        tree.cancel(key)?;
        self.inner.repository.save_items(tree.items()).await?;
        self.inner.emit(progress_event(&tree));
        Ok(())
    }

    /// Cancels every running course.
    pub fn cancel_all(&self) {
        let active: Vec<Arc<ActiveCourse>> = self.inner.active.lock().values().cloned().collect();
        info!(courses = active.len(), "Cancelling all course downloads");
        for course in active {
            course.token.cancel();
        }
    }

    /// Deletes a course's files and download items and returns the freed bytes.
    #[instrument(skip(self))]
    pub async fn remove(&self, course_id: &str) -> Result<u64> {
        self.inner.stop(course_id).await;

        let tree = self.inner.repository.load_tree(course_id).await?;
        let removed_dir = self.inner.delete_course_directory(course_id).await?;
        if tree.is_none() && !removed_dir {
            return Err(OfflineError::CourseNotSelected(course_id.to_string()));
        }

        let freed = tree.as_ref().map(DownloadTree::completed_bytes).unwrap_or(0);
        self.inner.repository.delete_course(course_id).await?;
        self.inner.budget.release(freed);

        info!(freed_bytes = freed, "Removed offline course");
        self.inner.emit(DownloadEvent::Removed {
            course_id: course_id.to_string(),
            freed_bytes: freed,
        });
        Ok(freed)
    }

    /// Deletes the downloaded content of each course but keeps it selected,
    /// with every file back to not started. Returns the freed bytes.
    #[instrument(skip(self))]
    pub async fn clean_content(&self, course_ids: &[String]) -> Result<u64> {
        let mut freed = 0;

        for course_id in dedup(course_ids) {
            self.inner.stop(&course_id).await;
            self.inner.delete_course_directory(&course_id).await?;

            let Some(mut tree) = self.inner.repository.load_tree(&course_id).await? else {
                continue;
            };
            let bytes = tree.completed_bytes();
            tree.reset();
            self.inner.repository.save_tree(&tree).await?;
            self.inner.budget.release(bytes);
            self.inner.emit(progress_event(&tree));
            freed += bytes;
        }

        Ok(freed)
    }

    /// Current state of a course, live while it downloads.
    pub async fn progress(&self, course_id: &str) -> Result<CourseSyncSummary> {
        if let Some(course) = self.inner.active_course(course_id) {
            let tree = course.tree.lock();
            return Ok(CourseSyncSummary::from_tree(&tree, false));
        }
        let tree = self.inner.load(course_id).await?;
        Ok(CourseSyncSummary::from_tree(&tree, false))
    }

    pub async fn load_tree(&self, course_id: &str) -> Result<Option<DownloadTree>> {
        if let Some(course) = self.inner.active_course(course_id) {
            return Ok(Some(course.tree.lock().clone()));
        }
        self.inner.repository.load_tree(course_id).await
    }

    /// Course items of every selected course.
    pub async fn selected_courses(&self) -> Result<Vec<DownloadItem>> {
        self.inner.repository.courses().await
    }

    /// Course items of courses whose every file is downloaded.
    pub async fn downloaded_courses(&self) -> Result<Vec<DownloadItem>> {
        let courses = self.inner.repository.courses().await?;
        Ok(courses
            .into_iter()
            .filter(|course| course.status == DownloadStatus::Completed)
            .collect())
    }
}

impl std::fmt::Debug for CourseSyncPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CourseSyncPipeline")
            .field("config", &self.inner.config)
            .field("budget", &self.inner.budget.snapshot())
            .field("active", &self.inner.active.lock().len())
            .finish()
    }
}

impl PipelineInner {
    fn active_course(&self, course_id: &str) -> Option<Arc<ActiveCourse>> {
        self.active.lock().get(course_id).cloned()
    }

    async fn load(&self, course_id: &str) -> Result<DownloadTree> {
        self.repository
            .load_tree(course_id)
            .await?
            .ok_or_else(|| OfflineError::CourseNotSelected(course_id.to_string()))
    }

    /// Cancels a running course and waits until its run has persisted.
    async fn stop(&self, course_id: &str) {
        let Some(course) = self.active_course(course_id) else {
            return;
        };
        let mut done = course.done.subscribe();
        course.token.cancel();
        if done.wait_for(|finished| *finished).await.is_err() {
            debug!(course_id, "Course run ended without reporting");
        }
    }

    #[instrument(skip(self, run, paused), fields(course_id = %run.course.course_id))]
    async fn run_course(
        self: Arc<Self>,
        run: CourseRun,
        pending: Pending,
        paused: Arc<AtomicBool>,
    ) -> CourseSyncSummary {
        let CourseRun {
            course,
            files,
            reservation,
        } = run;
        let reservation = Mutex::new(reservation);

        let permit = tokio::select! {
            biased;
            _ = course.token.cancelled() => None,
            permit = self.course_slots.clone().acquire_owned() => permit.ok(),
        };

        let mut held_back = false;
        if permit.is_some() {
            debug!(files = files.len(), "Course download started");
            let outcomes = join_all(
                files
                    .iter()
                    .map(|key| self.run_file(&course, key, pending, &reservation, &paused)),
            )
            .await;
            held_back = outcomes.contains(&FileOutcome::HeldBack);
            debug!(
                completed = outcomes.iter().filter(|o| **o == FileOutcome::Completed).count(),
                failed = outcomes.iter().filter(|o| **o == FileOutcome::Failed).count(),
                cancelled = outcomes.iter().filter(|o| **o == FileOutcome::Cancelled).count(),
                skipped = outcomes.iter().filter(|o| **o == FileOutcome::Skipped).count(),
                "Course files settled"
            );
        }
        drop(permit);

        let tree = {
            let mut tree = course.tree.lock();
            if course.token.is_cancelled() {
                let root = tree.root().key.clone();
                if let Err(e) = tree.cancel(&root) {
                    warn!(error = %e, "Failed to cancel remaining files");
                }
            }
            tree.clone()
        };

        if let Err(e) = self.repository.save_items(tree.items()).await {
            warn!(error = %e, "Failed to persist download tree");
        }
        self.active.lock().remove(&course.course_id);
        course.done.send_replace(true);

        let summary = CourseSyncSummary::from_tree(&tree, held_back);
        let status = if held_back {
            "paused"
        } else {
            summary.status.as_str()
        };
        info!(
            status,
            completed_files = summary.completed_files,
            failed_files = summary.failed_files,
            bytes_downloaded = summary.bytes_downloaded,
            "Course download finished"
        );
        self.emit(progress_event(&tree));
        self.emit(DownloadEvent::Finished {
            course_id: summary.course_id.clone(),
            status: status.to_string(),
            completed_files: summary.completed_files,
            failed_files: summary.failed_files,
        });
        summary
    }

    async fn run_file(
        &self,
        course: &ActiveCourse,
        key: &ItemKey,
        pending: Pending,
        reservation: &Mutex<Reservation>,
        paused: &AtomicBool,
    ) -> FileOutcome {
        let _permit = tokio::select! {
            biased;
            _ = course.token.cancelled() => return FileOutcome::Cancelled,
            permit = self.file_slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return FileOutcome::Cancelled,
            },
        };
        if paused.load(Ordering::SeqCst) {
            return FileOutcome::HeldBack;
        }

        let transfer = course.token.child_token();
        let (url, path, bytes_total) = {
            let mut tree = course.tree.lock();
            let Some(file) = tree.get(key) else {
                return FileOutcome::Skipped;
            };
            if !pending.includes(file.status) {
                return FileOutcome::Skipped;
            }
            let url = file.url.clone();
            let path = self.config.file_path(&key.course_id, &key.id, &file.name);
            let bytes_total = file.bytes_total;

            if let Err(e) = tree.transition(key, DownloadStatus::InProgress, None) {
                warn!(item = %key, error = %e, "Cannot start file");
                return FileOutcome::Skipped;
            }
            course.in_flight.lock().insert(key.clone(), transfer.clone());
            (url, path, bytes_total)
        };
        let share = reservation.lock().split(bytes_total);
        self.persist_transition(course, key).await;

        let on_progress = |written: u64, total: Option<u64>| {
            let progress = {
                let mut tree = course.tree.lock();
                if tree.update_file_progress(key, written, total).is_err() {
                    return;
                }
                progress_event(&tree)
            };
            self.emit(progress);
        };
        let result = match url {
            Some(url) => {
                self.downloader
                    .download(&url, &path, &transfer, &on_progress)
                    .await
            }
            None => Err(OfflineError::DownloadFailed(
                "file has no download URL".to_string(),
            )),
        };
        course.in_flight.lock().remove(key);

        let (outcome, status, error) = match result {
            Ok(bytes) => {
                share.commit(bytes);
                let mut tree = course.tree.lock();
                if let Err(e) = tree
                    .update_file_progress(key, bytes, Some(bytes))
                    .and_then(|_| tree.set_local_path(key, path.to_string_lossy()))
                {
                    warn!(item = %key, error = %e, "Failed to record download");
                }
                (FileOutcome::Completed, DownloadStatus::Completed, None)
            }
            Err(OfflineError::Cancelled) => {
                drop(share);
                (FileOutcome::Cancelled, DownloadStatus::Cancelled, None)
            }
            Err(e) => {
                drop(share);
                if e.is_storage_error() {
                    self.recheck_budget(&course.course_id, paused).await;
                }
                (FileOutcome::Failed, DownloadStatus::Failed, Some(e.to_string()))
            }
        };

        let transitioned = course.tree.lock().transition(key, status, error);
        if let Err(e) = transitioned {
            debug!(item = %key, error = %e, "File already settled");
        }
        self.persist_transition(course, key).await;
        outcome
    }

    /// Re-bases the budget on the filesystem after a failed disk write and
    /// pauses the batch when the admitted work no longer fits.
    async fn recheck_budget(&self, course_id: &str, paused: &AtomicBool) {
        let reason = match self.fs.available_space(&self.config.root_directory).await {
            Ok(free) => {
                let snapshot = self.budget.recheck(free);
                if !snapshot.is_over_committed() {
                    return;
                }
                format!(
                    "{} bytes pending, {} bytes free",
                    snapshot.reserved,
                    snapshot.capacity.saturating_sub(snapshot.consumed)
                )
            }
            Err(e) => format!("free space unknown: {}", e),
        };

        if !paused.swap(true, Ordering::SeqCst) {
            warn!(course_id, reason = %reason, "Holding back queued downloads");
            self.emit(DownloadEvent::Paused {
                course_id: course_id.to_string(),
                reason,
            });
        }
    }

    async fn persist_transition(&self, course: &ActiveCourse, key: &ItemKey) {
        let (items, status, progress) = {
            let tree = course.tree.lock();
            (
                tree.ancestry(key),
                tree.get(key).map(|file| file.status),
                progress_event(&tree),
            )
        };

        if let Some(status) = status {
            self.emit(DownloadEvent::ItemStatusChanged {
                course_id: course.course_id.clone(),
                item_key: key.to_string(),
                status: status.as_str().to_string(),
            });
        }
        self.emit(progress);

        if let Err(e) = self.repository.save_items(&items).await {
            warn!(item = %key, error = %e, "Failed to persist download item");
        }
    }

    /// Fails files a previous run left `inProgress` and deletes their partial
    /// downloads. Only called for courses without a run in flight.
    async fn recover_interrupted(&self, tree: &mut DownloadTree) -> Result<()> {
        let interrupted = tree.fail_interrupted();
        if interrupted.is_empty() {
            return Ok(());
        }

        for key in &interrupted {
            if let Some(file) = tree.get(key) {
                let path = self.config.file_path(&key.course_id, &key.id, &file.name);
                self.delete_file(&path).await;
            }
        }
        self.repository.save_items(tree.items()).await?;
        info!(
            course_id = tree.course_id(),
            files = interrupted.len(),
            "Recovered interrupted downloads"
        );
        Ok(())
    }

    /// Deletes files completed in `previous` that `current` no longer holds.
    async fn discard_orphans(&self, previous: &DownloadTree, current: &DownloadTree) {
        for file in previous.files_with_status(DownloadStatus::Completed) {
            let kept = current
                .get(&file.key)
                .is_some_and(|f| f.status == DownloadStatus::Completed);
            if kept {
                continue;
            }
            if let Some(path) = &file.local_path {
                self.delete_file(Path::new(path)).await;
            }
            self.budget.release(file.bytes_downloaded);
        }
    }

    async fn delete_file(&self, path: &Path) {
        if !is_within(&self.config.root_directory, path) {
            warn!(file = %strip_path(path), "Refusing to delete outside the offline directory");
            return;
        }
        if let Err(e) = self.fs.delete_file(path).await {
            debug!(file = %strip_path(path), error = %e, "Failed to delete stale file");
        }
    }

    /// Returns whether the directory existed.
    async fn delete_course_directory(&self, course_id: &str) -> Result<bool> {
        let dir = self.config.course_directory(course_id);
        if !self.fs.exists(&dir).await? {
            return Ok(false);
        }
        self.fs.delete_dir_all(&dir).await?;
        debug!(dir = %strip_path(&dir), "Deleted course directory");
        Ok(true)
    }

    fn emit(&self, event: DownloadEvent) {
        if let Some(events) = &self.events {
            events.emit(CoreEvent::Download(event)).ok();
        }
    }
}

fn progress_event(tree: &DownloadTree) -> DownloadEvent {
    let (bytes_downloaded, bytes_total) = tree.bytes();
    DownloadEvent::Progress {
        course_id: tree.course_id().to_string(),
        bytes_downloaded,
        bytes_total,
        status: tree.status().as_str().to_string(),
    }
}

/// Keeps the first occurrence of each id.
fn dedup(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}
