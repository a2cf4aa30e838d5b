//! Integration tests for the course download pipeline
//!
//! These tests verify:
//! - Byte-weighted course progress with a partially failed file
//! - All-or-nothing admission against the disk budget
//! - Retry of failed files only
//! - Cancellation of whole courses and single items
//! - Holding back queued files after a disk-write failure
//! - Removing and cleaning downloaded content

mod common;

use common::*;
use core_offline::{
    CourseSyncPipeline, DiskBudget, DownloadStatus, DownloadTree, ItemKey, OfflineConfig,
    OfflineError,
};
use core_runtime::events::{CoreEvent, DownloadEvent, EventBus};
use core_store::{LocalStore, MemoryStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::Receiver;

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    pipeline: CourseSyncPipeline,
    http: Arc<ScriptedHttp>,
    fs: Arc<MemoryFs>,
    events: Receiver<CoreEvent>,
}

impl Harness {
    fn new(trees: Vec<DownloadTree>, capacity: u64) -> Self {
        Self::with_config(trees, capacity, test_config())
    }

    fn with_config(trees: Vec<DownloadTree>, capacity: u64, config: OfflineConfig) -> Self {
        let http = Arc::new(ScriptedHttp::new());
        let fs = Arc::new(MemoryFs::new(capacity));
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let bus = EventBus::new(1024);
        let events = bus.subscribe();

        let pipeline = CourseSyncPipeline::new(
            config,
            Arc::new(StaticResolver::with(trees)),
            http.clone(),
            fs.clone(),
            store,
            DiskBudget::new(capacity),
            Some(bus),
        )
        .unwrap();

        Self {
            pipeline,
            http,
            fs,
            events,
        }
    }

    /// Serves every file of the tree in full.
    fn serve(&self, tree: &DownloadTree) {
        for file in tree.files() {
            self.http.script(
                file.url.clone().unwrap(),
                Script::Body(file.bytes_total as usize),
            );
        }
    }

    async fn select(&self, course_id: &str) {
        self.pipeline.select(&ids(&[course_id])).await.unwrap();
    }

    async fn download_all(&self, course_id: &str) {
        let summaries = self
            .pipeline
            .download(&ids(&[course_id]))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(summaries[0].is_complete());
    }

    async fn status_of(&self, key: &ItemKey) -> DownloadStatus {
        let tree = self.pipeline.load_tree(&key.course_id).await.unwrap().unwrap();
        tree.get(key).unwrap().status
    }

    fn drain_events(&mut self) -> Vec<DownloadEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let CoreEvent::Download(event) = event {
                out.push(event);
            }
        }
        out
    }
}

fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

fn course_dir(course_id: &str) -> PathBuf {
    Path::new(ROOT).join(format!("course-{}", course_id))
}

// ============================================================================
// Progress and failures
// ============================================================================

#[tokio::test]
async fn test_partial_failure_weights_progress_by_bytes() {
    let tree = course_tree("1", [10, 20, 30]);
    let h = Harness::new(vec![tree.clone()], 1_000);
    h.serve(&tree);
    h.http
        .script(file_url("1f2"), Script::Broken { sent: 5, size: 20 });
    h.select("1").await;

    let summaries = h.pipeline.download(&ids(&["1"])).await.unwrap().wait().await.unwrap();
    let summary = &summaries[0];

    assert_eq!(summary.bytes_downloaded, 45);
    assert_eq!(summary.bytes_total, 60);
    assert!((summary.progress() - 0.75).abs() < f64::EPSILON);
    assert_ne!(summary.status, DownloadStatus::Completed);
    assert_eq!(summary.status, DownloadStatus::Failed);
    assert_eq!((summary.completed_files, summary.failed_files), (2, 1));

    // The persisted tree agrees with the summary.
    let stored = h.pipeline.repository().load_tree("1").await.unwrap().unwrap();
    assert_eq!(stored.bytes(), (45, 60));
    let failed = stored.get(&file_key("1", "f2")).unwrap();
    assert_eq!(failed.status, DownloadStatus::Failed);
    assert!(failed.error.is_some());
    assert_eq!(
        stored.get(&ItemKey::item("1", "i1")).unwrap().status,
        DownloadStatus::Failed
    );

    // Transient failure retried up to the attempt limit; partial bytes discarded.
    assert_eq!(h.http.calls(&file_url("1f2")), 2);
    assert_eq!(h.fs.file_count_under(&course_dir("1")), 2);

    let budget = h.pipeline.budget().snapshot();
    assert_eq!((budget.consumed, budget.reserved), (40, 0));
}

#[tokio::test]
async fn test_missing_file_is_not_retried() {
    let tree = course_tree("1", [10, 20, 30]);
    let h = Harness::new(vec![tree.clone()], 1_000);
    h.serve(&tree);
    h.http.script(file_url("1f3"), Script::Status(404));
    h.select("1").await;

    let summaries = h.pipeline.download(&ids(&["1"])).await.unwrap().wait().await.unwrap();

    assert_eq!(summaries[0].failed_files, 1);
    assert_eq!(h.http.calls(&file_url("1f3")), 1);
    assert_eq!(
        h.status_of(&ItemKey::module("1", "m2")).await,
        DownloadStatus::Failed
    );
}

#[tokio::test]
async fn test_retry_downloads_only_failed_files() {
    let tree = course_tree("1", [10, 20, 30]);
    let h = Harness::new(vec![tree.clone()], 1_000);
    h.serve(&tree);
    h.http
        .script(file_url("1f2"), Script::Broken { sent: 5, size: 20 });
    h.select("1").await;
    h.pipeline.download(&ids(&["1"])).await.unwrap().wait().await.unwrap();

    h.http.script(file_url("1f2"), Script::Body(20));
    let handle = h.pipeline.retry("1").await.unwrap();
    assert_eq!(handle.reserved_bytes(), 20);
    let summaries = handle.wait().await.unwrap();

    assert!(summaries[0].is_complete());
    assert_eq!(summaries[0].bytes_downloaded, 60);
    assert_eq!(h.http.calls(&file_url("1f1")), 1);
    assert_eq!(h.http.calls(&file_url("1f2")), 3);
    assert_eq!(h.http.calls(&file_url("1f3")), 1);

    let downloaded = h.pipeline.downloaded_courses().await.unwrap();
    assert_eq!(downloaded.len(), 1);
    assert_eq!(downloaded[0].key, ItemKey::course("1"));
    assert_eq!(h.pipeline.budget().snapshot().consumed, 60);
}

/// Stores the `[10, 20, 30]` course as a run killed mid-transfer leaves it:
/// f1 complete, f2 `inProgress` with 5 bytes and a partial file on disk.
async fn interrupted_course(h: &Harness) -> DownloadTree {
    let mut tree = course_tree("1", [10, 20, 30]);
    let f1 = file_key("1", "f1");
    let f2 = file_key("1", "f2");
    tree.transition(&f1, DownloadStatus::InProgress, None).unwrap();
    tree.update_file_progress(&f1, 10, None).unwrap();
    tree.set_local_path(&f1, "/offline/course-1/1f1-f1.pdf").unwrap();
    tree.transition(&f1, DownloadStatus::Completed, None).unwrap();
    tree.transition(&f2, DownloadStatus::InProgress, None).unwrap();
    tree.update_file_progress(&f2, 5, None).unwrap();

    h.pipeline.repository().save_tree(&tree).await.unwrap();
    h.fs.put("/offline/course-1/1f1-f1.pdf", 10);
    h.fs.put("/offline/course-1/1f2-f2.pdf", 5);
    tree
}

#[tokio::test]
async fn test_download_resumes_interrupted_course() {
    let h = Harness::new(vec![], 1_000);
    let tree = interrupted_course(&h).await;
    h.serve(&tree);

    let handle = h.pipeline.download(&ids(&["1"])).await.unwrap();
    assert_eq!(handle.reserved_bytes(), 50);
    let summaries = handle.wait().await.unwrap();

    assert!(summaries[0].is_complete());
    assert_eq!(summaries[0].bytes_downloaded, 60);
    assert_eq!(h.http.calls(&file_url("1f1")), 0);
    assert_eq!(h.http.calls(&file_url("1f2")), 1);
    assert_eq!(h.http.calls(&file_url("1f3")), 1);
    assert_eq!(
        h.fs.file(Path::new("/offline/course-1/1f2-f2.pdf")).unwrap().len(),
        20
    );
    assert_eq!(
        h.status_of(&file_key("1", "f2")).await,
        DownloadStatus::Completed
    );
}

#[tokio::test]
async fn test_retry_picks_up_interrupted_files() {
    let h = Harness::new(vec![], 1_000);
    let tree = interrupted_course(&h).await;
    h.serve(&tree);

    let handle = h.pipeline.retry("1").await.unwrap();
    assert_eq!(handle.reserved_bytes(), 20);
    let summaries = handle.wait().await.unwrap();

    assert_eq!(summaries[0].completed_files, 2);
    assert_eq!(summaries[0].bytes_downloaded, 30);
    assert_eq!(h.http.calls(&file_url("1f2")), 1);
    assert_eq!(h.http.calls(&file_url("1f3")), 0);
    assert_eq!(
        h.status_of(&file_key("1", "f2")).await,
        DownloadStatus::Completed
    );
}

#[tokio::test]
async fn test_interrupted_partial_is_discarded_before_resuming() {
    let h = Harness::new(vec![], 1_000);
    interrupted_course(&h).await;
    h.http.script(file_url("1f2"), Script::Status(404));
    h.http.script(file_url("1f3"), Script::Body(30));

    let summaries = h.pipeline.download(&ids(&["1"])).await.unwrap().wait().await.unwrap();

    assert_eq!(summaries[0].status, DownloadStatus::Failed);
    assert_eq!(summaries[0].bytes_downloaded, 40);
    assert!(h.fs.file(Path::new("/offline/course-1/1f2-f2.pdf")).is_none());
}

#[tokio::test]
async fn test_download_requires_selection() {
    let h = Harness::new(vec![course_tree("1", [10, 20, 30])], 1_000);

    let err = h.pipeline.download(&ids(&["1"])).await.unwrap_err();

    assert!(matches!(err, OfflineError::CourseNotSelected(id) if id == "1"));
    assert_eq!(h.http.total_calls(), 0);
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn test_admission_is_all_or_nothing() {
    let one = course_tree("1", [10, 20, 30]);
    let two = course_tree("2", [5, 5, 5]);
    let h = Harness::new(vec![one.clone(), two.clone()], 50);
    h.serve(&one);
    h.serve(&two);
    h.select("1").await;
    h.select("2").await;

    let err = h.pipeline.download(&ids(&["1", "2"])).await.unwrap_err();

    assert!(matches!(
        err,
        OfflineError::InsufficientSpace {
            requested: 75,
            available: 50
        }
    ));
    assert_eq!(h.http.total_calls(), 0);
    assert_eq!(h.pipeline.budget().snapshot().reserved, 0);
    for course in ["1", "2"] {
        assert_eq!(
            h.pipeline.progress(course).await.unwrap().status,
            DownloadStatus::NotStarted
        );
    }

    // The smaller course alone fits.
    h.download_all("2").await;
    assert_eq!(h.pipeline.budget().snapshot().consumed, 15);
}

#[tokio::test]
async fn test_concurrent_batches_cannot_overbook_the_budget() {
    let one = course_tree("1", [10, 20, 30]);
    let two = course_tree("2", [10, 20, 30]);
    let h = Harness::new(vec![one.clone(), two.clone()], 100);
    h.serve(&one);
    h.serve(&two);
    h.select("1").await;
    h.select("2").await;

    let first = ids(&["1"]);
    let second = ids(&["2"]);
    let (a, b) = tokio::join!(h.pipeline.download(&first), h.pipeline.download(&second));

    let (admitted, rejected) = match (a, b) {
        (Ok(handle), Err(err)) | (Err(err), Ok(handle)) => (handle, err),
        (a, b) => panic!("expected exactly one admission, got {:?} and {:?}", a.is_ok(), b.is_ok()),
    };
    assert!(matches!(rejected, OfflineError::InsufficientSpace { requested: 60, .. }));

    admitted.wait().await.unwrap();
    assert_eq!(h.pipeline.budget().snapshot().consumed, 60);
}

#[tokio::test]
async fn test_completed_course_needs_no_new_reservation() {
    let tree = course_tree("1", [10, 20, 30]);
    let h = Harness::new(vec![tree.clone()], 100);
    h.serve(&tree);
    h.select("1").await;
    h.download_all("1").await;

    // Selecting again adopts what is already on disk.
    let summaries = h.pipeline.select(&ids(&["1"])).await.unwrap();
    assert!(summaries[0].is_complete());

    let handle = h.pipeline.download(&ids(&["1"])).await.unwrap();
    assert_eq!(handle.reserved_bytes(), 0);
    handle.wait().await.unwrap();
    assert_eq!(h.http.total_calls(), 3);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_course_stops_transfer_and_queue() {
    let tree = course_tree("1", [10, 20, 30]);
    let config = test_config().with_max_concurrent_files(1);
    let h = Harness::with_config(vec![tree.clone()], 1_000, config);
    h.serve(&tree);
    h.http.script(file_url("1f1"), Script::Stall { size: 10 });
    h.select("1").await;

    let handle = h.pipeline.download(&ids(&["1"])).await.unwrap();
    wait_for_status(&h.pipeline, &file_key("1", "f1"), DownloadStatus::InProgress).await;
    assert!(h.pipeline.is_running("1"));

    h.pipeline.cancel_course("1").await.unwrap();
    let summaries = handle.wait().await.unwrap();

    assert_eq!(summaries[0].status, DownloadStatus::Cancelled);
    assert_eq!(summaries[0].cancelled_files, 3);
    assert!(!h.pipeline.is_running("1"));
    assert_eq!(h.http.calls(&file_url("1f2")), 0);
    assert_eq!(h.fs.file_count_under(&course_dir("1")), 0);

    let budget = h.pipeline.budget().snapshot();
    assert_eq!((budget.consumed, budget.reserved), (0, 0));

    // Cancelled files stay cancelled on the next download.
    let handle = h.pipeline.download(&ids(&["1"])).await.unwrap();
    assert_eq!(handle.reserved_bytes(), 0);
    assert_eq!(handle.wait().await.unwrap()[0].cancelled_files, 3);
}

#[tokio::test]
async fn test_cancel_item_leaves_siblings_running() {
    let tree = course_tree("1", [10, 20, 30]);
    let config = test_config().with_max_concurrent_files(1);
    let h = Harness::with_config(vec![tree.clone()], 1_000, config);
    h.serve(&tree);
    h.http.script(file_url("1f1"), Script::Stall { size: 10 });
    h.select("1").await;

    let handle = h.pipeline.download(&ids(&["1"])).await.unwrap();
    let stalled = file_key("1", "f1");
    wait_for_status(&h.pipeline, &stalled, DownloadStatus::InProgress).await;

    h.pipeline.cancel_item(&stalled).await.unwrap();
    let summaries = handle.wait().await.unwrap();

    assert_eq!(h.status_of(&stalled).await, DownloadStatus::Cancelled);
    assert_eq!(h.status_of(&file_key("1", "f2")).await, DownloadStatus::Completed);
    assert_eq!(h.status_of(&file_key("1", "f3")).await, DownloadStatus::Completed);
    assert_eq!(summaries[0].completed_files, 2);
    assert_eq!(summaries[0].status, DownloadStatus::Cancelled);
    assert_eq!(h.pipeline.budget().snapshot().consumed, 50);
}

#[tokio::test]
async fn test_cancel_item_rejects_unknown_items() {
    let h = Harness::new(vec![course_tree("1", [10, 20, 30])], 1_000);
    h.select("1").await;

    let err = h
        .pipeline
        .cancel_item(&ItemKey::file("1", "nope"))
        .await
        .unwrap_err();

    assert!(matches!(err, OfflineError::ItemNotFound(_)));
}

#[tokio::test]
async fn test_running_course_rejects_second_start() {
    let tree = course_tree("1", [10, 20, 30]);
    let h = Harness::new(vec![tree.clone()], 1_000);
    h.serve(&tree);
    h.http.script(file_url("1f1"), Script::Stall { size: 10 });
    h.select("1").await;

    let handle = h.pipeline.download(&ids(&["1"])).await.unwrap();

    assert!(matches!(
        h.pipeline.download(&ids(&["1"])).await,
        Err(OfflineError::AlreadyRunning(_))
    ));
    assert!(matches!(
        h.pipeline.select(&ids(&["1"])).await,
        Err(OfflineError::AlreadyRunning(_))
    ));

    h.pipeline.cancel_all();
    handle.wait().await.unwrap();
    assert!(!h.pipeline.is_running("1"));
}

// ============================================================================
// Disk pressure
// ============================================================================

#[tokio::test]
async fn test_disk_write_failure_holds_back_queued_files() {
    let tree = course_tree("1", [10, 20, 30]);
    let config = test_config().with_max_concurrent_files(1);
    let mut h = Harness::with_config(vec![tree.clone()], 1_000, config);
    h.serve(&tree);
    h.fs.fail_writes_to("1f1-f1.pdf");
    h.fs.set_free(5);
    h.select("1").await;

    let summaries = h.pipeline.download(&ids(&["1"])).await.unwrap().wait().await.unwrap();
    let summary = &summaries[0];

    assert!(summary.paused);
    assert_eq!(summary.failed_files, 1);
    assert_eq!(h.http.calls(&file_url("1f1")), 1);
    assert_eq!(h.http.calls(&file_url("1f2")), 0);
    assert_eq!(h.http.calls(&file_url("1f3")), 0);
    assert_eq!(h.status_of(&file_key("1", "f2")).await, DownloadStatus::NotStarted);
    assert_eq!(h.status_of(&file_key("1", "f3")).await, DownloadStatus::NotStarted);

    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, DownloadEvent::Paused { course_id, .. } if course_id == "1")));
    assert!(events
        .iter()
        .any(|e| matches!(e, DownloadEvent::Finished { status, .. } if status == "paused")));

    let budget = h.pipeline.budget().snapshot();
    assert_eq!((budget.capacity, budget.reserved), (5, 0));
}

// ============================================================================
// Removal
// ============================================================================

#[tokio::test]
async fn test_remove_frees_budget_and_forgets_course() {
    let tree = course_tree("1", [10, 20, 30]);
    let mut h = Harness::new(vec![tree.clone()], 100);
    h.serve(&tree);
    h.select("1").await;
    h.download_all("1").await;
    assert_eq!(h.fs.file_count_under(&course_dir("1")), 3);
    h.drain_events();

    let freed = h.pipeline.remove("1").await.unwrap();

    assert_eq!(freed, 60);
    assert_eq!(h.pipeline.budget().snapshot().consumed, 0);
    assert!(h.pipeline.load_tree("1").await.unwrap().is_none());
    assert!(h.pipeline.selected_courses().await.unwrap().is_empty());
    assert_eq!(h.fs.file_count_under(&course_dir("1")), 0);
    assert_eq!(
        h.drain_events(),
        vec![DownloadEvent::Removed {
            course_id: "1".to_string(),
            freed_bytes: 60
        }]
    );

    assert!(matches!(
        h.pipeline.remove("1").await,
        Err(OfflineError::CourseNotSelected(_))
    ));
}

#[tokio::test]
async fn test_clean_content_keeps_selection() {
    let tree = course_tree("1", [10, 20, 30]);
    let h = Harness::new(vec![tree.clone()], 100);
    h.serve(&tree);
    h.select("1").await;
    h.download_all("1").await;

    let freed = h.pipeline.clean_content(&ids(&["1"])).await.unwrap();

    assert_eq!(freed, 60);
    assert_eq!(h.pipeline.budget().snapshot().consumed, 0);
    assert_eq!(h.fs.file_count_under(&course_dir("1")), 0);

    let summary = h.pipeline.progress("1").await.unwrap();
    assert_eq!(summary.status, DownloadStatus::NotStarted);
    assert_eq!(summary.bytes_downloaded, 0);
    assert_eq!(h.pipeline.selected_courses().await.unwrap().len(), 1);

    // Everything is downloadable again.
    h.download_all("1").await;
    assert_eq!(h.http.total_calls(), 6);
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn test_events_trace_a_full_download() {
    let tree = course_tree("1", [10, 20, 30]);
    let mut h = Harness::new(vec![tree.clone()], 100);
    h.serve(&tree);
    h.select("1").await;
    h.download_all("1").await;

    let events = h.drain_events();

    assert_eq!(
        events.first(),
        Some(&DownloadEvent::Admitted {
            course_ids: ids(&["1"]),
            reserved_bytes: 60
        })
    );
    assert_eq!(
        events.last(),
        Some(&DownloadEvent::Finished {
            course_id: "1".to_string(),
            status: "completed".to_string(),
            completed_files: 3,
            failed_files: 0
        })
    );

    let completed = events
        .iter()
        .filter(|e| {
            matches!(e, DownloadEvent::ItemStatusChanged { status, .. } if status == "completed")
        })
        .count();
    assert_eq!(completed, 3);

    let last_progress = events
        .iter()
        .rev()
        .find_map(|e| match e {
            DownloadEvent::Progress {
                bytes_downloaded,
                bytes_total,
                status,
                ..
            } => Some((*bytes_downloaded, *bytes_total, status.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_progress, (60, 60, "completed".to_string()));
}
