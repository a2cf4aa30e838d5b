//! # Course Download Pipeline
//!
//! Downloads entire courses for offline use under a disk-space budget, with
//! resumable, observable, per-file progress.
//!
//! ## Overview
//!
//! - **Items** (`item`): [`DownloadItem`], [`ItemKey`], [`DownloadStatus`]
//! - **Tree** (`tree`): [`DownloadTree`] arena with bottom-up aggregation
//! - **Budget** (`budget`): [`DiskBudget`] with atomic admission and
//!   splittable [`Reservation`]s
//! - **Content** (`content`): [`ContentResolver`] and the API-backed
//!   [`ApiContentResolver`]
//! - **Transfers** (`downloader`): [`FileDownloader`] with retries and backoff
//! - **Orchestration** (`pipeline`): [`CourseSyncPipeline`]
//!
//! ## Example
//!
//! ```ignore
//! let courses = vec!["42".to_string()];
//! pipeline.select(&courses).await?;
//!
//! let handle = pipeline.download(&courses).await?;
//! for summary in handle.wait().await? {
//!     println!("{}: {:.0}%", summary.name, summary.progress() * 100.0);
//! }
//! ```

pub mod budget;
pub mod config;
pub mod content;
pub mod downloader;
pub mod error;
pub mod item;
pub mod pipeline;
pub mod repository;
pub mod tree;

pub use budget::{BudgetSnapshot, DiskBudget, Reservation};
pub use config::OfflineConfig;
pub use content::{
    build_tree, get_course, ApiContentResolver, ContentResolver, CourseContent, CourseFile,
    CourseInfo, CourseModule, GetCourseFiles, GetCourseModules, ModuleItem,
};
pub use downloader::{FileDownloader, ProgressCallback};
pub use error::{OfflineError, Result};
pub use item::{DownloadItem, DownloadStatus, ItemKey, ItemKind};
pub use pipeline::{CourseSyncPipeline, CourseSyncSummary, SyncHandle};
pub use repository::DownloadRepository;
pub use tree::DownloadTree;
