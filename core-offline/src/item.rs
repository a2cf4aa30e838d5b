//! # Download Items
//!
//! One downloadable unit of a course: the course itself, a module, a module
//! item, or a file. Items are keyed by a stable `(course, kind, id)` triple and
//! reference each other by key only.
//!
//! ## Status machine
//!
//! ```text
//! notStarted ──► inProgress ──► completed
//!     │              │
//!     │              └────────► failed ──► inProgress (retry)
//!     └──────────────┴──────────┴────────► cancelled
//! ```
//!
//! `completed` and `cancelled` are terminal for a file. Parents never
//! transition on their own; their status is recomputed from their children.

use chrono::{DateTime, Utc};
use core_store::Entity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::OfflineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemKind {
    Course,
    Module,
    Item,
    File,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Course => "course",
            ItemKind::Module => "module",
            ItemKind::Item => "item",
            ItemKind::File => "file",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a download item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub course_id: String,
    pub kind: ItemKind,
    pub id: String,
}

impl ItemKey {
    pub fn new(course_id: impl Into<String>, kind: ItemKind, id: impl Into<String>) -> Self {
        Self {
            course_id: course_id.into(),
            kind,
            id: id.into(),
        }
    }

    pub fn course(course_id: impl Into<String>) -> Self {
        let course_id = course_id.into();
        Self::new(course_id.clone(), ItemKind::Course, course_id)
    }

    pub fn module(course_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(course_id, ItemKind::Module, id)
    }

    pub fn item(course_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(course_id, ItemKind::Item, id)
    }

    pub fn file(course_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(course_id, ItemKind::File, id)
    }
}

/// `<course>/<kind>/<id>`, also the record key in the Local Store.
impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.course_id, self.kind, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DownloadStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::NotStarted => "notStarted",
            DownloadStatus::InProgress => "inProgress",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    /// No further transition is possible for a file in this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;

        match (self, next) {
            (NotStarted, InProgress) => true,
            (InProgress, Completed) | (InProgress, Failed) => true,
            (Failed, InProgress) => true,
            (current, Cancelled) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = OfflineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notStarted" => Ok(DownloadStatus::NotStarted),
            "inProgress" => Ok(DownloadStatus::InProgress),
            "completed" => Ok(DownloadStatus::Completed),
            "failed" => Ok(DownloadStatus::Failed),
            "cancelled" => Ok(DownloadStatus::Cancelled),
            other => Err(OfflineError::UnknownStatus(other.to_string())),
        }
    }
}

/// Persisted state of one node in a course's download tree.
///
/// For files `bytes_total` is the size estimate (replaced by the
/// `Content-Length` once a transfer starts) and `bytes_downloaded` the last
/// reported count. For every other kind both are sums over the children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadItem {
    pub key: ItemKey,
    pub name: String,
    pub parent: Option<ItemKey>,
    #[serde(default)]
    pub children: Vec<ItemKey>,
    /// Position among siblings.
    #[serde(default)]
    pub position: i64,
    /// Source URL, files only.
    pub url: Option<String>,
    pub bytes_total: u64,
    pub bytes_downloaded: u64,
    pub status: DownloadStatus,
    pub error: Option<String>,
    /// Where a completed file lives on disk.
    pub local_path: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadItem {
    pub fn new(key: ItemKey, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
            parent: None,
            children: Vec::new(),
            position: 0,
            url: None,
            bytes_total: 0,
            bytes_downloaded: 0,
            status: DownloadStatus::NotStarted,
            error: None,
            local_path: None,
            updated_at: Utc::now(),
        }
    }

    pub fn file(
        course_id: impl Into<String>,
        id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        size: u64,
    ) -> Self {
        let mut item = Self::new(ItemKey::file(course_id, id), name);
        item.url = Some(url.into());
        item.bytes_total = size;
        item
    }

    pub fn with_parent(mut self, parent: ItemKey) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_position(mut self, position: i64) -> Self {
        self.position = position;
        self
    }

    pub fn is_file(&self) -> bool {
        self.key.kind == ItemKind::File
    }

    /// Downloaded fraction in `0.0..=1.0`. An empty item counts as done once completed.
    pub fn progress(&self) -> f64 {
        if self.bytes_total == 0 {
            return if self.status == DownloadStatus::Completed {
                1.0
            } else {
                0.0
            };
        }
        (self.bytes_downloaded as f64 / self.bytes_total as f64).min(1.0)
    }
}

impl Entity for DownloadItem {
    const ENTITY_TYPE: &'static str = "download_item";

    fn key(&self) -> String {
        self.key.to_string()
    }
}
