//! # Offline Error Types
//!
//! Errors raised while selecting, downloading, and removing offline course
//! content.

use bridge_traits::BridgeError;
use core_store::StoreError;
use core_sync::SyncError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the course download pipeline.
#[derive(Error, Debug)]
pub enum OfflineError {
    // ========================================================================
    // Admission Errors
    // ========================================================================
    /// The batch does not fit the disk budget. Nothing was admitted.
    #[error("Insufficient disk space: {requested} bytes requested, {available} available")]
    InsufficientSpace { requested: u64, available: u64 },

    /// The course has no download tree yet.
    #[error("Course not selected for offline use: {0}")]
    CourseNotSelected(String),

    /// The course already has a run in flight.
    #[error("Course download already running: {0}")]
    AlreadyRunning(String),

    // ========================================================================
    // Tree Errors
    // ========================================================================
    #[error("Download item not found: {0}")]
    ItemNotFound(String),

    #[error("Invalid download tree: {0}")]
    InvalidTree(String),

    #[error("Invalid status transition for {item}: {from} -> {to}")]
    InvalidTransition {
        item: String,
        from: String,
        to: String,
    },

    #[error("Unknown download status: {0}")]
    UnknownStatus(String),

    // ========================================================================
    // Transfer Errors
    // ========================================================================
    #[error("Download timed out after {0:?}")]
    Timeout(Duration),

    #[error("Download cancelled")]
    Cancelled,

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    // ========================================================================
    // Configuration & Lower Layers
    // ========================================================================
    #[error("Invalid offline configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl OfflineError {
    /// Local storage failed while writing content.
    pub fn is_storage_error(&self) -> bool {
        matches!(self, OfflineError::Bridge(e) if e.is_storage_error())
    }

    /// Worth another attempt at the transport boundary.
    pub fn is_transient(&self) -> bool {
        match self {
            OfflineError::Timeout(_) => true,
            OfflineError::Bridge(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, OfflineError>;
