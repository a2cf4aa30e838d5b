use bridge_traits::BridgeError;
use core_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The transport failed before a response arrived. Cached data is untouched.
    #[error("Network error: {0}")]
    Network(#[from] BridgeError),

    #[error("HTTP status {status} for {url}: {message}")]
    Http {
        status: u16,
        url: String,
        message: String,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pagination stopped after {0} pages")]
    PageLimit(u32),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SyncError {
    /// True when the failure happened before anything was written locally.
    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Http { .. })
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::InvalidResponse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
