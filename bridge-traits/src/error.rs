use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("HTTP status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// True when the failure came from local storage rather than the network.
    pub fn is_storage_error(&self) -> bool {
        matches!(self, BridgeError::Io(_))
    }

    /// True for failures worth retrying at the transport boundary (timeouts, 5xx, 429).
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::OperationFailed(_) => true,
            BridgeError::Http { status, .. } => *status >= 500 || *status == 429,
            BridgeError::NotAvailable(_) | BridgeError::Io(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
