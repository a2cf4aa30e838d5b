use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid record: {entity_type}/{key} - {message}")]
    InvalidRecord {
        entity_type: String,
        key: String,
        message: String,
    },

    #[error("Mutator failed: {0}")]
    Mutator(String),

    #[error("Transaction aborted: {0}")]
    Aborted(String),
}

impl StoreError {
    pub fn mutator(message: impl Into<String>) -> Self {
        StoreError::Mutator(message.into())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
