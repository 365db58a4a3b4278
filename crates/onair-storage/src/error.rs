use onair_core::AppError;
use thiserror::Error;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid storage root: {0}")]
    InvalidRoot(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidRoot(msg) => AppError::InvalidRoot(msg),
            StorageError::InvalidKey(msg) => AppError::InvalidInput(msg),
            StorageError::NotFound(msg) => AppError::NotFound(msg),
            other => AppError::Storage(other.to_string()),
        }
    }
}
