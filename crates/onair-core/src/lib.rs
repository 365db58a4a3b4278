//! onair core library
//!
//! Domain models, error types and configuration shared by every onair crate:
//! the ingest API, the repositories, the storage layout and the pipeline worker.

pub mod config;
pub mod error;
pub mod job_error;
pub mod models;
pub mod soft_delete;

// Re-export commonly used types
pub use config::{BaseConfig, Config, IngestConfig, LogFormat, WorkerSettings};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use job_error::{FailureKind, JobError, JobResultExt};
pub use soft_delete::SoftDeletable;

/// Upper bound on error text persisted on tracks, sessions and ledger rows.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 4000;

/// Keep at most `max_chars` characters from the start of `message`.
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

/// Keep at most `max_chars` characters from the end of `message`.
pub fn tail_message(message: &str, max_chars: usize) -> String {
    let count = message.chars().count();
    if count <= max_chars {
        return message.to_string();
    }
    message.chars().skip(count - max_chars).collect()
}
