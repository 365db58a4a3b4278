//! Pipeline job error types
//!
//! Every failure raised while processing an upload is classified so the consumer loop
//! can decide whether a new attempt is worth making. Only [`FailureKind::Transient`]
//! faults are retried; content, configuration and integrity faults are terminal.

use std::fmt;

/// Why a pipeline attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Unexpected fault in the orchestration code (I/O hiccup, database blip).
    Transient,
    /// The transcode step exited non-zero for this input.
    Content,
    /// Toolchain unresolvable or storage root unusable.
    Configuration,
    /// The track, its upload session or its temp file reference is missing.
    Integrity,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Content => "content",
            FailureKind::Configuration => "configuration",
            FailureKind::Integrity => "integrity",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified pipeline failure.
#[derive(Debug)]
pub struct JobError {
    inner: anyhow::Error,
    kind: FailureKind,
}

impl JobError {
    pub fn new(kind: FailureKind, err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            kind,
        }
    }

    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::new(FailureKind::Transient, err)
    }

    pub fn content(err: impl Into<anyhow::Error>) -> Self {
        Self::new(FailureKind::Content, err)
    }

    pub fn configuration(err: impl Into<anyhow::Error>) -> Self {
        Self::new(FailureKind::Configuration, err)
    }

    pub fn integrity(err: impl Into<anyhow::Error>) -> Self {
        Self::new(FailureKind::Integrity, err)
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// Whether the retry policy may schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Transient
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for JobError {
    /// Unclassified errors come from the orchestration code itself.
    fn from(err: anyhow::Error) -> Self {
        Self::transient(err)
    }
}

impl From<crate::AppError> for JobError {
    fn from(err: crate::AppError) -> Self {
        match err {
            crate::AppError::Configuration(_) | crate::AppError::InvalidRoot(_) => {
                Self::configuration(err)
            }
            other => Self::transient(other),
        }
    }
}

/// Extension trait for tagging a `Result` error with a failure kind.
pub trait JobResultExt<T> {
    fn content_fault(self) -> Result<T, JobError>;
    fn configuration_fault(self) -> Result<T, JobError>;
    fn integrity_fault(self) -> Result<T, JobError>;
}

impl<T, E: Into<anyhow::Error>> JobResultExt<T> for Result<T, E> {
    fn content_fault(self) -> Result<T, JobError> {
        self.map_err(JobError::content)
    }

    fn configuration_fault(self) -> Result<T, JobError> {
        self.map_err(JobError::configuration)
    }

    fn integrity_fault(self) -> Result<T, JobError> {
        self.map_err(JobError::integrity)
    }
}
