//! Job handler context trait
//!
//! The worker pool owns claiming, concurrency, the soft time limit and retries. What a
//! job actually does lives behind [`JobHandler`], which the pipeline implements.

use std::sync::OnceLock;

use async_trait::async_trait;
use onair_core::models::TranscodeJob;
use onair_core::JobError;
use uuid::Uuid;

/// One attempt of the pipeline for a track, running in a worker slot.
#[derive(Debug)]
pub struct JobContext {
    pub track_id: Uuid,
    /// 1 for the first attempt.
    pub attempt: u32,
    /// `{hostname}:{pid}:{slot}`
    pub worker_id: String,
    ledger_row: OnceLock<Uuid>,
}

impl JobContext {
    /// An attempt with no ledger row yet. The handler records one when it starts.
    pub fn new(track_id: Uuid, attempt: u32, worker_id: impl Into<String>) -> Self {
        Self {
            track_id,
            attempt,
            worker_id: worker_id.into(),
            ledger_row: OnceLock::new(),
        }
    }

    /// The attempt described by a ledger row the pool has already claimed.
    pub fn claimed(row: &TranscodeJob, worker_id: impl Into<String>) -> Self {
        let job = Self::new(
            row.track_id,
            u32::try_from(row.attempt).unwrap_or(1),
            worker_id,
        );
        job.bind_ledger_row(row.id);
        job
    }

    /// Remember the ledger row this attempt writes to. The first binding wins.
    pub fn bind_ledger_row(&self, id: Uuid) {
        if self.ledger_row.set(id).is_err() {
            tracing::debug!(track_id = %self.track_id, "Ledger row already bound");
        }
    }

    pub fn ledger_row(&self) -> Option<Uuid> {
        self.ledger_row.get().copied()
    }
}

/// Context for job dispatch.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt. The handler records its own failures before returning them.
    async fn handle(&self, job: &JobContext) -> Result<(), JobError>;

    /// Bookkeeping for an attempt abandoned at the soft time limit, or found abandoned
    /// by the reaper. `handle` recorded nothing for it.
    async fn on_timeout(&self, job: &JobContext, error: &JobError);
}
