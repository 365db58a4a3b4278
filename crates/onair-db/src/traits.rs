//! Repository traits
//!
//! The ingest service and the pipeline only see these traits, so both can run against
//! PostgreSQL or against [`crate::MemoryStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use onair_core::models::{
    JobOutcome, NewUploadSession, Studio, Track, TrackAsset, TrackState, TranscodeJob,
    UploadSession,
};
use onair_core::AppError;
use uuid::Uuid;

#[async_trait]
pub trait StudioStore: Send + Sync {
    async fn create_studio(&self, studio: &Studio) -> Result<(), AppError>;

    async fn get_studio(&self, id: Uuid) -> Result<Option<Studio>, AppError>;

    async fn get_studio_by_slug(&self, slug: &str) -> Result<Option<Studio>, AppError>;
}

/// Everything needed to open an upload: the session and the seed of its track.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub session: NewUploadSession,
    pub title: String,
    pub content_hash: String,
}

#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Create the session and its UPLOADING track in one transaction.
    ///
    /// When a live, non-duplicate track of the same studio already carries the content
    /// hash, the new track is created with `is_duplicate_of` pointing at it.
    async fn create_upload(&self, upload: NewUpload) -> Result<(UploadSession, Track), AppError>;

    async fn get_upload(&self, id: Uuid) -> Result<Option<UploadSession>, AppError>;

    /// Take the exclusive per-session lock. Returns `None` for unknown sessions.
    async fn lock_upload(&self, id: Uuid) -> Result<Option<Box<dyn LockedUpload>>, AppError>;

    /// Soft-delete the session unless a live track still references it.
    async fn release_upload_if_unreferenced(&self, id: Uuid) -> Result<bool, AppError>;
}

/// An upload session held under its exclusive lock.
///
/// Changes become visible on [`LockedUpload::commit`]; dropping the guard discards them
/// and releases the lock.
#[async_trait]
pub trait LockedUpload: Send {
    fn session(&self) -> &UploadSession;

    /// Persist a new watermark together with the client's declared total.
    async fn record_progress(
        &mut self,
        bytes_received: i64,
        declared_total: Option<i64>,
    ) -> Result<(), AppError>;

    /// Flip `finalized` and move the owning track from UPLOADING to PENDING.
    /// Returns the promoted track, if one was waiting.
    async fn mark_finalized(&mut self) -> Result<Option<Track>, AppError>;

    async fn commit(self: Box<Self>) -> Result<(), AppError>;
}

#[async_trait]
pub trait TrackStore: Send + Sync {
    /// Live (not soft-deleted) track by id.
    async fn get_track(&self, id: Uuid) -> Result<Option<Track>, AppError>;

    async fn track_for_upload(&self, upload_session_id: Uuid)
        -> Result<Option<Track>, AppError>;

    /// Write back the mutable fields of `track`.
    async fn save_track(&self, track: &Track) -> Result<(), AppError>;

    /// Like [`TrackStore::save_track`], but only while the stored state is still
    /// `expected`. Returns false when the row moved on.
    async fn save_track_if_state(
        &self,
        track: &Track,
        expected: TrackState,
    ) -> Result<bool, AppError>;

    /// Whether a live track still points at `original_id` as its original.
    async fn has_live_duplicates(&self, original_id: Uuid) -> Result<bool, AppError>;

    /// Soft-delete. Returns false when there was no live track.
    async fn soft_delete_track(&self, id: Uuid) -> Result<bool, AppError>;
}

#[async_trait]
pub trait JobLedger: Send + Sync {
    async fn insert_job(&self, job: &TranscodeJob) -> Result<(), AppError>;

    /// Move the oldest due QUEUED row to RUNNING for `worker_id`. Concurrent callers
    /// never claim the same row.
    async fn claim_next_job(&self, worker_id: &str) -> Result<Option<TranscodeJob>, AppError>;

    /// Close RUNNING rows started before `started_before` as FAILED with `reason`.
    /// Returns the closed rows; each is returned to exactly one caller.
    async fn reap_stale_jobs(
        &self,
        started_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<TranscodeJob>, AppError>;

    /// Record the terminal outcome. Terminal rows are never rewritten; returns false
    /// when the row was already terminal.
    async fn finish_job(&self, id: Uuid, outcome: JobOutcome) -> Result<bool, AppError>;

    /// All attempts for a track, oldest first.
    async fn jobs_for_track(&self, track_id: Uuid) -> Result<Vec<TranscodeJob>, AppError>;
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Insert or refresh the asset keyed by (track, type, storage key).
    async fn upsert_asset(&self, asset: &TrackAsset) -> Result<TrackAsset, AppError>;

    async fn assets_for_track(&self, track_id: Uuid) -> Result<Vec<TrackAsset>, AppError>;
}
