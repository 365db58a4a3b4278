//! Hand a finalized track to the pipeline.

use onair_core::models::{Track, TranscodeJob};
use onair_core::AppError;
use onair_db::JobLedger;
use uuid::Uuid;

use crate::queue::{JobQueue, PipelineMessage};

/// Record a QUEUED ledger row for `track` and wake the worker pool.
///
/// The row is the job. A lost wake-up only delays it until the pool's next poll.
#[tracing::instrument(skip(ledger, queue, track), fields(track_id = %track.id))]
pub async fn dispatch_track(
    ledger: &dyn JobLedger,
    queue: &dyn JobQueue,
    track: &Track,
) -> Result<Uuid, AppError> {
    let row = TranscodeJob::queued(track.studio_id, track.id, track.upload_session_id, 1);
    ledger.insert_job(&row).await?;

    if let Err(e) = queue.dispatch(PipelineMessage::new(track.id, row.id)).await {
        tracing::warn!(job_id = %row.id, error = %e, "Wake-up not delivered, job waits for the next poll");
    }

    Ok(row.id)
}
