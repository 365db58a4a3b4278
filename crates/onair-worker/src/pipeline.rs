//! Upload processing pipeline
//!
//! [`UploadPipeline::process_upload`] takes a finalized track from its assembled
//! `.part` file to a loudness-normalized MP3 published in the studio library:
//!
//! 1. load the track, its upload session and the temp file (integrity faults)
//! 2. resolve the ffmpeg/ffprobe toolchain (configuration fault)
//! 3. pick the target bitrate, studio override first
//! 4. probe duration and tags, best effort
//! 5. backfill empty metadata from the tags
//! 6. persist PROCESSING
//! 7. transcode into the studio's `processing/` area
//! 8. a non-zero exit is a content fault
//! 9. rename the output into `library/mp3/<bitrate>/`
//! 10. persist READY with the measurements, only if the track is still PROCESSING
//! 11. drop the `.part` file
//!
//! Every run writes to one ledger row, normally the one the worker pool claimed.
//! Re-running after success is harmless: a READY track whose published file exists is
//! left alone and the attempt is CANCELED. A run that fails after publishing removes
//! the published file again unless the track made it to READY.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use onair_core::models::{
    AssetType, JobOutcome, JobStatus, Track, TrackAsset, TrackState, TranscodeJob,
};
use onair_core::{AppError, JobError, JobResultExt};
use onair_db::{AssetStore, JobLedger, StudioStore, TrackStore, UploadStore};
use onair_processing::{
    backfill, ProbeResult, TranscodeOutcome, TranscodeRequest, Transcoder,
};
use onair_storage::{atomic_publish, file_size, remove_if_exists, StorageError, StudioRoot};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::context::{JobContext, JobHandler};

const PUBLISHED_MIME: &str = "audio/mpeg";

/// The repositories the pipeline reads and writes.
#[derive(Clone)]
pub struct PipelineStores {
    pub studios: Arc<dyn StudioStore>,
    pub uploads: Arc<dyn UploadStore>,
    pub tracks: Arc<dyn TrackStore>,
    pub ledger: Arc<dyn JobLedger>,
    pub assets: Arc<dyn AssetStore>,
}

impl PipelineStores {
    /// All five roles served by one store.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: StudioStore + UploadStore + TrackStore + JobLedger + AssetStore + 'static,
    {
        Self {
            studios: store.clone(),
            uploads: store.clone(),
            tracks: store.clone(),
            ledger: store.clone(),
            assets: store,
        }
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Published { rel_path: String },
    /// A duplicate upload now points at its original's published file.
    LinkedToOriginal { original_id: Uuid },
    AlreadyPublished,
    /// The track left the state this run expected, e.g. it was archived mid-run.
    Superseded { state: TrackState },
    /// The track was deleted before the job ran.
    TrackMissing,
}

pub struct UploadPipeline {
    stores: PipelineStores,
    root: StudioRoot,
    transcoder: Arc<dyn Transcoder>,
}

fn storage_fault(err: StorageError) -> JobError {
    match err {
        StorageError::InvalidRoot(_) => JobError::configuration(err),
        StorageError::InvalidKey(_) | StorageError::NotFound(_) => JobError::integrity(err),
        other => JobError::transient(other),
    }
}

fn integrity(message: String) -> JobError {
    JobError::integrity(anyhow::anyhow!(message))
}

impl UploadPipeline {
    pub fn new(stores: PipelineStores, root: StudioRoot, transcoder: Arc<dyn Transcoder>) -> Self {
        Self {
            stores,
            root,
            transcoder,
        }
    }

    #[tracing::instrument(
        skip(self, job),
        fields(track_id = %job.track_id, attempt = job.attempt, worker_id = %job.worker_id)
    )]
    pub async fn process_upload(&self, job: &JobContext) -> Result<PipelineOutcome, JobError> {
        let Some(mut track) = self.stores.tracks.get_track(job.track_id).await? else {
            tracing::warn!("Track no longer exists, dropping job");
            self.cancel(job, "Track no longer exists".to_string()).await;
            return Ok(PipelineOutcome::TrackMissing);
        };
        self.open_ledger_row(job, &track).await?;

        if track.state == TrackState::Ready {
            return self.settle_ready(job, &track).await;
        }
        if !track.state.can_transition_to(TrackState::Processing) {
            self.cancel(job, format!("Track is {}", track.state)).await;
            return Ok(PipelineOutcome::Superseded { state: track.state });
        }

        let session_id = track
            .upload_session_id
            .ok_or_else(|| integrity(format!("Track {} has no upload session", track.id)))?;
        let session = self
            .stores
            .uploads
            .get_upload(session_id)
            .await?
            .ok_or_else(|| integrity(format!("Upload session {} not found", session_id)))?;
        let temp_key = session
            .temp_rel_path
            .clone()
            .ok_or_else(|| integrity(format!("Upload session {} has no temp file", session_id)))?;
        let input = self.root.resolve(&temp_key).map_err(storage_fault)?;
        let input_size = file_size(&input).await.map_err(storage_fault)?;

        if let Some(original_id) = track.is_duplicate_of {
            if let Some(outcome) = self
                .link_duplicate(job, &mut track, original_id, &input, &temp_key)
                .await?
            {
                return Ok(outcome);
            }
        }

        let toolchain = self.transcoder.resolve_toolchain().configuration_fault()?;

        let studio = self
            .stores
            .studios
            .get_studio(track.studio_id)
            .await?
            .ok_or_else(|| integrity(format!("Studio {} not found", track.studio_id)))?;
        let bitrate = studio.target_bitrate_kbps(self.root.default_bitrate_kbps());
        let paths = self
            .root
            .studio_paths(&studio.slug, Some(bitrate))
            .await
            .map_err(storage_fault)?;

        let probe = match self.transcoder.probe(&toolchain, &input).await {
            Ok(probe) => probe,
            Err(e) => {
                tracing::warn!(error = %e, "Probe failed, continuing without tags");
                ProbeResult::default()
            }
        };
        let filled = backfill(&mut track, &probe.tags);
        tracing::debug!(filled = ?filled, tags = probe.tags.len(), "Metadata backfilled");

        let prior = track.state;
        track.transition_to(TrackState::Processing)?;
        track.error_message = None;
        if !self.stores.tracks.save_track_if_state(&track, prior).await? {
            return self.superseded(job, track.id).await;
        }

        let output = paths.processing_output(track.id);
        let library = paths.library_output(track.id);
        tracing::info!(
            studio = %studio.slug,
            input_bytes = input_size,
            bitrate_kbps = bitrate,
            "Transcoding upload"
        );

        let request = TranscodeRequest {
            input: &input,
            output: &output,
            bitrate_kbps: bitrate,
        };
        let measurement = match self.transcoder.transcode(&toolchain, &request).await? {
            TranscodeOutcome::Success { measurement } => measurement.unwrap_or_default(),
            TranscodeOutcome::Failed {
                exit_code,
                diagnostics,
            } => {
                self.discard(&output).await;
                let message = if diagnostics.trim().is_empty() {
                    format!("ffmpeg exited with code {:?}", exit_code)
                } else {
                    diagnostics
                };
                return Err(JobError::content(anyhow::anyhow!(message)));
            }
        };

        atomic_publish(&output, &library)
            .await
            .map_err(storage_fault)?;
        let rel_path = self.root.relpath_from_root(&library).map_err(storage_fault)?;

        track.duration_seconds =
            Decimal::from_f64(probe.duration_seconds).map(|d| d.round_dp(3));
        track.bitrate_kbps = i32::try_from(bitrate).ok();
        track.processed_rel_path = Some(rel_path.clone());
        track.loudness_lufs = measurement.integrated_lufs;
        track.peak_dbfs = measurement.true_peak_dbfs;
        track.transition_to(TrackState::Ready)?;
        if !self
            .stores
            .tracks
            .save_track_if_state(&track, TrackState::Processing)
            .await?
        {
            self.discard(&library).await;
            return self.superseded(job, track.id).await;
        }

        self.record_asset(track.id, &rel_path, &library).await;

        let mut outcome = JobOutcome::new(JobStatus::Success);
        outcome.input_storage_key = Some(temp_key);
        outcome.output_storage_key = Some(rel_path.clone());
        outcome.loudness_lufs = track.loudness_lufs;
        outcome.peak_dbfs = track.peak_dbfs;
        outcome.target_bitrate_kbps = track.bitrate_kbps;
        self.finish(job, outcome).await;

        self.discard(&input).await;

        tracing::info!(rel_path = %rel_path, "Track published");
        Ok(PipelineOutcome::Published { rel_path })
    }

    /// Start a RUNNING row unless the worker pool already claimed one for this attempt.
    async fn open_ledger_row(&self, job: &JobContext, track: &Track) -> Result<(), AppError> {
        if job.ledger_row().is_some() {
            return Ok(());
        }

        let row = TranscodeJob::running(
            track.studio_id,
            track.id,
            track.upload_session_id,
            i32::try_from(job.attempt).unwrap_or(i32::MAX),
            job.worker_id.as_str(),
        );
        self.stores.ledger.insert_job(&row).await?;
        job.bind_ledger_row(row.id);
        Ok(())
    }

    /// Redelivery of a READY track: leave it untouched.
    async fn settle_ready(
        &self,
        job: &JobContext,
        track: &Track,
    ) -> Result<PipelineOutcome, JobError> {
        let published = match track.processed_rel_path.as_deref() {
            Some(key) => self.published_size(key).await,
            None => None,
        };

        match published {
            Some(size) => {
                tracing::info!(size_bytes = size, "Track already published");
                self.cancel(job, "Track already published".to_string()).await;
                Ok(PipelineOutcome::AlreadyPublished)
            }
            None => {
                tracing::warn!(
                    rel_path = ?track.processed_rel_path,
                    "READY track has no published file"
                );
                self.cancel(job, "READY track has no published file".to_string())
                    .await;
                Ok(PipelineOutcome::Superseded {
                    state: TrackState::Ready,
                })
            }
        }
    }

    /// Point a duplicate at its original's published file instead of transcoding
    /// again. `None` when the original has nothing usable yet.
    async fn link_duplicate(
        &self,
        job: &JobContext,
        track: &mut Track,
        original_id: Uuid,
        input: &Path,
        temp_key: &str,
    ) -> Result<Option<PipelineOutcome>, JobError> {
        let Some(original) = self.stores.tracks.get_track(original_id).await? else {
            return Ok(None);
        };
        if original.state != TrackState::Ready {
            return Ok(None);
        }
        let Some(rel_path) = original.processed_rel_path.clone() else {
            return Ok(None);
        };
        if self.published_size(&rel_path).await.is_none() {
            return Ok(None);
        }

        let prior = track.state;
        track.transition_to(TrackState::Processing)?;
        track.transition_to(TrackState::Ready)?;
        track.error_message = None;
        track.duration_seconds = original.duration_seconds;
        track.bitrate_kbps = original.bitrate_kbps;
        track.loudness_lufs = original.loudness_lufs;
        track.peak_dbfs = original.peak_dbfs;
        track.processed_rel_path = Some(rel_path.clone());
        if !self.stores.tracks.save_track_if_state(track, prior).await? {
            return self.superseded(job, track.id).await.map(Some);
        }

        for asset in self.stores.assets.assets_for_track(original.id).await? {
            if asset.asset_type != AssetType::NormalizedMp3 {
                continue;
            }
            let mut linked = TrackAsset::new(track.id, asset.asset_type, asset.storage_key);
            linked.size_bytes = asset.size_bytes;
            linked.mime_type = asset.mime_type;
            linked.checksum = asset.checksum;
            if let Err(e) = self.stores.assets.upsert_asset(&linked).await {
                tracing::warn!(error = %e, "Failed to record linked asset");
            }
        }

        let mut outcome = JobOutcome::new(JobStatus::Success);
        outcome.input_storage_key = Some(temp_key.to_string());
        outcome.output_storage_key = Some(rel_path);
        outcome.loudness_lufs = track.loudness_lufs;
        outcome.peak_dbfs = track.peak_dbfs;
        outcome.target_bitrate_kbps = track.bitrate_kbps;
        self.finish(job, outcome).await;

        self.discard(input).await;

        tracing::info!(original_id = %original_id, "Duplicate linked to original");
        Ok(Some(PipelineOutcome::LinkedToOriginal { original_id }))
    }

    async fn record_asset(&self, track_id: Uuid, rel_path: &str, published: &Path) {
        let mut asset = TrackAsset::new(track_id, AssetType::NormalizedMp3, rel_path);
        asset.size_bytes = file_size(published)
            .await
            .ok()
            .and_then(|s| i64::try_from(s).ok());
        asset.mime_type = Some(PUBLISHED_MIME.to_string());
        if let Err(e) = self.stores.assets.upsert_asset(&asset).await {
            tracing::warn!(error = %e, "Failed to record published asset");
        }
    }

    async fn published_size(&self, key: &str) -> Option<u64> {
        let path = self.root.resolve(key).ok()?;
        file_size(&path).await.ok()
    }

    async fn superseded(&self, job: &JobContext, track_id: Uuid) -> Result<PipelineOutcome, JobError> {
        let state = self
            .stores
            .tracks
            .get_track(track_id)
            .await?
            .map(|t| t.state)
            .unwrap_or(TrackState::Archived);
        tracing::info!(state = %state, "Track changed state during processing");
        self.cancel(job, format!("Track moved to {} during processing", state))
            .await;
        Ok(PipelineOutcome::Superseded { state })
    }

    async fn cancel(&self, job: &JobContext, reason: String) {
        self.finish(job, JobOutcome::new(JobStatus::Canceled).with_error(reason))
            .await;
    }

    async fn finish(&self, job: &JobContext, outcome: JobOutcome) {
        let Some(id) = job.ledger_row() else {
            return;
        };
        let status = outcome.status;
        match self.stores.ledger.finish_job(id, outcome).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(job_id = %id, "Ledger row already terminal"),
            Err(e) => {
                tracing::warn!(job_id = %id, status = %status, error = %e, "Failed to close ledger row")
            }
        }
    }

    async fn discard(&self, path: &Path) {
        if let Err(e) = remove_if_exists(path).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }

    /// Mark the track FAILED and close the ledger row with the error. A file published
    /// by an attempt that never got the track to READY is removed.
    async fn record_failure(&self, job: &JobContext, error: &JobError) {
        let message = error.to_string();

        match self.stores.tracks.get_track(job.track_id).await {
            Ok(Some(mut track)) if track.state.can_transition_to(TrackState::Failed) => {
                let prior = track.state;
                if track.fail(&message).is_ok() {
                    match self.stores.tracks.save_track_if_state(&track, prior).await {
                        // FAILED rows never point at a published file.
                        Ok(true) => self.discard_unreferenced_output(&track).await,
                        Ok(false) => tracing::debug!("Track moved on before failure was recorded"),
                        Err(e) => tracing::error!(error = %e, "Failed to mark track FAILED"),
                    }
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Failed to load track for failure"),
        }

        self.finish(job, JobOutcome::new(JobStatus::Failed).with_error(message))
            .await;
    }

    /// Remove `library_output` for a track whose row does not point at it.
    async fn discard_unreferenced_output(&self, track: &Track) {
        let studio = match self.stores.studios.get_studio(track.studio_id).await {
            Ok(Some(studio)) => studio,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load studio for cleanup");
                return;
            }
        };
        let bitrate = studio.target_bitrate_kbps(self.root.default_bitrate_kbps());
        match self.root.studio_paths(&studio.slug, Some(bitrate)).await {
            Ok(paths) => self.discard(&paths.library_output(track.id)).await,
            Err(e) => tracing::warn!(error = %e, "Failed to resolve studio paths for cleanup"),
        }
    }
}

#[async_trait]
impl JobHandler for UploadPipeline {
    async fn handle(&self, job: &JobContext) -> Result<(), JobError> {
        match self.process_upload(job).await {
            Ok(outcome) => {
                tracing::info!(track_id = %job.track_id, outcome = ?outcome, "Pipeline run finished");
                Ok(())
            }
            Err(e) => {
                self.record_failure(job, &e).await;
                Err(e)
            }
        }
    }

    async fn on_timeout(&self, job: &JobContext, error: &JobError) {
        self.record_failure(job, error).await;
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use onair_core::models::{NewUploadSession, Studio, UploadSource};
    use onair_core::FailureKind;
    use onair_db::{MemoryStore, NewUpload};
    use onair_processing::testing::ScriptedTranscoder;
    use onair_processing::TagMap;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        root: StudioRoot,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = StudioRoot::new(dir.path().join("studios"), 128).unwrap();
            let store = Arc::new(MemoryStore::new());
            store.insert_studio(Studio::new("wxyz", "WXYZ FM")).unwrap();
            Self {
                _dir: dir,
                store,
                root,
            }
        }

        fn pipeline(&self, transcoder: Arc<ScriptedTranscoder>) -> UploadPipeline {
            UploadPipeline::new(
                PipelineStores::shared(self.store.clone()),
                self.root.clone(),
                transcoder,
            )
        }

        async fn studio(&self) -> Studio {
            self.store.get_studio_by_slug("wxyz").await.unwrap().unwrap()
        }

        /// Write `bytes` as the upload's `.part` file and finalize it.
        async fn finalized_upload(&self, bytes: &[u8], hash: &str) -> Track {
            let studio = self.studio().await;
            let paths = self.root.studio_paths("wxyz", None).await.unwrap();
            let id = Uuid::new_v4();
            let part = paths.incoming_part(id);
            tokio::fs::write(&part, bytes).await.unwrap();

            let (session, _) = self
                .store
                .create_upload(NewUpload {
                    session: NewUploadSession {
                        id,
                        studio_id: studio.id,
                        original_filename: "song.mp3".to_string(),
                        size_bytes: Some(bytes.len() as i64),
                        mime_type: "audio/mpeg".to_string(),
                        source: UploadSource::Direct,
                        temp_rel_path: self.root.relpath_from_root(&part).unwrap(),
                        upload_token: "token".to_string(),
                    },
                    title: "song.mp3".to_string(),
                    content_hash: hash.to_string(),
                })
                .await
                .unwrap();

            let mut locked = self.store.lock_upload(session.id).await.unwrap().unwrap();
            locked
                .record_progress(bytes.len() as i64, Some(bytes.len() as i64))
                .await
                .unwrap();
            let track = locked.mark_finalized().await.unwrap().unwrap();
            locked.commit().await.unwrap();
            track
        }

        async fn track(&self, id: Uuid) -> Track {
            self.store.get_track(id).await.unwrap().unwrap()
        }

        async fn jobs(&self, track_id: Uuid) -> Vec<TranscodeJob> {
            self.store.jobs_for_track(track_id).await.unwrap()
        }
    }

    fn job(track_id: Uuid) -> JobContext {
        JobContext::new(track_id, 1, "test-host:1:0")
    }

    /// Track store whose READY writes fail, as when the database drops mid-run.
    struct ReadyWriteFails(Arc<MemoryStore>);

    #[async_trait]
    impl TrackStore for ReadyWriteFails {
        async fn get_track(&self, id: Uuid) -> Result<Option<Track>, AppError> {
            self.0.get_track(id).await
        }

        async fn track_for_upload(&self, upload_session_id: Uuid) -> Result<Option<Track>, AppError> {
            self.0.track_for_upload(upload_session_id).await
        }

        async fn save_track(&self, track: &Track) -> Result<(), AppError> {
            self.0.save_track(track).await
        }

        async fn save_track_if_state(
            &self,
            track: &Track,
            expected: TrackState,
        ) -> Result<bool, AppError> {
            if track.state == TrackState::Ready {
                return Err(AppError::Internal("connection reset".to_string()));
            }
            self.0.save_track_if_state(track, expected).await
        }

        async fn has_live_duplicates(&self, original_id: Uuid) -> Result<bool, AppError> {
            self.0.has_live_duplicates(original_id).await
        }

        async fn soft_delete_track(&self, id: Uuid) -> Result<bool, AppError> {
            self.0.soft_delete_track(id).await
        }
    }

    #[tokio::test]
    async fn publishes_normalized_mp3() {
        let fx = Fixture::new();
        let mut tags = TagMap::new();
        tags.insert("TITLE", "Probed Title");
        tags.insert("artist", "Probed Artist");
        tags.insert("date", "2019-04-01");
        let transcoder = Arc::new(ScriptedTranscoder::new().with_probe(187.25, tags));
        let pipeline = fx.pipeline(transcoder.clone());
        let track = fx.finalized_upload(b"0123456789", "h1").await;
        assert_eq!(track.state, TrackState::Pending);

        let outcome = pipeline.process_upload(&job(track.id)).await.unwrap();

        let expected_key = format!("wxyz/library/mp3/128/{}.mp3", track.id);
        assert_eq!(
            outcome,
            PipelineOutcome::Published {
                rel_path: expected_key.clone()
            }
        );

        let track = fx.track(track.id).await;
        assert_eq!(track.state, TrackState::Ready);
        assert_eq!(track.processed_rel_path.as_deref(), Some(expected_key.as_str()));
        assert_eq!(track.bitrate_kbps, Some(128));
        assert_eq!(track.duration_seconds, Some(Decimal::new(187250, 3)));
        assert_eq!(track.loudness_lufs, Some(Decimal::new(-1400, 2)));
        assert_eq!(track.peak_dbfs, Some(Decimal::new(-150, 2)));
        assert_eq!(track.title, "song.mp3");
        assert_eq!(track.artist, "Probed Artist");
        assert_eq!(track.year, Some(2019));

        let published = fx.root.resolve(&expected_key).unwrap();
        let size = tokio::fs::metadata(&published).await.unwrap().len();
        assert_eq!(size as usize, transcoder.output_len());
        assert_ne!(size, 10);

        let paths = fx.root.studio_paths("wxyz", None).await.unwrap();
        let session_id = track.upload_session_id.unwrap();
        assert!(!paths.incoming_part(session_id).exists());
        assert!(!paths.processing_output(track.id).exists());

        let jobs = fx.jobs(track.id).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Success);
        assert_eq!(jobs[0].worker_id.as_deref(), Some("test-host:1:0"));
        assert_eq!(jobs[0].output_storage_key.as_deref(), Some(expected_key.as_str()));
        assert_eq!(jobs[0].target_bitrate_kbps, Some(128));

        let assets = fx.store.assets_for_track(track.id).await.unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].asset_type, AssetType::NormalizedMp3);
        assert_eq!(assets[0].size_bytes, Some(size as i64));
    }

    #[tokio::test]
    async fn studio_bitrate_override_selects_library_dir() {
        let fx = Fixture::new();
        let mut studio = Studio::new("kexp", "KEXP");
        studio.default_bitrate_kbps = Some(192);
        fx.store.insert_studio(studio.clone()).unwrap();

        let track = fx.finalized_upload(b"abc", "h1").await;
        // Move the track under the second studio.
        let mut moved = fx.track(track.id).await;
        moved.studio_id = studio.id;
        fx.store.save_track(&moved).await.unwrap();

        let pipeline = fx.pipeline(Arc::new(ScriptedTranscoder::new()));
        let outcome = pipeline.process_upload(&job(track.id)).await.unwrap();

        assert_eq!(
            outcome,
            PipelineOutcome::Published {
                rel_path: format!("kexp/library/mp3/192/{}.mp3", track.id)
            }
        );
        assert_eq!(fx.track(track.id).await.bitrate_kbps, Some(192));
    }

    #[tokio::test]
    async fn redelivery_after_success_leaves_track_untouched() {
        let fx = Fixture::new();
        let transcoder = Arc::new(ScriptedTranscoder::new());
        let pipeline = fx.pipeline(transcoder.clone());
        let track = fx.finalized_upload(b"0123456789", "h1").await;

        pipeline.handle(&job(track.id)).await.unwrap();
        let first = fx.track(track.id).await;
        let published = fx
            .root
            .resolve(first.processed_rel_path.as_deref().unwrap())
            .unwrap();
        let first_size = tokio::fs::metadata(&published).await.unwrap().len();

        let outcome = pipeline.process_upload(&job(track.id)).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::AlreadyPublished);

        let second = fx.track(track.id).await;
        assert_eq!(second.state, TrackState::Ready);
        assert_eq!(second.processed_rel_path, first.processed_rel_path);
        assert_eq!(
            tokio::fs::metadata(&published).await.unwrap().len(),
            first_size
        );
        assert_eq!(transcoder.transcodes(), 1);

        let statuses: Vec<JobStatus> = fx.jobs(track.id).await.iter().map(|j| j.status).collect();
        assert_eq!(statuses, vec![JobStatus::Success, JobStatus::Canceled]);
    }

    #[tokio::test]
    async fn transcode_failure_is_terminal_content_fault() {
        let fx = Fixture::new();
        let transcoder =
            Arc::new(ScriptedTranscoder::new().failing_with("song.part: Invalid data found"));
        let pipeline = fx.pipeline(transcoder);
        let track = fx.finalized_upload(b"not audio", "h1").await;

        let err = pipeline.handle(&job(track.id)).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Content);
        assert!(!err.is_retryable());

        let track = fx.track(track.id).await;
        assert_eq!(track.state, TrackState::Failed);
        assert!(track
            .error_message
            .as_deref()
            .unwrap()
            .contains("Invalid data found"));
        assert_eq!(track.processed_rel_path, None);

        let paths = fx.root.studio_paths("wxyz", None).await.unwrap();
        assert!(!paths.library_output(track.id).exists());
        assert!(!paths.processing_output(track.id).exists());

        let jobs = fx.jobs(track.id).await;
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0].error_message.as_deref().unwrap().contains("Invalid data"));
    }

    #[tokio::test]
    async fn missing_temp_file_is_integrity_fault() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(Arc::new(ScriptedTranscoder::new()));
        let track = fx.finalized_upload(b"0123456789", "h1").await;
        let paths = fx.root.studio_paths("wxyz", None).await.unwrap();
        tokio::fs::remove_file(paths.incoming_part(track.upload_session_id.unwrap()))
            .await
            .unwrap();

        let err = pipeline.handle(&job(track.id)).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Integrity);
        assert_eq!(fx.track(track.id).await.state, TrackState::Failed);
    }

    #[tokio::test]
    async fn missing_toolchain_is_configuration_fault() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(Arc::new(ScriptedTranscoder::new().without_toolchain()));
        let track = fx.finalized_upload(b"0123456789", "h1").await;

        let err = pipeline.handle(&job(track.id)).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Configuration);
        assert!(err.to_string().contains("FFMPEG_PATH"));

        let track = fx.track(track.id).await;
        assert_eq!(track.state, TrackState::Failed);
        assert!(track.error_message.is_some());
    }

    #[tokio::test]
    async fn probe_failure_is_not_fatal() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(Arc::new(ScriptedTranscoder::new().with_failing_probe()));
        let track = fx.finalized_upload(b"0123456789", "h1").await;

        pipeline.process_upload(&job(track.id)).await.unwrap();

        let track = fx.track(track.id).await;
        assert_eq!(track.state, TrackState::Ready);
        assert_eq!(track.duration_seconds, Some(Decimal::ZERO));
        assert_eq!(track.artist, "");
    }

    #[tokio::test]
    async fn transient_fault_then_retry_recovers() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(Arc::new(ScriptedTranscoder::new().with_launch_failures(1)));
        let track = fx.finalized_upload(b"0123456789", "h1").await;

        let first = job(track.id);
        let err = pipeline.handle(&first).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(fx.track(track.id).await.state, TrackState::Failed);

        let queued = TranscodeJob::queued(track.studio_id, track.id, track.upload_session_id, 2);
        fx.store.insert_job(&queued).await.unwrap();
        let claimed = fx.store.claim_next_job("test-host:1:1").await.unwrap().unwrap();
        let retry = JobContext::claimed(&claimed, "test-host:1:1");
        pipeline.handle(&retry).await.unwrap();

        let track = fx.track(track.id).await;
        assert_eq!(track.state, TrackState::Ready);
        assert_eq!(track.error_message, None);

        let jobs = fx.jobs(track.id).await;
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[1].id, queued.id);
        assert_eq!(jobs[1].attempt, 2);
        assert_eq!(jobs[1].status, JobStatus::Success);
        assert_eq!(jobs[1].worker_id.as_deref(), Some("test-host:1:1"));
    }

    #[tokio::test]
    async fn duplicate_links_to_published_original() {
        let fx = Fixture::new();
        let transcoder = Arc::new(ScriptedTranscoder::new());
        let pipeline = fx.pipeline(transcoder.clone());

        let original = fx.finalized_upload(b"0123456789", "same-hash").await;
        pipeline.handle(&job(original.id)).await.unwrap();
        let original = fx.track(original.id).await;

        let duplicate = fx.finalized_upload(b"0123456789", "same-hash").await;
        assert_eq!(duplicate.is_duplicate_of, Some(original.id));

        let outcome = pipeline.process_upload(&job(duplicate.id)).await.unwrap();
        assert_eq!(
            outcome,
            PipelineOutcome::LinkedToOriginal {
                original_id: original.id
            }
        );
        assert_eq!(transcoder.transcodes(), 1);

        let duplicate = fx.track(duplicate.id).await;
        assert_eq!(duplicate.state, TrackState::Ready);
        assert_eq!(duplicate.processed_rel_path, original.processed_rel_path);

        let paths = fx.root.studio_paths("wxyz", None).await.unwrap();
        assert!(!paths.library_output(duplicate.id).exists());
        assert!(!paths
            .incoming_part(duplicate.upload_session_id.unwrap())
            .exists());

        let assets = fx.store.assets_for_track(duplicate.id).await.unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(
            Some(assets[0].storage_key.as_str()),
            original.processed_rel_path.as_deref()
        );
    }

    #[tokio::test]
    async fn archive_during_processing_wins() {
        let fx = Fixture::new();
        let transcoder =
            Arc::new(ScriptedTranscoder::new().with_delay(Duration::from_millis(300)));
        let pipeline = Arc::new(fx.pipeline(transcoder));
        let track = fx.finalized_upload(b"0123456789", "h1").await;

        let running = {
            let pipeline = pipeline.clone();
            let track_id = track.id;
            tokio::spawn(async move { pipeline.process_upload(&job(track_id)).await })
        };

        // Wait until the pipeline has persisted PROCESSING.
        let mut current = fx.track(track.id).await;
        for _ in 0..100 {
            if current.state == TrackState::Processing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            current = fx.track(track.id).await;
        }
        assert_eq!(current.state, TrackState::Processing);
        current.transition_to(TrackState::Archived).unwrap();
        fx.store.save_track(&current).await.unwrap();

        let outcome = running.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            PipelineOutcome::Superseded {
                state: TrackState::Archived
            }
        );
        assert_eq!(fx.track(track.id).await.state, TrackState::Archived);
        assert_eq!(fx.jobs(track.id).await[0].status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn runs_on_the_row_the_pool_claimed() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(Arc::new(ScriptedTranscoder::new()));
        let track = fx.finalized_upload(b"0123456789", "h1").await;
        let queued = TranscodeJob::queued(track.studio_id, track.id, track.upload_session_id, 1);
        fx.store.insert_job(&queued).await.unwrap();

        let claimed = fx.store.claim_next_job("test-host:1:0").await.unwrap().unwrap();
        let ctx = JobContext::claimed(&claimed, "test-host:1:0");
        pipeline.handle(&ctx).await.unwrap();
        assert_eq!(ctx.ledger_row(), Some(queued.id));

        let jobs = fx.jobs(track.id).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Success);
        assert!(jobs[0].started_at.is_some());
        assert!(jobs[0].finished_at.unwrap() >= jobs[0].created_at);
    }

    #[tokio::test]
    async fn deleted_track_is_dropped() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(Arc::new(ScriptedTranscoder::new()));
        let track = fx.finalized_upload(b"0123456789", "h1").await;
        fx.store.soft_delete_track(track.id).await.unwrap();

        let outcome = pipeline.process_upload(&job(track.id)).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::TrackMissing);
        assert!(fx.jobs(track.id).await.is_empty());
    }

    #[tokio::test]
    async fn deleted_track_cancels_its_claimed_row() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(Arc::new(ScriptedTranscoder::new()));
        let track = fx.finalized_upload(b"0123456789", "h1").await;
        let queued = TranscodeJob::queued(track.studio_id, track.id, track.upload_session_id, 1);
        fx.store.insert_job(&queued).await.unwrap();
        fx.store.soft_delete_track(track.id).await.unwrap();

        let claimed = fx.store.claim_next_job("test-host:1:0").await.unwrap().unwrap();
        let outcome = pipeline
            .process_upload(&JobContext::claimed(&claimed, "test-host:1:0"))
            .await
            .unwrap();
        assert_eq!(outcome, PipelineOutcome::TrackMissing);
        assert_eq!(fx.jobs(track.id).await[0].status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn failed_ready_write_unpublishes_the_output() {
        let fx = Fixture::new();
        let mut stores = PipelineStores::shared(fx.store.clone());
        stores.tracks = Arc::new(ReadyWriteFails(fx.store.clone()));
        let pipeline = UploadPipeline::new(
            stores,
            fx.root.clone(),
            Arc::new(ScriptedTranscoder::new()),
        );
        let track = fx.finalized_upload(b"0123456789", "h1").await;

        let err = pipeline.handle(&job(track.id)).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));

        let track = fx.track(track.id).await;
        assert_eq!(track.state, TrackState::Failed);
        assert_eq!(track.processed_rel_path, None);

        let paths = fx.root.studio_paths("wxyz", None).await.unwrap();
        assert!(!paths.library_output(track.id).exists());
        assert!(!paths.processing_output(track.id).exists());
        assert!(fx.store.assets_for_track(track.id).await.unwrap().is_empty());
        assert_eq!(fx.jobs(track.id).await[0].status, JobStatus::Failed);
    }
}
