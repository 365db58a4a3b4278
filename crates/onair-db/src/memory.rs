//! In-process store
//!
//! Implements every repository trait over hash maps guarded by a mutex. Upload sessions
//! get one async mutex each, standing in for the row lock PostgreSQL takes with
//! `SELECT ... FOR UPDATE`. Used by tests and by local runs without a database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use onair_core::models::{
    JobOutcome, JobStatus, Studio, Track, TrackAsset, TrackState, TranscodeJob, UploadSession,
};
use onair_core::{AppError, SoftDeletable};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::traits::{
    AssetStore, JobLedger, LockedUpload, NewUpload, StudioStore, TrackStore, UploadStore,
};

#[derive(Default)]
struct Tables {
    studios: HashMap<Uuid, Studio>,
    uploads: HashMap<Uuid, UploadSession>,
    tracks: HashMap<Uuid, Track>,
    jobs: Vec<TranscodeJob>,
    assets: Vec<TrackAsset>,
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    session_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a studio, returning it.
    pub fn insert_studio(&self, studio: Studio) -> Result<Studio, AppError> {
        self.tables()?.studios.insert(studio.id, studio.clone());
        Ok(studio)
    }

    /// Every track, including soft-deleted ones.
    pub fn all_tracks(&self) -> Result<Vec<Track>, AppError> {
        Ok(self.tables()?.tracks.values().cloned().collect())
    }

    /// Session by id, including soft-deleted ones.
    pub fn raw_upload(&self, id: Uuid) -> Result<Option<UploadSession>, AppError> {
        Ok(self.tables()?.uploads.get(&id).cloned())
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, AppError> {
        self.inner
            .tables
            .lock()
            .map_err(|_| AppError::Internal("memory store lock poisoned".to_string()))
    }

    fn session_lock(&self, id: Uuid) -> Result<Arc<tokio::sync::Mutex<()>>, AppError> {
        let mut locks = self
            .inner
            .session_locks
            .lock()
            .map_err(|_| AppError::Internal("memory store lock poisoned".to_string()))?;
        Ok(locks.entry(id).or_default().clone())
    }
}

#[async_trait]
impl StudioStore for MemoryStore {
    async fn create_studio(&self, studio: &Studio) -> Result<(), AppError> {
        let mut tables = self.tables()?;
        if tables.studios.values().any(|s| s.slug == studio.slug) {
            return Err(AppError::Conflict(format!(
                "Studio slug {} already exists",
                studio.slug
            )));
        }
        tables.studios.insert(studio.id, studio.clone());
        Ok(())
    }

    async fn get_studio(&self, id: Uuid) -> Result<Option<Studio>, AppError> {
        Ok(self
            .tables()?
            .studios
            .get(&id)
            .filter(|s| !s.is_deleted())
            .cloned())
    }

    async fn get_studio_by_slug(&self, slug: &str) -> Result<Option<Studio>, AppError> {
        Ok(self
            .tables()?
            .studios
            .values()
            .find(|s| s.slug == slug && !s.is_deleted())
            .cloned())
    }
}

#[async_trait]
impl UploadStore for MemoryStore {
    async fn create_upload(&self, upload: NewUpload) -> Result<(UploadSession, Track), AppError> {
        let now = Utc::now();
        let mut tables = self.tables()?;

        let original = tables
            .tracks
            .values()
            .filter(|t| !t.is_deleted())
            .find(|t| {
                t.studio_id == upload.session.studio_id
                    && t.content_hash == upload.content_hash
                    && t.is_duplicate_of.is_none()
            })
            .map(|t| t.id);

        let session = upload.session.into_session(now);
        let mut track = Track::new_uploading(
            session.studio_id,
            session.id,
            upload.title,
            upload.content_hash,
            now,
        );
        track.is_duplicate_of = original;

        tables.uploads.insert(session.id, session.clone());
        tables.tracks.insert(track.id, track.clone());
        Ok((session, track))
    }

    async fn get_upload(&self, id: Uuid) -> Result<Option<UploadSession>, AppError> {
        Ok(self
            .tables()?
            .uploads
            .get(&id)
            .filter(|s| !s.is_deleted())
            .cloned())
    }

    async fn lock_upload(&self, id: Uuid) -> Result<Option<Box<dyn LockedUpload>>, AppError> {
        let guard = self.session_lock(id)?.lock_owned().await;

        // Read after the lock is held so we see the previous holder's commit.
        let session = match self.get_upload(id).await? {
            Some(session) => session,
            None => return Ok(None),
        };

        Ok(Some(Box::new(MemoryLockedUpload {
            store: self.clone(),
            _guard: guard,
            session,
            promote: None,
        })))
    }

    async fn release_upload_if_unreferenced(&self, id: Uuid) -> Result<bool, AppError> {
        let mut tables = self.tables()?;
        let referenced = tables
            .tracks
            .values()
            .any(|t| t.upload_session_id == Some(id) && !t.is_deleted());
        if referenced {
            return Ok(false);
        }
        match tables.uploads.get_mut(&id) {
            Some(session) => Ok(session.mark_deleted(Utc::now())),
            None => Ok(false),
        }
    }
}

struct MemoryLockedUpload {
    store: MemoryStore,
    _guard: OwnedMutexGuard<()>,
    session: UploadSession,
    promote: Option<Uuid>,
}

#[async_trait]
impl LockedUpload for MemoryLockedUpload {
    fn session(&self) -> &UploadSession {
        &self.session
    }

    async fn record_progress(
        &mut self,
        bytes_received: i64,
        declared_total: Option<i64>,
    ) -> Result<(), AppError> {
        self.session.bytes_received = bytes_received;
        if declared_total.is_some() {
            self.session.size_bytes = declared_total;
        }
        self.session.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_finalized(&mut self) -> Result<Option<Track>, AppError> {
        self.session.finalized = true;
        self.session.updated_at = Utc::now();

        let tables = self.store.tables()?;
        let waiting = tables.tracks.values().find(|t| {
            t.upload_session_id == Some(self.session.id)
                && t.state == TrackState::Uploading
                && !t.is_deleted()
        });

        Ok(waiting.map(|t| {
            self.promote = Some(t.id);
            let mut promoted = t.clone();
            promoted.state = TrackState::Pending;
            promoted.updated_at = self.session.updated_at;
            promoted
        }))
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        let mut tables = self.store.tables()?;
        tables.uploads.insert(self.session.id, self.session.clone());
        if let Some(track_id) = self.promote {
            if let Some(track) = tables.tracks.get_mut(&track_id) {
                if track.state == TrackState::Uploading {
                    track.state = TrackState::Pending;
                    track.updated_at = self.session.updated_at;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TrackStore for MemoryStore {
    async fn get_track(&self, id: Uuid) -> Result<Option<Track>, AppError> {
        Ok(self
            .tables()?
            .tracks
            .get(&id)
            .filter(|t| !t.is_deleted())
            .cloned())
    }

    async fn track_for_upload(&self, upload_session_id: Uuid) -> Result<Option<Track>, AppError> {
        Ok(self
            .tables()?
            .tracks
            .values()
            .filter(|t| !t.is_deleted())
            .filter(|t| t.upload_session_id == Some(upload_session_id))
            .min_by_key(|t| t.created_at)
            .cloned())
    }

    async fn save_track(&self, track: &Track) -> Result<(), AppError> {
        let mut tables = self.tables()?;
        match tables.tracks.get_mut(&track.id).filter(|t| !t.is_deleted()) {
            Some(stored) => {
                *stored = Track {
                    updated_at: Utc::now(),
                    ..track.clone()
                };
                Ok(())
            }
            None => Err(AppError::NotFound(format!("Track {} not found", track.id))),
        }
    }

    async fn save_track_if_state(
        &self,
        track: &Track,
        expected: TrackState,
    ) -> Result<bool, AppError> {
        let mut tables = self.tables()?;
        match tables.tracks.get_mut(&track.id) {
            Some(stored) if !stored.is_deleted() && stored.state == expected => {
                *stored = Track {
                    updated_at: Utc::now(),
                    ..track.clone()
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn has_live_duplicates(&self, original_id: Uuid) -> Result<bool, AppError> {
        Ok(self
            .tables()?
            .tracks
            .values()
            .any(|t| !t.is_deleted() && t.is_duplicate_of == Some(original_id)))
    }

    async fn soft_delete_track(&self, id: Uuid) -> Result<bool, AppError> {
        let mut tables = self.tables()?;
        match tables.tracks.get_mut(&id) {
            Some(track) => Ok(track.mark_deleted(Utc::now())),
            None => Ok(false),
        }
    }
}

#[async_trait]
impl JobLedger for MemoryStore {
    async fn insert_job(&self, job: &TranscodeJob) -> Result<(), AppError> {
        self.tables()?.jobs.push(job.clone());
        Ok(())
    }

    async fn claim_next_job(&self, worker_id: &str) -> Result<Option<TranscodeJob>, AppError> {
        let mut tables = self.tables()?;
        let now = Utc::now();
        let job = tables
            .jobs
            .iter_mut()
            .filter(|j| j.is_due(now))
            .min_by_key(|j| (j.scheduled_at, j.created_at));
        Ok(job.map(|job| {
            job.status = JobStatus::Running;
            job.worker_id = Some(worker_id.to_string());
            job.started_at = Some(now);
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn reap_stale_jobs(
        &self,
        started_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<TranscodeJob>, AppError> {
        let mut tables = self.tables()?;
        let now = Utc::now();
        let mut reaped = Vec::new();
        for job in tables.jobs.iter_mut().filter(|j| {
            j.status == JobStatus::Running && j.started_at.is_some_and(|t| t < started_before)
        }) {
            job.status = JobStatus::Failed;
            job.error_message = Some(reason.to_string());
            job.finished_at = Some(now);
            job.updated_at = now;
            reaped.push(job.clone());
        }
        Ok(reaped)
    }

    async fn finish_job(&self, id: Uuid, outcome: JobOutcome) -> Result<bool, AppError> {
        let mut tables = self.tables()?;
        let job = match tables
            .jobs
            .iter_mut()
            .find(|j| j.id == id && !j.status.is_terminal())
        {
            Some(job) => job,
            None => return Ok(false),
        };

        let now = Utc::now();
        job.status = outcome.status;
        job.error_message = outcome.error_message;
        job.input_storage_key = outcome.input_storage_key.or(job.input_storage_key.take());
        job.output_storage_key = outcome.output_storage_key.or(job.output_storage_key.take());
        job.loudness_lufs = outcome.loudness_lufs.or(job.loudness_lufs);
        job.peak_dbfs = outcome.peak_dbfs.or(job.peak_dbfs);
        job.target_bitrate_kbps = outcome.target_bitrate_kbps.or(job.target_bitrate_kbps);
        job.finished_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn jobs_for_track(&self, track_id: Uuid) -> Result<Vec<TranscodeJob>, AppError> {
        Ok(self
            .tables()?
            .jobs
            .iter()
            .filter(|j| j.track_id == track_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AssetStore for MemoryStore {
    async fn upsert_asset(&self, asset: &TrackAsset) -> Result<TrackAsset, AppError> {
        let mut tables = self.tables()?;
        if let Some(existing) = tables.assets.iter_mut().find(|a| a.same_key(asset)) {
            existing.size_bytes = asset.size_bytes;
            existing.mime_type = asset.mime_type.clone();
            existing.checksum = asset.checksum.clone();
            existing.updated_at = Utc::now();
            return Ok(existing.clone());
        }
        tables.assets.push(asset.clone());
        Ok(asset.clone())
    }

    async fn assets_for_track(&self, track_id: Uuid) -> Result<Vec<TrackAsset>, AppError> {
        Ok(self
            .tables()?
            .assets
            .iter()
            .filter(|a| a.track_id == track_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onair_core::models::{AssetType, NewUploadSession, UploadSource};
    use std::time::Duration;

    fn new_upload(studio_id: Uuid, hash: &str) -> NewUpload {
        let id = Uuid::new_v4();
        NewUpload {
            session: NewUploadSession {
                id,
                studio_id,
                original_filename: "song.mp3".to_string(),
                size_bytes: Some(10),
                mime_type: "audio/mpeg".to_string(),
                source: UploadSource::Direct,
                temp_rel_path: format!("wxyz/incoming/{}.part", id),
                upload_token: "token".to_string(),
            },
            title: "song.mp3".to_string(),
            content_hash: hash.to_string(),
        }
    }

    #[tokio::test]
    async fn second_upload_with_same_hash_is_a_duplicate() {
        let store = MemoryStore::new();
        let studio = Uuid::new_v4();

        let (_, first) = store.create_upload(new_upload(studio, "h1")).await.unwrap();
        let (_, second) = store.create_upload(new_upload(studio, "h1")).await.unwrap();
        let (_, other_studio) = store
            .create_upload(new_upload(Uuid::new_v4(), "h1"))
            .await
            .unwrap();

        assert_eq!(first.is_duplicate_of, None);
        assert_eq!(second.is_duplicate_of, Some(first.id));
        assert_eq!(other_studio.is_duplicate_of, None);

        assert!(store.has_live_duplicates(first.id).await.unwrap());
        store.soft_delete_track(second.id).await.unwrap();
        assert!(!store.has_live_duplicates(first.id).await.unwrap());
    }

    #[tokio::test]
    async fn deleted_original_frees_the_hash() {
        let store = MemoryStore::new();
        let studio = Uuid::new_v4();

        let (_, first) = store.create_upload(new_upload(studio, "h1")).await.unwrap();
        assert!(store.soft_delete_track(first.id).await.unwrap());
        let (_, again) = store.create_upload(new_upload(studio, "h1")).await.unwrap();
        assert_eq!(again.is_duplicate_of, None);
    }

    #[tokio::test]
    async fn locked_changes_apply_on_commit_only() {
        let store = MemoryStore::new();
        let (session, track) = store
            .create_upload(new_upload(Uuid::new_v4(), "h"))
            .await
            .unwrap();

        {
            let mut locked = store.lock_upload(session.id).await.unwrap().unwrap();
            locked.record_progress(5, Some(10)).await.unwrap();
            // dropped without commit
        }
        assert_eq!(store.get_upload(session.id).await.unwrap().unwrap().bytes_received, 0);

        let mut locked = store.lock_upload(session.id).await.unwrap().unwrap();
        locked.record_progress(10, Some(10)).await.unwrap();
        let promoted = locked.mark_finalized().await.unwrap().unwrap();
        assert_eq!(promoted.id, track.id);
        assert_eq!(promoted.state, TrackState::Pending);
        locked.commit().await.unwrap();

        let stored = store.get_upload(session.id).await.unwrap().unwrap();
        assert!(stored.finalized);
        assert_eq!(stored.bytes_received, 10);
        let track = store.get_track(track.id).await.unwrap().unwrap();
        assert_eq!(track.state, TrackState::Pending);
    }

    #[tokio::test]
    async fn session_lock_is_exclusive() {
        let store = MemoryStore::new();
        let (session, _) = store
            .create_upload(new_upload(Uuid::new_v4(), "h"))
            .await
            .unwrap();

        let held = store.lock_upload(session.id).await.unwrap().unwrap();
        let contender = tokio::time::timeout(
            Duration::from_millis(50),
            store.lock_upload(session.id),
        )
        .await;
        assert!(contender.is_err(), "second lock must wait");

        drop(held);
        assert!(store.lock_upload(session.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn conditional_save_respects_state() {
        let store = MemoryStore::new();
        let (_, mut track) = store
            .create_upload(new_upload(Uuid::new_v4(), "h"))
            .await
            .unwrap();

        track.state = TrackState::Ready;
        assert!(!store
            .save_track_if_state(&track, TrackState::Processing)
            .await
            .unwrap());
        assert!(store
            .save_track_if_state(&track, TrackState::Uploading)
            .await
            .unwrap());
        assert_eq!(
            store.get_track(track.id).await.unwrap().unwrap().state,
            TrackState::Ready
        );
    }

    #[tokio::test]
    async fn session_released_only_when_unreferenced() {
        let store = MemoryStore::new();
        let (session, track) = store
            .create_upload(new_upload(Uuid::new_v4(), "h"))
            .await
            .unwrap();

        assert!(!store.release_upload_if_unreferenced(session.id).await.unwrap());
        store.soft_delete_track(track.id).await.unwrap();
        assert!(store.release_upload_if_unreferenced(session.id).await.unwrap());
        assert!(store.get_upload(session.id).await.unwrap().is_none());
        assert!(!store.release_upload_if_unreferenced(session.id).await.unwrap());
    }

    #[tokio::test]
    async fn terminal_jobs_are_immutable() {
        let store = MemoryStore::new();
        let job = TranscodeJob::queued(Uuid::new_v4(), Uuid::new_v4(), None, 1);
        store.insert_job(&job).await.unwrap();

        let claimed = store.claim_next_job("host:1:0").await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(store.claim_next_job("host:1:1").await.unwrap().is_none());

        assert!(store
            .finish_job(job.id, JobOutcome::new(JobStatus::Success))
            .await
            .unwrap());
        assert!(!store
            .finish_job(job.id, JobOutcome::new(JobStatus::Failed).with_error("late"))
            .await
            .unwrap());

        let jobs = store.jobs_for_track(job.track_id).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Success);
        assert_eq!(jobs[0].error_message, None);
    }

    #[tokio::test]
    async fn claims_due_rows_oldest_first() {
        let store = MemoryStore::new();
        let track_id = Uuid::new_v4();
        let later = TranscodeJob::queued(Uuid::new_v4(), track_id, None, 2)
            .delayed_until(Utc::now() + chrono::Duration::hours(1));
        let first = TranscodeJob::queued(Uuid::new_v4(), track_id, None, 1);
        store.insert_job(&later).await.unwrap();
        store.insert_job(&first).await.unwrap();

        let claimed = store.claim_next_job("host:1:0").await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.worker_id.as_deref(), Some("host:1:0"));
        assert!(store.claim_next_job("host:1:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reaper_closes_only_stale_running_rows() {
        let store = MemoryStore::new();
        let track_id = Uuid::new_v4();
        let mut stale = TranscodeJob::running(Uuid::new_v4(), track_id, None, 1, "gone:1:0");
        stale.started_at = Some(Utc::now() - chrono::Duration::hours(2));
        let fresh = TranscodeJob::running(Uuid::new_v4(), track_id, None, 1, "live:1:0");
        store.insert_job(&stale).await.unwrap();
        store.insert_job(&fresh).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let reaped = store.reap_stale_jobs(cutoff, "worker lost").await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, stale.id);
        assert_eq!(reaped[0].status, JobStatus::Failed);
        assert!(store.reap_stale_jobs(cutoff, "worker lost").await.unwrap().is_empty());

        let jobs = store.jobs_for_track(track_id).await.unwrap();
        assert_eq!(jobs[0].error_message.as_deref(), Some("worker lost"));
        assert_eq!(jobs[1].status, JobStatus::Running);
    }

    #[tokio::test]
    async fn asset_upsert_is_keyed() {
        let store = MemoryStore::new();
        let track_id = Uuid::new_v4();
        let mut asset = TrackAsset::new(track_id, AssetType::NormalizedMp3, "wxyz/library/x.mp3");
        asset.size_bytes = Some(1);
        store.upsert_asset(&asset).await.unwrap();

        let mut again = TrackAsset::new(track_id, AssetType::NormalizedMp3, "wxyz/library/x.mp3");
        again.size_bytes = Some(2);
        store.upsert_asset(&again).await.unwrap();

        let assets = store.assets_for_track(track_id).await.unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].size_bytes, Some(2));
    }
}
