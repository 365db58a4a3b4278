//! Ingest service: the chunked-upload protocol and the track lifecycle operations.
//!
//! Handlers stay thin and call into [`IngestService`], which can be exercised without
//! HTTP. Every watermark read-modify-write happens under the per-session lock taken
//! with [`UploadStore::lock_upload`], so concurrent appends or finalizes of the same
//! upload serialize.
//!
//! [`UploadStore::lock_upload`]: onair_db::UploadStore::lock_upload

use std::path::PathBuf;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use onair_core::models::{
    NewUploadSession, Studio, Track, TrackState, TranscodeJob, UploadSession, UploadSource,
};
use onair_core::AppError;
use onair_db::NewUpload;
use onair_storage::{
    append_from_reader, create_empty, file_size, remove_if_exists, sha256_file, StorageError,
    StudioRoot,
};
use onair_worker::{dispatch_track, JobQueue, PipelineStores};
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::io::AsyncRead;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::constants;
use crate::content_range::ContentRange;

const MAX_FILENAME_LENGTH: usize = 255;
const MAX_SLUG_LENGTH: usize = 64;
const MIN_BITRATE_KBPS: i32 = 32;
const MAX_BITRATE_KBPS: i32 = 320;
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// What a client declares when it opens an upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub studio: String,
    pub filename: String,
    pub size_bytes: Option<i64>,
    pub mime_type: Option<String>,
    /// Hex SHA-256 of the whole file, when the client computed one.
    pub checksum: Option<String>,
    pub source: UploadSource,
}

/// Returned by request-upload.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UploadTicket {
    pub upload_id: Uuid,
    pub track_id: Uuid,
    /// Where to `PUT` the chunks.
    pub chunk_url: String,
    /// Send back in the `X-Upload-Token` header.
    pub upload_token: String,
    /// Set when the studio already holds a track with the same content hash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FinalizeResult {
    pub upload_id: Uuid,
    pub track_id: Uuid,
    /// False when the upload had already been finalized by an earlier call.
    pub enqueued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UploadProgress {
    pub upload_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<Uuid>,
    pub filename: String,
    pub received: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
    pub finalized: bool,
}

/// A published file ready to be streamed.
#[derive(Debug, Clone)]
pub struct StreamTarget {
    pub path: PathBuf,
    pub title: String,
}

pub struct IngestService {
    stores: PipelineStores,
    root: StudioRoot,
    queue: Arc<dyn JobQueue>,
    max_upload_size_bytes: u64,
    chunk_read_size: usize,
}

impl IngestService {
    pub fn new(
        stores: PipelineStores,
        root: StudioRoot,
        queue: Arc<dyn JobQueue>,
        max_upload_size_bytes: u64,
        chunk_read_size: usize,
    ) -> Self {
        Self {
            stores,
            root,
            queue,
            max_upload_size_bytes,
            chunk_read_size,
        }
    }

    pub fn root(&self) -> &StudioRoot {
        &self.root
    }

    /// Register a studio and provision its directories.
    #[tracing::instrument(skip(self, display_name))]
    pub async fn create_studio(
        &self,
        slug: &str,
        display_name: &str,
        default_bitrate_kbps: Option<i32>,
    ) -> Result<Studio, AppError> {
        validate_slug(slug)?;
        if let Some(kbps) = default_bitrate_kbps {
            if !(MIN_BITRATE_KBPS..=MAX_BITRATE_KBPS).contains(&kbps) {
                return Err(AppError::InvalidInput(format!(
                    "default_bitrate_kbps must be between {} and {}",
                    MIN_BITRATE_KBPS, MAX_BITRATE_KBPS
                )));
            }
        }
        let display_name = match display_name.trim() {
            "" => slug,
            name => name,
        };

        let mut studio = Studio::new(slug, display_name);
        studio.default_bitrate_kbps = default_bitrate_kbps;

        self.stores.studios.create_studio(&studio).await?;
        self.root
            .studio_paths(&studio.slug, Some(self.studio_bitrate(&studio)))
            .await?;

        tracing::info!(studio_id = %studio.id, slug = %studio.slug, "Studio created");
        Ok(studio)
    }

    /// Open an upload session and its UPLOADING track, and create the empty temp file.
    #[tracing::instrument(skip(self, request), fields(studio = %request.studio, filename = %request.filename))]
    pub async fn request_upload(&self, request: UploadRequest) -> Result<UploadTicket, AppError> {
        let filename = validate_filename(&request.filename)?;

        if let Some(size) = request.size_bytes {
            if size <= 0 {
                return Err(AppError::InvalidInput(
                    "size_bytes must be greater than 0".to_string(),
                ));
            }
            self.check_size_limit(size)?;
        }

        let checksum = request
            .checksum
            .as_deref()
            .map(normalize_checksum)
            .transpose()?;

        let studio = self.active_studio(&request.studio).await?;

        let upload_id = Uuid::new_v4();
        let paths = self
            .root
            .studio_paths(&studio.slug, Some(self.studio_bitrate(&studio)))
            .await?;
        let part = paths.incoming_part(upload_id);
        let temp_rel_path = self.root.relpath_from_root(&part)?;

        let content_hash = checksum.unwrap_or_else(|| fallback_hash(upload_id, &filename));
        let mime_type = request
            .mime_type
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());

        create_empty(&part).await?;

        let upload = NewUpload {
            session: NewUploadSession {
                id: upload_id,
                studio_id: studio.id,
                original_filename: filename.clone(),
                size_bytes: request.size_bytes,
                mime_type,
                source: request.source,
                temp_rel_path,
                upload_token: generate_upload_token(),
            },
            title: filename,
            content_hash,
        };

        let (session, track) = match self.stores.uploads.create_upload(upload).await {
            Ok(created) => created,
            Err(e) => {
                if let Err(cleanup) = remove_if_exists(&part).await {
                    tracing::warn!(error = %cleanup, path = %part.display(), "Failed to remove temp file");
                }
                return Err(e);
            }
        };

        tracing::info!(
            upload_id = %session.id,
            track_id = %track.id,
            duplicate_of = ?track.is_duplicate_of,
            "Upload requested"
        );

        Ok(UploadTicket {
            upload_id: session.id,
            track_id: track.id,
            chunk_url: constants::chunk_url(session.id),
            upload_token: session.upload_token,
            duplicate_of: track.is_duplicate_of,
        })
    }

    /// Append one chunk and return the new watermark.
    ///
    /// The range must start at the watermark; there is no reordering and no tolerance
    /// for a replayed range. A zero-end range past byte 0 writes nothing and reports
    /// the watermark, wherever it starts.
    #[tracing::instrument(skip(self, token, body))]
    pub async fn append_chunk<R>(
        &self,
        upload_id: Uuid,
        token: Option<&str>,
        range: ContentRange,
        body: &mut R,
    ) -> Result<i64, AppError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let mut locked = self
            .stores
            .uploads
            .lock_upload(upload_id)
            .await?
            .ok_or_else(|| upload_not_found(upload_id))?;

        verify_token(locked.session(), token)?;
        if locked.session().finalized {
            return Err(AppError::Conflict(format!(
                "Upload {} is already finalized",
                upload_id
            )));
        }

        let part = self.temp_path(locked.session())?;
        let watermark = self.watermark_on_disk(locked.session(), &part).await?;

        if range.is_offset_query() {
            if watermark != locked.session().bytes_received {
                let total = locked.session().size_bytes;
                locked.record_progress(watermark, total).await?;
                locked.commit().await?;
            }
            return Ok(watermark);
        }

        range.validate()?;
        let declared_total = range.total.or(locked.session().size_bytes);
        if let (Some(known), Some(sent)) = (locked.session().size_bytes, range.total) {
            if known != sent {
                return Err(AppError::BadRequest(format!(
                    "Declared total {} does not match the upload size {}",
                    sent, known
                )));
            }
        }
        if let Some(total) = declared_total {
            self.check_size_limit(total)?;
            if range.end >= total {
                return Err(AppError::BadRequest(format!(
                    "Content-Range end {} is past the upload size {}",
                    range.end, total
                )));
            }
        } else {
            self.check_size_limit(range.end + 1)?;
        }

        if range.start != watermark {
            return Err(AppError::RangeMismatch {
                expected: watermark,
                got: range.start,
            });
        }

        let appended =
            append_from_reader(&part, body, range.byte_count() as u64, self.chunk_read_size).await;

        // The file is the source of truth, also after a partial write.
        let received = file_size(&part).await? as i64;
        locked.record_progress(received, declared_total).await?;
        locked.commit().await?;

        let written = appended?;
        tracing::debug!(
            upload_id = %upload_id,
            written,
            received,
            "Chunk appended"
        );
        Ok(received)
    }

    /// Verify the assembled file and hand the track to the pipeline.
    ///
    /// A second finalize of the same upload succeeds without enqueueing again.
    #[tracing::instrument(skip(self, token, checksum))]
    pub async fn finalize(
        &self,
        upload_id: Uuid,
        token: Option<&str>,
        checksum: Option<&str>,
    ) -> Result<FinalizeResult, AppError> {
        let mut locked = self
            .stores
            .uploads
            .lock_upload(upload_id)
            .await?
            .ok_or_else(|| upload_not_found(upload_id))?;

        verify_token(locked.session(), token)?;

        if locked.session().finalized {
            drop(locked);
            let track = self.track_for_upload(upload_id).await?;
            tracing::info!(upload_id = %upload_id, "Upload already finalized, not enqueueing again");
            return Ok(FinalizeResult {
                upload_id,
                track_id: track.id,
                enqueued: false,
                job_id: None,
            });
        }

        let declared = locked.session().size_bytes.ok_or_else(|| {
            AppError::Conflict("Upload size is not known yet; send at least one chunk".to_string())
        })?;
        let part = self.temp_path(locked.session())?;
        let on_disk = match file_size(&part).await {
            Ok(size) => size as i64,
            Err(StorageError::NotFound(_)) => {
                return Err(AppError::Conflict(format!(
                    "Temp file of upload {} is missing",
                    upload_id
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if on_disk != declared {
            return Err(AppError::Conflict(format!(
                "Upload incomplete: {} of {} bytes received",
                on_disk, declared
            )));
        }

        if let Some(expected) = checksum {
            let expected = normalize_checksum(expected)?;
            let actual = sha256_file(&part).await?;
            if actual != expected {
                return Err(AppError::Conflict(
                    "Checksum does not match the uploaded bytes".to_string(),
                ));
            }
        }

        locked.record_progress(on_disk, Some(declared)).await?;
        let promoted = locked.mark_finalized().await?;
        locked.commit().await?;

        let track = match promoted {
            Some(track) => track,
            None => self.track_for_upload(upload_id).await?,
        };

        let job_id = dispatch_track(
            self.stores.ledger.as_ref(),
            self.queue.as_ref(),
            &track,
        )
        .await
        .inspect_err(|e| {
            tracing::error!(
                upload_id = %upload_id,
                track_id = %track.id,
                error = %e,
                "Upload finalized but the pipeline could not be enqueued"
            );
        })?;

        tracing::info!(upload_id = %upload_id, track_id = %track.id, job_id = %job_id, "Upload finalized");
        Ok(FinalizeResult {
            upload_id,
            track_id: track.id,
            enqueued: true,
            job_id: Some(job_id),
        })
    }

    pub async fn get_upload(&self, upload_id: Uuid) -> Result<UploadProgress, AppError> {
        let session = self
            .stores
            .uploads
            .get_upload(upload_id)
            .await?
            .ok_or_else(|| upload_not_found(upload_id))?;
        let track = self.stores.tracks.track_for_upload(upload_id).await?;

        Ok(UploadProgress {
            upload_id: session.id,
            track_id: track.map(|t| t.id),
            filename: session.original_filename,
            received: session.bytes_received,
            size_bytes: session.size_bytes,
            finalized: session.finalized,
        })
    }

    pub async fn get_track(&self, track_id: Uuid) -> Result<Track, AppError> {
        self.stores
            .tracks
            .get_track(track_id)
            .await?
            .ok_or_else(|| track_not_found(track_id))
    }

    pub async fn jobs_for_track(&self, track_id: Uuid) -> Result<Vec<TranscodeJob>, AppError> {
        self.get_track(track_id).await?;
        self.stores.ledger.jobs_for_track(track_id).await
    }

    /// Soft-delete a track and remove its files, best effort.
    ///
    /// Unknown or already deleted tracks are a success. A PROCESSING track is a conflict.
    #[tracing::instrument(skip(self))]
    pub async fn delete_track(&self, track_id: Uuid) -> Result<(), AppError> {
        let Some(track) = self.stores.tracks.get_track(track_id).await? else {
            tracing::debug!(track_id = %track_id, "Track already gone");
            return Ok(());
        };

        if track.state == TrackState::Processing {
            return Err(AppError::Conflict(format!(
                "Track {} is being processed; retry once it is READY or FAILED",
                track_id
            )));
        }

        for path in self.files_of(&track).await? {
            match remove_if_exists(&path).await {
                Ok(true) => tracing::debug!(path = %path.display(), "Removed track file"),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "Failed to remove track file")
                }
            }
        }

        if !self.stores.tracks.soft_delete_track(track_id).await? {
            return Ok(());
        }
        if let Some(session_id) = track.upload_session_id {
            self.stores
                .uploads
                .release_upload_if_unreferenced(session_id)
                .await?;
        }

        tracing::info!(track_id = %track_id, "Track deleted");
        Ok(())
    }

    /// Move a track to ARCHIVED. Archiving an archived track is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn archive_track(&self, track_id: Uuid) -> Result<Track, AppError> {
        let mut track = self.get_track(track_id).await?;
        if track.state == TrackState::Archived {
            return Ok(track);
        }

        let prior = track.state;
        track.transition_to(TrackState::Archived)?;
        if !self
            .stores
            .tracks
            .save_track_if_state(&track, prior)
            .await?
        {
            return Err(AppError::Conflict(format!(
                "Track {} changed state concurrently; retry",
                track_id
            )));
        }

        tracing::info!(track_id = %track_id, from = %prior, "Track archived");
        Ok(track)
    }

    /// Resolve the published file of a studio's track.
    pub async fn stream_target(&self, slug: &str, track_id: Uuid) -> Result<StreamTarget, AppError> {
        let studio = self
            .stores
            .studios
            .get_studio_by_slug(slug)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Studio {} not found", slug)))?;

        let track = self
            .stores
            .tracks
            .get_track(track_id)
            .await?
            .filter(|t| t.studio_id == studio.id)
            .ok_or_else(|| track_not_found(track_id))?;

        let rel_path = track.processed_rel_path.as_deref().ok_or_else(|| {
            AppError::NotFound(format!("Track {} has no published file", track_id))
        })?;
        let path = self.root.resolve(rel_path)?;
        file_size(&path).await?;

        Ok(StreamTarget {
            path,
            title: track.title,
        })
    }

    async fn active_studio(&self, slug: &str) -> Result<Studio, AppError> {
        self.stores
            .studios
            .get_studio_by_slug(slug)
            .await?
            .filter(|s| s.is_active)
            .ok_or_else(|| AppError::NotFound(format!("Studio {} not found", slug)))
    }

    async fn track_for_upload(&self, upload_id: Uuid) -> Result<Track, AppError> {
        self.stores
            .tracks
            .track_for_upload(upload_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Upload {} has no live track", upload_id))
            })
    }

    fn studio_bitrate(&self, studio: &Studio) -> u32 {
        studio.target_bitrate_kbps(self.root.default_bitrate_kbps())
    }

    fn check_size_limit(&self, size: i64) -> Result<(), AppError> {
        if size as u64 > self.max_upload_size_bytes {
            return Err(AppError::PayloadTooLarge(format!(
                "{} bytes exceeds the maximum upload size of {} bytes",
                size, self.max_upload_size_bytes
            )));
        }
        Ok(())
    }

    fn temp_path(&self, session: &UploadSession) -> Result<PathBuf, AppError> {
        let key = session.temp_rel_path.as_deref().ok_or_else(|| {
            AppError::Internal(format!("Upload {} has no temp file reference", session.id))
        })?;
        Ok(self.root.resolve(key)?)
    }

    /// Watermark reconciled with the temp file size.
    async fn watermark_on_disk(
        &self,
        session: &UploadSession,
        part: &std::path::Path,
    ) -> Result<i64, AppError> {
        let on_disk = match file_size(part).await {
            Ok(size) => size as i64,
            Err(StorageError::NotFound(_)) => 0,
            Err(e) => return Err(e.into()),
        };
        if on_disk != session.bytes_received {
            tracing::warn!(
                upload_id = %session.id,
                recorded = session.bytes_received,
                on_disk,
                "Watermark differs from temp file size, using the file"
            );
        }
        Ok(on_disk)
    }

    /// Files a deleted track leaves behind: its published file (unless shared), the
    /// upload's temp file and the processing output.
    async fn files_of(&self, track: &Track) -> Result<Vec<PathBuf>, AppError> {
        let mut files = Vec::new();

        if let Some(rel) = track.processed_rel_path.as_deref() {
            if self.owns_published_file(track, rel).await? {
                match self.root.resolve(rel) {
                    Ok(path) => files.push(path),
                    Err(e) => tracing::warn!(error = %e, key = %rel, "Unresolvable published key"),
                }
            } else {
                tracing::debug!(track_id = %track.id, key = %rel, "Published file is shared, keeping it");
            }
        }

        if let Some(session_id) = track.upload_session_id {
            if let Some(session) = self.stores.uploads.get_upload(session_id).await? {
                if let Some(rel) = session.temp_rel_path.as_deref() {
                    match self.root.resolve(rel) {
                        Ok(path) => files.push(path),
                        Err(e) => tracing::warn!(error = %e, key = %rel, "Unresolvable temp key"),
                    }
                }
            }
        }

        if let Some(studio) = self.stores.studios.get_studio(track.studio_id).await? {
            match self.root.studio_paths(&studio.slug, None).await {
                Ok(paths) => files.push(paths.processing_output(track.id)),
                Err(e) => tracing::warn!(error = %e, slug = %studio.slug, "Unresolvable studio directory"),
            }
        }

        Ok(files)
    }

    /// A duplicate linked to its original shares the original's file; an original keeps
    /// its file while live duplicates still point at it.
    async fn owns_published_file(&self, track: &Track, rel: &str) -> Result<bool, AppError> {
        if let Some(original_id) = track.is_duplicate_of {
            if let Some(original) = self.stores.tracks.get_track(original_id).await? {
                if original.processed_rel_path.as_deref() == Some(rel) {
                    return Ok(false);
                }
            }
        }
        Ok(!self.stores.tracks.has_live_duplicates(track.id).await?)
    }
}

/// 32 random bytes, URL-safe base64 without padding.
fn generate_upload_token() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>())
}

fn verify_token(session: &UploadSession, presented: Option<&str>) -> Result<(), AppError> {
    let presented = presented
        .ok_or_else(|| AppError::Forbidden("Missing upload token".to_string()))?;
    let matches: bool = presented
        .as_bytes()
        .ct_eq(session.upload_token.as_bytes())
        .into();
    if !matches {
        return Err(AppError::Forbidden("Invalid upload token".to_string()));
    }
    Ok(())
}

fn fallback_hash(upload_id: Uuid, filename: &str) -> String {
    hex::encode(Sha256::digest(format!("{}:{}", upload_id, filename).as_bytes()))
}

fn normalize_checksum(checksum: &str) -> Result<String, AppError> {
    let checksum = checksum.trim().to_ascii_lowercase();
    if checksum.len() != 64 || !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(AppError::InvalidInput(
            "checksum must be a hex-encoded SHA-256 digest".to_string(),
        ));
    }
    Ok(checksum)
}

fn validate_filename(filename: &str) -> Result<String, AppError> {
    let filename = filename.trim();
    if filename.is_empty() {
        return Err(AppError::InvalidInput("filename is required".to_string()));
    }
    if filename.chars().count() > MAX_FILENAME_LENGTH {
        return Err(AppError::InvalidInput(format!(
            "filename is longer than {} characters",
            MAX_FILENAME_LENGTH
        )));
    }
    if filename.contains(['/', '\\']) || filename.contains("..") || filename.contains('\0') {
        return Err(AppError::InvalidInput(
            "filename must not contain path separators".to_string(),
        ));
    }
    Ok(filename.to_string())
}

fn validate_slug(slug: &str) -> Result<(), AppError> {
    let valid = !slug.is_empty()
        && slug.len() <= MAX_SLUG_LENGTH
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
    if !valid {
        return Err(AppError::InvalidInput(format!(
            "slug must be 1-{} characters of a-z, 0-9, '-' or '_'",
            MAX_SLUG_LENGTH
        )));
    }
    Ok(())
}

fn upload_not_found(upload_id: Uuid) -> AppError {
    AppError::NotFound(format!("Upload {} not found", upload_id))
}

fn track_not_found(track_id: Uuid) -> AppError {
    AppError::NotFound(format!("Track {} not found", track_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use onair_db::{JobLedger, MemoryStore, TrackStore};
    use onair_storage::StudioRoot;
    use onair_worker::{ChannelJobQueue, PipelineMessage};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        service: IngestService,
        receiver: mpsc::Receiver<PipelineMessage>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert_studio(Studio::new("wxyz", "WXYZ Radio")).unwrap();

        let root = StudioRoot::new(dir.path(), 128).unwrap();
        let (queue, receiver) = ChannelJobQueue::channel(16);
        let service = IngestService::new(
            PipelineStores::shared(store.clone()),
            root,
            Arc::new(queue),
            1024,
            3,
        );
        Fixture {
            _dir: dir,
            store,
            service,
            receiver,
        }
    }

    fn request(size: Option<i64>) -> UploadRequest {
        UploadRequest {
            studio: "wxyz".to_string(),
            filename: "song.mp3".to_string(),
            size_bytes: size,
            mime_type: Some("audio/mpeg".to_string()),
            checksum: None,
            source: UploadSource::Direct,
        }
    }

    fn range(value: &str) -> ContentRange {
        value.parse().unwrap()
    }

    async fn append(
        f: &Fixture,
        ticket: &UploadTicket,
        value: &str,
        body: &[u8],
    ) -> Result<i64, AppError> {
        let mut reader = body;
        f.service
            .append_chunk(
                ticket.upload_id,
                Some(&ticket.upload_token),
                range(value),
                &mut reader,
            )
            .await
    }

    async fn part_len(f: &Fixture, ticket: &UploadTicket) -> u64 {
        let session = f.store.raw_upload(ticket.upload_id).unwrap().unwrap();
        let path = f
            .service
            .root()
            .resolve(session.temp_rel_path.as_deref().unwrap())
            .unwrap();
        file_size(&path).await.unwrap()
    }

    #[tokio::test]
    async fn request_upload_creates_empty_part_and_uploading_track() {
        let f = fixture();
        let ticket = f.service.request_upload(request(Some(10))).await.unwrap();

        assert_eq!(ticket.chunk_url, format!("/api/uploads/{}/chunk", ticket.upload_id));
        assert_eq!(ticket.upload_token.len(), 43);
        assert_eq!(part_len(&f, &ticket).await, 0);

        let track = f.service.get_track(ticket.track_id).await.unwrap();
        assert_eq!(track.state, TrackState::Uploading);
        assert_eq!(track.title, "song.mp3");
        assert_eq!(track.content_hash, fallback_hash(ticket.upload_id, "song.mp3"));
    }

    #[tokio::test]
    async fn request_upload_rejects_unknown_studio_and_bad_input() {
        let f = fixture();

        let mut unknown = request(Some(10));
        unknown.studio = "nope".to_string();
        assert!(matches!(
            f.service.request_upload(unknown).await,
            Err(AppError::NotFound(_))
        ));

        let mut traversal = request(Some(10));
        traversal.filename = "../etc/passwd".to_string();
        assert!(matches!(
            f.service.request_upload(traversal).await,
            Err(AppError::InvalidInput(_))
        ));

        assert!(matches!(
            f.service.request_upload(request(Some(4096))).await,
            Err(AppError::PayloadTooLarge(_))
        ));

        let mut bad_checksum = request(Some(10));
        bad_checksum.checksum = Some("abc".to_string());
        assert!(matches!(
            f.service.request_upload(bad_checksum).await,
            Err(AppError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn same_checksum_marks_duplicate() {
        let f = fixture();
        let digest = hex::encode(Sha256::digest(b"0123456789"));

        let mut first = request(Some(10));
        first.checksum = Some(digest.to_uppercase());
        let first = f.service.request_upload(first).await.unwrap();
        assert_eq!(first.duplicate_of, None);

        let mut second = request(Some(10));
        second.checksum = Some(digest);
        let second = f.service.request_upload(second).await.unwrap();
        assert_eq!(second.duplicate_of, Some(first.track_id));
    }

    #[tokio::test]
    async fn in_order_chunks_tile_the_file_and_finalize_enqueues() {
        let mut f = fixture();
        let ticket = f.service.request_upload(request(Some(10))).await.unwrap();

        assert_eq!(append(&f, &ticket, "bytes 0-4/10", b"01234").await.unwrap(), 5);
        assert_eq!(append(&f, &ticket, "bytes 5-9/10", b"56789").await.unwrap(), 10);
        assert_eq!(part_len(&f, &ticket).await, 10);

        let result = f
            .service
            .finalize(ticket.upload_id, Some(&ticket.upload_token), None)
            .await
            .unwrap();
        assert!(result.enqueued);
        assert_eq!(result.track_id, ticket.track_id);

        let message = f.receiver.try_recv().unwrap();
        assert_eq!(message.track_id, ticket.track_id);
        assert_eq!(Some(message.job_id), result.job_id);
        let jobs = f.store.jobs_for_track(ticket.track_id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempt, 1);

        let track = f.service.get_track(ticket.track_id).await.unwrap();
        assert_eq!(track.state, TrackState::Pending);
    }

    #[tokio::test]
    async fn out_of_order_chunk_is_a_range_mismatch() {
        let f = fixture();
        let ticket = f.service.request_upload(request(Some(10))).await.unwrap();
        append(&f, &ticket, "bytes 0-4/10", b"01234").await.unwrap();

        let err = append(&f, &ticket, "bytes 0-4/10", b"01234").await.unwrap_err();
        assert_eq!(err.expected_offset(), Some(5));

        let err = append(&f, &ticket, "bytes 7-9/10", b"789").await.unwrap_err();
        assert!(matches!(err, AppError::RangeMismatch { expected: 5, got: 7 }));

        assert_eq!(part_len(&f, &ticket).await, 5);
        let progress = f.service.get_upload(ticket.upload_id).await.unwrap();
        assert_eq!(progress.received, 5);
    }

    #[tokio::test]
    async fn offset_query_reports_watermark_without_writing() {
        let f = fixture();
        let ticket = f.service.request_upload(request(Some(10))).await.unwrap();
        append(&f, &ticket, "bytes 0-4/10", b"01234").await.unwrap();

        assert_eq!(append(&f, &ticket, "bytes 9-0/10", b"garbage").await.unwrap(), 5);
        assert_eq!(part_len(&f, &ticket).await, 5);
    }

    #[tokio::test]
    async fn offset_query_at_the_watermark_is_not_a_bad_range() {
        let f = fixture();
        let ticket = f.service.request_upload(request(Some(10))).await.unwrap();
        append(&f, &ticket, "bytes 0-4/10", b"01234").await.unwrap();

        assert_eq!(append(&f, &ticket, "bytes 5-0/10", b"").await.unwrap(), 5);
        assert_eq!(part_len(&f, &ticket).await, 5);
        assert_eq!(f.service.get_upload(ticket.upload_id).await.unwrap().received, 5);
    }

    #[tokio::test]
    async fn one_byte_first_chunk_is_appended() {
        let f = fixture();
        let ticket = f.service.request_upload(request(Some(10))).await.unwrap();

        assert_eq!(append(&f, &ticket, "bytes 0-0/10", b"0").await.unwrap(), 1);
        assert_eq!(part_len(&f, &ticket).await, 1);
    }

    #[tokio::test]
    async fn concurrent_appends_at_one_offset_write_once() {
        let f = fixture();
        let ticket = f.service.request_upload(request(Some(10))).await.unwrap();

        let (first, second) = tokio::join!(
            append(&f, &ticket, "bytes 0-4/10", b"01234"),
            append(&f, &ticket, "bytes 0-4/10", b"abcde"),
        );

        let results = [first, second];
        let written: Vec<&i64> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(written, vec![&5]);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(AppError::RangeMismatch { expected: 5, got: 0 })
        )));
        assert_eq!(part_len(&f, &ticket).await, 5);
        assert_eq!(f.service.get_upload(ticket.upload_id).await.unwrap().received, 5);
    }

    #[tokio::test]
    async fn body_longer_than_range_is_cut_at_the_range_end() {
        let f = fixture();
        let ticket = f.service.request_upload(request(Some(10))).await.unwrap();

        assert_eq!(append(&f, &ticket, "bytes 0-3/10", b"0123456789").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn token_is_required_and_checked() {
        let f = fixture();
        let ticket = f.service.request_upload(request(Some(10))).await.unwrap();
        let mut body: &[u8] = b"01234";

        let missing = f
            .service
            .append_chunk(ticket.upload_id, None, range("bytes 0-4/10"), &mut body)
            .await;
        assert!(matches!(missing, Err(AppError::Forbidden(_))));

        let wrong = f
            .service
            .append_chunk(ticket.upload_id, Some("nope"), range("bytes 0-4/10"), &mut body)
            .await;
        assert!(matches!(wrong, Err(AppError::Forbidden(_))));
        assert_eq!(part_len(&f, &ticket).await, 0);
    }

    #[tokio::test]
    async fn range_past_declared_total_is_rejected() {
        let f = fixture();
        let ticket = f.service.request_upload(request(Some(10))).await.unwrap();

        let err = append(&f, &ticket, "bytes 0-11/12", b"012345678901").await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn total_is_learned_from_the_first_chunk() {
        let f = fixture();
        let ticket = f.service.request_upload(request(None)).await.unwrap();

        append(&f, &ticket, "bytes 0-4/*", b"01234").await.unwrap();
        assert_eq!(f.service.get_upload(ticket.upload_id).await.unwrap().size_bytes, None);

        append(&f, &ticket, "bytes 5-7/8", b"567").await.unwrap();
        let progress = f.service.get_upload(ticket.upload_id).await.unwrap();
        assert_eq!(progress.size_bytes, Some(8));
        assert_eq!(progress.received, 8);
    }

    #[tokio::test]
    async fn finalized_session_rejects_chunks_and_second_finalize_does_not_enqueue() {
        let mut f = fixture();
        let ticket = f.service.request_upload(request(Some(5))).await.unwrap();
        append(&f, &ticket, "bytes 0-4/5", b"01234").await.unwrap();
        f.service
            .finalize(ticket.upload_id, Some(&ticket.upload_token), None)
            .await
            .unwrap();
        f.receiver.try_recv().unwrap();

        let err = append(&f, &ticket, "bytes 5-5/6", b"5").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(part_len(&f, &ticket).await, 5);

        let again = f
            .service
            .finalize(ticket.upload_id, Some(&ticket.upload_token), None)
            .await
            .unwrap();
        assert!(!again.enqueued);
        assert!(f.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn incomplete_upload_does_not_finalize() {
        let mut f = fixture();
        let ticket = f.service.request_upload(request(Some(10))).await.unwrap();
        append(&f, &ticket, "bytes 0-4/10", b"01234").await.unwrap();

        let err = f
            .service
            .finalize(ticket.upload_id, Some(&ticket.upload_token), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert!(f.receiver.try_recv().is_err());

        let track = f.service.get_track(ticket.track_id).await.unwrap();
        assert_eq!(track.state, TrackState::Uploading);
    }

    #[tokio::test]
    async fn checksum_mismatch_blocks_finalize() {
        let f = fixture();
        let ticket = f.service.request_upload(request(Some(5))).await.unwrap();
        append(&f, &ticket, "bytes 0-4/5", b"01234").await.unwrap();

        let wrong = hex::encode(Sha256::digest(b"other"));
        let err = f
            .service
            .finalize(ticket.upload_id, Some(&ticket.upload_token), Some(&wrong))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let right = hex::encode(Sha256::digest(b"01234"));
        let result = f
            .service
            .finalize(ticket.upload_id, Some(&ticket.upload_token), Some(&right))
            .await
            .unwrap();
        assert!(result.enqueued);
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_removes_the_part_file() {
        let f = fixture();
        let ticket = f.service.request_upload(request(Some(10))).await.unwrap();
        append(&f, &ticket, "bytes 0-4/10", b"01234").await.unwrap();

        f.service.delete_track(ticket.track_id).await.unwrap();
        f.service.delete_track(ticket.track_id).await.unwrap();
        f.service.delete_track(Uuid::new_v4()).await.unwrap();

        let session = f.store.raw_upload(ticket.upload_id).unwrap().unwrap();
        assert!(session.deleted_at.is_some());
        let part = f
            .service
            .root()
            .resolve(session.temp_rel_path.as_deref().unwrap())
            .unwrap();
        assert!(!part.exists());
        assert!(matches!(
            f.service.get_track(ticket.track_id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn processing_track_cannot_be_deleted() {
        let f = fixture();
        let ticket = f.service.request_upload(request(Some(10))).await.unwrap();
        let mut track = f.service.get_track(ticket.track_id).await.unwrap();
        track.state = TrackState::Processing;
        f.store.save_track(&track).await.unwrap();

        assert!(matches!(
            f.service.delete_track(ticket.track_id).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn archive_rejects_uploading_and_is_idempotent() {
        let f = fixture();
        let ticket = f.service.request_upload(request(Some(5))).await.unwrap();
        assert!(matches!(
            f.service.archive_track(ticket.track_id).await,
            Err(AppError::Conflict(_))
        ));

        append(&f, &ticket, "bytes 0-4/5", b"01234").await.unwrap();
        f.service
            .finalize(ticket.upload_id, Some(&ticket.upload_token), None)
            .await
            .unwrap();

        let archived = f.service.archive_track(ticket.track_id).await.unwrap();
        assert_eq!(archived.state, TrackState::Archived);
        let again = f.service.archive_track(ticket.track_id).await.unwrap();
        assert_eq!(again.state, TrackState::Archived);
    }

    #[tokio::test]
    async fn create_studio_validates_slug_and_uniqueness() {
        let f = fixture();
        let studio = f.service.create_studio("kexp", "KEXP", Some(192)).await.unwrap();
        assert_eq!(studio.default_bitrate_kbps, Some(192));
        assert!(f.service.root().path().join("kexp/library/mp3/192").is_dir());

        assert!(matches!(
            f.service.create_studio("kexp", "Again", None).await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            f.service.create_studio("Bad Slug", "x", None).await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            f.service.create_studio("ok", "x", Some(8)).await,
            Err(AppError::InvalidInput(_))
        ));
    }
}
