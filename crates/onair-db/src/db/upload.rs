use async_trait::async_trait;
use chrono::Utc;
use onair_core::models::{Track, UploadSession};
use onair_core::AppError;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::TRACK_COLUMNS;
use crate::traits::{LockedUpload, NewUpload, UploadStore};

const SESSION_COLUMNS: &str = "id, studio_id, original_filename, size_bytes, mime_type, source, \
     temp_rel_path, bytes_received, upload_token, finalized, error_message, \
     created_at, updated_at, deleted_at";

/// A concurrent request-upload may claim the same content hash between our lookup and
/// our insert; the second pass then sees the winner and records a duplicate.
const CREATE_ATTEMPTS: u32 = 2;

/// Repository for chunked upload sessions
#[derive(Clone)]
pub struct UploadRepository {
    pool: PgPool,
}

impl UploadRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn try_create_upload(
        &self,
        upload: &NewUpload,
    ) -> Result<(UploadSession, Track), AppError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let original: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM tracks
            WHERE studio_id = $1
                AND content_hash = $2
                AND is_duplicate_of IS NULL
                AND deleted_at IS NULL
            LIMIT 1
            "#,
        )
        .bind(upload.session.studio_id)
        .bind(&upload.content_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let session = upload.session.clone().into_session(now);
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                id, studio_id, original_filename, size_bytes, mime_type, source,
                temp_rel_path, bytes_received, upload_token, finalized, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, FALSE, $9, $9)
            "#,
        )
        .bind(session.id)
        .bind(session.studio_id)
        .bind(&session.original_filename)
        .bind(session.size_bytes)
        .bind(&session.mime_type)
        .bind(session.source.to_string())
        .bind(&session.temp_rel_path)
        .bind(&session.upload_token)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let mut track = Track::new_uploading(
            session.studio_id,
            session.id,
            upload.title.clone(),
            upload.content_hash.clone(),
            now,
        );
        track.is_duplicate_of = original;

        sqlx::query(
            r#"
            INSERT INTO tracks (
                id, studio_id, title, state, content_hash, is_duplicate_of,
                upload_session_id, is_active, is_explicit, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            "#,
        )
        .bind(track.id)
        .bind(track.studio_id)
        .bind(&track.title)
        .bind(track.state.to_string())
        .bind(&track.content_hash)
        .bind(track.is_duplicate_of)
        .bind(track.upload_session_id)
        .bind(track.is_active)
        .bind(track.is_explicit)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((session, track))
    }
}

#[async_trait]
impl UploadStore for UploadRepository {
    #[tracing::instrument(skip(self, upload), fields(upload_id = %upload.session.id))]
    async fn create_upload(&self, upload: NewUpload) -> Result<(UploadSession, Track), AppError> {
        let mut attempt = 1;
        loop {
            match self.try_create_upload(&upload).await {
                Err(AppError::Database(sqlx::Error::Database(db_err)))
                    if db_err.is_unique_violation() && attempt < CREATE_ATTEMPTS =>
                {
                    tracing::debug!(
                        content_hash = %upload.content_hash,
                        "Content hash claimed concurrently, retrying as duplicate"
                    );
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn get_upload(&self, id: Uuid) -> Result<Option<UploadSession>, AppError> {
        let sql = format!(
            "SELECT {} FROM upload_sessions WHERE id = $1 AND deleted_at IS NULL",
            SESSION_COLUMNS
        );
        let session = sqlx::query_as::<Postgres, UploadSession>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(session)
    }

    #[tracing::instrument(skip(self))]
    async fn lock_upload(&self, id: Uuid) -> Result<Option<Box<dyn LockedUpload>>, AppError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {} FROM upload_sessions WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
            SESSION_COLUMNS
        );
        let session = sqlx::query_as::<Postgres, UploadSession>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        match session {
            Some(session) => Ok(Some(Box::new(PgLockedUpload { tx, session }))),
            None => {
                tx.rollback().await?;
                Ok(None)
            }
        }
    }

    async fn release_upload_if_unreferenced(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET deleted_at = NOW(), updated_at = NOW()
            WHERE id = $1
                AND deleted_at IS NULL
                AND NOT EXISTS (
                    SELECT 1 FROM tracks
                    WHERE upload_session_id = $1 AND deleted_at IS NULL
                )
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Session row held with `SELECT ... FOR UPDATE` until commit or drop.
struct PgLockedUpload {
    tx: Transaction<'static, Postgres>,
    session: UploadSession,
}

#[async_trait]
impl LockedUpload for PgLockedUpload {
    fn session(&self) -> &UploadSession {
        &self.session
    }

    async fn record_progress(
        &mut self,
        bytes_received: i64,
        declared_total: Option<i64>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE upload_sessions
            SET bytes_received = $2,
                size_bytes = COALESCE($3, size_bytes),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(self.session.id)
        .bind(bytes_received)
        .bind(declared_total)
        .execute(&mut *self.tx)
        .await?;

        self.session.bytes_received = bytes_received;
        if declared_total.is_some() {
            self.session.size_bytes = declared_total;
        }
        self.session.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_finalized(&mut self) -> Result<Option<Track>, AppError> {
        sqlx::query(
            "UPDATE upload_sessions SET finalized = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(self.session.id)
        .execute(&mut *self.tx)
        .await?;
        self.session.finalized = true;

        let sql = format!(
            r#"
            UPDATE tracks
            SET state = 'PENDING', updated_at = NOW()
            WHERE upload_session_id = $1 AND state = 'UPLOADING' AND deleted_at IS NULL
            RETURNING {}
            "#,
            TRACK_COLUMNS
        );
        let track = sqlx::query_as::<Postgres, Track>(&sql)
            .bind(self.session.id)
            .fetch_optional(&mut *self.tx)
            .await?;

        Ok(track)
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        self.tx.commit().await?;
        Ok(())
    }
}
