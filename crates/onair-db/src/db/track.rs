use async_trait::async_trait;
use onair_core::models::{Track, TrackState};
use onair_core::AppError;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use super::TRACK_COLUMNS;
use crate::traits::TrackStore;

/// Repository for tracks
#[derive(Clone)]
pub struct TrackRepository {
    pool: PgPool,
}

impl TrackRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Update the mutable columns, optionally guarded on the stored state.
    async fn update(&self, track: &Track, expected: Option<TrackState>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE tracks
            SET title = $2,
                artist = $3,
                album = $4,
                year = $5,
                genre = $6,
                state = $7,
                error_message = $8,
                duration_seconds = $9,
                bitrate_kbps = $10,
                loudness_lufs = $11,
                peak_dbfs = $12,
                processed_rel_path = $13,
                is_duplicate_of = $14,
                is_active = $15,
                is_explicit = $16,
                updated_at = NOW()
            WHERE id = $1
                AND deleted_at IS NULL
                AND ($17::text IS NULL OR state = $17)
            "#,
        )
        .bind(track.id)
        .bind(&track.title)
        .bind(&track.artist)
        .bind(&track.album)
        .bind(track.year)
        .bind(&track.genre)
        .bind(track.state.to_string())
        .bind(&track.error_message)
        .bind(track.duration_seconds)
        .bind(track.bitrate_kbps)
        .bind(track.loudness_lufs)
        .bind(track.peak_dbfs)
        .bind(&track.processed_rel_path)
        .bind(track.is_duplicate_of)
        .bind(track.is_active)
        .bind(track.is_explicit)
        .bind(expected.map(|s| s.to_string()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TrackStore for TrackRepository {
    async fn get_track(&self, id: Uuid) -> Result<Option<Track>, AppError> {
        let sql = format!(
            "SELECT {} FROM tracks WHERE id = $1 AND deleted_at IS NULL",
            TRACK_COLUMNS
        );
        let track = sqlx::query_as::<Postgres, Track>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(track)
    }

    async fn track_for_upload(&self, upload_session_id: Uuid) -> Result<Option<Track>, AppError> {
        let sql = format!(
            r#"
            SELECT {} FROM tracks
            WHERE upload_session_id = $1 AND deleted_at IS NULL
            ORDER BY created_at ASC
            LIMIT 1
            "#,
            TRACK_COLUMNS
        );
        let track = sqlx::query_as::<Postgres, Track>(&sql)
            .bind(upload_session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(track)
    }

    #[tracing::instrument(skip(self, track), fields(track_id = %track.id, state = %track.state))]
    async fn save_track(&self, track: &Track) -> Result<(), AppError> {
        if self.update(track, None).await? == 0 {
            return Err(AppError::NotFound(format!("Track {} not found", track.id)));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, track), fields(track_id = %track.id, state = %track.state))]
    async fn save_track_if_state(
        &self,
        track: &Track,
        expected: TrackState,
    ) -> Result<bool, AppError> {
        Ok(self.update(track, Some(expected)).await? > 0)
    }

    async fn has_live_duplicates(&self, original_id: Uuid) -> Result<bool, AppError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM tracks WHERE is_duplicate_of = $1 AND deleted_at IS NULL)",
        )
        .bind(original_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    #[tracing::instrument(skip(self))]
    async fn soft_delete_track(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE tracks SET deleted_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
