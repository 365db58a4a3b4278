use async_trait::async_trait;
use onair_core::models::Studio;
use onair_core::AppError;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::traits::StudioStore;

const STUDIO_COLUMNS: &str = "id, slug, display_name, is_active, default_bitrate_kbps, \
     loudness_target_lufs, created_at, updated_at, deleted_at";

/// Repository for studios (tenants)
#[derive(Clone)]
pub struct StudioRepository {
    pool: PgPool,
}

impl StudioRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StudioStore for StudioRepository {
    #[tracing::instrument(skip(self, studio), fields(slug = %studio.slug))]
    async fn create_studio(&self, studio: &Studio) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO studios (
                id, slug, display_name, is_active, default_bitrate_kbps,
                loudness_target_lufs, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(studio.id)
        .bind(&studio.slug)
        .bind(&studio.display_name)
        .bind(studio.is_active)
        .bind(studio.default_bitrate_kbps)
        .bind(studio.loudness_target_lufs)
        .bind(studio.created_at)
        .bind(studio.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_studio(&self, id: Uuid) -> Result<Option<Studio>, AppError> {
        let sql = format!(
            "SELECT {} FROM studios WHERE id = $1 AND deleted_at IS NULL",
            STUDIO_COLUMNS
        );
        let studio = sqlx::query_as::<Postgres, Studio>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(studio)
    }

    async fn get_studio_by_slug(&self, slug: &str) -> Result<Option<Studio>, AppError> {
        let sql = format!(
            "SELECT {} FROM studios WHERE slug = $1 AND deleted_at IS NULL",
            STUDIO_COLUMNS
        );
        let studio = sqlx::query_as::<Postgres, Studio>(&sql)
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        Ok(studio)
    }
}
