use async_trait::async_trait;
use onair_core::models::TrackAsset;
use onair_core::AppError;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::traits::AssetStore;

const ASSET_COLUMNS: &str =
    "id, track_id, asset_type, storage_key, size_bytes, mime_type, checksum, created_at, updated_at";

/// Repository for derived track files
#[derive(Clone)]
pub struct AssetRepository {
    pool: PgPool,
}

impl AssetRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AssetStore for AssetRepository {
    #[tracing::instrument(skip(self, asset), fields(track_id = %asset.track_id, asset_type = %asset.asset_type))]
    async fn upsert_asset(&self, asset: &TrackAsset) -> Result<TrackAsset, AppError> {
        let sql = format!(
            r#"
            INSERT INTO track_assets (
                id, track_id, asset_type, storage_key, size_bytes, mime_type, checksum
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (track_id, asset_type, storage_key) DO UPDATE
            SET size_bytes = EXCLUDED.size_bytes,
                mime_type = EXCLUDED.mime_type,
                checksum = EXCLUDED.checksum,
                updated_at = NOW()
            RETURNING {}
            "#,
            ASSET_COLUMNS
        );
        let stored = sqlx::query_as::<Postgres, TrackAsset>(&sql)
            .bind(asset.id)
            .bind(asset.track_id)
            .bind(asset.asset_type.to_string())
            .bind(&asset.storage_key)
            .bind(asset.size_bytes)
            .bind(&asset.mime_type)
            .bind(&asset.checksum)
            .fetch_one(&self.pool)
            .await?;
        Ok(stored)
    }

    async fn assets_for_track(&self, track_id: Uuid) -> Result<Vec<TrackAsset>, AppError> {
        let sql = format!(
            "SELECT {} FROM track_assets WHERE track_id = $1 ORDER BY created_at ASC",
            ASSET_COLUMNS
        );
        let assets = sqlx::query_as::<Postgres, TrackAsset>(&sql)
            .bind(track_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(assets)
    }
}
