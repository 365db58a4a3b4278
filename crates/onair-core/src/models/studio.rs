use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tenant: an isolated owner of uploads, tracks and library storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Studio {
    pub id: Uuid,
    /// Directory name under the shared storage root.
    pub slug: String,
    pub display_name: String,
    pub is_active: bool,
    /// Overrides the global target bitrate when set.
    pub default_bitrate_kbps: Option<i32>,
    pub loudness_target_lufs: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

crate::impl_soft_deletable!(Studio);

impl Studio {
    pub fn new(slug: impl Into<String>, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            slug: slug.into(),
            display_name: display_name.into(),
            is_active: true,
            default_bitrate_kbps: None,
            loudness_target_lufs: Decimal::new(-1400, 2),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Target bitrate for this studio, falling back to the global default.
    pub fn target_bitrate_kbps(&self, global_default: u32) -> u32 {
        self.default_bitrate_kbps
            .filter(|kbps| *kbps > 0)
            .map(|kbps| kbps as u32)
            .unwrap_or(global_default)
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Studio {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Studio {
            id: row.try_get("id")?,
            slug: row.try_get("slug")?,
            display_name: row.try_get("display_name")?,
            is_active: row.try_get("is_active")?,
            default_bitrate_kbps: row.try_get("default_bitrate_kbps")?,
            loudness_target_lufs: row.try_get("loudness_target_lufs")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}
