use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetType {
    RawOriginal,
    NormalizedMp3,
    WaveformJson,
    CoverArt,
    AltEncoding,
}

impl Display for AssetType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            AssetType::RawOriginal => write!(f, "RAW_ORIGINAL"),
            AssetType::NormalizedMp3 => write!(f, "NORMALIZED_MP3"),
            AssetType::WaveformJson => write!(f, "WAVEFORM_JSON"),
            AssetType::CoverArt => write!(f, "COVER_ART"),
            AssetType::AltEncoding => write!(f, "ALT_ENCODING"),
        }
    }
}

impl FromStr for AssetType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RAW_ORIGINAL" => Ok(AssetType::RawOriginal),
            "NORMALIZED_MP3" => Ok(AssetType::NormalizedMp3),
            "WAVEFORM_JSON" => Ok(AssetType::WaveformJson),
            "COVER_ART" => Ok(AssetType::CoverArt),
            "ALT_ENCODING" => Ok(AssetType::AltEncoding),
            _ => Err(anyhow::anyhow!("Invalid asset type: {}", s)),
        }
    }
}

/// A derived file belonging to a track. Unique per (track, type, storage key).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TrackAsset {
    pub id: Uuid,
    pub track_id: Uuid,
    pub asset_type: AssetType,
    pub storage_key: String,
    pub size_bytes: Option<i64>,
    pub mime_type: Option<String>,
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackAsset {
    pub fn new(track_id: Uuid, asset_type: AssetType, storage_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            track_id,
            asset_type,
            storage_key: storage_key.into(),
            size_bytes: None,
            mime_type: None,
            checksum: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn same_key(&self, other: &TrackAsset) -> bool {
        self.track_id == other.track_id
            && self.asset_type == other.asset_type
            && self.storage_key == other.storage_key
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for TrackAsset {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let asset_type: String = row.try_get("asset_type")?;
        Ok(TrackAsset {
            id: row.try_get("id")?,
            track_id: row.try_get("track_id")?,
            asset_type: asset_type
                .parse()
                .map_err(|e: anyhow::Error| sqlx::Error::Decode(e.into()))?,
            storage_key: row.try_get("storage_key")?,
            size_bytes: row.try_get("size_bytes")?,
            mime_type: row.try_get("mime_type")?,
            checksum: row.try_get("checksum")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
