use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// Channel an upload came in through.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadSource {
    #[default]
    Direct,
    AdminPanel,
    Api,
}

impl Display for UploadSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            UploadSource::Direct => write!(f, "DIRECT"),
            UploadSource::AdminPanel => write!(f, "ADMIN_PANEL"),
            UploadSource::Api => write!(f, "API"),
        }
    }
}

impl FromStr for UploadSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DIRECT" => Ok(UploadSource::Direct),
            "ADMIN_PANEL" => Ok(UploadSource::AdminPanel),
            "API" => Ok(UploadSource::Api),
            _ => Err(anyhow::anyhow!("Invalid upload source: {}", s)),
        }
    }
}

/// An in-progress chunked upload.
///
/// `bytes_received` is the watermark: the number of contiguous bytes present in the
/// temp file. It only moves forward, and only while `finalized` is false.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: Uuid,
    pub studio_id: Uuid,
    pub original_filename: String,
    /// Declared total size, known once the client has sent a Content-Range.
    pub size_bytes: Option<i64>,
    pub mime_type: String,
    pub source: UploadSource,
    /// Temp file key relative to the storage root (`{slug}/incoming/{id}.part`).
    pub temp_rel_path: Option<String>,
    pub bytes_received: i64,
    #[serde(skip_serializing)]
    pub upload_token: String,
    pub finalized: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

crate::impl_soft_deletable!(UploadSession);

impl UploadSession {
    /// Whether the watermark has reached the declared total.
    pub fn is_complete(&self) -> bool {
        matches!(self.size_bytes, Some(total) if total == self.bytes_received)
    }
}

/// Fields supplied when an upload session is opened.
#[derive(Debug, Clone)]
pub struct NewUploadSession {
    pub id: Uuid,
    pub studio_id: Uuid,
    pub original_filename: String,
    pub size_bytes: Option<i64>,
    pub mime_type: String,
    pub source: UploadSource,
    pub temp_rel_path: String,
    pub upload_token: String,
}

impl NewUploadSession {
    pub fn into_session(self, now: DateTime<Utc>) -> UploadSession {
        UploadSession {
            id: self.id,
            studio_id: self.studio_id,
            original_filename: self.original_filename,
            size_bytes: self.size_bytes,
            mime_type: self.mime_type,
            source: self.source,
            temp_rel_path: Some(self.temp_rel_path),
            bytes_received: 0,
            upload_token: self.upload_token,
            finalized: false,
            error_message: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for UploadSession {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let source: String = row.try_get("source")?;
        Ok(UploadSession {
            id: row.try_get("id")?,
            studio_id: row.try_get("studio_id")?,
            original_filename: row.try_get("original_filename")?,
            size_bytes: row.try_get("size_bytes")?,
            mime_type: row.try_get("mime_type")?,
            source: source
                .parse()
                .map_err(|e: anyhow::Error| sqlx::Error::Decode(e.into()))?,
            temp_rel_path: row.try_get("temp_rel_path")?,
            bytes_received: row.try_get("bytes_received")?,
            upload_token: row.try_get("upload_token")?,
            finalized: row.try_get("finalized")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}
