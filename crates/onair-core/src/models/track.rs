use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::AppError;
use crate::truncate_message;
use crate::MAX_ERROR_MESSAGE_CHARS;

/// Lifecycle state of a track.
///
/// ```text
/// UPLOADING -> PENDING -> PROCESSING -> READY
///                 |           |  ^
///                 |           v  |
///                 +-------> FAILED
///
/// any state but UPLOADING -> ARCHIVED
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackState {
    Uploading,
    Pending,
    Processing,
    Ready,
    Failed,
    Archived,
}

impl TrackState {
    /// Whether moving from `self` to `next` is a legal transition.
    /// Staying in the same state is always allowed.
    pub fn can_transition_to(self, next: TrackState) -> bool {
        use TrackState::*;

        if self == next {
            return true;
        }
        match (self, next) {
            (Uploading, Pending) => true,
            (Pending, Processing) => true,
            // Integrity and configuration faults fail a track before it is claimed.
            (Pending, Failed) => true,
            (Processing, Ready) | (Processing, Failed) => true,
            (Failed, Processing) => true,
            // An upload still in flight is abandoned, never archived.
            (from, Archived) => from != Uploading,
            _ => false,
        }
    }
}

impl Display for TrackState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TrackState::Uploading => write!(f, "UPLOADING"),
            TrackState::Pending => write!(f, "PENDING"),
            TrackState::Processing => write!(f, "PROCESSING"),
            TrackState::Ready => write!(f, "READY"),
            TrackState::Failed => write!(f, "FAILED"),
            TrackState::Archived => write!(f, "ARCHIVED"),
        }
    }
}

impl FromStr for TrackState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPLOADING" => Ok(TrackState::Uploading),
            "PENDING" => Ok(TrackState::Pending),
            "PROCESSING" => Ok(TrackState::Processing),
            "READY" => Ok(TrackState::Ready),
            "FAILED" => Ok(TrackState::Failed),
            "ARCHIVED" => Ok(TrackState::Archived),
            _ => Err(anyhow::anyhow!("Invalid track state: {}", s)),
        }
    }
}

/// A logical media item owned by a studio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: Uuid,
    pub studio_id: Uuid,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub year: Option<i32>,
    pub genre: String,
    pub state: TrackState,
    pub error_message: Option<String>,
    pub duration_seconds: Option<Decimal>,
    pub bitrate_kbps: Option<i32>,
    pub loudness_lufs: Option<Decimal>,
    pub peak_dbfs: Option<Decimal>,
    /// Digest of the uploaded bytes, or a value derived from the upload id when the
    /// client supplied none. Unique per studio among non-duplicates.
    pub content_hash: String,
    pub is_duplicate_of: Option<Uuid>,
    pub upload_session_id: Option<Uuid>,
    /// Published file key relative to the storage root.
    pub processed_rel_path: Option<String>,
    pub is_active: bool,
    pub is_explicit: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

crate::impl_soft_deletable!(Track);

impl Track {
    /// A freshly requested track, waiting for its bytes.
    pub fn new_uploading(
        studio_id: Uuid,
        upload_session_id: Uuid,
        title: impl Into<String>,
        content_hash: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            studio_id,
            title: title.into(),
            artist: String::new(),
            album: String::new(),
            year: None,
            genre: String::new(),
            state: TrackState::Uploading,
            error_message: None,
            duration_seconds: None,
            bitrate_kbps: None,
            loudness_lufs: None,
            peak_dbfs: None,
            content_hash: content_hash.into(),
            is_duplicate_of: None,
            upload_session_id: Some(upload_session_id),
            processed_rel_path: None,
            is_active: true,
            is_explicit: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Move to `next`, rejecting illegal transitions with a conflict.
    pub fn transition_to(&mut self, next: TrackState) -> Result<(), AppError> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::Conflict(format!(
                "Track {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move to FAILED with a bounded error message.
    pub fn fail(&mut self, message: &str) -> Result<(), AppError> {
        self.transition_to(TrackState::Failed)?;
        self.error_message = Some(truncate_message(message, MAX_ERROR_MESSAGE_CHARS));
        Ok(())
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Track {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let state: String = row.try_get("state")?;
        Ok(Track {
            id: row.try_get("id")?,
            studio_id: row.try_get("studio_id")?,
            title: row.try_get("title")?,
            artist: row.try_get("artist")?,
            album: row.try_get("album")?,
            year: row.try_get("year")?,
            genre: row.try_get("genre")?,
            state: state
                .parse()
                .map_err(|e: anyhow::Error| sqlx::Error::Decode(e.into()))?,
            error_message: row.try_get("error_message")?,
            duration_seconds: row.try_get("duration_seconds")?,
            bitrate_kbps: row.try_get("bitrate_kbps")?,
            loudness_lufs: row.try_get("loudness_lufs")?,
            peak_dbfs: row.try_get("peak_dbfs")?,
            content_hash: row.try_get("content_hash")?,
            is_duplicate_of: row.try_get("is_duplicate_of")?,
            upload_session_id: row.try_get("upload_session_id")?,
            processed_rel_path: row.try_get("processed_rel_path")?,
            is_active: row.try_get("is_active")?,
            is_explicit: row.try_get("is_explicit")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}
