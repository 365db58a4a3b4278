use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Terminal rows are never updated again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            JobStatus::Queued => write!(f, "QUEUED"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Success => write!(f, "SUCCESS"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELED" => Ok(JobStatus::Canceled),
            _ => Err(anyhow::anyhow!("Invalid job status: {}", s)),
        }
    }
}

/// One row per dispatch attempt of the pipeline for a track.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TranscodeJob {
    pub id: Uuid,
    pub studio_id: Uuid,
    pub track_id: Uuid,
    pub upload_session_id: Option<Uuid>,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub attempt: i32,
    pub error_message: Option<String>,
    pub input_storage_key: Option<String>,
    pub output_storage_key: Option<String>,
    #[schema(value_type = Option<f64>)]
    pub loudness_lufs: Option<Decimal>,
    #[schema(value_type = Option<f64>)]
    pub peak_dbfs: Option<Decimal>,
    pub target_bitrate_kbps: Option<i32>,
    /// A QUEUED row is not claimed before this instant.
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TranscodeJob {
    /// A ledger row for an attempt that has been dispatched but not picked up.
    pub fn queued(
        studio_id: Uuid,
        track_id: Uuid,
        upload_session_id: Option<Uuid>,
        attempt: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            studio_id,
            track_id,
            upload_session_id,
            status: JobStatus::Queued,
            started_at: None,
            finished_at: None,
            worker_id: None,
            attempt,
            error_message: None,
            input_storage_key: None,
            output_storage_key: None,
            loudness_lufs: None,
            peak_dbfs: None,
            target_bitrate_kbps: None,
            scheduled_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Hold a QUEUED row back until `at`.
    pub fn delayed_until(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = at;
        self
    }

    /// Whether a worker may claim this row at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.scheduled_at <= now
    }

    /// A ledger row for an attempt that has been picked up by a worker.
    pub fn running(
        studio_id: Uuid,
        track_id: Uuid,
        upload_session_id: Option<Uuid>,
        attempt: i32,
        worker_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            studio_id,
            track_id,
            upload_session_id,
            status: JobStatus::Running,
            started_at: Some(now),
            finished_at: None,
            worker_id: Some(worker_id.into()),
            attempt,
            error_message: None,
            input_storage_key: None,
            output_storage_key: None,
            loudness_lufs: None,
            peak_dbfs: None,
            target_bitrate_kbps: None,
            scheduled_at: now,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Terminal outcome written back to a ledger row.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub input_storage_key: Option<String>,
    pub output_storage_key: Option<String>,
    pub loudness_lufs: Option<Decimal>,
    pub peak_dbfs: Option<Decimal>,
    pub target_bitrate_kbps: Option<i32>,
}

impl JobOutcome {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            error_message: None,
            input_storage_key: None,
            output_storage_key: None,
            loudness_lufs: None,
            peak_dbfs: None,
            target_bitrate_kbps: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(crate::truncate_message(
            &message.into(),
            crate::MAX_ERROR_MESSAGE_CHARS,
        ));
        self
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for TranscodeJob {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let status: String = row.try_get("status")?;
        Ok(TranscodeJob {
            id: row.try_get("id")?,
            studio_id: row.try_get("studio_id")?,
            track_id: row.try_get("track_id")?,
            upload_session_id: row.try_get("upload_session_id")?,
            status: status
                .parse()
                .map_err(|e: anyhow::Error| sqlx::Error::Decode(e.into()))?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            worker_id: row.try_get("worker_id")?,
            attempt: row.try_get("attempt")?,
            error_message: row.try_get("error_message")?,
            input_storage_key: row.try_get("input_storage_key")?,
            output_storage_key: row.try_get("output_storage_key")?,
            loudness_lufs: row.try_get("loudness_lufs")?,
            peak_dbfs: row.try_get("peak_dbfs")?,
            target_bitrate_kbps: row.try_get("target_bitrate_kbps")?,
            scheduled_at: row.try_get("scheduled_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
