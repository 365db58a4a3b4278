use async_trait::async_trait;
use chrono::{DateTime, Utc};
use onair_core::models::{JobOutcome, TranscodeJob};
use onair_core::AppError;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::traits::JobLedger;

const JOB_COLUMNS: &str = "id, studio_id, track_id, upload_session_id, status, started_at, \
     finished_at, worker_id, attempt, error_message, input_storage_key, output_storage_key, \
     loudness_lufs, peak_dbfs, target_bitrate_kbps, scheduled_at, created_at, updated_at";

/// Repository for the transcode job ledger
#[derive(Clone)]
pub struct JobRepository {
    pool: PgPool,
}

impl JobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobLedger for JobRepository {
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, track_id = %job.track_id, attempt = job.attempt))]
    async fn insert_job(&self, job: &TranscodeJob) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO transcode_jobs (
                id, studio_id, track_id, upload_session_id, status, started_at,
                worker_id, attempt, scheduled_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            "#,
        )
        .bind(job.id)
        .bind(job.studio_id)
        .bind(job.track_id)
        .bind(job.upload_session_id)
        .bind(job.status.to_string())
        .bind(job.started_at)
        .bind(&job.worker_id)
        .bind(job.attempt)
        .bind(job.scheduled_at)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn claim_next_job(&self, worker_id: &str) -> Result<Option<TranscodeJob>, AppError> {
        let mut tx = self.pool.begin().await?;

        let next: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM transcode_jobs
            WHERE status = 'QUEUED'
                AND scheduled_at <= NOW()
            ORDER BY scheduled_at ASC, created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = next else {
            tx.commit().await?;
            return Ok(None);
        };

        let sql = format!(
            r#"
            UPDATE transcode_jobs
            SET status = 'RUNNING',
                worker_id = $2,
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let job = sqlx::query_as::<Postgres, TranscodeJob>(&sql)
            .bind(id)
            .bind(worker_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(job_id = %job.id, track_id = %job.track_id, attempt = job.attempt, "Job claimed");
        Ok(Some(job))
    }

    #[tracing::instrument(skip(self, reason))]
    async fn reap_stale_jobs(
        &self,
        started_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<TranscodeJob>, AppError> {
        let sql = format!(
            r#"
            UPDATE transcode_jobs
            SET status = 'FAILED',
                error_message = $2,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE status = 'RUNNING' AND started_at < $1
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let jobs = sqlx::query_as::<Postgres, TranscodeJob>(&sql)
            .bind(started_before)
            .bind(reason)
            .fetch_all(&self.pool)
            .await?;

        if !jobs.is_empty() {
            tracing::warn!(count = jobs.len(), "Reaped stale running jobs");
        }
        Ok(jobs)
    }

    #[tracing::instrument(skip(self, outcome), fields(status = %outcome.status))]
    async fn finish_job(&self, id: Uuid, outcome: JobOutcome) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE transcode_jobs
            SET status = $2,
                error_message = $3,
                input_storage_key = COALESCE($4, input_storage_key),
                output_storage_key = COALESCE($5, output_storage_key),
                loudness_lufs = COALESCE($6, loudness_lufs),
                peak_dbfs = COALESCE($7, peak_dbfs),
                target_bitrate_kbps = COALESCE($8, target_bitrate_kbps),
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('QUEUED', 'RUNNING')
            "#,
        )
        .bind(id)
        .bind(outcome.status.to_string())
        .bind(&outcome.error_message)
        .bind(&outcome.input_storage_key)
        .bind(&outcome.output_storage_key)
        .bind(outcome.loudness_lufs)
        .bind(outcome.peak_dbfs)
        .bind(outcome.target_bitrate_kbps)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn jobs_for_track(&self, track_id: Uuid) -> Result<Vec<TranscodeJob>, AppError> {
        let sql = format!(
            "SELECT {} FROM transcode_jobs WHERE track_id = $1 ORDER BY created_at ASC, attempt ASC",
            JOB_COLUMNS
        );
        let jobs = sqlx::query_as::<Postgres, TranscodeJob>(&sql)
            .bind(track_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }
}
