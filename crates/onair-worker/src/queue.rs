//! Job queue: wake-ups, the worker pool, retries and the stale job reaper.
//!
//! The ledger is the queue. A job is a QUEUED row in `transcode_jobs`; workers claim
//! rows with [`JobLedger::claim_next_job`], so a row runs at most once per claim and
//! survives a crash of the process that wrote it. [`PipelineMessage`]s only wake the
//! pool early; without them it still polls every `poll_interval`.
//!
//! A failed attempt that earns a retry becomes a new QUEUED row held back by the retry
//! delay. RUNNING rows whose worker vanished are closed by the reaper once they pass
//! the soft time limit plus a grace period, and retried the same way.
//!
//! Shutdown: [`WorkerPool::shutdown`] stops claiming; it does not wait for in-flight
//! jobs, which keep running until they finish or hit the soft time limit.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use onair_core::models::TranscodeJob;
use onair_core::{JobError, WorkerSettings};
use onair_db::JobLedger;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::context::{JobContext, JobHandler};
use crate::retry::RetryPolicy;

/// Notice that a QUEUED ledger row was written for a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineMessage {
    pub track_id: Uuid,
    pub job_id: Uuid,
}

impl PipelineMessage {
    pub fn new(track_id: Uuid, job_id: Uuid) -> Self {
        Self { track_id, job_id }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Wake the pool for a freshly queued row.
    async fn dispatch(&self, message: PipelineMessage) -> anyhow::Result<()>;
}

/// [`JobQueue`] over a bounded in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelJobQueue {
    tx: mpsc::Sender<PipelineMessage>,
}

impl ChannelJobQueue {
    /// The queue and the receiving end to hand to [`WorkerPool::start`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PipelineMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobQueue for ChannelJobQueue {
    async fn dispatch(&self, message: PipelineMessage) -> anyhow::Result<()> {
        match self.tx.try_send(message) {
            Ok(()) => {}
            // A full channel means the pool has wake-ups pending already.
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => return Err(anyhow::anyhow!("Job queue is closed")),
        }
        tracing::debug!(
            track_id = %message.track_id,
            job_id = %message.job_id,
            "Pipeline job signalled"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// `{hostname}:{pid}`, completed with the slot number per job.
    pub identity: String,
    pub poll_interval: Duration,
    /// Zero disables the reaper.
    pub stale_job_reap_interval: Duration,
    pub stale_job_grace_period: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from_settings(&WorkerSettings::default())
    }
}

impl WorkerPoolConfig {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency.max(1),
            retry: RetryPolicy::from_settings(settings),
            identity: process_identity(),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            stale_job_reap_interval: Duration::from_secs(settings.stale_job_reap_interval_secs),
            stale_job_grace_period: Duration::from_secs(settings.stale_job_grace_period_secs),
        }
    }
}

fn process_identity() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

/// Ledger identity of a worker slot in this process.
pub fn worker_identity(slot: usize) -> String {
    format!("{}:{}", process_identity(), slot)
}

/// Concurrency permits that also hand out a stable slot number.
#[derive(Clone)]
struct Slots {
    semaphore: Arc<Semaphore>,
    free: Arc<Mutex<Vec<usize>>>,
}

struct SlotGuard {
    slot: usize,
    free: Arc<Mutex<Vec<usize>>>,
    _permit: OwnedSemaphorePermit,
}

impl Slots {
    fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            free: Arc::new(Mutex::new((0..size).rev().collect())),
        }
    }

    fn try_acquire(&self) -> Option<SlotGuard> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        let slot = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or(0);
        Some(SlotGuard {
            slot,
            free: self.free.clone(),
            _permit: permit,
        })
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Ok(mut free) = self.free.lock() {
            free.push(self.slot);
        }
    }
}

pub struct WorkerPool {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawn the claim loop and, unless disabled, the stale job reaper.
    pub fn start(
        wakeups: mpsc::Receiver<PipelineMessage>,
        ledger: Arc<dyn JobLedger>,
        handler: Arc<dyn JobHandler>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(Self::worker_pool(
            wakeups,
            ledger,
            handler,
            config,
            shutdown_rx,
        ));
        Self {
            shutdown_tx,
            handle,
        }
    }

    async fn worker_pool(
        mut wakeups: mpsc::Receiver<PipelineMessage>,
        ledger: Arc<dyn JobLedger>,
        handler: Arc<dyn JobHandler>,
        config: WorkerPoolConfig,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        tracing::info!(
            max_concurrency = config.max_concurrency,
            max_retries = config.retry.max_retries,
            retry_delay_secs = config.retry.delay.as_secs(),
            soft_time_limit_secs = config.retry.soft_time_limit.as_secs(),
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            "Pipeline worker pool started"
        );

        let (reaper_shutdown_tx, reaper_shutdown_rx) = mpsc::channel::<()>(1);
        if !config.stale_job_reap_interval.is_zero() {
            tokio::spawn(Self::reaper(
                ledger.clone(),
                handler.clone(),
                config.clone(),
                reaper_shutdown_rx,
            ));
        }

        let slots = Slots::new(config.max_concurrency.max(1));
        let finished = Arc::new(Notify::new());
        let mut poll = tokio::time::interval(config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut wakeups_open = true;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Pipeline worker pool shutting down");
                    break;
                }
                message = wakeups.recv(), if wakeups_open => match message {
                    Some(message) => tracing::trace!(
                        track_id = %message.track_id,
                        job_id = %message.job_id,
                        "Woken for a queued job"
                    ),
                    None => {
                        tracing::info!("Job queue closed, polling only");
                        wakeups_open = false;
                        continue;
                    }
                },
                _ = finished.notified() => {}
                _ = poll.tick() => {}
            }

            Self::claim_available(&slots, &ledger, &handler, &config, &finished).await;
        }

        let _ = reaper_shutdown_tx.send(()).await;
        tracing::info!("Pipeline worker pool stopped");
    }

    /// Claim due rows until the ledger or the free slots run out.
    async fn claim_available(
        slots: &Slots,
        ledger: &Arc<dyn JobLedger>,
        handler: &Arc<dyn JobHandler>,
        config: &WorkerPoolConfig,
        finished: &Arc<Notify>,
    ) {
        loop {
            let Some(guard) = slots.try_acquire() else {
                tracing::trace!("No worker slot free, skipping claim");
                return;
            };

            let worker_id = format!("{}:{}", config.identity, guard.slot);
            let row = match ledger.claim_next_job(&worker_id).await {
                Ok(Some(row)) => row,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim job from the ledger");
                    return;
                }
            };

            let ledger = ledger.clone();
            let handler = handler.clone();
            let finished = finished.clone();
            let retry = config.retry;
            tokio::spawn(async move {
                Self::process_claimed(row, worker_id, handler, ledger, retry).await;
                drop(guard);
                finished.notify_one();
            });
        }
    }

    #[tracing::instrument(
        skip(row, handler, ledger, retry),
        fields(job_id = %row.id, track_id = %row.track_id, attempt = row.attempt)
    )]
    async fn process_claimed(
        row: TranscodeJob,
        worker_id: String,
        handler: Arc<dyn JobHandler>,
        ledger: Arc<dyn JobLedger>,
        retry: RetryPolicy,
    ) {
        let job = JobContext::claimed(&row, worker_id);
        let result = tokio::time::timeout(retry.soft_time_limit, handler.handle(&job)).await;

        let error = match result {
            Ok(Ok(())) => {
                tracing::info!(track_id = %job.track_id, "Pipeline job completed");
                return;
            }
            Ok(Err(e)) => e,
            Err(_) => {
                let e = retry.timeout_error();
                tracing::error!(
                    track_id = %job.track_id,
                    soft_time_limit_secs = retry.soft_time_limit.as_secs(),
                    "Pipeline job timed out"
                );
                handler.on_timeout(&job, &e).await;
                e
            }
        };

        Self::schedule_retry(ledger.as_ref(), &row, &error, &retry).await;
    }

    /// Queue the next attempt after `row` failed with `error`, if the policy allows.
    async fn schedule_retry(
        ledger: &dyn JobLedger,
        row: &TranscodeJob,
        error: &JobError,
        retry: &RetryPolicy,
    ) {
        let attempt = u32::try_from(row.attempt).unwrap_or(u32::MAX);
        let will_retry = retry.should_retry(attempt, error);
        tracing::error!(
            track_id = %row.track_id,
            attempt = row.attempt,
            max_attempts = retry.max_attempts(),
            kind = %error.kind(),
            error = %error,
            will_retry = will_retry,
            "Pipeline job failed"
        );

        if !will_retry {
            if error.is_retryable() {
                tracing::error!(track_id = %row.track_id, "Pipeline job failed after max retries");
            }
            return;
        }

        let next = TranscodeJob::queued(
            row.studio_id,
            row.track_id,
            row.upload_session_id,
            row.attempt.saturating_add(1),
        );
        let delay = chrono::Duration::from_std(retry.delay).unwrap_or_else(|_| chrono::Duration::zero());
        let run_at = next.created_at + delay;
        let next = next.delayed_until(run_at);

        tracing::info!(
            track_id = %row.track_id,
            attempt = next.attempt,
            job_id = %next.id,
            delay_secs = retry.delay.as_secs(),
            "Scheduling pipeline retry"
        );
        if let Err(e) = ledger.insert_job(&next).await {
            tracing::error!(track_id = %row.track_id, error = %e, "Failed to queue retry");
        }
    }

    async fn reaper(
        ledger: Arc<dyn JobLedger>,
        handler: Arc<dyn JobHandler>,
        config: WorkerPoolConfig,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(config.stale_job_reap_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    Self::reap_stale(ledger.as_ref(), handler.as_ref(), &config).await;
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Close RUNNING rows past the soft time limit plus grace and retry their tracks.
    async fn reap_stale(ledger: &dyn JobLedger, handler: &dyn JobHandler, config: &WorkerPoolConfig) {
        let Ok(age) =
            chrono::Duration::from_std(config.retry.soft_time_limit + config.stale_job_grace_period)
        else {
            return;
        };
        let reason = format!(
            "Worker stopped reporting within {}s of starting the job",
            (config.retry.soft_time_limit + config.stale_job_grace_period).as_secs()
        );

        let rows = match ledger.reap_stale_jobs(Utc::now() - age, &reason).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "Stale job reaper failed");
                return;
            }
        };

        for row in rows {
            tracing::warn!(
                job_id = %row.id,
                track_id = %row.track_id,
                worker_id = ?row.worker_id,
                "Reaped abandoned pipeline job"
            );
            let error = JobError::transient(anyhow::anyhow!(reason.clone()));
            let job = JobContext::claimed(&row, row.worker_id.clone().unwrap_or_default());
            handler.on_timeout(&job, &error).await;
            Self::schedule_retry(ledger, &row, &error, &config.retry).await;
        }
    }

    /// Signal the claim loop to stop and wait for it to exit.
    pub async fn shutdown(self) {
        tracing::info!("Initiating pipeline worker pool shutdown");
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Pipeline worker pool task panicked");
        }
    }
}
