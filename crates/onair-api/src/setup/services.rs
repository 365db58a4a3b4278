//! Repositories, storage root, pipeline worker pool and the ingest service.

use crate::services::IngestService;
use crate::state::AppState;
use anyhow::{Context, Result};
use onair_core::Config;
use onair_db::{
    AssetRepository, JobRepository, StudioRepository, TrackRepository, UploadRepository,
};
use onair_processing::{FfmpegTranscoder, Transcoder};
use onair_storage::StudioRoot;
use onair_worker::{
    ChannelJobQueue, JobQueue, PipelineStores, UploadPipeline, WorkerPool, WorkerPoolConfig,
};
use sqlx::PgPool;
use std::sync::Arc;

/// Wire the PostgreSQL repositories and the ffmpeg transcoder.
pub async fn initialize_services(
    config: &Config,
    pool: PgPool,
) -> Result<(Arc<AppState>, WorkerPool)> {
    let stores = PipelineStores {
        studios: Arc::new(StudioRepository::new(pool.clone())),
        uploads: Arc::new(UploadRepository::new(pool.clone())),
        tracks: Arc::new(TrackRepository::new(pool.clone())),
        ledger: Arc::new(JobRepository::new(pool.clone())),
        assets: Arc::new(AssetRepository::new(pool.clone())),
    };

    let transcoder = FfmpegTranscoder::new(
        config.ffmpeg_path().map(String::from),
        config.ffprobe_path().map(String::from),
    );
    match transcoder.resolve_toolchain() {
        Ok(toolchain) => tracing::info!(
            ffmpeg = %toolchain.ffmpeg.display(),
            ffprobe = %toolchain.ffprobe.display(),
            "Audio toolchain resolved"
        ),
        // Jobs fail with a configuration fault until this is fixed.
        Err(e) => tracing::error!(error = %e, "Audio toolchain not found"),
    }

    build_state(config, stores, Arc::new(transcoder), Some(pool))
}

/// Build the application state around the given stores and transcoder, and start the
/// pipeline worker pool claiming from the job ledger.
pub fn build_state(
    config: &Config,
    stores: PipelineStores,
    transcoder: Arc<dyn Transcoder>,
    pool: Option<PgPool>,
) -> Result<(Arc<AppState>, WorkerPool)> {
    let root = StudioRoot::new(config.studios_root(), config.default_target_bitrate_kbps())
        .context("Studios root is not usable")?;
    tracing::info!(
        root = %root.path().display(),
        default_bitrate_kbps = root.default_bitrate_kbps(),
        "Studios root ready"
    );

    let (queue, receiver) = ChannelJobQueue::channel(config.worker().queue_capacity);
    let queue: Arc<dyn JobQueue> = Arc::new(queue);

    let pipeline = Arc::new(UploadPipeline::new(stores.clone(), root.clone(), transcoder));
    let workers = WorkerPool::start(
        receiver,
        stores.ledger.clone(),
        pipeline,
        WorkerPoolConfig::from_settings(config.worker()),
    );

    let ingest = IngestService::new(
        stores,
        root,
        queue,
        config.max_upload_size_bytes(),
        config.chunk_read_size(),
    );

    let state = Arc::new(AppState {
        config: config.clone(),
        ingest: Arc::new(ingest),
        pool,
    });

    Ok((state, workers))
}
