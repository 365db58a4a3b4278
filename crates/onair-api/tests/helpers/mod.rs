//! Test helpers: build the router around the in-memory store and a scripted transcoder.
//!
//! Run from workspace root: `cargo test -p onair-api`.

use axum_test::TestServer;
use onair_api::constants;
use onair_api::setup::{routes, services};
use onair_core::models::{Studio, Track, TrackState};
use onair_core::{Config, IngestConfig};
use onair_db::{MemoryStore, TrackStore};
use onair_processing::testing::ScriptedTranscoder;
use onair_storage::StudioRoot;
use onair_worker::{ChannelJobQueue, PipelineStores, UploadPipeline, WorkerPool, WorkerPoolConfig};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

pub const STUDIO: &str = "wxyz";

/// API path prefix for tests (e.g. `/api`).
pub fn api_path(path: &str) -> String {
    format!("{}{}", constants::API_PREFIX, path)
}

/// Test application: server, store, and owned resources.
pub struct TestApp {
    pub server: TestServer,
    pub store: Arc<MemoryStore>,
    pub workers: Option<WorkerPool>,
    pub _temp_dir: TempDir,
    pub root: PathBuf,
}

/// Upload ticket fields the tests need.
pub struct Ticket {
    pub upload_id: Uuid,
    pub track_id: Uuid,
    pub token: String,
}

impl TestApp {
    pub fn client(&self) -> &TestServer {
        &self.server
    }

    pub async fn request_upload(&self, filename: &str, size_bytes: i64) -> Ticket {
        let response = self
            .server
            .post(&api_path("/uploads"))
            .json(&json!({
                "studio": STUDIO,
                "filename": filename,
                "size_bytes": size_bytes,
                "mime_type": "audio/mpeg"
            }))
            .await;
        assert_eq!(response.status_code(), 201, "{}", response.text());

        let body: Value = response.json();
        Ticket {
            upload_id: body["upload_id"].as_str().unwrap().parse().unwrap(),
            track_id: body["track_id"].as_str().unwrap().parse().unwrap(),
            token: body["upload_token"].as_str().unwrap().to_string(),
        }
    }

    pub async fn put_chunk(
        &self,
        ticket: &Ticket,
        range: &str,
        bytes: &'static [u8],
    ) -> axum_test::TestResponse {
        self.server
            .put(&api_path(&format!("/uploads/{}/chunk", ticket.upload_id)))
            .add_header(constants::UPLOAD_TOKEN_HEADER, ticket.token.clone())
            .add_header("Content-Range", range.to_string())
            .bytes(bytes.into())
            .await
    }

    pub async fn finalize(&self, ticket: &Ticket) -> axum_test::TestResponse {
        self.server
            .post(&api_path(&format!("/uploads/{}/finalize", ticket.upload_id)))
            .add_header(constants::UPLOAD_TOKEN_HEADER, ticket.token.clone())
            .await
    }

    /// Upload `bytes` in two chunks and finalize.
    pub async fn upload(&self, filename: &str, bytes: &'static [u8]) -> Ticket {
        let total = bytes.len();
        let mid = total / 2;
        let ticket = self.request_upload(filename, total as i64).await;

        let first = self
            .put_chunk(&ticket, &format!("bytes 0-{}/{}", mid - 1, total), &bytes[..mid])
            .await;
        assert_eq!(first.status_code(), 200, "{}", first.text());
        let second = self
            .put_chunk(
                &ticket,
                &format!("bytes {}-{}/{}", mid, total - 1, total),
                &bytes[mid..],
            )
            .await;
        assert_eq!(second.status_code(), 200, "{}", second.text());

        let finalized = self.finalize(&ticket).await;
        assert_eq!(finalized.status_code(), 200, "{}", finalized.text());
        ticket
    }

    pub async fn track(&self, id: Uuid) -> Track {
        self.store
            .get_track(id)
            .await
            .expect("Failed to load track")
            .expect("Track not found")
    }

    /// Poll until the track leaves the PENDING/PROCESSING states.
    pub async fn wait_for_settled(&self, id: Uuid) -> Track {
        for _ in 0..200 {
            let track = self.track(id).await;
            if !matches!(track.state, TrackState::Pending | TrackState::Processing) {
                return track;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("track {id} did not settle");
    }

    /// Stop the worker pool, as a crashed process would. Finalize still records jobs.
    pub async fn stop_workers(&mut self) {
        if let Some(workers) = self.workers.take() {
            workers.shutdown().await;
        }
    }

    /// Start a new pool over the same store and studios root, with no wake-ups from
    /// the API, as a restarted worker process would.
    pub fn restart_workers(&mut self, transcoder: ScriptedTranscoder) {
        let root = StudioRoot::new(self.root.clone(), 128).expect("Failed to open studios root");
        let pipeline = UploadPipeline::new(
            PipelineStores::shared(self.store.clone()),
            root,
            Arc::new(transcoder),
        );
        let (_queue, receiver) = ChannelJobQueue::channel(16);
        let config = WorkerPoolConfig {
            poll_interval: Duration::from_millis(10),
            ..WorkerPoolConfig::default()
        };
        self.workers = Some(WorkerPool::start(
            receiver,
            self.store.clone(),
            Arc::new(pipeline),
            config,
        ));
    }

    pub async fn shutdown(mut self) {
        if let Some(workers) = self.workers.take() {
            workers.shutdown().await;
        }
    }
}

/// Setup test app with the default scripted transcoder.
pub async fn setup_test_app() -> TestApp {
    setup_test_app_with(ScriptedTranscoder::new()).await
}

/// Setup test app with an isolated studios root and in-memory store.
pub async fn setup_test_app_with(transcoder: ScriptedTranscoder) -> TestApp {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let root = temp_dir.path().to_path_buf();

    let mut ingest = IngestConfig::new("postgres://unused", root.clone());
    ingest.max_upload_size_bytes = 1024;
    ingest.chunk_read_size = 4;
    ingest.worker.retry_delay_secs = 0;
    ingest.worker.soft_time_limit_secs = 5;
    ingest.worker.poll_interval_ms = 10;
    let config = Config(Box::new(ingest));

    let store = Arc::new(MemoryStore::new());
    store
        .insert_studio(Studio::new(STUDIO, "WXYZ Community Radio"))
        .expect("Failed to insert studio");

    let (state, workers) = services::build_state(
        &config,
        PipelineStores::shared(store.clone()),
        Arc::new(transcoder),
        None,
    )
    .expect("Failed to build state");

    let app = routes::setup_routes(&config, state).expect("Failed to build router");
    let server = TestServer::new(app).expect("Failed to create test server");

    TestApp {
        server,
        store,
        workers: Some(workers),
        _temp_dir: temp_dir,
        root,
    }
}
