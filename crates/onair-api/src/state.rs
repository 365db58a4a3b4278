//! Application state shared by every handler.

use std::sync::Arc;

use onair_core::Config;
use sqlx::PgPool;

use crate::services::IngestService;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub ingest: Arc<IngestService>,
    /// Absent when running on the in-memory store.
    pub pool: Option<PgPool>,
}
