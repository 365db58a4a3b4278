//! Liveness and readiness probes.

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use std::sync::Arc;
use std::time::Duration;

pub(super) fn health_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health/live", get(liveness_check))
        .route("/health/ready", get(readiness_check))
}

/// Liveness probe - process is running.
async fn liveness_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "alive" })),
    )
}

/// Readiness probe - database and studios root.
async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    const TIMEOUT: Duration = Duration::from_secs(5);

    let mut response = serde_json::json!({
        "status": "ready",
        "database": "not_configured",
        "storage": "unknown"
    });
    let mut overall_ready = true;

    if let Some(pool) = &state.pool {
        match tokio::time::timeout(TIMEOUT, sqlx::query("SELECT 1").execute(pool)).await {
            Ok(Ok(_)) => response["database"] = serde_json::json!("ready"),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Database readiness check failed");
                response["database"] = serde_json::json!(format!("not_ready: {}", e));
                overall_ready = false;
            }
            Err(_) => {
                tracing::error!("Database readiness check timed out");
                response["database"] = serde_json::json!("timeout");
                overall_ready = false;
            }
        }
    }

    let root = state.ingest.root().path().to_path_buf();
    match tokio::fs::metadata(&root).await {
        Ok(meta) if meta.is_dir() => response["storage"] = serde_json::json!("ready"),
        Ok(_) | Err(_) => {
            tracing::error!(root = %root.display(), "Studios root is not available");
            response["storage"] = serde_json::json!("not_ready");
            overall_ready = false;
        }
    }

    let status_code = if overall_ready {
        StatusCode::OK
    } else {
        response["status"] = serde_json::json!("not_ready");
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(response))
}
