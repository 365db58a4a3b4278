//! Route configuration and setup

mod health;

use crate::api_doc::ApiDoc;
use crate::constants::{API_PREFIX, UPLOAD_TOKEN_HEADER};
use crate::handlers;
use crate::state::AppState;
use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post, put},
    Json, Router,
};
use onair_core::Config;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

/// Headroom above the upload ceiling for a single request body.
const BODY_LIMIT_SLACK_BYTES: u64 = 64 * 1024;

/// Setup all application routes
pub fn setup_routes(config: &Config, state: Arc<AppState>) -> Result<Router<()>, anyhow::Error> {
    let cors = setup_cors(config)?;

    let api = Router::new()
        .route("/studios", post(handlers::studios::create_studio))
        .route("/uploads", post(handlers::uploads::request_upload))
        .route("/uploads/{id}", get(handlers::uploads::get_upload))
        .route("/uploads/{id}/chunk", put(handlers::uploads::append_chunk))
        .route(
            "/uploads/{id}/finalize",
            post(handlers::uploads::finalize_upload),
        )
        .route(
            "/tracks/{id}",
            get(handlers::tracks::get_track).delete(handlers::tracks::delete_track),
        )
        .route("/tracks/{id}/jobs", get(handlers::tracks::list_track_jobs))
        .route(
            "/tracks/{id}/archive",
            post(handlers::tracks::archive_track),
        )
        .route(
            "/studios/{slug}/tracks/{id}/stream",
            get(handlers::tracks::stream_track),
        )
        .route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }));

    let http_concurrency_limit = std::env::var("HTTP_CONCURRENCY_LIMIT")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(10_000)
        .max(1);
    tracing::info!(
        http_concurrency_limit = http_concurrency_limit,
        "HTTP concurrency limit layer enabled"
    );

    let body_limit = usize::try_from(config.max_upload_size_bytes() + BODY_LIMIT_SLACK_BYTES)
        .unwrap_or(usize::MAX);

    let app = Router::new()
        .nest(API_PREFIX, api)
        .merge(health::health_routes())
        .layer(ConcurrencyLimitLayer::new(http_concurrency_limit))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    Ok(app)
}

/// Setup CORS configuration
fn setup_cors(config: &Config) -> Result<CorsLayer, anyhow::Error> {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];

    let cors = if config.cors_origins().iter().any(|o| o == "*") {
        tracing::warn!("CORS configured to allow all origins - not recommended for production");
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any)
    } else {
        let origins = config
            .cors_origins()
            .iter()
            .map(|o| o.parse::<HeaderValue>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Invalid CORS origin: {}", e))?;

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers([
                header::CONTENT_TYPE,
                header::CONTENT_RANGE,
                header::RANGE,
                HeaderName::from_static(UPLOAD_TOKEN_HEADER),
            ])
    };
    Ok(cors)
}
