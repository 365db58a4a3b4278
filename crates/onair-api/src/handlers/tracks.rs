//! Track lifecycle handlers: status, job ledger, delete, archive and streaming.

use crate::error::{ErrorResponse, HttpAppError};
use crate::state::AppState;
use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use onair_core::models::{Track, TrackState, TranscodeJob};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use utoipa::ToSchema;
use uuid::Uuid;

/// Track as exposed to clients
#[derive(Debug, Serialize, ToSchema)]
pub struct TrackResponse {
    pub id: Uuid,
    pub studio_id: Uuid,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub year: Option<i32>,
    pub genre: String,
    pub state: TrackState,
    pub error_message: Option<String>,
    #[schema(value_type = Option<f64>)]
    pub duration_seconds: Option<Decimal>,
    pub bitrate_kbps: Option<i32>,
    #[schema(value_type = Option<f64>)]
    pub loudness_lufs: Option<Decimal>,
    #[schema(value_type = Option<f64>)]
    pub peak_dbfs: Option<Decimal>,
    pub is_duplicate_of: Option<Uuid>,
    pub upload_session_id: Option<Uuid>,
    /// Published file, relative to the studios root
    pub processed_rel_path: Option<String>,
    pub is_active: bool,
    pub is_explicit: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Track> for TrackResponse {
    fn from(track: Track) -> Self {
        Self {
            id: track.id,
            studio_id: track.studio_id,
            title: track.title,
            artist: track.artist,
            album: track.album,
            year: track.year,
            genre: track.genre,
            state: track.state,
            error_message: track.error_message,
            duration_seconds: track.duration_seconds,
            bitrate_kbps: track.bitrate_kbps,
            loudness_lufs: track.loudness_lufs,
            peak_dbfs: track.peak_dbfs,
            is_duplicate_of: track.is_duplicate_of,
            upload_session_id: track.upload_session_id,
            processed_rel_path: track.processed_rel_path,
            is_active: track.is_active,
            is_explicit: track.is_explicit,
            created_at: track.created_at,
            updated_at: track.updated_at,
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/tracks/{id}",
    tag = "tracks",
    params(("id" = Uuid, Path, description = "Track ID")),
    responses(
        (status = 200, description = "Track", body = TrackResponse),
        (status = 404, description = "Track not found", body = ErrorResponse)
    )
)]
pub async fn get_track(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpAppError> {
    let track = state.ingest.get_track(id).await?;
    Ok(Json(TrackResponse::from(track)))
}

#[utoipa::path(
    get,
    path = "/api/tracks/{id}/jobs",
    tag = "tracks",
    params(("id" = Uuid, Path, description = "Track ID")),
    responses(
        (status = 200, description = "Pipeline attempts, oldest first", body = Vec<TranscodeJob>),
        (status = 404, description = "Track not found", body = ErrorResponse)
    )
)]
pub async fn list_track_jobs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpAppError> {
    let jobs = state.ingest.jobs_for_track(id).await?;
    Ok(Json(jobs))
}

#[utoipa::path(
    delete,
    path = "/api/tracks/{id}",
    tag = "tracks",
    params(("id" = Uuid, Path, description = "Track ID")),
    responses(
        (status = 204, description = "Track deleted, or already gone"),
        (status = 409, description = "Track is being processed", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state))]
pub async fn delete_track(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpAppError> {
    state.ingest.delete_track(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/tracks/{id}/archive",
    tag = "tracks",
    params(("id" = Uuid, Path, description = "Track ID")),
    responses(
        (status = 200, description = "Track archived", body = TrackResponse),
        (status = 404, description = "Track not found", body = ErrorResponse),
        (status = 409, description = "Track is still uploading", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state))]
pub async fn archive_track(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpAppError> {
    let track = state.ingest.archive_track(id).await?;
    Ok(Json(TrackResponse::from(track)))
}

#[utoipa::path(
    get,
    path = "/api/studios/{slug}/tracks/{id}/stream",
    tag = "tracks",
    params(
        ("slug" = String, Path, description = "Studio slug"),
        ("id" = Uuid, Path, description = "Track ID")
    ),
    responses(
        (status = 200, description = "Published audio", content_type = "audio/mpeg"),
        (status = 206, description = "Requested byte range", content_type = "audio/mpeg"),
        (status = 404, description = "Studio, track or file not found", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state, request))]
pub async fn stream_track(
    State(state): State<Arc<AppState>>,
    Path((slug, id)): Path<(String, Uuid)>,
    request: Request,
) -> Result<Response, HttpAppError> {
    let target = state.ingest.stream_target(&slug, id).await?;

    // ServeFile answers Range requests with 206 and sets Accept-Ranges.
    let mut response = match ServeFile::new(&target.path).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    };

    if response.status().is_success() {
        let disposition = format!("inline; filename=\"{}\"", header_safe(&target.title));
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            response
                .headers_mut()
                .insert(header::CONTENT_DISPOSITION, value);
        }
    }

    Ok(response)
}

/// Visible ASCII only, without quotes or backslashes.
fn header_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() || c == ' ') && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_safe_replaces_quotes_and_non_ascii() {
        assert_eq!(header_safe("Night \"Drive\".mp3"), "Night _Drive_.mp3");
        assert_eq!(header_safe("Café"), "Caf_");
    }
}
