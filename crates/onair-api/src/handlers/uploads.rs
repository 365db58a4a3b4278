//! Chunked upload handlers: request-upload, chunk submission, finalize and progress.

use crate::constants::UPLOAD_TOKEN_HEADER;
use crate::content_range::ContentRange;
use crate::error::{ErrorResponse, HttpAppError, ValidatedJson};
use crate::services::{FinalizeResult, UploadProgress, UploadRequest, UploadTicket};
use crate::state::AppState;
use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use futures::TryStreamExt;
use onair_core::models::UploadSource;
use onair_core::AppError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::io::StreamReader;
use utoipa::ToSchema;
use uuid::Uuid;

/// Request to open an upload
#[derive(Debug, Deserialize, ToSchema)]
pub struct RequestUploadBody {
    /// Studio slug
    pub studio: String,
    pub filename: String,
    /// Total file size in bytes, if known up front
    #[serde(default)]
    pub size_bytes: Option<i64>,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Hex SHA-256 of the file, used for per-studio deduplication
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub source: UploadSource,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChunkAccepted {
    /// Contiguous bytes received so far
    pub received: i64,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct FinalizeBody {
    /// Hex SHA-256 the assembled file must match
    #[serde(default)]
    pub checksum: Option<String>,
}

fn upload_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(UPLOAD_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
}

fn content_range(headers: &HeaderMap) -> Result<ContentRange, AppError> {
    headers
        .get(header::CONTENT_RANGE)
        .ok_or_else(|| AppError::BadRequest("Content-Range header is required".to_string()))?
        .to_str()
        .map_err(|_| AppError::BadRequest("Content-Range header is not ASCII".to_string()))?
        .parse()
}

#[utoipa::path(
    post,
    path = "/api/uploads",
    tag = "uploads",
    request_body = RequestUploadBody,
    responses(
        (status = 201, description = "Upload opened", body = UploadTicket),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 404, description = "Studio not found", body = ErrorResponse),
        (status = 413, description = "Declared size too large", body = ErrorResponse)
    )
)]
pub async fn request_upload(
    State(state): State<Arc<AppState>>,
    ValidatedJson(body): ValidatedJson<RequestUploadBody>,
) -> Result<impl IntoResponse, HttpAppError> {
    let ticket = state
        .ingest
        .request_upload(UploadRequest {
            studio: body.studio,
            filename: body.filename,
            size_bytes: body.size_bytes,
            mime_type: body.mime_type,
            checksum: body.checksum,
            source: body.source,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(ticket)))
}

#[utoipa::path(
    put,
    path = "/api/uploads/{id}/chunk",
    tag = "uploads",
    params(
        ("id" = Uuid, Path, description = "Upload ID"),
        ("X-Upload-Token" = String, Header, description = "Token returned by request-upload"),
        ("Content-Range" = String, Header, description = "bytes <start>-<end>/<total>")
    ),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Chunk appended", body = ChunkAccepted),
        (status = 400, description = "Malformed Content-Range", body = ErrorResponse),
        (status = 403, description = "Missing or wrong upload token", body = ErrorResponse),
        (status = 404, description = "Upload not found", body = ErrorResponse),
        (status = 409, description = "Upload already finalized", body = ErrorResponse),
        (status = 416, description = "Range does not start at the watermark", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state, headers, body))]
pub async fn append_chunk(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, HttpAppError> {
    let range = content_range(&headers)?;

    let reader = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
    tokio::pin!(reader);

    let received = state
        .ingest
        .append_chunk(id, upload_token(&headers), range, &mut reader)
        .await?;

    Ok(Json(ChunkAccepted { received }))
}

#[utoipa::path(
    post,
    path = "/api/uploads/{id}/finalize",
    tag = "uploads",
    params(
        ("id" = Uuid, Path, description = "Upload ID"),
        ("X-Upload-Token" = String, Header, description = "Token returned by request-upload")
    ),
    request_body(content = FinalizeBody, content_type = "application/json"),
    responses(
        (status = 200, description = "Upload finalized", body = FinalizeResult),
        (status = 403, description = "Missing or wrong upload token", body = ErrorResponse),
        (status = 404, description = "Upload not found", body = ErrorResponse),
        (status = 409, description = "Upload incomplete or checksum mismatch", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state, headers, body))]
pub async fn finalize_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, HttpAppError> {
    // The body is optional; an empty one means no checksum.
    let body: FinalizeBody = if body.iter().all(u8::is_ascii_whitespace) {
        FinalizeBody::default()
    } else {
        serde_json::from_slice(&body).map_err(AppError::from)?
    };

    let result = state
        .ingest
        .finalize(id, upload_token(&headers), body.checksum.as_deref())
        .await?;

    Ok(Json(result))
}

#[utoipa::path(
    get,
    path = "/api/uploads/{id}",
    tag = "uploads",
    params(("id" = Uuid, Path, description = "Upload ID")),
    responses(
        (status = 200, description = "Upload progress", body = UploadProgress),
        (status = 404, description = "Upload not found", body = ErrorResponse)
    )
)]
pub async fn get_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpAppError> {
    let progress = state.ingest.get_upload(id).await?;
    Ok(Json(progress))
}
