//! OpenAPI documentation, served at `/api/openapi.json`.

use utoipa::OpenApi;

use crate::error;
use crate::handlers;
use crate::services;
use onair_core::models;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "onair ingest API",
        version = "0.1.0",
        description = "Resumable chunked audio uploads feeding a loudness-normalizing transcode pipeline"
    ),
    paths(
        handlers::studios::create_studio,
        handlers::uploads::request_upload,
        handlers::uploads::append_chunk,
        handlers::uploads::finalize_upload,
        handlers::uploads::get_upload,
        handlers::tracks::get_track,
        handlers::tracks::list_track_jobs,
        handlers::tracks::delete_track,
        handlers::tracks::archive_track,
        handlers::tracks::stream_track,
    ),
    components(schemas(
        error::ErrorResponse,
        handlers::studios::CreateStudioBody,
        handlers::studios::StudioResponse,
        handlers::uploads::RequestUploadBody,
        handlers::uploads::ChunkAccepted,
        handlers::uploads::FinalizeBody,
        handlers::tracks::TrackResponse,
        services::UploadTicket,
        services::FinalizeResult,
        services::UploadProgress,
        models::TrackState,
        models::UploadSource,
        models::JobStatus,
        models::TranscodeJob,
    )),
    tags(
        (name = "studios", description = "Tenant registration"),
        (name = "uploads", description = "Chunked upload protocol"),
        (name = "tracks", description = "Track lifecycle and playback"),
    )
)]
pub struct ApiDoc;
