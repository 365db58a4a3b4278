//! API constants

/// Prefix of every ingest route.
pub const API_PREFIX: &str = "/api";

/// Header carrying the per-upload authorization token.
pub const UPLOAD_TOKEN_HEADER: &str = "x-upload-token";

/// Chunk endpoint reference handed out by request-upload.
pub fn chunk_url(upload_id: uuid::Uuid) -> String {
    format!("{}/uploads/{}/chunk", API_PREFIX, upload_id)
}
