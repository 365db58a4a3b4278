use crate::error::{ErrorResponse, HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use onair_core::models::Studio;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateStudioBody {
    /// Directory name under the studios root
    pub slug: String,
    #[serde(default)]
    pub display_name: String,
    /// Overrides the global target bitrate
    #[serde(default)]
    pub default_bitrate_kbps: Option<i32>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StudioResponse {
    pub id: Uuid,
    pub slug: String,
    pub display_name: String,
    pub is_active: bool,
    pub default_bitrate_kbps: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl From<Studio> for StudioResponse {
    fn from(studio: Studio) -> Self {
        Self {
            id: studio.id,
            slug: studio.slug,
            display_name: studio.display_name,
            is_active: studio.is_active,
            default_bitrate_kbps: studio.default_bitrate_kbps,
            created_at: studio.created_at,
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/studios",
    tag = "studios",
    request_body = CreateStudioBody,
    responses(
        (status = 201, description = "Studio created", body = StudioResponse),
        (status = 400, description = "Invalid slug or bitrate", body = ErrorResponse),
        (status = 409, description = "Slug already taken", body = ErrorResponse)
    )
)]
pub async fn create_studio(
    State(state): State<Arc<AppState>>,
    ValidatedJson(body): ValidatedJson<CreateStudioBody>,
) -> Result<impl IntoResponse, HttpAppError> {
    let studio = state
        .ingest
        .create_studio(&body.slug, &body.display_name, body.default_bitrate_kbps)
        .await?;
    Ok((StatusCode::CREATED, Json(StudioResponse::from(studio))))
}
