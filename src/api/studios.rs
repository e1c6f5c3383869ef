//! Studio CRUD, assignment and session handlers

use super::{ApiError, ApiResult, AppState};
use crate::assignment::{Studio, StudioSpec, StudioUpdate};
use crate::session::RecordingSession;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;

/// Body of `POST /studios/{id}/assign`; a null or missing source unassigns
#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    #[serde(default)]
    pub source_id: Option<String>,
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<Studio>> {
    Json(state.fleet.list_studios())
}

pub async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Studio> {
    Ok(Json(state.fleet.get_studio(&id)?))
}

pub async fn create(
    State(state): State<AppState>,
    Json(spec): Json<StudioSpec>,
) -> Result<(StatusCode, Json<Studio>), ApiError> {
    let studio = state.fleet.create_studio(spec)?;
    Ok((StatusCode::CREATED, Json(studio)))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<StudioUpdate>,
) -> ApiResult<Studio> {
    Ok(Json(state.fleet.update_studio(&id, update)?))
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.fleet.delete_studio(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn assign(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AssignRequest>,
) -> ApiResult<RecordingSession> {
    let session = state.fleet.assign(&id, request.source_id.as_deref()).await?;
    Ok(Json(session))
}

pub async fn session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<RecordingSession> {
    Ok(Json(state.fleet.session(&id)?))
}
