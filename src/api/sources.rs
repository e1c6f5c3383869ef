//! Source CRUD handlers

use super::{ApiError, ApiResult, AppState};
use crate::sources::{Source, SourceSpec};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};

pub async fn list(State(state): State<AppState>) -> Json<Vec<Source>> {
    Json(state.fleet.list_sources())
}

pub async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Source> {
    Ok(Json(state.fleet.get_source(&id)?))
}

pub async fn create(
    State(state): State<AppState>,
    Json(spec): Json<SourceSpec>,
) -> Result<(StatusCode, Json<Source>), ApiError> {
    let source = state.fleet.add_source(spec)?;
    Ok((StatusCode::CREATED, Json(source)))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(spec): Json<SourceSpec>,
) -> ApiResult<Source> {
    Ok(Json(state.fleet.update_source(&id, spec)?))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.fleet.delete_source(&id)?;
    Ok(StatusCode::NO_CONTENT)
}
