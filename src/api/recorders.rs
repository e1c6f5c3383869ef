//! Recorder health, levels and kill

use super::{ApiError, ApiResult, AppState};
use crate::fleet::RecorderLevels;
use crate::recorder::{FleetHealth, RecorderId};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};

pub async fn health(State(state): State<AppState>) -> Json<FleetHealth> {
    Json(state.fleet.health())
}

/// Latest reading of one recorder; silence until it reports
pub async fn levels(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<RecorderLevels> {
    Ok(Json(state.fleet.recorder_levels(RecorderId(id))?))
}

/// Force-kill a recorder; its studio is left unassigned
pub async fn kill(State(state): State<AppState>, Path(id): Path<u64>) -> Result<StatusCode, ApiError> {
    state.fleet.kill_recorder(RecorderId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
