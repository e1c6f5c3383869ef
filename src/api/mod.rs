//! HTTP and WebSocket gateway
//!
//! Thin layer over [`Fleet`]: handlers translate requests into fleet calls
//! and map [`FleetError`] codes onto HTTP statuses.

mod recorders;
mod sources;
mod studios;
mod telemetry;

use crate::error::FleetError;
use crate::fleet::Fleet;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<Fleet>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sources", get(sources::list).post(sources::create))
        .route(
            "/sources/{id}",
            get(sources::get_one).put(sources::update).delete(sources::delete),
        )
        .route("/studios", get(studios::list).post(studios::create))
        .route(
            "/studios/{id}",
            get(studios::get_one).put(studios::update).delete(studios::delete),
        )
        .route("/studios/{id}/assign", post(studios::assign))
        .route("/studios/{id}/session", get(studios::session))
        .route("/recorders", get(recorders::health))
        .route("/recorders/{id}/levels", get(recorders::levels))
        .route("/recorders/{id}/kill", post(recorders::kill))
        .route("/ws/levels", get(telemetry::fleet_levels))
        .route("/ws/levels/recorders/{id}", get(telemetry::recorder_levels))
        .route("/ws/levels/studios/{id}", get(telemetry::studio_levels))
        .route("/ws/events", get(telemetry::events))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy", "service": "audyn-fleet"}))
}

/// Error response wrapper: `{"error": CODE, "message": text}`
#[derive(Debug)]
pub struct ApiError(pub FleetError);

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            FleetError::SourceNotFound(_)
            | FleetError::StudioNotFound(_)
            | FleetError::RecorderNotFound(_)
            | FleetError::TelemetryUnavailable(_) => StatusCode::NOT_FOUND,
            FleetError::InvalidSource(_) | FleetError::InvalidStudio(_) => StatusCode::BAD_REQUEST,
            FleetError::SourceInUse(_)
            | FleetError::AssignmentConflict(_)
            | FleetError::AssignmentInProgress(_) => StatusCode::CONFLICT,
            FleetError::RecorderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            FleetError::RecorderStartupTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            FleetError::RecorderCrashed(..) => StatusCode::BAD_GATEWAY,
            FleetError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self.0);
        }
        let body = Json(json!({"error": self.0.code(), "message": self.0.to_string()}));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;
