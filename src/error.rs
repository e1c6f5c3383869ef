//! Error taxonomy shared by the coordination layer

use crate::recorder::RecorderId;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by fleet operations
///
/// `Clone` so a single in-flight assignment outcome can be handed to every
/// caller that was coalesced onto it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FleetError {
    #[error("Source not found: {0}")]
    SourceNotFound(String),
    #[error("Invalid source: {0}")]
    InvalidSource(String),
    #[error("Source {0} backs an active assignment")]
    SourceInUse(String),
    #[error("Studio not found: {0}")]
    StudioNotFound(String),
    #[error("Invalid studio: {0}")]
    InvalidStudio(String),
    #[error("Assignment conflict: {0}")]
    AssignmentConflict(String),
    #[error("Another assignment is in progress for studio {0}")]
    AssignmentInProgress(String),
    #[error("Recorder not found: {0}")]
    RecorderNotFound(RecorderId),
    #[error("Recorder unavailable: {0}")]
    RecorderUnavailable(String),
    #[error("Recorder {0} did not signal readiness in time")]
    RecorderStartupTimeout(RecorderId),
    #[error("Recorder {0} crashed: {1}")]
    RecorderCrashed(RecorderId, String),
    #[error("Telemetry unavailable: {0}")]
    TelemetryUnavailable(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl FleetError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            FleetError::SourceNotFound(_) => "SOURCE_NOT_FOUND",
            FleetError::InvalidSource(_) => "INVALID_SOURCE",
            FleetError::SourceInUse(_) => "SOURCE_IN_USE",
            FleetError::StudioNotFound(_) => "STUDIO_NOT_FOUND",
            FleetError::InvalidStudio(_) => "INVALID_STUDIO",
            FleetError::AssignmentConflict(_) => "ASSIGNMENT_CONFLICT",
            FleetError::AssignmentInProgress(_) => "ASSIGNMENT_IN_PROGRESS",
            FleetError::RecorderNotFound(_) => "RECORDER_NOT_FOUND",
            FleetError::RecorderUnavailable(_) => "RECORDER_UNAVAILABLE",
            FleetError::RecorderStartupTimeout(_) => "RECORDER_STARTUP_TIMEOUT",
            FleetError::RecorderCrashed(..) => "RECORDER_CRASHED",
            FleetError::TelemetryUnavailable(_) => "TELEMETRY_UNAVAILABLE",
            FleetError::Storage(_) => "STORAGE",
        }
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<crate::database::DatabaseError> for FleetError {
    fn from(e: crate::database::DatabaseError) -> Self {
        FleetError::Storage(e.to_string())
    }
}

/// Serializable form of a [`FleetError`] for session projections and events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

pub type FleetResult<T> = Result<T, FleetError>;
