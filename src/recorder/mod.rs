//! Recorder process supervision
//!
//! Each recorder is one audyn capture process recording a single source into
//! a studio's archive directory.

pub mod launcher;
pub mod protocol;
pub mod supervisor;

#[cfg(test)]
pub mod testing;

pub use launcher::{ProcessLauncher, RecorderLauncher};
pub use protocol::ChannelLevel;
pub use supervisor::{FleetHealth, RetireReason, RetiredRecorder, Supervisor};

use crate::error::ErrorInfo;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Supervisor-assigned recorder identity, never reused within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RecorderId(pub u64);

impl fmt::Display for RecorderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a supervised recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl RecorderState {
    /// Whether `next` may follow `self`.
    ///
    /// `Error` is reachable from `Starting` and `Running`; from `Error` the
    /// recorder is either restarted or stopped. A stop request during startup
    /// goes straight to `Stopping`.
    pub fn can_transition_to(self, next: RecorderState) -> bool {
        use RecorderState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Error)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Error, Starting)
                | (Error, Stopping)
        )
    }
}

/// Point-in-time view of a recorder
#[derive(Debug, Clone, Serialize)]
pub struct RecorderInfo {
    pub id: RecorderId,
    pub source_id: String,
    pub studio_id: Option<String>,
    pub pid: Option<u32>,
    pub state: RecorderState,
    /// Time of the last state change
    pub since: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    /// Automatic restarts performed so far
    pub restarts: u32,
    pub last_error: Option<ErrorInfo>,
}

impl RecorderInfo {
    pub fn new(id: RecorderId, source_id: String, studio_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            source_id,
            studio_id,
            pid: None,
            state: RecorderState::Starting,
            since: now,
            started_at: now,
            restarts: 0,
            last_error: None,
        }
    }
}
