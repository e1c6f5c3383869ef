//! Recording session projection
//!
//! A studio's session is never stored. It is computed on demand from the
//! studio's binding and the state of the bound recorder.

use crate::error::{ErrorInfo, FleetError};
use crate::recorder::{RecorderId, RecorderInfo, RecorderState};
use crate::sources::SourceId;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Externally visible session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Starting,
    Recording,
    Stopping,
    Stopped,
    Error,
}

impl From<RecorderState> for SessionStatus {
    fn from(state: RecorderState) -> Self {
        match state {
            RecorderState::Starting => SessionStatus::Starting,
            RecorderState::Running => SessionStatus::Recording,
            RecorderState::Stopping => SessionStatus::Stopping,
            RecorderState::Stopped => SessionStatus::Stopped,
            RecorderState::Error => SessionStatus::Error,
        }
    }
}

impl SessionStatus {
    /// Whether observers may see `next` right after `self`
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Recording)
                | (Starting, Error)
                | (Starting, Stopping)
                | (Recording, Stopping)
                | (Recording, Error)
                | (Stopping, Stopped)
                | (Stopping, Idle)
                | (Stopped, Idle)
                | (Stopped, Starting)
                | (Error, Starting)
                | (Error, Stopping)
                | (Error, Idle)
        )
    }
}

/// Current session of one studio
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingSession {
    pub studio_id: String,
    pub recorder_id: Option<RecorderId>,
    pub source_id: Option<SourceId>,
    pub status: SessionStatus,
    pub since: DateTime<Utc>,
    pub error: Option<ErrorInfo>,
}

/// A studio's side of the studio/recorder bijection
#[derive(Debug, Clone)]
pub struct Binding {
    pub source_id: Option<SourceId>,
    pub recorder_id: Option<RecorderId>,
    /// Set while an assign/unassign is driving the studio
    pub pending: Option<SessionStatus>,
    /// Why the last binding attempt or recorder ended
    pub last_error: Option<FleetError>,
    pub since: DateTime<Utc>,
}

impl Binding {
    pub fn idle() -> Self {
        Self {
            source_id: None,
            recorder_id: None,
            pending: None,
            last_error: None,
            since: Utc::now(),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.recorder_id.is_some()
    }

    pub fn bind(&mut self, source_id: SourceId, recorder_id: RecorderId) {
        self.source_id = Some(source_id);
        self.recorder_id = Some(recorder_id);
        self.pending = None;
        self.last_error = None;
        self.since = Utc::now();
    }

    /// Drop the binding, remembering `error` if it ended badly
    pub fn clear(&mut self, error: Option<FleetError>) {
        self.source_id = None;
        self.recorder_id = None;
        self.pending = None;
        self.last_error = error;
        self.since = Utc::now();
    }

    pub fn set_pending(&mut self, status: SessionStatus, source_id: Option<SourceId>) {
        self.pending = Some(status);
        if source_id.is_some() {
            self.source_id = source_id;
        }
        self.since = Utc::now();
    }

    /// Compute the session from this binding and the bound recorder
    pub fn project(&self, studio_id: &str, recorder: Option<&RecorderInfo>) -> RecordingSession {
        let (status, since) = match (self.pending, self.recorder_id) {
            (Some(pending), _) => (pending, self.since),
            (None, Some(_)) => match recorder {
                Some(info) => (SessionStatus::from(info.state), info.since),
                // Recorder already gone, retirement not yet processed
                None => (SessionStatus::Error, self.since),
            },
            (None, None) if self.last_error.is_some() => (SessionStatus::Error, self.since),
            (None, None) => (SessionStatus::Idle, self.since),
        };

        let error = match status {
            SessionStatus::Error => recorder
                .and_then(|info| info.last_error.clone())
                .or_else(|| self.last_error.as_ref().map(FleetError::to_info)),
            _ => None,
        };

        RecordingSession {
            studio_id: studio_id.to_string(),
            recorder_id: self.recorder_id,
            source_id: self.source_id.clone(),
            status,
            since,
            error,
        }
    }
}

impl Default for Binding {
    fn default() -> Self {
        Self::idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(state: RecorderState) -> RecorderInfo {
        let mut info = RecorderInfo::new(RecorderId(1), "mic-1".to_string(), Some("a".to_string()));
        info.state = state;
        info
    }

    #[test]
    fn test_projection_follows_recorder() {
        let mut binding = Binding::idle();
        assert_eq!(binding.project("a", None).status, SessionStatus::Idle);

        binding.set_pending(SessionStatus::Starting, Some("mic-1".to_string()));
        let session = binding.project("a", None);
        assert_eq!(session.status, SessionStatus::Starting);
        assert_eq!(session.source_id.as_deref(), Some("mic-1"));
        assert_eq!(session.recorder_id, None);

        binding.bind("mic-1".to_string(), RecorderId(1));
        let running = recorder(RecorderState::Running);
        let session = binding.project("a", Some(&running));
        assert_eq!(session.status, SessionStatus::Recording);
        assert_eq!(session.recorder_id, Some(RecorderId(1)));
        assert_eq!(session.since, running.since);

        let mut failed = recorder(RecorderState::Error);
        failed.last_error = Some(FleetError::RecorderCrashed(RecorderId(1), "exit status 1".into()).to_info());
        let session = binding.project("a", Some(&failed));
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.error.map(|e| e.code), Some("RECORDER_CRASHED".to_string()));

        // Bound but the recorder is already gone
        assert_eq!(binding.project("a", None).status, SessionStatus::Error);
    }

    #[test]
    fn test_cleared_binding() {
        let mut binding = Binding::idle();
        binding.bind("mic-1".to_string(), RecorderId(4));
        binding.clear(None);
        assert!(!binding.is_bound());
        assert_eq!(binding.project("a", None).status, SessionStatus::Idle);

        binding.clear(Some(FleetError::RecorderStartupTimeout(RecorderId(5))));
        let session = binding.project("a", None);
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(
            session.error.map(|e| e.code),
            Some("RECORDER_STARTUP_TIMEOUT".to_string())
        );
    }

    #[test]
    fn test_status_transitions() {
        use SessionStatus::*;

        assert!(Idle.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Recording));
        assert!(Recording.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Idle));
        assert!(Recording.can_transition_to(Error));
        assert!(Error.can_transition_to(Starting));

        assert!(!Idle.can_transition_to(Recording));
        assert!(!Recording.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Stopping));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::Recording).unwrap(),
            "\"recording\""
        );
        assert_eq!(
            SessionStatus::from(RecorderState::Running),
            SessionStatus::Recording
        );
    }
}
