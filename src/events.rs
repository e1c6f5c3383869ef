//! Fleet event bus
//!
//! Every mutation of studio, source or recorder state is published here as a
//! discrete event. Observers (the event WebSocket, tests) subscribe; nothing
//! watches shared state implicitly.

use crate::assignment::Studio;
use crate::error::ErrorInfo;
use crate::recorder::{RecorderId, RecorderState};
use crate::session::RecordingSession;
use crate::sources::Source;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Events emitted by the coordination layer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    /// A recorder moved through its lifecycle
    RecorderState {
        recorder_id: RecorderId,
        source_id: String,
        state: RecorderState,
        error: Option<ErrorInfo>,
        at: DateTime<Utc>,
    },
    /// A studio's session projection changed
    Session { session: RecordingSession },
    StudioChanged { studio: Studio },
    StudioRemoved { studio_id: String },
    SourceChanged { source: Source },
    SourceRemoved { source_id: String },
}

/// Broadcast fan-out of [`FleetEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: FleetEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
