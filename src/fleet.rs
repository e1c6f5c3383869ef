//! Fleet coordinator
//!
//! Wires the source registry, supervisor, assignment table and telemetry
//! multiplexer together and is the only thing the gateway talks to.

use crate::assignment::{AssignmentTable, Studio, StudioSpec, StudioUpdate};
use crate::config::Config;
use crate::database::Database;
use crate::error::{FleetError, FleetResult};
use crate::events::{EventBus, FleetEvent};
use crate::recorder::{
    ChannelLevel, FleetHealth, RecorderId, RecorderInfo, RecorderLauncher, RecorderState,
    RetiredRecorder, Supervisor,
};
use crate::session::RecordingSession;
use crate::sources::{Source, SourceRegistry, SourceSpec};
use crate::telemetry::{Subscription, TelemetryMux};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Current levels of one recorder
#[derive(Debug, Clone, Serialize)]
pub struct RecorderLevels {
    pub recorder_id: RecorderId,
    pub studio_id: Option<String>,
    pub state: RecorderState,
    /// Time of the reading; `None` when nothing has been measured
    pub at: Option<DateTime<Utc>>,
    pub channels: Vec<ChannelLevel>,
}

impl RecorderLevels {
    /// Recorders that are not running, or have not reported yet, read as
    /// stereo silence
    fn read(info: &RecorderInfo, telemetry: &TelemetryMux) -> Self {
        let latest = match info.state {
            RecorderState::Running => telemetry.latest(info.id),
            _ => None,
        };
        let (at, channels) = match latest {
            Some(sample) => (Some(sample.at), sample.channels.clone()),
            None => (None, vec![ChannelLevel::silence("L"), ChannelLevel::silence("R")]),
        };
        Self {
            recorder_id: info.id,
            studio_id: info.studio_id.clone(),
            state: info.state,
            at,
            channels,
        }
    }
}

pub struct Fleet {
    db: Arc<Database>,
    sources: Arc<SourceRegistry>,
    supervisor: Arc<Supervisor>,
    table: Arc<AssignmentTable>,
    telemetry: Arc<TelemetryMux>,
    events: EventBus,
}

impl Fleet {
    /// Build the fleet. Must be called inside a tokio runtime.
    pub fn new(config: &Config, db: Arc<Database>, launcher: Arc<dyn RecorderLauncher>) -> Arc<Self> {
        let events = EventBus::new();
        let telemetry = Arc::new(TelemetryMux::new(config.telemetry_queue));
        let (supervisor, retired) = Supervisor::new(
            config.supervisor.clone(),
            launcher,
            telemetry.clone(),
            events.clone(),
        );
        let sources = Arc::new(SourceRegistry::new());
        let table = Arc::new(AssignmentTable::new(
            sources.clone(),
            supervisor.clone(),
            db.clone(),
            events.clone(),
            config.shared_sources,
        ));

        let fleet = Arc::new(Self {
            db,
            sources,
            supervisor,
            table,
            telemetry,
            events,
        });
        fleet.spawn_pump(retired);
        fleet
    }

    /// Feed supervisor notifications into the assignment table
    fn spawn_pump(&self, mut retired: mpsc::UnboundedReceiver<RetiredRecorder>) {
        let table = self.table.clone();
        let mut events = self.events.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(recorder) = retired.recv() => {
                        let table = table.clone();
                        tokio::spawn(async move {
                            table.on_recorder_retired(&recorder).await;
                        });
                    }
                    event = events.recv() => match event {
                        Ok(FleetEvent::RecorderState { recorder_id, .. }) => {
                            table.publish_for_recorder(recorder_id);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Session pump lagged, {} events skipped", missed);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    else => break,
                }
            }
        });
    }

    /// Load persisted sources and studios and re-assign bound studios in
    /// the background. Returns the number of bindings being restored.
    pub fn restore(self: &Arc<Self>) -> FleetResult<usize> {
        let sources = self.db.load_sources()?;
        let studios = self.db.load_studios()?;
        info!("Restoring {} sources and {} studios", sources.len(), studios.len());

        for source in sources {
            self.sources.restore(source);
        }

        let mut restored = 0;
        for stored in &studios {
            self.table.restore(stored);
            if let Some(source_id) = stored.bound_source_id.clone() {
                restored += 1;
                let table = self.table.clone();
                let studio_id = stored.profile.id.clone();
                tokio::spawn(async move {
                    match table.assign(&studio_id, &source_id).await {
                        Ok(_) => info!("Restored studio {} on source {}", studio_id, source_id),
                        Err(e) => error!("Failed to restore studio {}: {}", studio_id, e),
                    }
                });
            }
        }
        Ok(restored)
    }

    // ---- sources ----

    pub fn list_sources(&self) -> Vec<Source> {
        self.sources.list()
    }

    pub fn get_source(&self, id: &str) -> FleetResult<Source> {
        self.sources
            .get(id)
            .ok_or_else(|| FleetError::SourceNotFound(id.to_string()))
    }

    pub fn add_source(&self, spec: SourceSpec) -> FleetResult<Source> {
        let source = self.sources.add(spec)?;
        if let Err(e) = self.db.save_source(&source) {
            let _ = self.sources.remove(&source.id);
            return Err(e.into());
        }
        self.events.publish(FleetEvent::SourceChanged {
            source: source.clone(),
        });
        Ok(source)
    }

    pub fn update_source(&self, id: &str, spec: SourceSpec) -> FleetResult<Source> {
        let previous = self.get_source(id)?;
        let source = self.sources.update(id, spec)?;
        if let Err(e) = self.db.save_source(&source) {
            self.sources.restore(previous);
            return Err(e.into());
        }
        self.events.publish(FleetEvent::SourceChanged {
            source: source.clone(),
        });
        Ok(source)
    }

    /// Remove a source; refused with `SourceInUse` while a studio records it
    pub fn delete_source(&self, id: &str) -> FleetResult<()> {
        let source = self.sources.remove(id)?;
        if let Err(e) = self.db.delete_source(id) {
            self.sources.restore(source);
            return Err(e.into());
        }
        self.events.publish(FleetEvent::SourceRemoved {
            source_id: id.to_string(),
        });
        Ok(())
    }

    // ---- studios ----

    pub fn list_studios(&self) -> Vec<Studio> {
        self.table.list()
    }

    pub fn get_studio(&self, id: &str) -> FleetResult<Studio> {
        self.table.studio(id)
    }

    pub fn create_studio(&self, spec: StudioSpec) -> FleetResult<Studio> {
        self.table.create(spec)
    }

    pub fn update_studio(&self, id: &str, update: StudioUpdate) -> FleetResult<Studio> {
        self.table.update(id, update)
    }

    pub fn delete_studio(&self, id: &str) -> FleetResult<()> {
        self.table.delete(id)
    }

    /// Assign a studio to a source, or unassign it with `None`
    pub async fn assign(&self, studio_id: &str, source_id: Option<&str>) -> FleetResult<RecordingSession> {
        match source_id {
            Some(source_id) => self.table.assign(studio_id, source_id).await,
            None => self.table.unassign(studio_id).await,
        }
    }

    pub fn session(&self, studio_id: &str) -> FleetResult<RecordingSession> {
        self.table.session(studio_id)
    }

    // ---- recorders ----

    pub fn health(&self) -> FleetHealth {
        self.supervisor.health()
    }

    pub fn recorder_levels(&self, id: RecorderId) -> FleetResult<RecorderLevels> {
        let info = self
            .supervisor
            .get(id)
            .ok_or(FleetError::RecorderNotFound(id))?;
        Ok(RecorderLevels::read(&info, &self.telemetry))
    }

    /// Levels of every recorder in the fleet, ordered by id
    pub fn all_levels(&self) -> Vec<RecorderLevels> {
        self.supervisor
            .health()
            .recorders
            .iter()
            .map(|info| RecorderLevels::read(info, &self.telemetry))
            .collect()
    }

    pub async fn kill_recorder(&self, id: RecorderId) -> FleetResult<()> {
        warn!("Killing recorder {} on request", id);
        self.supervisor.kill(id).await
    }

    // ---- observation ----

    pub fn subscribe_recorder(&self, id: RecorderId) -> FleetResult<Subscription> {
        self.telemetry.subscribe(id)
    }

    pub fn subscribe_studio(&self, studio_id: &str) -> FleetResult<Subscription> {
        let recorder_id = self.table.recorder_of(studio_id)?.ok_or_else(|| {
            FleetError::TelemetryUnavailable(format!("studio {} has no recorder", studio_id))
        })?;
        self.telemetry.subscribe(recorder_id)
    }

    pub fn events(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    /// Stop every recorder. Bindings stay persisted for the next start.
    pub async fn shutdown(&self) {
        info!("Shutting down fleet");
        self.supervisor.shutdown().await;
    }
}
