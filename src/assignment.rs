//! Studio assignment table
//!
//! The single source of truth for which studio owns which recorder. Every
//! mutation of a studio runs inside that studio's exclusive section, so
//! unrelated studios never wait on each other. Assignments run in their own
//! task and cannot be cancelled halfway by a disconnecting caller.

use crate::database::{Database, StoredStudio};
use crate::error::{FleetError, FleetResult};
use crate::events::{EventBus, FleetEvent};
use crate::recorder::{RecorderId, RecorderState, RetireReason, RetiredRecorder, Supervisor};
use crate::session::{Binding, RecordingSession, SessionStatus};
use crate::sources::{SourceId, SourceRegistry};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_COLOR: &str = "#2196F3";

/// Persisted part of a studio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudioProfile {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub color: String,
}

/// A studio with its current binding
#[derive(Debug, Clone, Serialize)]
pub struct Studio {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub color: String,
    pub assigned_recorder_id: Option<RecorderId>,
    pub source_id: Option<SourceId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StudioSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_color")]
    pub color: String,
}

#[cfg(test)]
impl StudioSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: None,
            color: default_color(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Partial edit; absent fields keep their value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StudioUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
}

fn default_color() -> String {
    DEFAULT_COLOR.to_string()
}

type Outcome = Option<FleetResult<RecordingSession>>;

struct InFlight {
    target: Option<SourceId>,
    outcome: watch::Receiver<Outcome>,
}

struct StudioSlot {
    profile: RwLock<StudioProfile>,
    binding: RwLock<Binding>,
    /// Held for the whole of an assign/unassign/retirement
    section: tokio::sync::Mutex<()>,
    inflight: Mutex<Option<InFlight>>,
    /// Last published (status, recorder) pair, to skip duplicate events
    published: Mutex<Option<(SessionStatus, Option<RecorderId>)>>,
    removed: AtomicBool,
}

impl StudioSlot {
    fn new(profile: StudioProfile) -> Self {
        Self {
            profile: RwLock::new(profile),
            binding: RwLock::new(Binding::idle()),
            section: tokio::sync::Mutex::new(()),
            inflight: Mutex::new(None),
            published: Mutex::new(None),
            removed: AtomicBool::new(false),
        }
    }
}

/// Authoritative studio/recorder bijection
pub struct AssignmentTable {
    studios: DashMap<String, Arc<StudioSlot>>,
    /// Reverse index: recorder -> owning studio
    owners: DashMap<RecorderId, String>,
    sources: Arc<SourceRegistry>,
    supervisor: Arc<Supervisor>,
    db: Arc<Database>,
    events: EventBus,
    shared_sources: bool,
}

impl AssignmentTable {
    pub fn new(
        sources: Arc<SourceRegistry>,
        supervisor: Arc<Supervisor>,
        db: Arc<Database>,
        events: EventBus,
        shared_sources: bool,
    ) -> Self {
        Self {
            studios: DashMap::new(),
            owners: DashMap::new(),
            sources,
            supervisor,
            db,
            events,
            shared_sources,
        }
    }

    // ---- studio CRUD ----

    pub fn list(&self) -> Vec<Studio> {
        let mut studios: Vec<Studio> = self
            .studios
            .iter()
            .map(|entry| studio_view(entry.value()))
            .collect();
        studios.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        studios
    }

    pub fn studio(&self, studio_id: &str) -> FleetResult<Studio> {
        let slot = self.slot(studio_id)?;
        Ok(studio_view(&slot))
    }

    pub fn create(&self, spec: StudioSpec) -> FleetResult<Studio> {
        let id = match spec.id.as_deref().map(str::trim) {
            Some("") => return Err(FleetError::InvalidStudio("id must not be empty".to_string())),
            Some(id) if !is_valid_id(id) => {
                return Err(FleetError::InvalidStudio(format!("invalid id: {}", id)))
            }
            Some(id) => id.to_string(),
            None => format!("studio-{}", &Uuid::new_v4().simple().to_string()[..8]),
        };

        let profile = StudioProfile {
            id: id.clone(),
            name: validate_name(&spec.name)?,
            description: spec.description.filter(|d| !d.trim().is_empty()),
            color: validate_color(&spec.color)?,
        };

        match self.studios.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(FleetError::InvalidStudio(format!("studio {} already exists", id)))
            }
            Entry::Vacant(vacant) => {
                self.db.save_studio(&profile)?;
                vacant.insert(Arc::new(StudioSlot::new(profile)));
            }
        }

        info!("Studio created: {}", id);
        let studio = self.studio(&id)?;
        self.events.publish(FleetEvent::StudioChanged {
            studio: studio.clone(),
        });
        Ok(studio)
    }

    pub fn update(&self, studio_id: &str, update: StudioUpdate) -> FleetResult<Studio> {
        let slot = self.slot(studio_id)?;

        {
            // Held through the save so concurrent edits apply one after another
            let mut current = slot.profile.write();
            let mut profile = current.clone();
            if let Some(name) = update.name {
                profile.name = validate_name(&name)?;
            }
            if let Some(description) = update.description {
                profile.description = Some(description).filter(|d| !d.trim().is_empty());
            }
            if let Some(color) = update.color {
                profile.color = validate_color(&color)?;
            }

            self.db.save_studio(&profile)?;
            *current = profile;
        }

        let studio = studio_view(&slot);
        self.events.publish(FleetEvent::StudioChanged {
            studio: studio.clone(),
        });
        Ok(studio)
    }

    /// Delete an unbound studio
    pub fn delete(&self, studio_id: &str) -> FleetResult<()> {
        let slot = self.slot(studio_id)?;

        let _section = slot
            .section
            .try_lock()
            .map_err(|_| FleetError::AssignmentInProgress(studio_id.to_string()))?;
        {
            let binding = slot.binding.read();
            if binding.is_bound() || binding.pending.is_some() {
                return Err(FleetError::AssignmentConflict(format!(
                    "studio {} is bound to a recorder",
                    studio_id
                )));
            }
        }

        self.db.delete_studio(studio_id)?;
        slot.removed.store(true, Ordering::SeqCst);
        self.studios.remove(studio_id);

        info!("Studio deleted: {}", studio_id);
        self.events.publish(FleetEvent::StudioRemoved {
            studio_id: studio_id.to_string(),
        });
        Ok(())
    }

    /// Load a persisted studio at startup
    pub fn restore(&self, stored: &StoredStudio) {
        let id = stored.profile.id.clone();
        self.studios
            .insert(id, Arc::new(StudioSlot::new(stored.profile.clone())));
    }

    // ---- assignment ----

    /// Bind `studio_id` to a recorder for `source_id`
    pub async fn assign(self: &Arc<Self>, studio_id: &str, source_id: &str) -> FleetResult<RecordingSession> {
        self.submit(studio_id, Some(source_id.to_string())).await
    }

    /// Stop the studio's recorder, if any, and clear the binding
    pub async fn unassign(self: &Arc<Self>, studio_id: &str) -> FleetResult<RecordingSession> {
        self.submit(studio_id, None).await
    }

    /// Run an assignment, or join the one already in flight for the same
    /// target. A different target while one is in flight is refused.
    pub async fn submit(
        self: &Arc<Self>,
        studio_id: &str,
        target: Option<SourceId>,
    ) -> FleetResult<RecordingSession> {
        let slot = self.slot(studio_id)?;

        let mut outcome = {
            let mut inflight = slot.inflight.lock();
            match inflight.as_ref() {
                Some(op) if op.target == target => {
                    debug!("Joining in-flight assignment for studio {}", studio_id);
                    op.outcome.clone()
                }
                Some(_) => return Err(FleetError::AssignmentInProgress(studio_id.to_string())),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *inflight = Some(InFlight {
                        target: target.clone(),
                        outcome: rx.clone(),
                    });

                    let table = self.clone();
                    let slot = slot.clone();
                    let studio_id = studio_id.to_string();
                    tokio::spawn(async move {
                        let result = table.execute(&slot, &studio_id, target).await;
                        slot.inflight.lock().take();
                        let _ = tx.send(Some(result));
                    });
                    rx
                }
            }
        };

        let result = outcome
            .wait_for(Option::is_some)
            .await
            .map(|outcome| outcome.clone());
        match result {
            Ok(Some(result)) => result,
            _ => Err(FleetError::RecorderUnavailable(format!(
                "assignment task for studio {} ended unexpectedly",
                studio_id
            ))),
        }
    }

    async fn execute(
        &self,
        slot: &StudioSlot,
        studio_id: &str,
        target: Option<SourceId>,
    ) -> FleetResult<RecordingSession> {
        let _section = slot.section.lock().await;
        if slot.removed.load(Ordering::SeqCst) {
            return Err(FleetError::StudioNotFound(studio_id.to_string()));
        }

        match target {
            Some(source_id) => self.bind(slot, studio_id, source_id).await,
            None => {
                self.release_binding(slot, studio_id).await;
                Ok(self.project(slot, studio_id))
            }
        }
    }

    async fn bind(
        &self,
        slot: &StudioSlot,
        studio_id: &str,
        source_id: SourceId,
    ) -> FleetResult<RecordingSession> {
        let current = slot.binding.read().clone();

        // Same source and the recorder is still alive: nothing to do
        if let Some(recorder_id) = current.recorder_id {
            if current.source_id.as_deref() == Some(source_id.as_str()) {
                if let Some(info) = self.supervisor.get(recorder_id) {
                    if matches!(
                        info.state,
                        RecorderState::Starting | RecorderState::Running | RecorderState::Error
                    ) {
                        return Ok(current.project(studio_id, Some(&info)));
                    }
                }
            }
        }

        // A dead recorder on the same source still holds its pin
        if current.is_bound() && current.source_id.as_deref() == Some(source_id.as_str()) {
            self.release_binding(slot, studio_id).await;
        }

        // Validate and pin the new source before touching the old binding
        let source = self.sources.acquire(&source_id, !self.shared_sources)?;

        if slot.binding.read().is_bound() {
            info!("Studio {} switching to source {}", studio_id, source_id);
            self.release_binding(slot, studio_id).await;
        }

        slot.binding
            .write()
            .set_pending(SessionStatus::Starting, Some(source_id.clone()));
        self.publish_session(slot, studio_id);

        match self.supervisor.start(&source, Some(studio_id)).await {
            Ok(info) => {
                let conflict = match self.owners.entry(info.id) {
                    Entry::Occupied(existing) => Some(existing.get().clone()),
                    Entry::Vacant(vacant) => {
                        vacant.insert(studio_id.to_string());
                        None
                    }
                };
                if let Some(owner) = conflict {
                    warn!("Recorder {} already owned by studio {}", info.id, owner);
                    let _ = self.supervisor.stop(info.id, None).await;
                    self.sources.release(&source_id);
                    let err = FleetError::AssignmentConflict(format!(
                        "recorder {} is already assigned to studio {}",
                        info.id, owner
                    ));
                    slot.binding.write().clear(Some(err.clone()));
                    self.publish_session(slot, studio_id);
                    return Err(err);
                }

                slot.binding.write().bind(source_id.clone(), info.id);
                self.persist_binding(studio_id, Some(&source_id));
                info!("Studio {} recording {} on recorder {}", studio_id, source_id, info.id);

                let session = self.project(slot, studio_id);
                self.publish_session(slot, studio_id);
                Ok(session)
            }
            Err(err) => {
                warn!("Studio {} failed to start recorder: {}", studio_id, err);
                self.sources.release(&source_id);
                slot.binding.write().clear(Some(err.clone()));
                self.persist_binding(studio_id, None);
                self.publish_session(slot, studio_id);
                Err(err)
            }
        }
    }

    /// Stop the bound recorder and return the studio to idle
    async fn release_binding(&self, slot: &StudioSlot, studio_id: &str) {
        let (recorder_id, source_id) = {
            let binding = slot.binding.read();
            (binding.recorder_id, binding.source_id.clone())
        };

        if let Some(recorder_id) = recorder_id {
            slot.binding.write().set_pending(SessionStatus::Stopping, None);
            self.publish_session(slot, studio_id);

            if let Err(e) = self.supervisor.stop(recorder_id, None).await {
                warn!("Failed to stop recorder {}: {}", recorder_id, e);
            }
            self.owners.remove(&recorder_id);
            if let Some(source_id) = &source_id {
                self.sources.release(source_id);
            }
            info!("Studio {} released recorder {}", studio_id, recorder_id);
        }

        slot.binding.write().clear(None);
        self.persist_binding(studio_id, None);
        self.publish_session(slot, studio_id);
    }

    /// Clear the binding of a recorder the supervisor gave up on or that was
    /// stopped behind the table's back
    pub async fn on_recorder_retired(&self, retired: &RetiredRecorder) {
        if retired.reason == RetireReason::Shutdown {
            // Binding stays persisted for the next start
            return;
        }
        let Some(studio_id) = retired.studio_id.as_deref() else {
            return;
        };
        let Some(slot) = self.studios.get(studio_id).map(|s| s.clone()) else {
            self.owners.remove(&retired.recorder_id);
            return;
        };

        let _section = slot.section.lock().await;
        if slot.binding.read().recorder_id != Some(retired.recorder_id) {
            return;
        }

        let error = match &retired.reason {
            RetireReason::Crashed(e) | RetireReason::Failed(e) => Some(e.clone()),
            _ => None,
        };
        warn!(
            "Studio {} lost recorder {} ({:?})",
            studio_id, retired.recorder_id, retired.reason
        );

        self.owners.remove(&retired.recorder_id);
        self.sources.release(&retired.source_id);
        slot.binding.write().clear(error);
        self.persist_binding(studio_id, None);
        self.publish_session(&slot, studio_id);
    }

    /// Republish the session of whichever studio owns `recorder_id`
    pub fn publish_for_recorder(&self, recorder_id: RecorderId) {
        let Some(studio_id) = self.owners.get(&recorder_id).map(|o| o.clone()) else {
            return;
        };
        if let Some(slot) = self.studios.get(&studio_id).map(|s| s.clone()) {
            self.publish_session(&slot, &studio_id);
        }
    }

    // ---- queries ----

    /// Current session of a studio, `None` for unknown studios
    pub fn get(&self, studio_id: &str) -> Option<RecordingSession> {
        let slot = self.studios.get(studio_id).map(|s| s.clone())?;
        Some(self.project(&slot, studio_id))
    }

    pub fn session(&self, studio_id: &str) -> FleetResult<RecordingSession> {
        self.get(studio_id)
            .ok_or_else(|| FleetError::StudioNotFound(studio_id.to_string()))
    }

    pub fn recorder_of(&self, studio_id: &str) -> FleetResult<Option<RecorderId>> {
        Ok(self.slot(studio_id)?.binding.read().recorder_id)
    }

    #[cfg(test)]
    /// (studio, recorder) pairs of every bound studio
    pub fn bindings(&self) -> Vec<(String, RecorderId)> {
        self.studios
            .iter()
            .filter_map(|entry| {
                let recorder_id = entry.value().binding.read().recorder_id?;
                Some((entry.key().clone(), recorder_id))
            })
            .collect()
    }

    #[cfg(test)]
    pub fn owner_of(&self, recorder_id: RecorderId) -> Option<String> {
        self.owners.get(&recorder_id).map(|o| o.clone())
    }

    fn slot(&self, studio_id: &str) -> FleetResult<Arc<StudioSlot>> {
        self.studios
            .get(studio_id)
            .map(|s| s.clone())
            .ok_or_else(|| FleetError::StudioNotFound(studio_id.to_string()))
    }

    fn project(&self, slot: &StudioSlot, studio_id: &str) -> RecordingSession {
        let binding = slot.binding.read().clone();
        let recorder = binding
            .recorder_id
            .and_then(|id| self.supervisor.get(id));
        binding.project(studio_id, recorder.as_ref())
    }

    fn publish_session(&self, slot: &StudioSlot, studio_id: &str) {
        let session = self.project(slot, studio_id);
        {
            let mut published = slot.published.lock();
            let key = (session.status, session.recorder_id);
            if *published == Some(key) {
                return;
            }
            if let Some((previous, _)) = *published {
                if previous != session.status && !previous.can_transition_to(session.status) {
                    debug!(
                        "Studio {} session jumped {:?} -> {:?}",
                        studio_id, previous, session.status
                    );
                }
            }
            *published = Some(key);
        }
        self.events.publish(FleetEvent::Session { session });
    }

    fn persist_binding(&self, studio_id: &str, source_id: Option<&str>) {
        if let Err(e) = self.db.set_studio_binding(studio_id, source_id) {
            warn!("Failed to persist binding of studio {}: {}", studio_id, e);
        }
    }
}

fn studio_view(slot: &StudioSlot) -> Studio {
    let profile = slot.profile.read().clone();
    let binding = slot.binding.read();
    Studio {
        id: profile.id,
        name: profile.name,
        description: profile.description,
        color: profile.color,
        assigned_recorder_id: binding.recorder_id,
        source_id: binding.recorder_id.and(binding.source_id.clone()),
    }
}

fn is_valid_id(id: &str) -> bool {
    id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn validate_name(name: &str) -> FleetResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(FleetError::InvalidStudio("name must not be empty".to_string()));
    }
    Ok(name.to_string())
}

/// `#RRGGBB`
fn validate_color(color: &str) -> FleetResult<String> {
    let color = color.trim();
    let valid = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(FleetError::InvalidStudio(format!("invalid color: {}", color)));
    }
    Ok(color.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::testing::{fast_config, Behavior, ScriptedLauncher};
    use crate::sources::SourceSpec;
    use crate::telemetry::TelemetryMux;
    use futures_util::future::join_all;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    struct Harness {
        table: Arc<AssignmentTable>,
        sources: Arc<SourceRegistry>,
        launcher: Arc<ScriptedLauncher>,
        db: Arc<Database>,
        events: broadcast::Receiver<FleetEvent>,
    }

    fn harness(launcher: ScriptedLauncher, shared_sources: bool) -> Harness {
        let launcher = Arc::new(launcher);
        let bus = EventBus::new();
        let events = bus.subscribe();
        let (supervisor, mut retired) = Supervisor::new(
            fast_config(),
            launcher.clone(),
            Arc::new(TelemetryMux::new(8)),
            bus.clone(),
        );

        let sources = Arc::new(SourceRegistry::new());
        for (id, addr) in [("mic-1", "239.69.1.1"), ("mic-2", "239.69.1.2"), ("mic-3", "239.69.1.3")] {
            sources.add(SourceSpec::new(id, addr).with_id(id)).unwrap();
        }

        let db = Arc::new(Database::open(":memory:").unwrap());
        let table = Arc::new(AssignmentTable::new(
            sources.clone(),
            supervisor,
            db.clone(),
            bus,
            shared_sources,
        ));
        for id in ["a", "b"] {
            table.create(StudioSpec::new(format!("Studio {}", id)).with_id(id)).unwrap();
        }

        let pump = table.clone();
        tokio::spawn(async move {
            while let Some(r) = retired.recv().await {
                pump.on_recorder_retired(&r).await;
            }
        });

        Harness {
            table,
            sources,
            launcher,
            db,
            events,
        }
    }

    /// Session statuses published for `studio` until `until` is seen
    async fn statuses_until(h: &mut Harness, studio: &str, until: SessionStatus) -> Vec<SessionStatus> {
        let mut seen = Vec::new();
        timeout(Duration::from_secs(3), async {
            loop {
                if let Ok(FleetEvent::Session { session }) = h.events.recv().await {
                    if session.studio_id == studio {
                        seen.push(session.status);
                        if session.status == until {
                            break;
                        }
                    }
                }
            }
        })
        .await
        .expect("timed out waiting for session status");
        seen
    }

    fn assert_bijection(table: &AssignmentTable) {
        let bindings = table.bindings();
        let recorders: HashSet<RecorderId> = bindings.iter().map(|(_, r)| *r).collect();
        assert_eq!(recorders.len(), bindings.len(), "recorder shared by two studios");
        for (studio, recorder) in &bindings {
            assert_eq!(table.owner_of(*recorder).as_deref(), Some(studio.as_str()));
        }
    }

    #[tokio::test]
    async fn test_assign_and_unassign_scenario() {
        let mut h = harness(ScriptedLauncher::new(Behavior::Healthy), false);
        assert_eq!(h.table.session("a").unwrap().status, SessionStatus::Idle);

        let session = h.table.assign("a", "mic-1").await.unwrap();
        assert_eq!(session.status, SessionStatus::Recording);
        assert_eq!(session.source_id.as_deref(), Some("mic-1"));
        assert_eq!(
            statuses_until(&mut h, "a", SessionStatus::Recording).await,
            vec![SessionStatus::Starting, SessionStatus::Recording]
        );

        let studio = h.table.studio("a").unwrap();
        assert_eq!(studio.assigned_recorder_id, session.recorder_id);
        let stored = h.db.load_studios().unwrap();
        let a = stored.iter().find(|s| s.profile.id == "a").unwrap();
        assert_eq!(a.bound_source_id.as_deref(), Some("mic-1"));

        let after = h.table.unassign("a").await.unwrap();
        assert_eq!(after.status, SessionStatus::Idle);
        assert_eq!(after.recorder_id, None);
        assert_eq!(
            statuses_until(&mut h, "a", SessionStatus::Idle).await,
            vec![SessionStatus::Stopping, SessionStatus::Idle]
        );
        assert_eq!(h.sources.pins("mic-1"), 0);

        // Unassigning an idle studio is a no-op
        assert_eq!(h.table.unassign("a").await.unwrap().status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_assign_is_idempotent() {
        let h = harness(ScriptedLauncher::new(Behavior::Healthy), false);

        let first = h.table.assign("a", "mic-1").await.unwrap();
        let second = h.table.assign("a", "mic-1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_reassign_stops_previous_recorder() {
        let h = harness(ScriptedLauncher::new(Behavior::Healthy), false);

        let first = h.table.assign("a", "mic-1").await.unwrap();
        let second = h.table.assign("a", "mic-2").await.unwrap();

        assert_ne!(first.recorder_id, second.recorder_id);
        assert_eq!(second.source_id.as_deref(), Some("mic-2"));
        assert_eq!(h.launcher.terminations(), 1);
        assert_eq!(h.sources.pins("mic-1"), 0);
        assert_eq!(h.sources.pins("mic-2"), 1);
        assert_eq!(h.table.bindings().len(), 1);
        assert_bijection(&h.table);
    }

    #[tokio::test]
    async fn test_concurrent_assigns_have_one_winner() {
        let h = harness(ScriptedLauncher::new(Behavior::Healthy), false);

        let targets = ["mic-1", "mic-2", "mic-3"];
        let results = join_all(targets.iter().map(|s| h.table.assign("a", s))).await;

        let winners: Vec<&RecordingSession> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        for result in &results {
            if let Err(e) = result {
                assert_eq!(e, &FleetError::AssignmentInProgress("a".to_string()));
            }
        }

        let session = h.table.session("a").unwrap();
        assert_eq!(session.source_id, winners[0].source_id);
        assert_eq!(h.launcher.launches(), 1);
        assert_bijection(&h.table);
    }

    #[tokio::test]
    async fn test_concurrent_same_target_is_coalesced() {
        let h = harness(ScriptedLauncher::new(Behavior::Healthy), false);

        let results = join_all((0..4).map(|_| h.table.assign("a", "mic-1"))).await;
        let sessions: Vec<RecordingSession> = results.into_iter().map(|r| r.unwrap()).collect();
        assert!(sessions.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(h.launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_studios_proceed_independently() {
        let h = harness(ScriptedLauncher::new(Behavior::Healthy), false);

        let (a, b) = tokio::join!(h.table.assign("a", "mic-1"), h.table.assign("b", "mic-2"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.recorder_id, b.recorder_id);
        assert_bijection(&h.table);
    }

    #[tokio::test]
    async fn test_exclusive_source() {
        let h = harness(ScriptedLauncher::new(Behavior::Healthy), false);

        h.table.assign("b", "mic-1").await.unwrap();
        let err = h.table.assign("a", "mic-1").await.unwrap_err();
        assert!(matches!(err, FleetError::RecorderUnavailable(_)));

        // The failed request left both studios as they were
        assert_eq!(h.table.session("b").unwrap().status, SessionStatus::Recording);
        assert_eq!(h.table.session("a").unwrap().status, SessionStatus::Idle);
        assert_eq!(h.sources.pins("mic-1"), 1);
    }

    #[tokio::test]
    async fn test_shared_source() {
        let h = harness(ScriptedLauncher::new(Behavior::Healthy), true);

        let a = h.table.assign("a", "mic-1").await.unwrap();
        let b = h.table.assign("b", "mic-1").await.unwrap();
        assert_ne!(a.recorder_id, b.recorder_id);
        assert_eq!(h.sources.pins("mic-1"), 2);
        assert_bijection(&h.table);
    }

    #[tokio::test]
    async fn test_source_in_use_leaves_assignment_untouched() {
        let h = harness(ScriptedLauncher::new(Behavior::Healthy), false);

        let before = h.table.assign("a", "mic-1").await.unwrap();
        assert_eq!(
            h.sources.remove("mic-1"),
            Err(FleetError::SourceInUse("mic-1".to_string()))
        );
        assert_eq!(h.table.session("a").unwrap(), before);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let h = harness(ScriptedLauncher::new(Behavior::Healthy), false);

        assert_eq!(
            h.table.assign("a", "nope").await.unwrap_err(),
            FleetError::SourceNotFound("nope".to_string())
        );
        assert_eq!(h.table.session("a").unwrap().status, SessionStatus::Idle);
        assert_eq!(
            h.table.assign("zz", "mic-1").await.unwrap_err(),
            FleetError::StudioNotFound("zz".to_string())
        );
        assert_eq!(h.launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_startup_failure_leaves_studio_in_error() {
        let h = harness(ScriptedLauncher::new(Behavior::Hang), false);

        let err = h.table.assign("a", "mic-1").await.unwrap_err();
        assert!(matches!(err, FleetError::RecorderStartupTimeout(_)));

        let session = h.table.session("a").unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.recorder_id, None);
        assert_eq!(h.sources.pins("mic-1"), 0);

        // A fresh assign starts over
        assert_eq!(h.table.unassign("a").await.unwrap().status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_no_free_slot() {
        let h = harness(ScriptedLauncher::new(Behavior::Healthy), false);
        h.table.create(StudioSpec::new("Studio c").with_id("c")).unwrap();

        h.table.assign("a", "mic-1").await.unwrap();
        h.table.assign("b", "mic-2").await.unwrap();
        let err = h.table.assign("c", "mic-3").await.unwrap_err();
        assert!(matches!(err, FleetError::RecorderUnavailable(_)));

        let session = h.table.session("c").unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.error.map(|e| e.code), Some("RECORDER_UNAVAILABLE".to_string()));
        assert_eq!(h.sources.pins("mic-3"), 0);
        assert_eq!(h.launcher.launches(), 2);
        assert_bijection(&h.table);
    }

    #[tokio::test]
    async fn test_kill_during_startup_fails_assign() {
        let h = harness(ScriptedLauncher::new(Behavior::Hang), false);

        let table = h.table.clone();
        let pending = tokio::spawn(async move { table.assign("a", "mic-1").await });
        while h.launcher.launches() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.table.supervisor.kill(RecorderId(1)).await.unwrap();

        assert!(matches!(
            pending.await.unwrap(),
            Err(FleetError::RecorderUnavailable(_))
        ));
        let session = h.table.session("a").unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.recorder_id, None);
        assert_eq!(h.sources.pins("mic-1"), 0);
        assert!(h.table.bindings().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_studio_edits_are_kept() {
        let h = harness(ScriptedLauncher::new(Behavior::Healthy), false);

        for round in 0..20u8 {
            let name = format!("Studio {}", round);
            let color = format!("#0000{:02x}", round);
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    h.table
                        .update(
                            "a",
                            StudioUpdate {
                                name: Some(name.clone()),
                                ..StudioUpdate::default()
                            },
                        )
                        .unwrap()
                });
                scope.spawn(|| {
                    h.table
                        .update(
                            "a",
                            StudioUpdate {
                                color: Some(color.clone()),
                                ..StudioUpdate::default()
                            },
                        )
                        .unwrap()
                });
            });

            let studio = h.table.studio("a").unwrap();
            assert_eq!(studio.name, name);
            assert_eq!(studio.color, color);
        }
    }

    #[tokio::test]
    async fn test_crash_loop_unbinds_studio() {
        let mut h = harness(
            ScriptedLauncher::new(Behavior::CrashAfter(Duration::from_millis(20))),
            false,
        );

        h.table.assign("a", "mic-1").await.unwrap();
        timeout(Duration::from_secs(3), async {
            loop {
                if let Ok(FleetEvent::Session { session }) = h.events.recv().await {
                    if session.recorder_id.is_none() && session.status == SessionStatus::Error {
                        break;
                    }
                }
            }
        })
        .await
        .expect("studio was never unbound");

        let session = h.table.session("a").unwrap();
        assert_eq!(session.error.map(|e| e.code), Some("RECORDER_CRASHED".to_string()));
        assert!(h.table.bindings().is_empty());
        assert_eq!(h.sources.pins("mic-1"), 0);
        let stored = h.db.load_studios().unwrap();
        assert!(stored.iter().all(|s| s.bound_source_id.is_none()));
    }

    #[tokio::test]
    async fn test_studio_crud() {
        let h = harness(ScriptedLauncher::new(Behavior::Healthy), false);

        let created = h.table.create(StudioSpec::new("Newsroom")).unwrap();
        assert!(created.id.starts_with("studio-"));
        assert_eq!(created.color, DEFAULT_COLOR);

        assert!(matches!(
            h.table.create(StudioSpec::new("Dup").with_id("a")),
            Err(FleetError::InvalidStudio(_))
        ));
        assert!(matches!(
            h.table.create(StudioSpec::new("  ")),
            Err(FleetError::InvalidStudio(_))
        ));

        let updated = h
            .table
            .update(
                &created.id,
                StudioUpdate {
                    color: Some("#ff5722".to_string()),
                    ..StudioUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "Newsroom");
        assert_eq!(updated.color, "#ff5722");
        assert!(h
            .table
            .update(
                &created.id,
                StudioUpdate {
                    color: Some("blue".to_string()),
                    ..StudioUpdate::default()
                }
            )
            .is_err());

        h.table.assign("a", "mic-1").await.unwrap();
        assert!(matches!(
            h.table.delete("a"),
            Err(FleetError::AssignmentConflict(_))
        ));
        h.table.unassign("a").await.unwrap();
        h.table.delete("a").unwrap();
        assert!(h.table.get("a").is_none());

        let names: Vec<String> = h.table.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["Newsroom", "Studio b"]);
        assert_eq!(h.db.load_studios().unwrap().len(), 2);
    }
}
