//! Recorder process supervisor
//!
//! Every recorder gets its own monitor task that owns the process handle and
//! drives it through `Starting -> Running -> Stopping -> Stopped`, with the
//! `Error` detour for crashes, startup timeouts and health-check failures.
//! Callers talk to the monitor through a small command channel.

use super::launcher::{LaunchSpec, RecorderLauncher, RecorderProcess, SpawnedRecorder};
use super::protocol::{ChannelLevel, RecorderOutput};
use super::{RecorderId, RecorderInfo, RecorderState};
use crate::config::{RestartPolicy, SupervisorConfig};
use crate::error::{FleetError, FleetResult};
use crate::events::{EventBus, FleetEvent};
use crate::sources::Source;
use crate::telemetry::TelemetryMux;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 8;

/// Why a recorder left the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetireReason {
    Stopped,
    Killed,
    /// Initial start failed; the error went back to the caller
    Failed(FleetError),
    /// Restart budget exhausted
    Crashed(FleetError),
    /// Stopped as part of process shutdown
    Shutdown,
}

/// Notification sent once a recorder is gone for good
#[derive(Debug, Clone)]
pub struct RetiredRecorder {
    pub recorder_id: RecorderId,
    pub source_id: String,
    pub studio_id: Option<String>,
    pub reason: RetireReason,
}

/// Snapshot returned by [`Supervisor::health`]
#[derive(Debug, Clone, Serialize)]
pub struct FleetHealth {
    pub capacity: usize,
    pub in_use: usize,
    pub recorders: Vec<RecorderInfo>,
}

enum Command {
    Stop {
        grace: Duration,
        reply: oneshot::Sender<()>,
    },
    Kill {
        reply: oneshot::Sender<()>,
    },
}

struct RecorderEntry {
    info: Arc<RwLock<RecorderInfo>>,
    commands: mpsc::Sender<Command>,
}

/// Owns every recorder process of the fleet
pub struct Supervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn RecorderLauncher>,
    recorders: DashMap<RecorderId, RecorderEntry>,
    slots: Arc<Semaphore>,
    next_id: AtomicU64,
    telemetry: Arc<TelemetryMux>,
    events: EventBus,
    retired_tx: mpsc::UnboundedSender<RetiredRecorder>,
    shutting_down: AtomicBool,
}

impl Supervisor {
    /// Create a supervisor. The returned receiver yields every retired
    /// recorder exactly once.
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn RecorderLauncher>,
        telemetry: Arc<TelemetryMux>,
        events: EventBus,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RetiredRecorder>) {
        let (retired_tx, retired_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            slots: Arc::new(Semaphore::new(config.max_recorders)),
            config,
            launcher,
            recorders: DashMap::new(),
            next_id: AtomicU64::new(1),
            telemetry,
            events,
            retired_tx,
            shutting_down: AtomicBool::new(false),
        });
        (supervisor, retired_rx)
    }

    /// Start a recorder for `source` and wait until it is running.
    ///
    /// Fails with `RecorderUnavailable` when no process slot is free or the
    /// launch itself fails, `RecorderStartupTimeout` when no readiness signal
    /// arrives in time and `RecorderCrashed` when the process exits first.
    pub async fn start(
        self: &Arc<Self>,
        source: &Source,
        studio_id: Option<&str>,
    ) -> FleetResult<RecorderInfo> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(FleetError::RecorderUnavailable(
                "supervisor is shutting down".to_string(),
            ));
        }

        let permit = self.slots.clone().try_acquire_owned().map_err(|_| {
            FleetError::RecorderUnavailable(format!(
                "all {} recorder slots are in use",
                self.config.max_recorders
            ))
        })?;

        let id = RecorderId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let destination = match studio_id {
            Some(studio) => self.config.archive.root.join(studio),
            None => self.config.archive.root.join(format!("recorder-{}", id)),
        };
        let spec = LaunchSpec {
            recorder_id: id,
            source: source.clone(),
            destination,
            archive: self.config.archive.clone(),
        };

        let info = Arc::new(RwLock::new(RecorderInfo::new(
            id,
            source.id.clone(),
            studio_id.map(str::to_string),
        )));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        self.recorders.insert(
            id,
            RecorderEntry {
                info: info.clone(),
                commands: commands_tx,
            },
        );
        self.publish_state(&info.read());

        let (ready_tx, ready_rx) = oneshot::channel();
        let monitor = Monitor {
            supervisor: self.clone(),
            id,
            spec,
            info,
            commands: commands_rx,
            permit: Some(permit),
            ready: Some(ready_tx),
            reply: None,
        };
        tokio::spawn(monitor.run());

        ready_rx.await.unwrap_or_else(|_| {
            Err(FleetError::RecorderUnavailable(format!(
                "recorder {} monitor exited",
                id
            )))
        })
    }

    /// Gracefully stop a recorder, escalating to kill after `grace`.
    ///
    /// Resolves once the recorder has been retired. Unknown ids are a no-op.
    pub async fn stop(&self, id: RecorderId, grace: Option<Duration>) -> FleetResult<()> {
        let Some(commands) = self.recorders.get(&id).map(|e| e.commands.clone()) else {
            return Ok(());
        };
        let (reply, done) = oneshot::channel();
        let grace = grace.unwrap_or(self.config.stop_grace);
        if commands.send(Command::Stop { grace, reply }).await.is_ok() {
            // Dropped reply means the monitor retired the recorder on its own
            let _ = done.await;
        }
        Ok(())
    }

    /// Kill a recorder immediately
    pub async fn kill(&self, id: RecorderId) -> FleetResult<()> {
        let commands = self
            .recorders
            .get(&id)
            .map(|e| e.commands.clone())
            .ok_or(FleetError::RecorderNotFound(id))?;
        let (reply, done) = oneshot::channel();
        if commands.send(Command::Kill { reply }).await.is_ok() {
            let _ = done.await;
        }
        Ok(())
    }

    pub fn get(&self, id: RecorderId) -> Option<RecorderInfo> {
        self.recorders.get(&id).map(|e| e.info.read().clone())
    }

    pub fn health(&self) -> FleetHealth {
        let mut recorders: Vec<RecorderInfo> = self
            .recorders
            .iter()
            .map(|e| e.info.read().clone())
            .collect();
        recorders.sort_by_key(|r| r.id);

        FleetHealth {
            capacity: self.config.max_recorders,
            in_use: self.config.max_recorders - self.slots.available_permits(),
            recorders,
        }
    }

    /// Stop every recorder and refuse new starts
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let ids: Vec<RecorderId> = self.recorders.iter().map(|e| *e.key()).collect();
        if ids.is_empty() {
            return;
        }
        info!("Stopping {} recorders", ids.len());
        join_all(ids.into_iter().map(|id| self.stop(id, None))).await;
    }

    fn publish_state(&self, info: &RecorderInfo) {
        self.events.publish(FleetEvent::RecorderState {
            recorder_id: info.id,
            source_id: info.source_id.clone(),
            state: info.state,
            error: info.last_error.clone(),
            at: Utc::now(),
        });
    }

    fn retire(&self, id: RecorderId, reason: RetireReason) {
        let Some((_, entry)) = self.recorders.remove(&id) else {
            return;
        };
        self.telemetry.close(id, "recorder retired");

        let info = entry.info.read().clone();
        let reason = match reason {
            RetireReason::Stopped if self.shutting_down.load(Ordering::SeqCst) => {
                RetireReason::Shutdown
            }
            other => other,
        };
        info!("Recorder {} retired ({:?})", id, reason);

        let _ = self.retired_tx.send(RetiredRecorder {
            recorder_id: id,
            source_id: info.source_id,
            studio_id: info.studio_id,
            reason,
        });
    }
}

/// Exponential backoff with equal jitter.
///
/// `base * 2^attempt`, capped at `max_delay`; half of that is fixed and the
/// other half scaled by `jitter` in `[0, 1]`.
pub fn backoff_delay(policy: &RestartPolicy, attempt: u32, jitter: f64) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(20));
    let capped = policy.base_delay.saturating_mul(factor).min(policy.max_delay);
    let half = capped / 2;
    half + half.mul_f64(jitter.clamp(0.0, 1.0))
}

enum Launch {
    Ready(SpawnedRecorder, Option<Vec<ChannelLevel>>),
    Failed(FleetError),
    Interrupted(Command),
}

enum RunEnd {
    Finished(RetireReason),
    Failed(FleetError),
}

struct Monitor {
    supervisor: Arc<Supervisor>,
    id: RecorderId,
    spec: LaunchSpec,
    info: Arc<RwLock<RecorderInfo>>,
    commands: mpsc::Receiver<Command>,
    permit: Option<OwnedSemaphorePermit>,
    ready: Option<oneshot::Sender<FleetResult<RecorderInfo>>>,
    reply: Option<oneshot::Sender<()>>,
}

impl Monitor {
    async fn run(mut self) {
        let reason = self.lifecycle().await;
        let failure = match &reason {
            RetireReason::Failed(e) | RetireReason::Crashed(e) => Some(e.clone()),
            _ => None,
        };
        self.supervisor.retire(self.id, reason);

        // Free the slot before anyone waiting on us resumes
        drop(self.permit.take());

        if let Some(reply) = self.reply.take() {
            let _ = reply.send(());
        }
        if let Some(ready) = self.ready.take() {
            let err = failure.unwrap_or_else(|| {
                FleetError::RecorderUnavailable(format!(
                    "recorder {} was stopped before it became ready",
                    self.id
                ))
            });
            let _ = ready.send(Err(err));
        }
    }

    async fn lifecycle(&mut self) -> RetireReason {
        let policy = self.supervisor.config.restart.clone();
        let mut failures = 0u32;

        loop {
            let failure = match self.launch_once().await {
                Launch::Ready(spawned, first) => {
                    self.transition(RecorderState::Running, None);
                    if let Some(ready) = self.ready.take() {
                        let info = self.info.read().clone();
                        if ready.send(Ok(info)).is_err() {
                            warn!("Start request for recorder {} was abandoned, stopping", self.id);
                            let mut process = spawned.process;
                            let grace = self.supervisor.config.stop_grace;
                            self.transition(RecorderState::Stopping, None);
                            self.halt(&mut process, Some(grace)).await;
                            self.transition(RecorderState::Stopped, None);
                            return RetireReason::Stopped;
                        }
                    }

                    let started = Instant::now();
                    match self.supervise(spawned, first).await {
                        RunEnd::Finished(reason) => return reason,
                        RunEnd::Failed(err) => {
                            if started.elapsed() >= policy.reset_after {
                                failures = 0;
                            }
                            err
                        }
                    }
                }
                Launch::Failed(err) => err,
                Launch::Interrupted(command) => return self.finish_idle(command),
            };

            self.transition(RecorderState::Error, Some(&failure));

            // Initial start failures go straight back to the caller
            if self.ready.is_some() {
                return RetireReason::Failed(failure);
            }

            failures += 1;
            if failures > policy.max_restarts {
                let crashed = FleetError::RecorderCrashed(
                    self.id,
                    format!("gave up after {} restarts: {}", policy.max_restarts, failure),
                );
                error!("{}", crashed);
                let snapshot = {
                    let mut info = self.info.write();
                    info.last_error = Some(crashed.to_info());
                    info.clone()
                };
                self.supervisor.publish_state(&snapshot);
                return RetireReason::Crashed(crashed);
            }

            let delay = backoff_delay(&policy, failures - 1, rand::random::<f64>());
            warn!(
                "Recorder {} failed ({}), restart {}/{} in {:?}",
                self.id, failure, failures, policy.max_restarts, delay
            );

            tokio::select! {
                _ = sleep(delay) => {}
                Some(command) = self.commands.recv() => return self.finish_idle(command),
            }

            {
                let mut info = self.info.write();
                info.restarts += 1;
                info.started_at = Utc::now();
            }
            self.transition(RecorderState::Starting, None);
        }
    }

    /// Launch the process and wait for its readiness signal
    async fn launch_once(&mut self) -> Launch {
        let SpawnedRecorder {
            mut process,
            mut output,
        } = match self.supervisor.launcher.launch(&self.spec).await {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("Failed to launch recorder {}: {}", self.id, e);
                return Launch::Failed(FleetError::RecorderUnavailable(e.to_string()));
            }
        };
        self.info.write().pid = process.pid();

        let deadline = sleep(self.supervisor.config.startup_timeout);
        tokio::pin!(deadline);
        let mut output_open = true;

        loop {
            tokio::select! {
                message = output.recv(), if output_open => match message {
                    Some(RecorderOutput::Ready) => {
                        return Launch::Ready(SpawnedRecorder { process, output }, None);
                    }
                    Some(RecorderOutput::Levels(channels)) => {
                        return Launch::Ready(SpawnedRecorder { process, output }, Some(channels));
                    }
                    None => output_open = false,
                },
                exit = process.wait() => {
                    let reason = match exit {
                        Ok(kind) => format!("exited before becoming ready ({})", kind.describe()),
                        Err(e) => format!("wait failed: {}", e),
                    };
                    return Launch::Failed(FleetError::RecorderCrashed(self.id, reason));
                }
                _ = &mut deadline => {
                    warn!("Recorder {} not ready after {:?}, killing", self.id, self.supervisor.config.startup_timeout);
                    if let Err(e) = process.kill().await {
                        warn!("Failed to kill recorder {}: {}", self.id, e);
                    }
                    return Launch::Failed(FleetError::RecorderStartupTimeout(self.id));
                }
                Some(command) = self.commands.recv() => {
                    if let Err(e) = process.kill().await {
                        warn!("Failed to kill recorder {}: {}", self.id, e);
                    }
                    return Launch::Interrupted(command);
                }
            }
        }
    }

    /// Relay output of a running recorder until it stops or fails
    async fn supervise(
        &mut self,
        spawned: SpawnedRecorder,
        first: Option<Vec<ChannelLevel>>,
    ) -> RunEnd {
        let SpawnedRecorder {
            mut process,
            mut output,
        } = spawned;
        let telemetry = self.supervisor.telemetry.clone();
        let health_timeout = self.supervisor.config.health_timeout;

        if let Some(channels) = first {
            telemetry.publish(self.id, channels);
        }

        let mut last_output = Instant::now();
        let mut output_open = true;
        let mut health = interval(
            health_timeout
                .map(|t| (t / 2).max(Duration::from_millis(10)))
                .unwrap_or(Duration::from_secs(1)),
        );
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = output.recv(), if output_open => match message {
                    Some(RecorderOutput::Levels(channels)) => {
                        last_output = Instant::now();
                        telemetry.publish(self.id, channels);
                    }
                    Some(RecorderOutput::Ready) => last_output = Instant::now(),
                    None => {
                        debug!("Recorder {} closed its output", self.id);
                        output_open = false;
                    }
                },
                exit = process.wait() => {
                    let reason = match exit {
                        Ok(kind) => format!("exited unexpectedly ({})", kind.describe()),
                        Err(e) => format!("wait failed: {}", e),
                    };
                    warn!("Recorder {} {}", self.id, reason);
                    return RunEnd::Failed(FleetError::RecorderCrashed(self.id, reason));
                }
                Some(command) = self.commands.recv() => {
                    return RunEnd::Finished(self.finish_running(&mut process, command).await);
                }
                _ = health.tick(), if health_timeout.is_some() => {
                    let limit = health_timeout.unwrap_or_default();
                    let silent = last_output.elapsed();
                    if silent > limit {
                        warn!("Recorder {} silent for {:?}, killing", self.id, silent);
                        self.halt(&mut process, None).await;
                        return RunEnd::Failed(FleetError::RecorderCrashed(
                            self.id,
                            format!("no level output for {} ms", silent.as_millis()),
                        ));
                    }
                }
            }
        }
    }

    async fn finish_running(
        &mut self,
        process: &mut Box<dyn RecorderProcess>,
        command: Command,
    ) -> RetireReason {
        self.transition(RecorderState::Stopping, None);
        let reason = match command {
            Command::Stop { grace, reply } => {
                self.reply = Some(reply);
                self.halt(process, Some(grace)).await;
                RetireReason::Stopped
            }
            Command::Kill { reply } => {
                self.reply = Some(reply);
                self.halt(process, None).await;
                RetireReason::Killed
            }
        };
        self.transition(RecorderState::Stopped, None);
        reason
    }

    /// Stop or kill request while no process is running
    fn finish_idle(&mut self, command: Command) -> RetireReason {
        self.transition(RecorderState::Stopping, None);
        let reason = match command {
            Command::Stop { reply, .. } => {
                self.reply = Some(reply);
                RetireReason::Stopped
            }
            Command::Kill { reply } => {
                self.reply = Some(reply);
                RetireReason::Killed
            }
        };
        self.transition(RecorderState::Stopped, None);
        reason
    }

    /// SIGTERM and wait up to `grace`, then kill. `None` kills right away.
    async fn halt(&self, process: &mut Box<dyn RecorderProcess>, grace: Option<Duration>) {
        if let Some(grace) = grace {
            match process.terminate() {
                Ok(()) => match timeout(grace, process.wait()).await {
                    Ok(Ok(kind)) => {
                        info!("Recorder {} stopped ({})", self.id, kind.describe());
                        return;
                    }
                    Ok(Err(e)) => warn!("Failed to wait for recorder {}: {}", self.id, e),
                    Err(_) => warn!(
                        "Recorder {} did not exit within {:?}, killing",
                        self.id, grace
                    ),
                },
                Err(e) => warn!("Failed to signal recorder {}: {}", self.id, e),
            }
        }

        if let Err(e) = process.kill().await {
            warn!("Failed to kill recorder {}: {}", self.id, e);
        }
    }

    fn transition(&self, next: RecorderState, error: Option<&FleetError>) {
        let (previous, snapshot) = {
            let mut info = self.info.write();
            if !info.state.can_transition_to(next) {
                warn!(
                    "Recorder {}: ignoring transition {:?} -> {:?}",
                    self.id, info.state, next
                );
                return;
            }
            let previous = info.state;
            info.state = next;
            info.since = Utc::now();
            if let Some(e) = error {
                info.last_error = Some(e.to_info());
            }
            if matches!(next, RecorderState::Error | RecorderState::Stopped) {
                info.pid = None;
            }
            (previous, info.clone())
        };

        debug!("Recorder {}: {:?} -> {:?}", self.id, previous, next);

        let telemetry = &self.supervisor.telemetry;
        if next == RecorderState::Running {
            telemetry.open(self.id);
        } else if previous == RecorderState::Running {
            telemetry.close(self.id, &format!("recorder {:?}", next).to_lowercase());
        }

        self.supervisor.publish_state(&snapshot);
    }
}
