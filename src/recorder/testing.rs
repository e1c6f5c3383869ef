//! In-process stand-in for the audyn binary

use super::launcher::{
    ExitKind, LaunchError, LaunchSpec, RecorderLauncher, RecorderProcess, SpawnedRecorder,
};
use super::protocol::{ChannelLevel, RecorderOutput};
use crate::config::{ArchiveConfig, RestartPolicy, SupervisorConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{interval, sleep};

/// Supervisor settings scaled down for tests: two slots, 200 ms startup
/// deadline, 100 ms stop grace, 300 ms health timeout, 10-50 ms backoff
pub fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        max_recorders: 2,
        startup_timeout: Duration::from_millis(200),
        stop_grace: Duration::from_millis(100),
        health_timeout: Some(Duration::from_millis(300)),
        restart: RestartPolicy {
            max_restarts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            reset_after: Duration::from_secs(60),
        },
        archive: ArchiveConfig {
            root: PathBuf::from("/tmp/audyn-fleet-test"),
            ..ArchiveConfig::default()
        },
    }
}

/// How a scripted recorder behaves once launched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Ready, then levels at the launcher cadence until terminated
    Healthy,
    /// Healthy, then exits with status 1 after the given time
    CrashAfter(Duration),
    /// Never signals readiness
    Hang,
    ExitBeforeReady,
    /// Healthy but ignores SIGTERM
    IgnoreTerm,
    FailSpawn,
    /// Ready, then no level output at all
    Silent,
}

#[derive(Default)]
struct Counters {
    launches: AtomicUsize,
    terminations: AtomicUsize,
    kills: AtomicUsize,
    next_pid: AtomicU32,
}

pub struct ScriptedLauncher {
    script: Mutex<VecDeque<Behavior>>,
    default: Behavior,
    cadence: Duration,
    counters: Arc<Counters>,
    specs: Mutex<Vec<LaunchSpec>>,
}

impl ScriptedLauncher {
    pub fn new(default: Behavior) -> Self {
        Self::scripted(Vec::new(), default)
    }

    /// Play `script` in order, then fall back to `default`
    pub fn scripted(script: Vec<Behavior>, default: Behavior) -> Self {
        Self {
            script: Mutex::new(script.into()),
            default,
            cadence: Duration::from_millis(10),
            counters: Arc::new(Counters::default()),
            specs: Mutex::new(Vec::new()),
        }
    }

    pub fn launches(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.counters.terminations.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.counters.kills.load(Ordering::SeqCst)
    }

    pub fn specs(&self) -> Vec<LaunchSpec> {
        self.specs.lock().clone()
    }
}

#[async_trait]
impl RecorderLauncher for ScriptedLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<SpawnedRecorder, LaunchError> {
        let behavior = self.script.lock().pop_front().unwrap_or(self.default);
        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().push(spec.clone());

        if behavior == Behavior::FailSpawn {
            return Err(LaunchError::Spawn(
                PathBuf::from("audyn"),
                io::Error::new(io::ErrorKind::NotFound, "scripted spawn failure"),
            ));
        }

        let (output_tx, output_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = watch::channel(None);
        let control = Arc::new(Control::default());

        tokio::spawn(simulate(behavior, self.cadence, output_tx, exit_tx, control.clone()));

        let pid = 10_000 + self.counters.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(SpawnedRecorder {
            process: Box::new(FakeProcess {
                pid,
                control,
                exit: exit_rx,
                counters: self.counters.clone(),
            }),
            output: output_rx,
        })
    }
}

#[derive(Default)]
struct Control {
    term: Notify,
    kill: Notify,
}

fn levels() -> RecorderOutput {
    RecorderOutput::Levels(vec![
        ChannelLevel::new("L", -18.0, -9.0, false),
        ChannelLevel::new("R", -20.0, -11.0, false),
    ])
}

async fn simulate(
    behavior: Behavior,
    cadence: Duration,
    output: mpsc::Sender<RecorderOutput>,
    exit: watch::Sender<Option<ExitKind>>,
    control: Arc<Control>,
) {
    let killed = ExitKind::Crashed("killed by signal 9".to_string());

    let kind = match behavior {
        Behavior::Hang => {
            control.kill.notified().await;
            killed
        }
        Behavior::ExitBeforeReady | Behavior::FailSpawn => ExitKind::Crashed("exit status 2".to_string()),
        _ => {
            let _ = output.send(RecorderOutput::Ready).await;

            let emits = behavior != Behavior::Silent;
            let honours_term = behavior != Behavior::IgnoreTerm;
            let crash_after = match behavior {
                Behavior::CrashAfter(after) => after,
                _ => Duration::from_secs(3600),
            };
            let crash = sleep(crash_after);
            tokio::pin!(crash);
            let mut ticks = interval(cadence);

            loop {
                tokio::select! {
                    _ = ticks.tick(), if emits => {
                        let _ = output.try_send(levels());
                    }
                    _ = control.term.notified(), if honours_term => break ExitKind::Graceful,
                    _ = control.kill.notified() => break killed,
                    _ = &mut crash => break ExitKind::Crashed("exit status 1".to_string()),
                }
            }
        }
    };

    drop(output);
    let _ = exit.send(Some(kind));
}

struct FakeProcess {
    pid: u32,
    control: Arc<Control>,
    exit: watch::Receiver<Option<ExitKind>>,
    counters: Arc<Counters>,
}

impl FakeProcess {
    fn exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

#[async_trait]
impl RecorderProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        (!self.exited()).then_some(self.pid)
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.counters.terminations.fetch_add(1, Ordering::SeqCst);
        self.control.term.notify_one();
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        if !self.exited() {
            self.counters.kills.fetch_add(1, Ordering::SeqCst);
            self.control.kill.notify_one();
        }
        self.wait().await.map(|_| ())
    }

    async fn wait(&mut self) -> io::Result<ExitKind> {
        let exit = self
            .exit
            .wait_for(Option::is_some)
            .await
            .map(|kind| kind.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "simulator vanished"))?;
        Ok(exit.unwrap_or(ExitKind::Graceful))
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        self.control.kill.notify_one();
    }
}
