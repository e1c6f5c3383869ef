//! Recorder launcher abstraction
//!
//! Production code spawns real audyn processes; tests substitute an
//! in-process scripted recorder behind the same traits.

use super::protocol::{parse_line, RecorderOutput};
use super::RecorderId;
use crate::config::ArchiveConfig;
use crate::sources::Source;
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info};

const OUTPUT_BUFFER: usize = 256;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Failed to prepare archive directory {0:?}: {1}")]
    Archive(PathBuf, io::Error),
    #[error("Failed to spawn {0:?}: {1}")]
    Spawn(PathBuf, io::Error),
    #[error("Recorder stdout not captured")]
    NoStdout,
}

/// Everything needed to launch one recorder
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub recorder_id: RecorderId,
    pub source: Source,
    /// Archive directory for this recorder
    pub destination: PathBuf,
    pub archive: ArchiveConfig,
}

impl LaunchSpec {
    /// audyn command line arguments
    pub fn args(&self) -> Vec<String> {
        let codec = &self.source.codec;
        let mut args = vec![
            "--archive-root".to_string(),
            self.destination.display().to_string(),
            "--archive-layout".to_string(),
            self.archive.layout.clone(),
            "--archive-period".to_string(),
            self.archive.period.to_string(),
            "--archive-clock".to_string(),
            self.archive.clock.clone(),
            "--archive-suffix".to_string(),
            self.archive.format.clone(),
            "-m".to_string(),
            self.source.multicast_address.to_string(),
            "-p".to_string(),
            self.source.port.to_string(),
            "--pt".to_string(),
            codec.payload_type.to_string(),
            "--spp".to_string(),
            codec.samples_per_packet.to_string(),
            "-r".to_string(),
            codec.sample_rate.to_string(),
            "-c".to_string(),
            codec.channels.to_string(),
        ];

        if self.archive.format == "opus" {
            args.push("--bitrate".to_string());
            args.push(self.archive.bitrate.to_string());
        }

        args.push("--levels".to_string());
        args
    }
}

/// How a recorder process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    /// Exit status 0
    Graceful,
    Crashed(String),
}

impl ExitKind {
    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            return ExitKind::Graceful;
        }
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitKind::Crashed(format!("exit status {}", code)),
            (None, Some(sig)) => ExitKind::Crashed(format!("killed by signal {}", sig)),
            _ => ExitKind::Crashed("terminated abnormally".to_string()),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ExitKind::Graceful => "exited normally".to_string(),
            ExitKind::Crashed(reason) => reason.clone(),
        }
    }
}

/// Control handle for a launched recorder
#[async_trait]
pub trait RecorderProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Ask the recorder to finish its current file and exit
    fn terminate(&mut self) -> io::Result<()>;

    async fn kill(&mut self) -> io::Result<()>;

    /// Wait for the process to exit. Cancel-safe.
    async fn wait(&mut self) -> io::Result<ExitKind>;
}

/// A launched recorder with its parsed output channel
pub struct SpawnedRecorder {
    pub process: Box<dyn RecorderProcess>,
    pub output: mpsc::Receiver<RecorderOutput>,
}

/// Starts recorder processes
#[async_trait]
pub trait RecorderLauncher: Send + Sync + 'static {
    async fn launch(&self, spec: &LaunchSpec) -> Result<SpawnedRecorder, LaunchError>;
}

/// Launches the audyn binary
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: PathBuf,
}

impl ProcessLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl RecorderLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<SpawnedRecorder, LaunchError> {
        tokio::fs::create_dir_all(&spec.destination)
            .await
            .map_err(|e| LaunchError::Archive(spec.destination.clone(), e))?;

        let args = spec.args();
        info!(
            "Starting recorder {}: {} {}",
            spec.recorder_id,
            self.binary.display(),
            args.join(" ")
        );

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::Spawn(self.binary.clone(), e))?;

        let stdout = child.stdout.take().ok_or(LaunchError::NoStdout)?;
        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(output) = parse_line(&line) {
                    if tx.send(output).await.is_err() {
                        break;
                    }
                }
            }
        });

        if let Some(stderr) = child.stderr.take() {
            let id = spec.recorder_id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(recorder_id = %id, "{}", line.trim_end());
                }
            });
        }

        info!("Recorder {} started with PID {:?}", spec.recorder_id, child.id());

        Ok(SpawnedRecorder {
            process: Box::new(ChildProcess { child }),
            output: rx,
        })
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl RecorderProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn terminate(&mut self) -> io::Result<()> {
        match self.child.id() {
            Some(pid) => signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from),
            // Already reaped
            None => Ok(()),
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    async fn wait(&mut self) -> io::Result<ExitKind> {
        self.child.wait().await.map(ExitKind::from_status)
    }
}
