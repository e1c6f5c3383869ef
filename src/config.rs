//! Configuration management for the fleet coordinator
//!
//! Loads settings from environment variables (.env file)

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Archive settings handed through to every recorder process
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Base directory; each studio records into its own subdirectory
    pub root: PathBuf,
    pub layout: String,
    /// Rotation period in seconds
    pub period: u64,
    pub clock: String,
    /// File suffix, also selects the encoder (`wav` or `opus`)
    pub format: String,
    /// Opus bitrate, ignored for wav
    pub bitrate: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/audyn"),
            layout: "dailydir".to_string(),
            period: 3600,
            clock: "localtime".to_string(),
            format: "wav".to_string(),
            bitrate: 128_000,
        }
    }
}

/// Crash-loop protection for running recorders
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Automatic restart attempts before a recorder is declared crashed
    pub max_restarts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// A restarted recorder that stays up this long gets its budget back
    pub reset_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            reset_after: Duration::from_secs(60),
        }
    }
}

/// Limits and timeouts for the recorder supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Number of recorder process slots
    pub max_recorders: usize,
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
    /// Silence on the level channel tolerated from a running recorder.
    /// `None` disables the check.
    pub health_timeout: Option<Duration>,
    pub restart: RestartPolicy,
    pub archive: ArchiveConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_recorders: 6,
            startup_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(5),
            health_timeout: Some(Duration::from_secs(3)),
            restart: RestartPolicy::default(),
            archive: ArchiveConfig::default(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Control API listen address
    pub bind_addr: SocketAddr,
    /// SQLite file holding sources, studios and bindings
    pub database_path: PathBuf,
    /// Recorder binary
    pub recorder_bin: PathBuf,
    /// Per-subscriber telemetry queue depth
    pub telemetry_queue: usize,
    /// Whether one source may feed more than one recorder at a time
    pub shared_sources: bool,
    pub supervisor: SupervisorConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = SupervisorConfig::default();

        let archive = ArchiveConfig {
            root: env::var("AUDYN_ARCHIVE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.archive.root),
            layout: env::var("AUDYN_ARCHIVE_LAYOUT").unwrap_or(defaults.archive.layout),
            period: parse_var("AUDYN_ARCHIVE_PERIOD", defaults.archive.period)?,
            clock: env::var("AUDYN_ARCHIVE_CLOCK").unwrap_or(defaults.archive.clock),
            format: env::var("AUDYN_ARCHIVE_FORMAT").unwrap_or(defaults.archive.format),
            bitrate: parse_var("AUDYN_BITRATE", defaults.archive.bitrate)?,
        };

        let restart = RestartPolicy {
            max_restarts: parse_var("AUDYN_MAX_RESTARTS", defaults.restart.max_restarts)?,
            base_delay: millis_var("AUDYN_RESTART_BASE_MS", defaults.restart.base_delay)?,
            max_delay: millis_var("AUDYN_RESTART_MAX_MS", defaults.restart.max_delay)?,
            reset_after: Duration::from_secs(parse_var(
                "AUDYN_RESTART_RESET_SECS",
                defaults.restart.reset_after.as_secs(),
            )?),
        };

        let health_ms: u64 = parse_var("AUDYN_HEALTH_TIMEOUT_MS", 3000)?;

        let supervisor = SupervisorConfig {
            max_recorders: parse_var("AUDYN_MAX_RECORDERS", defaults.max_recorders)?,
            startup_timeout: millis_var("AUDYN_STARTUP_TIMEOUT_MS", defaults.startup_timeout)?,
            stop_grace: millis_var("AUDYN_STOP_GRACE_MS", defaults.stop_grace)?,
            health_timeout: (health_ms > 0).then(|| Duration::from_millis(health_ms)),
            restart,
            archive,
        };

        if supervisor.max_recorders == 0 {
            return Err(ConfigError::InvalidValue(
                "AUDYN_MAX_RECORDERS".to_string(),
                "0".to_string(),
            ));
        }

        let telemetry_queue = parse_var("AUDYN_TELEMETRY_QUEUE", 64usize)?.max(1);

        Ok(Self {
            bind_addr: parse_var("AUDYN_BIND", SocketAddr::from(([0, 0, 0, 0], 8000)))?,
            database_path: env::var("AUDYN_DB_PATH")
                .unwrap_or_else(|_| "audyn_fleet.db".to_string())
                .into(),
            recorder_bin: env::var("AUDYN_BIN")
                .unwrap_or_else(|_| "/usr/bin/audyn".to_string())
                .into(),
            telemetry_queue,
            shared_sources: parse_var("AUDYN_SHARED_SOURCES", false)?,
            supervisor,
        })
    }
}

/// Read an optional variable, falling back to `default` when unset or empty
fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(s) if !s.trim().is_empty() => s
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), s)),
        _ => Ok(default),
    }
}

fn millis_var(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    let ms = parse_var(name, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}
