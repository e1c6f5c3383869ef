//! Recorder stdout protocol
//!
//! audyn writes newline-delimited JSON to stdout. Anything that does not
//! parse is ignored.

use serde::{Deserialize, Serialize};

/// Floor of the level meter
pub const MIN_DB: f32 = -60.0;

/// Level reading for one channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelLevel {
    pub name: String,
    pub rms_db: f32,
    pub peak_db: f32,
    /// `10^(rms_db / 20)`
    pub level_linear: f32,
    pub clipping: bool,
}

impl ChannelLevel {
    pub fn new(name: impl Into<String>, rms_db: f32, peak_db: f32, clipping: bool) -> Self {
        Self {
            name: name.into(),
            rms_db,
            peak_db,
            level_linear: 10f32.powf(rms_db / 20.0),
            clipping,
        }
    }

    pub fn silence(name: impl Into<String>) -> Self {
        Self::new(name, MIN_DB, MIN_DB, false)
    }
}

/// Parsed line of recorder output
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderOutput {
    /// Explicit readiness signal
    Ready,
    Levels(Vec<ChannelLevel>),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireMessage {
    Ready,
    Levels(WireLevels),
}

#[derive(Deserialize)]
struct WireLevels {
    #[serde(default = "default_channels")]
    channels: u16,
    left: Option<WireChannel>,
    right: Option<WireChannel>,
}

#[derive(Deserialize)]
struct WireChannel {
    #[serde(default = "min_db")]
    rms_db: f32,
    #[serde(default = "min_db")]
    peak_db: f32,
    #[serde(default)]
    clipping: bool,
}

fn default_channels() -> u16 {
    2
}

fn min_db() -> f32 {
    MIN_DB
}

impl WireChannel {
    fn into_level(self, name: &str) -> ChannelLevel {
        ChannelLevel::new(name, self.rms_db, self.peak_db, self.clipping)
    }
}

/// Parse one stdout line
pub fn parse_line(line: &str) -> Option<RecorderOutput> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }

    match serde_json::from_str::<WireMessage>(line).ok()? {
        WireMessage::Ready => Some(RecorderOutput::Ready),
        WireMessage::Levels(levels) => {
            // A missing channel reads as silence
            let mut channels = Vec::with_capacity(2);
            channels.push(match levels.left {
                Some(left) => left.into_level("L"),
                None => ChannelLevel::silence("L"),
            });
            if levels.channels >= 2 {
                channels.push(match levels.right {
                    Some(right) => right.into_level("R"),
                    None => ChannelLevel::silence("R"),
                });
            }
            Some(RecorderOutput::Levels(channels))
        }
    }
}
