//! Source registry
//!
//! Holds the configured AES67 multicast sources. A source is pinned while an
//! assignment records from it; pinned sources can be neither edited nor
//! removed.

use crate::error::{FleetError, FleetResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info};
use uuid::Uuid;

pub type SourceId = String;

const SUPPORTED_SAMPLE_RATES: [u32; 3] = [44_100, 48_000, 96_000];
const MAX_CHANNELS: u16 = 8;

/// RTP stream parameters passed to the recorder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub payload_type: u8,
    pub samples_per_packet: u32,
}

impl Default for CodecParams {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            payload_type: 96,
            samples_per_packet: 48,
        }
    }
}

/// A configured network audio source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub multicast_address: IpAddr,
    pub port: u16,
    pub codec: CodecParams,
    pub description: Option<String>,
    pub enabled: bool,
}

/// Create / edit request for a source
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub multicast_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub codec: CodecParams,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_port() -> u16 {
    5004
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
impl SourceSpec {
    pub fn new(name: impl Into<String>, multicast_address: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            multicast_address: multicast_address.into(),
            port: default_port(),
            codec: CodecParams::default(),
            description: None,
            enabled: true,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

struct Entry {
    source: Source,
    /// Number of assignments currently recording from this source
    pins: usize,
}

/// Registry of configured sources
pub struct SourceRegistry {
    entries: RwLock<HashMap<SourceId, Entry>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// All sources, ordered by name
    pub fn list(&self) -> Vec<Source> {
        let entries = self.entries.read();
        let mut sources: Vec<Source> = entries.values().map(|e| e.source.clone()).collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        sources
    }

    pub fn get(&self, id: &str) -> Option<Source> {
        self.entries.read().get(id).map(|e| e.source.clone())
    }

    /// Register a new source
    pub fn add(&self, spec: SourceSpec) -> FleetResult<Source> {
        let mut entries = self.entries.write();

        let id = match &spec.id {
            Some(id) if id.trim().is_empty() => {
                return Err(FleetError::InvalidSource("id must not be empty".to_string()))
            }
            Some(id) => id.trim().to_string(),
            None => Uuid::new_v4().simple().to_string()[..8].to_string(),
        };
        if entries.contains_key(&id) {
            return Err(FleetError::InvalidSource(format!("source id {} already exists", id)));
        }

        let source = validate(&entries, &id, spec)?;
        info!("Source added: {} ({}:{})", source.id, source.multicast_address, source.port);
        entries.insert(id, Entry { source: source.clone(), pins: 0 });
        Ok(source)
    }

    /// Administrative edit; refused while an assignment records from it
    pub fn update(&self, id: &str, spec: SourceSpec) -> FleetResult<Source> {
        let mut entries = self.entries.write();

        match entries.get(id) {
            None => return Err(FleetError::SourceNotFound(id.to_string())),
            Some(entry) if entry.pins > 0 => return Err(FleetError::SourceInUse(id.to_string())),
            Some(_) => {}
        }

        let source = validate(&entries, id, spec)?;
        if let Some(entry) = entries.get_mut(id) {
            entry.source = source.clone();
        }
        info!("Source updated: {}", id);
        Ok(source)
    }

    /// Remove an unreferenced source
    pub fn remove(&self, id: &str) -> FleetResult<Source> {
        let mut entries = self.entries.write();

        match entries.get(id) {
            None => Err(FleetError::SourceNotFound(id.to_string())),
            Some(entry) if entry.pins > 0 => Err(FleetError::SourceInUse(id.to_string())),
            Some(_) => {
                let entry = entries.remove(id).ok_or_else(|| FleetError::SourceNotFound(id.to_string()))?;
                info!("Source removed: {}", id);
                Ok(entry.source)
            }
        }
    }

    /// Pin a source for a new binding.
    ///
    /// With `exclusive` set, a source that already backs a binding is refused
    /// with `RecorderUnavailable`.
    pub fn acquire(&self, id: &str, exclusive: bool) -> FleetResult<Source> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| FleetError::SourceNotFound(id.to_string()))?;

        if !entry.source.enabled {
            return Err(FleetError::InvalidSource(format!("source {} is disabled", id)));
        }
        if exclusive && entry.pins > 0 {
            return Err(FleetError::RecorderUnavailable(format!(
                "source {} is already being recorded",
                id
            )));
        }

        entry.pins += 1;
        debug!("Source {} pinned ({} bindings)", id, entry.pins);
        Ok(entry.source.clone())
    }

    /// Drop a pin taken by [`SourceRegistry::acquire`]
    pub fn release(&self, id: &str) {
        if let Some(entry) = self.entries.write().get_mut(id) {
            entry.pins = entry.pins.saturating_sub(1);
            debug!("Source {} released ({} bindings)", id, entry.pins);
        }
    }

    #[cfg(test)]
    pub fn pins(&self, id: &str) -> usize {
        self.entries.read().get(id).map(|e| e.pins).unwrap_or(0)
    }

    /// Load a previously persisted source without re-running id generation
    pub fn restore(&self, source: Source) {
        self.entries
            .write()
            .insert(source.id.clone(), Entry { source, pins: 0 });
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(entries: &HashMap<SourceId, Entry>, id: &str, spec: SourceSpec) -> FleetResult<Source> {
    let name = spec.name.trim();
    if name.is_empty() {
        return Err(FleetError::InvalidSource("name must not be empty".to_string()));
    }

    let address: IpAddr = spec.multicast_address.trim().parse().map_err(|_| {
        FleetError::InvalidSource(format!("malformed address: {}", spec.multicast_address))
    })?;
    if !address.is_multicast() {
        return Err(FleetError::InvalidSource(format!("{} is not a multicast address", address)));
    }
    if spec.port == 0 {
        return Err(FleetError::InvalidSource("port must be non-zero".to_string()));
    }

    let codec = spec.codec;
    if !SUPPORTED_SAMPLE_RATES.contains(&codec.sample_rate) {
        return Err(FleetError::InvalidSource(format!(
            "unsupported sample rate {}",
            codec.sample_rate
        )));
    }
    if codec.channels == 0 || codec.channels > MAX_CHANNELS {
        return Err(FleetError::InvalidSource(format!(
            "channel count {} outside 1..={}",
            codec.channels, MAX_CHANNELS
        )));
    }
    if !(96..=127).contains(&codec.payload_type) {
        return Err(FleetError::InvalidSource(format!(
            "payload type {} is not a dynamic RTP type",
            codec.payload_type
        )));
    }
    if codec.samples_per_packet == 0 {
        return Err(FleetError::InvalidSource("samples per packet must be non-zero".to_string()));
    }

    let duplicate = entries.values().find(|e| {
        e.source.id != id && e.source.multicast_address == address && e.source.port == spec.port
    });
    if let Some(other) = duplicate {
        return Err(FleetError::InvalidSource(format!(
            "{}:{} is already configured as {}",
            address, spec.port, other.source.id
        )));
    }

    Ok(Source {
        id: id.to_string(),
        name: name.to_string(),
        multicast_address: address,
        port: spec.port,
        codec,
        description: spec.description.filter(|d| !d.trim().is_empty()),
        enabled: spec.enabled,
    })
}
