//! Settings loading for the client and server roles.
//!
//! Settings are read from a JSON file with camelCase keys, then overridden
//! by `TCP_COMMS_*` environment variables. Missing keys fall back to the
//! defaults in [`crate::constants`].

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, str::FromStr};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BIND_ADDRESS, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HEARTBEAT_TIMEOUT_MS,
    DEFAULT_INCOMING_INTERVAL_MS, DEFAULT_MONITOR_INTERVAL_MS, DEFAULT_OUTGOING_INTERVAL_MS,
    DEFAULT_PORT, DEFAULT_READ_BUFFER_SIZE_BYTES,
};

/// Name of the settings file inside the config directory.
pub const SETTINGS_FILE: &str = "settings.json";

/// Settings for the connecting role.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Interval between heartbeat requests.
    pub heartbeat_interval_ms: u64,
    /// A connection with no heartbeat for longer than this is torn down.
    pub heartbeat_timeout_ms: u64,
    /// Liveness check cadence for each connection.
    pub connection_interval_ms: u64,
    /// Socket poll cadence.
    pub process_incoming_interval_ms: u64,
    /// Outgoing queue drain cadence.
    pub process_outgoing_interval_ms: u64,
    /// Maximum bytes read per incoming tick.
    pub read_buffer_size_bytes: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            connection_interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
            process_incoming_interval_ms: DEFAULT_INCOMING_INTERVAL_MS,
            process_outgoing_interval_ms: DEFAULT_OUTGOING_INTERVAL_MS,
            read_buffer_size_bytes: DEFAULT_READ_BUFFER_SIZE_BYTES,
        }
    }
}

/// Settings for the listening role.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Address the listener binds to.
    pub bind_address: IpAddr,
    /// Port the listener binds to. `0` picks an ephemeral port.
    pub port: u16,
    /// Liveness sweep cadence across all connections.
    pub connection_monitor_interval_ms: u64,
    /// Socket poll cadence.
    pub process_incoming_interval_ms: u64,
    /// Outgoing queue drain cadence.
    pub process_outgoing_interval_ms: u64,
    /// A connection with no heartbeat for longer than this is torn down.
    pub heartbeat_timeout_ms: u64,
    /// Maximum bytes read per incoming tick.
    pub read_buffer_size_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS,
            port: DEFAULT_PORT,
            connection_monitor_interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
            process_incoming_interval_ms: DEFAULT_INCOMING_INTERVAL_MS,
            process_outgoing_interval_ms: DEFAULT_OUTGOING_INTERVAL_MS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            read_buffer_size_bytes: DEFAULT_READ_BUFFER_SIZE_BYTES,
        }
    }
}

/// Per-connection loop cadences shared by both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTimings {
    /// Socket poll cadence.
    pub incoming_interval: Duration,
    /// Outgoing queue drain cadence.
    pub outgoing_interval: Duration,
    /// Liveness check cadence.
    pub monitor_interval: Duration,
    /// Liveness timeout.
    pub heartbeat_timeout: Duration,
    /// Maximum bytes read per incoming tick.
    pub read_buffer_size: usize,
}

impl ClientSettings {
    /// Loads settings from the default location, with environment overrides.
    ///
    /// A missing settings file is not an error: defaults are used.
    pub fn load() -> Result<Self> {
        let path = config_dir()?.join(SETTINGS_FILE);
        let mut settings = if path.exists() {
            load_json(&path)?
        } else {
            Self::default()
        };
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from a specific file, with environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings: Self = load_json(path)?;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        env_override("TCP_COMMS_HEARTBEAT_INTERVAL_MS", &mut self.heartbeat_interval_ms);
        env_override("TCP_COMMS_HEARTBEAT_TIMEOUT_MS", &mut self.heartbeat_timeout_ms);
        env_override("TCP_COMMS_MONITOR_INTERVAL_MS", &mut self.connection_interval_ms);
        env_override("TCP_COMMS_INCOMING_INTERVAL_MS", &mut self.process_incoming_interval_ms);
        env_override("TCP_COMMS_OUTGOING_INTERVAL_MS", &mut self.process_outgoing_interval_ms);
        env_override("TCP_COMMS_READ_BUFFER_BYTES", &mut self.read_buffer_size_bytes);
    }

    /// Rejects settings the loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        require_nonzero("heartbeatIntervalMs", self.heartbeat_interval_ms)?;
        require_nonzero("heartbeatTimeoutMs", self.heartbeat_timeout_ms)?;
        require_nonzero("connectionIntervalMs", self.connection_interval_ms)?;
        require_nonzero("processIncomingIntervalMs", self.process_incoming_interval_ms)?;
        require_nonzero("processOutgoingIntervalMs", self.process_outgoing_interval_ms)?;
        require_nonzero("readBufferSizeBytes", self.read_buffer_size_bytes as u64)?;
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            bail!(
                "heartbeatTimeoutMs ({}) must be greater than heartbeatIntervalMs ({})",
                self.heartbeat_timeout_ms,
                self.heartbeat_interval_ms
            );
        }
        Ok(())
    }

    /// Heartbeat emission cadence.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Loop cadences for a client connection.
    pub fn timings(&self) -> LoopTimings {
        LoopTimings {
            incoming_interval: Duration::from_millis(self.process_incoming_interval_ms),
            outgoing_interval: Duration::from_millis(self.process_outgoing_interval_ms),
            monitor_interval: Duration::from_millis(self.connection_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            read_buffer_size: self.read_buffer_size_bytes,
        }
    }
}

impl ServerSettings {
    /// Loads settings from the default location, with environment overrides.
    ///
    /// A missing settings file is not an error: defaults are used.
    pub fn load() -> Result<Self> {
        let path = config_dir()?.join(SETTINGS_FILE);
        let mut settings = if path.exists() {
            load_json(&path)?
        } else {
            Self::default()
        };
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from a specific file, with environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings: Self = load_json(path)?;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        env_override("TCP_COMMS_BIND_ADDRESS", &mut self.bind_address);
        env_override("TCP_COMMS_PORT", &mut self.port);
        env_override("TCP_COMMS_MONITOR_INTERVAL_MS", &mut self.connection_monitor_interval_ms);
        env_override("TCP_COMMS_INCOMING_INTERVAL_MS", &mut self.process_incoming_interval_ms);
        env_override("TCP_COMMS_OUTGOING_INTERVAL_MS", &mut self.process_outgoing_interval_ms);
        env_override("TCP_COMMS_HEARTBEAT_TIMEOUT_MS", &mut self.heartbeat_timeout_ms);
        env_override("TCP_COMMS_READ_BUFFER_BYTES", &mut self.read_buffer_size_bytes);
    }

    /// Rejects settings the loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        require_nonzero("connectionMonitorIntervalMs", self.connection_monitor_interval_ms)?;
        require_nonzero("processIncomingIntervalMs", self.process_incoming_interval_ms)?;
        require_nonzero("processOutgoingIntervalMs", self.process_outgoing_interval_ms)?;
        require_nonzero("heartbeatTimeoutMs", self.heartbeat_timeout_ms)?;
        require_nonzero("readBufferSizeBytes", self.read_buffer_size_bytes as u64)?;
        Ok(())
    }

    /// Loop cadences for a server connection.
    pub fn timings(&self) -> LoopTimings {
        LoopTimings {
            incoming_interval: Duration::from_millis(self.process_incoming_interval_ms),
            outgoing_interval: Duration::from_millis(self.process_outgoing_interval_ms),
            monitor_interval: Duration::from_millis(self.connection_monitor_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            read_buffer_size: self.read_buffer_size_bytes,
        }
    }
}

/// Returns the configuration directory.
///
/// `TCP_COMMS_CONFIG_DIR` overrides the platform config directory
/// (e.g. `~/.config/tcp-comms` on Linux).
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("TCP_COMMS_CONFIG_DIR") {
        return Ok(PathBuf::from(dir));
    }
    Ok(dirs::config_dir()
        .context("Could not determine config directory")?
        .join("tcp-comms"))
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid settings file: {}", path.display()))
}

fn env_override<T: FromStr>(var: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => log::warn!("Ignoring unparsable {}={:?}", var, raw),
        }
    }
}

fn require_nonzero(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        bail!("{} must be greater than zero", name);
    }
    Ok(())
}
