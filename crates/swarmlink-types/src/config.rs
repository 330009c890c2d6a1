//! Coordinator configuration.
//!
//! All fields have defaults so a partial (or empty) TOML document is a valid
//! configuration. Durations are stored as integer milliseconds.

use crate::error::{SwarmError, SwarmResult};
use crate::peer::LivenessThresholds;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Channel used when none is configured, so unconfigured peers on one
/// machine rendezvous automatically.
pub const DEFAULT_CHANNEL: &str = "DefaultCoordinator";

/// Default Host port for the network transport.
pub const DEFAULT_HOST_PORT: u16 = 8081;

/// Default upper bound on one wire frame (256 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

/// Which byte transport the coordinator's devices use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// TCP, routable across machines.
    #[default]
    Network,
    /// Unix domain sockets, single machine.
    Local,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Network => write!(f, "network"),
            TransportKind::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "network" | "tcp" => Ok(TransportKind::Network),
            "local" | "ipc" | "pipe" => Ok(TransportKind::Local),
            other => Err(SwarmError::Config(format!("unknown transport '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Byte transport of both devices.
    pub transport: TransportKind,
    /// Rendezvous channel name.
    pub channel: String,
    /// Explicit Host socket address (`host:port`) for the network transport.
    pub host_address: Option<String>,
    /// IP the Client device binds to. Defaults to this machine's IPv4.
    pub bind_ip: Option<IpAddr>,
    /// Host port used when `host_address` is unset.
    pub host_port: u16,
    /// Socket directory of the local transport.
    pub local_dir: Option<PathBuf>,
    /// Distinguishes coordinators sharing a process. Defaults to the pid.
    pub instance: Option<String>,
    /// Minimum spacing of sync rounds, and the freshness window of the Host.
    pub sync_interval_ms: u64,
    /// Minimum spacing of attempts to bind the Host address.
    pub host_port_check_interval_ms: u64,
    /// Minimum spacing of roster requests.
    pub client_list_update_interval_ms: u64,
    /// Silence after which a peer counts as inactive.
    pub inactive_threshold_ms: u64,
    /// Silence after which a peer is dropped from the roster.
    pub expiry_threshold_ms: u64,
    /// Age after which an unanswered callback is dropped.
    pub callback_timeout_ms: u64,
    /// Largest accepted wire frame.
    pub max_frame_bytes: u32,
    /// Connect, write and idle-read timeout of the transports.
    pub io_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            channel: DEFAULT_CHANNEL.to_string(),
            host_address: None,
            bind_ip: None,
            host_port: DEFAULT_HOST_PORT,
            local_dir: None,
            instance: None,
            sync_interval_ms: 1_000,
            host_port_check_interval_ms: 10_000,
            client_list_update_interval_ms: 1_000,
            inactive_threshold_ms: 10_000,
            expiry_threshold_ms: 60_000,
            callback_timeout_ms: 60_000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            io_timeout_ms: 15 * 60 * 1_000,
        }
    }
}

impl CoordinatorConfig {
    /// The configured channel, or the default one when blank.
    pub fn channel_name(&self) -> &str {
        let trimmed = self.channel.trim();
        if trimmed.is_empty() {
            DEFAULT_CHANNEL
        } else {
            trimmed
        }
    }

    /// The instance token, defaulting to the process id.
    pub fn instance_id(&self) -> String {
        self.instance
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| std::process::id().to_string())
    }

    /// `sync_interval_ms` as a [`Duration`].
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn host_port_check_interval(&self) -> Duration {
        Duration::from_millis(self.host_port_check_interval_ms)
    }

    pub fn client_list_update_interval(&self) -> Duration {
        Duration::from_millis(self.client_list_update_interval_ms)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn thresholds(&self) -> LivenessThresholds {
        LivenessThresholds {
            inactive: Duration::from_millis(self.inactive_threshold_ms),
            expiry: Duration::from_millis(self.expiry_threshold_ms),
        }
    }

    /// Reject configurations the coordinator cannot run with.
    pub fn validate(&self) -> SwarmResult<()> {
        let channel = self.channel_name();
        if channel.contains('/') || channel.contains('\\') {
            return Err(SwarmError::Config(format!(
                "channel '{channel}' must not contain path separators"
            )));
        }
        let instance = self.instance_id();
        if instance.contains('/') || instance.contains('\\') {
            return Err(SwarmError::Config(format!(
                "instance '{instance}' must not contain path separators"
            )));
        }
        if self.sync_interval_ms == 0 {
            return Err(SwarmError::Config("sync_interval_ms must be positive".into()));
        }
        if self.inactive_threshold_ms > self.expiry_threshold_ms {
            return Err(SwarmError::Config(format!(
                "inactive_threshold_ms ({}) exceeds expiry_threshold_ms ({})",
                self.inactive_threshold_ms, self.expiry_threshold_ms
            )));
        }
        if self.max_frame_bytes == 0 {
            return Err(SwarmError::Config("max_frame_bytes must be positive".into()));
        }
        Ok(())
    }

    /// Parse a TOML document.
    pub fn from_toml(contents: &str) -> SwarmResult<Self> {
        toml::from_str(contents).map_err(|e| SwarmError::Config(e.to_string()))
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> SwarmResult<String> {
        toml::to_string_pretty(self).map_err(|e| SwarmError::Config(e.to_string()))
    }
}
