//! Box configuration handling. Parses a TOML file (`~/.box/Box.toml`) into a
//! strongly-typed structure. Reloads are command-driven through the admin
//! channel; there is no file watcher.
//!
//! Merging precedence for values that can arrive from several places is
//! explicit through [`Sourced`]: CLI > environment > config file > default.

use serde::Deserialize;
use std::{fs, net::Ipv4Addr, path::Path};
use uuid::Uuid;

use crate::{Error, Result};

/// Where an effective value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Origin {
    Default,
    Config,
    Env,
    Cli,
}

/// A value tagged with its origin. Higher origins win on merge.
#[derive(Debug, Clone, Copy)]
pub struct Sourced<T> {
    pub value: T,
    pub origin: Origin,
}

impl<T> Sourced<T> {
    pub fn new(value: T, origin: Origin) -> Self {
        Self { value, origin }
    }

    pub fn default_value(value: T) -> Self {
        Self::new(value, Origin::Default)
    }

    /// Replace the value when `candidate` carries a higher-precedence origin.
    pub fn merge(&mut self, candidate: Option<T>, origin: Origin) {
        if let Some(value) = candidate {
            if origin >= self.origin {
                self.value = value;
                self.origin = origin;
            }
        }
    }
}

/// Transport section: port, framing mode and the pre-shared key.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP listen port for broker traffic.
    pub listen_port: u16,

    /// Framing mode: `clear` or `psk`.
    pub mode: TransportModeConfig,

    /// Pre-shared key for the AEAD mode. Required when `mode = "psk"`.
    pub psk: Option<String>,

    /// Reserved for the full Noise state machine (`NK` or `IK`).
    /// Validated but not acted upon; only the PSK path runs today.
    pub noise_handshake_pattern: Option<String>,

    /// Reserved: peer static key (hex) for the future Noise handshake.
    pub remote_static_key: Option<String>,
}

/// Framing mode selector for the UDP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportModeConfig {
    #[default]
    Clear,
    Psk,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            mode: TransportModeConfig::Clear,
            psk: None,
            noise_handshake_pattern: None,
            remote_static_key: None,
        }
    }
}

fn default_listen_port() -> u16 {
    16962 // 0x4242, the frame magic doubled
}

/// Queue store section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queues whose objects survive GET (peek semantics). Paths are
    /// normalized on load; a path nested under a listed prefix is permanent.
    pub permanent: Vec<String>,

    /// Upper bound for a stored payload, in bytes.
    pub max_object_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            permanent: vec!["/whoswho".to_string()],
            max_object_bytes: 64 * 1024,
        }
    }
}

/// Presence / location section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Seconds between presence publishes.
    pub publish_interval_s: u64,

    /// A record older than this is stale (two missed publishes by default).
    pub stale_threshold_ms: u64,

    /// Root resolvers to publish our location record to, `ip:port`.
    pub root_resolvers: Vec<String>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            publish_interval_s: 60,
            stale_threshold_ms: 120_000,
            root_resolvers: Vec::new(),
        }
    }
}

/// NAT traversal section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// Run the coordinator at startup.
    pub enabled: bool,

    /// Gateway override. Mandatory on platforms without route-table discovery.
    pub gateway: Option<Ipv4Addr>,

    /// Requested mapping lifetime in seconds.
    pub lease_s: u32,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gateway: None,
            lease_s: 3600,
        }
    }
}

/// Logging section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Verbosity (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,

    /// Target: `stderr`, `stdout` or `file:<path>`.
    pub target: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            target: "stderr".to_string(),
        }
    }
}

/// Runtime tuning section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of each pipeline stage queue.
    pub event_queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: 1024,
        }
    }
}

/// Primary configuration structure shared across Box components.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BoxConfig {
    /// Account identifier. When omitted it is derived from the client
    /// identity key at startup.
    pub user_id: Option<Uuid>,

    pub network: NetworkConfig,
    pub queues: QueueConfig,
    pub presence: PresenceConfig,
    pub nat: NatConfig,
    pub log: LogConfig,
    pub runtime: RuntimeConfig,
}

impl BoxConfig {
    /// Load a configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path).map_err(Error::from)?;
        let cfg = toml::from_str::<BoxConfig>(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load the file when it exists, defaults otherwise.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject combinations the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.network.mode == TransportModeConfig::Psk
            && self.network.psk.as_deref().map_or(true, str::is_empty)
        {
            return Err(Error::config("mode = \"psk\" requires a non-empty psk"));
        }
        if let Some(pattern) = &self.network.noise_handshake_pattern {
            if pattern != "NK" && pattern != "IK" {
                return Err(Error::config(format!(
                    "unknown noise_handshake_pattern {pattern:?} (expected NK or IK)"
                )));
            }
        }
        if self.runtime.event_queue_capacity == 0 {
            return Err(Error::config("event_queue_capacity must be at least 1"));
        }
        Ok(())
    }
}
