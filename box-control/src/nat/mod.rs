//! NAT traversal coordinator.
//!
//! Obtains an external `(ip, port)` mapping and keeps it refreshed. Backends
//! are probed in a fixed order — UPnP-IGD, then PCP (MAP + PEER), then
//! NAT-PMP — with a hard 3 s receive timeout per step; the first success
//! wins. State changes are reported as [`NatState`] messages on a watch
//! channel the runtime consumes; the coordinator holds no references back
//! into the runtime.

pub mod coordinator;
pub mod gateway;
pub mod natpmp;
pub mod pcp;
pub mod upnp;

pub use coordinator::{probe, NatCoordinator, NatSettings};

use serde::Serialize;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Receive timeout for a single mapping request.
pub(crate) const STEP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// Timeout for the UPnP device-description fetch.
pub(crate) const DESCRIPTION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Timeout for best-effort teardown DELETEs at shutdown.
pub(crate) const TEARDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Mapping protocol that produced a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NatBackend {
    Upnp,
    Pcp,
    Natpmp,
}

impl core::fmt::Display for NatBackend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            NatBackend::Upnp => "upnp",
            NatBackend::Pcp => "pcp",
            NatBackend::Natpmp => "natpmp",
        })
    }
}

/// A live mapping owned by the coordinator. Released (best-effort DELETE) on
/// shutdown or replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingHandle {
    pub backend: NatBackend,
    pub external_port: u16,
    pub gateway: Option<Ipv4Addr>,
    /// UPnP service type that accepted the mapping.
    pub service: Option<String>,
    pub lifetime_s: u32,
    pub external_ipv4: Option<Ipv4Addr>,
    /// PCP PEER diagnostics, when the backend provides them.
    pub peer_state: Option<String>,
}

/// Snapshot of the current mapping, shipped to the presence subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingSnapshot {
    pub backend: NatBackend,
    pub external_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ipv4: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub lifetime_s: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_state: Option<String>,
}

impl From<&MappingHandle> for MappingSnapshot {
    fn from(handle: &MappingHandle) -> Self {
        Self {
            backend: handle.backend,
            external_port: handle.external_port,
            external_ipv4: handle.external_ipv4,
            gateway: handle.gateway,
            service: handle.service.clone(),
            lifetime_s: handle.lifetime_s,
            peer_state: handle.peer_state.clone(),
        }
    }
}

/// What the runtime currently knows about port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NatState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping: Option<MappingSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One backend's outcome in an on-demand probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub backend: NatBackend,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ipv4: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeReport {
    pub(crate) fn skipped(backend: NatBackend) -> Self {
        Self {
            backend,
            status: "skipped".to_string(),
            external_port: None,
            external_ipv4: None,
            lifetime: None,
            gateway: None,
            service: None,
            peer_state: None,
            error: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum NatError {
    #[error("no gateway found")]
    GatewayNotFound,
    #[error("protocol error (code {0})")]
    ProtocolError(u16),
    #[error("nonce mismatch")]
    NonceMismatch,
    #[error("timeout")]
    Timeout,
    #[error("unsupported by gateway")]
    Unsupported,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = NatError> = core::result::Result<T, E>;
