//! Mapping lifecycle: discovery order, lease refresh, teardown and the
//! on-demand probe.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{
    gateway, natpmp, pcp, upnp, MappingHandle, MappingSnapshot, NatBackend, NatError, NatState,
    ProbeReport, Result, TEARDOWN_TIMEOUT,
};

/// Environment switch: when set (non-empty), probes answer `skipped`.
pub const SKIP_PROBE_ENV: &str = "BOX_SKIP_NAT_PROBE";

/// Coordinator inputs, lifted out of the daemon configuration.
#[derive(Debug, Clone)]
pub struct NatSettings {
    pub enabled: bool,
    pub gateway_override: Option<Ipv4Addr>,
    pub internal_port: u16,
    pub lease_s: u32,
}

/// Owns the mapping and reports every state change on a watch channel.
pub struct NatCoordinator {
    settings: NatSettings,
    state_tx: watch::Sender<NatState>,
}

impl NatCoordinator {
    pub fn new(settings: NatSettings, state_tx: watch::Sender<NatState>) -> Self {
        Self { settings, state_tx }
    }

    /// Run until shutdown. Maintains one mapping: acquire, refresh every
    /// `max(lifetime/2, 60)` seconds, re-acquire after failures, DELETE on
    /// the way out.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.settings.enabled {
            debug!("nat coordinator disabled by configuration");
            return;
        }

        let mut current: Option<MappingHandle> = None;
        loop {
            let wait = match &current {
                Some(handle) => Duration::from_secs(u64::from(handle.lifetime_s / 2).max(60)),
                None => Duration::ZERO,
            };

            if !wait.is_zero() {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            } else if *shutdown.borrow() {
                break;
            }

            match self.acquire(current.as_ref().map(|h| h.backend)).await {
                Ok(handle) => {
                    if current.as_ref() != Some(&handle) {
                        info!(backend = %handle.backend, port = handle.external_port, "port mapping active");
                    }
                    self.publish(NatState {
                        mapping: Some(MappingSnapshot::from(&handle)),
                        error: None,
                    });
                    current = Some(handle);
                }
                Err(e) => {
                    warn!(error = %e, "port mapping lost");
                    if let Some(handle) = current.take() {
                        self.teardown(&handle).await;
                    }
                    self.publish(NatState {
                        mapping: None,
                        error: Some(format!("port_mapping_error: {e}")),
                    });
                    // Back off before rediscovering from scratch.
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                    }
                }
            }
        }

        if let Some(handle) = current {
            self.teardown(&handle).await;
        }
        self.publish(NatState::default());
        debug!("nat coordinator stopped");
    }

    /// Refresh the existing backend, or walk the discovery order when there
    /// is none. A failing backend is retired and the next one tried.
    async fn acquire(&self, pinned: Option<NatBackend>) -> Result<MappingHandle> {
        if let Some(backend) = pinned {
            return self.acquire_backend(backend).await;
        }
        let mut last_error = NatError::GatewayNotFound;
        for backend in [NatBackend::Upnp, NatBackend::Pcp, NatBackend::Natpmp] {
            match self.acquire_backend(backend).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    debug!(%backend, error = %e, "backend retired");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn acquire_backend(&self, backend: NatBackend) -> Result<MappingHandle> {
        let port = self.settings.internal_port;
        let lease = self.settings.lease_s;
        match backend {
            NatBackend::Upnp => upnp::map(port, lease).await,
            NatBackend::Pcp => {
                let gw = gateway::default_gateway(self.settings.gateway_override)?;
                pcp::map(gw, port, lease).await
            }
            NatBackend::Natpmp => {
                let gw = gateway::default_gateway(self.settings.gateway_override)?;
                natpmp::map(gw, port, lease).await
            }
        }
    }

    async fn teardown(&self, handle: &MappingHandle) {
        if let Err(e) = remove_mapping(handle, self.settings.internal_port).await {
            debug!(backend = %handle.backend, error = %e, "teardown delete failed");
        }
    }

    fn publish(&self, state: NatState) {
        let _ = self.state_tx.send(state);
    }
}

/// Protocol-specific DELETE, bounded by the teardown timeout. Best-effort.
async fn remove_mapping(handle: &MappingHandle, internal_port: u16) -> Result<()> {
    match handle.backend {
        NatBackend::Upnp => upnp::unmap(handle, TEARDOWN_TIMEOUT).await,
        NatBackend::Pcp => {
            let gw = handle.gateway.ok_or(NatError::GatewayNotFound)?;
            pcp::unmap(gw, internal_port, TEARDOWN_TIMEOUT).await
        }
        NatBackend::Natpmp => {
            let gw = handle.gateway.ok_or(NatError::GatewayNotFound)?;
            natpmp::unmap(gw, internal_port, TEARDOWN_TIMEOUT).await
        }
    }
}

/// Run all three backends once each — establish, then immediately remove —
/// and report per-backend results. Used by the admin CLI.
pub async fn probe(gateway_override: Option<Ipv4Addr>, internal_port: u16) -> Vec<ProbeReport> {
    if std::env::var(SKIP_PROBE_ENV).is_ok_and(|v| !v.is_empty()) {
        return [NatBackend::Upnp, NatBackend::Pcp, NatBackend::Natpmp]
            .into_iter()
            .map(ProbeReport::skipped)
            .collect();
    }

    let mut reports = Vec::with_capacity(3);
    for backend in [NatBackend::Upnp, NatBackend::Pcp, NatBackend::Natpmp] {
        let attempt = async {
            let handle = match backend {
                NatBackend::Upnp => upnp::map(internal_port, 60).await?,
                NatBackend::Pcp => {
                    let gw = gateway::default_gateway(gateway_override)?;
                    pcp::map(gw, internal_port, 60).await?
                }
                NatBackend::Natpmp => {
                    let gw = gateway::default_gateway(gateway_override)?;
                    natpmp::map(gw, internal_port, 60).await?
                }
            };
            let _ = remove_mapping(&handle, internal_port).await;
            Ok::<_, NatError>(handle)
        };
        reports.push(match attempt.await {
            Ok(handle) => ProbeReport {
                backend,
                status: "ok".to_string(),
                external_port: Some(handle.external_port),
                external_ipv4: handle.external_ipv4,
                lifetime: Some(handle.lifetime_s),
                gateway: handle.gateway,
                service: handle.service,
                peer_state: handle.peer_state,
                error: None,
            },
            Err(e) => ProbeReport {
                backend,
                status: "error".to_string(),
                external_port: None,
                external_ipv4: None,
                lifetime: None,
                gateway: None,
                service: None,
                peer_state: None,
                error: Some(e.to_string()),
            },
        });
    }
    reports
}
