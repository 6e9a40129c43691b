//! NAT-PMP client (RFC 6886), UDP mapping opcode only.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::debug;

use super::{MappingHandle, NatBackend, NatError, Result, STEP_TIMEOUT};

/// Gateway-side control port shared with PCP.
pub const NATPMP_PORT: u16 = 5351;

const VERSION: u8 = 0;
const OP_MAP_UDP: u8 = 1;
const OP_RESPONSE: u8 = 0x81;
const RESULT_SUCCESS: u16 = 0;

/// 12-byte UDP mapping request.
pub fn build_map_request(internal_port: u16, external_port: u16, lifetime_s: u32) -> [u8; 12] {
    let mut req = [0u8; 12];
    req[0] = VERSION;
    req[1] = OP_MAP_UDP;
    // bytes 2..4 reserved
    req[4..6].copy_from_slice(&internal_port.to_be_bytes());
    req[6..8].copy_from_slice(&external_port.to_be_bytes());
    req[8..12].copy_from_slice(&lifetime_s.to_be_bytes());
    req
}

/// Assigned external port and lifetime from a 16-byte mapping response.
pub fn parse_map_response(buf: &[u8], internal_port: u16) -> Result<(u16, u32)> {
    if buf.len() < 16 || buf[0] != VERSION {
        return Err(NatError::Unsupported);
    }
    if buf[1] != OP_RESPONSE {
        return Err(NatError::Unsupported);
    }
    let result = u16::from_be_bytes([buf[2], buf[3]]);
    if result != RESULT_SUCCESS {
        return Err(NatError::ProtocolError(result));
    }
    let mapped_internal = u16::from_be_bytes([buf[8], buf[9]]);
    if mapped_internal != internal_port {
        // Response for some other client's mapping.
        return Err(NatError::Unsupported);
    }
    let external_port = u16::from_be_bytes([buf[10], buf[11]]);
    let lifetime = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
    Ok((external_port, lifetime))
}

/// Request (or with `lifetime_s == 0`, delete) a UDP mapping.
pub async fn map(gateway: Ipv4Addr, internal_port: u16, lifetime_s: u32) -> Result<MappingHandle> {
    let (external_port, lifetime) =
        exchange(gateway, internal_port, internal_port, lifetime_s, STEP_TIMEOUT).await?;
    debug!(%gateway, external_port, lifetime, "nat-pmp mapping established");
    Ok(MappingHandle {
        backend: NatBackend::Natpmp,
        external_port,
        gateway: Some(gateway),
        service: None,
        lifetime_s: lifetime,
        external_ipv4: None,
        peer_state: None,
    })
}

/// Delete the mapping: lifetime zero, best-effort.
pub async fn unmap(gateway: Ipv4Addr, internal_port: u16, timeout: Duration) -> Result<()> {
    exchange(gateway, internal_port, 0, 0, timeout).await?;
    Ok(())
}

async fn exchange(
    gateway: Ipv4Addr,
    internal_port: u16,
    external_port: u16,
    lifetime_s: u32,
    timeout: Duration,
) -> Result<(u16, u32)> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let target = SocketAddr::V4(SocketAddrV4::new(gateway, NATPMP_PORT));
    let request = build_map_request(internal_port, external_port, lifetime_s);
    socket.send_to(&request, target).await?;

    let mut buf = [0u8; 64];
    let (len, _) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| NatError::Timeout)??;
    parse_map_response(&buf[..len], internal_port)
}
