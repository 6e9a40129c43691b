//! PCP client (RFC 6887): MAP for the mapping itself, then PEER once for
//! diagnostics.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;
use tracing::debug;

use super::{MappingHandle, NatBackend, NatError, Result, STEP_TIMEOUT};
use crate::nat::natpmp::NATPMP_PORT;

const VERSION: u8 = 2;
const OP_MAP: u8 = 0x01;
const OP_PEER: u8 = 0x02;
const RESPONSE_BIT: u8 = 0x80;
const PROTO_UDP: u8 = 17;

const HEADER_LEN: usize = 24;
const MAP_PAYLOAD_LEN: usize = 36;
const PEER_PAYLOAD_LEN: usize = 56;

/// 12-byte mapping nonce, fresh per transaction.
pub fn fresh_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

fn header(opcode: u8, lifetime_s: u32, client: Ipv4Addr) -> [u8; HEADER_LEN] {
    let mut hdr = [0u8; HEADER_LEN];
    hdr[0] = VERSION;
    hdr[1] = opcode;
    hdr[4..8].copy_from_slice(&lifetime_s.to_be_bytes());
    // 96-bit IPv4-mapped client address: ::ffff:a.b.c.d
    hdr[18] = 0xff;
    hdr[19] = 0xff;
    hdr[20..24].copy_from_slice(&client.octets());
    hdr
}

/// MAP request: header + nonce + protocol + ports. Suggested external IP is
/// all zeros (let the gateway choose).
pub fn build_map_request(
    nonce: &[u8; 12],
    client: Ipv4Addr,
    internal_port: u16,
    lifetime_s: u32,
) -> Vec<u8> {
    let mut req = Vec::with_capacity(HEADER_LEN + MAP_PAYLOAD_LEN);
    req.extend_from_slice(&header(OP_MAP, lifetime_s, client));
    req.extend_from_slice(nonce);
    req.push(PROTO_UDP);
    req.extend_from_slice(&[0u8; 3]);
    req.extend_from_slice(&internal_port.to_be_bytes());
    req.extend_from_slice(&internal_port.to_be_bytes()); // suggested external = internal
    req.extend_from_slice(&[0u8; 16]);
    req
}

/// PEER request for the same mapping, pointed at `remote`.
pub fn build_peer_request(
    nonce: &[u8; 12],
    client: Ipv4Addr,
    internal_port: u16,
    remote: SocketAddrV4,
    lifetime_s: u32,
) -> Vec<u8> {
    let mut req = Vec::with_capacity(HEADER_LEN + PEER_PAYLOAD_LEN);
    req.extend_from_slice(&header(OP_PEER, lifetime_s, client));
    req.extend_from_slice(nonce);
    req.push(PROTO_UDP);
    req.extend_from_slice(&[0u8; 3]);
    req.extend_from_slice(&internal_port.to_be_bytes());
    req.extend_from_slice(&internal_port.to_be_bytes());
    req.extend_from_slice(&[0u8; 16]);
    req.extend_from_slice(&remote.port().to_be_bytes());
    req.extend_from_slice(&[0u8; 2]);
    let mut remote_ip = [0u8; 16];
    remote_ip[10] = 0xff;
    remote_ip[11] = 0xff;
    remote_ip[12..16].copy_from_slice(&remote.ip().octets());
    req.extend_from_slice(&remote_ip);
    req
}

/// Outcome of a MAP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapResponse {
    pub external_ipv4: Option<Ipv4Addr>,
    pub external_port: u16,
    pub lifetime_s: u32,
}

/// Verify and decode a MAP response: opcode `0x81`, result 0, nonce echoed.
pub fn parse_map_response(buf: &[u8], nonce: &[u8; 12]) -> Result<MapResponse> {
    if buf.len() < HEADER_LEN + MAP_PAYLOAD_LEN || buf[0] != VERSION {
        return Err(NatError::Unsupported);
    }
    if buf[1] != (OP_MAP | RESPONSE_BIT) {
        return Err(NatError::Unsupported);
    }
    let result = buf[3];
    if result != 0 {
        return Err(NatError::ProtocolError(result as u16));
    }
    let lifetime_s = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if &buf[HEADER_LEN..HEADER_LEN + 12] != nonce {
        return Err(NatError::NonceMismatch);
    }
    let external_port = u16::from_be_bytes([buf[HEADER_LEN + 18], buf[HEADER_LEN + 19]]);
    let ip_bytes = &buf[HEADER_LEN + 20..HEADER_LEN + 36];
    Ok(MapResponse {
        external_ipv4: ipv4_from_mapped(ip_bytes),
        external_port,
        lifetime_s,
    })
}

/// Decode a PEER response into a diagnostics string (result code, lifetime).
pub fn parse_peer_response(buf: &[u8], nonce: &[u8; 12]) -> Result<String> {
    if buf.len() < HEADER_LEN + PEER_PAYLOAD_LEN || buf[0] != VERSION {
        return Err(NatError::Unsupported);
    }
    if buf[1] != (OP_PEER | RESPONSE_BIT) {
        return Err(NatError::Unsupported);
    }
    if &buf[HEADER_LEN..HEADER_LEN + 12] != nonce {
        return Err(NatError::NonceMismatch);
    }
    let result = buf[3];
    let lifetime = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok(format!("result={result} lifetime={lifetime}"))
}

fn ipv4_from_mapped(bytes: &[u8]) -> Option<Ipv4Addr> {
    if bytes.len() != 16 {
        return None;
    }
    let mapped = bytes[..10].iter().all(|&b| b == 0) && bytes[10] == 0xff && bytes[11] == 0xff;
    if !mapped {
        return None;
    }
    Some(Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]))
}

/// Establish a mapping: MAP, then one PEER round for diagnostics.
pub async fn map(gateway: Ipv4Addr, internal_port: u16, lifetime_s: u32) -> Result<MappingHandle> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let target = SocketAddr::V4(SocketAddrV4::new(gateway, NATPMP_PORT));
    let client = local_ipv4(&socket, target).await?;
    let nonce = fresh_nonce();

    let request = build_map_request(&nonce, client, internal_port, lifetime_s);
    socket.send_to(&request, target).await?;
    let mut buf = [0u8; 256];
    let (len, _) = tokio::time::timeout(STEP_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| NatError::Timeout)??;
    let mapped = parse_map_response(&buf[..len], &nonce)?;
    debug!(%gateway, port = mapped.external_port, "pcp mapping established");

    // PEER is diagnostics only; its failure does not retire the mapping.
    let peer_state = match peer_round(&socket, target, &nonce, client, internal_port, &mapped).await
    {
        Ok(state) => Some(state),
        Err(e) => {
            debug!(%gateway, error = %e, "pcp peer diagnostics unavailable");
            None
        }
    };

    Ok(MappingHandle {
        backend: NatBackend::Pcp,
        external_port: mapped.external_port,
        gateway: Some(gateway),
        service: None,
        lifetime_s: mapped.lifetime_s,
        external_ipv4: mapped.external_ipv4,
        peer_state,
    })
}

async fn peer_round(
    socket: &UdpSocket,
    target: SocketAddr,
    nonce: &[u8; 12],
    client: Ipv4Addr,
    internal_port: u16,
    mapped: &MapResponse,
) -> Result<String> {
    let remote = SocketAddrV4::new(
        mapped.external_ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED),
        mapped.external_port,
    );
    let request = build_peer_request(nonce, client, internal_port, remote, 0);
    socket.send_to(&request, target).await?;
    let mut buf = [0u8; 256];
    let (len, _) = tokio::time::timeout(STEP_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| NatError::Timeout)??;
    parse_peer_response(&buf[..len], nonce)
}

/// Delete the mapping: a MAP with lifetime zero.
pub async fn unmap(gateway: Ipv4Addr, internal_port: u16, timeout: Duration) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let target = SocketAddr::V4(SocketAddrV4::new(gateway, NATPMP_PORT));
    let client = local_ipv4(&socket, target).await?;
    let nonce = fresh_nonce();
    let request = build_map_request(&nonce, client, internal_port, 0);
    socket.send_to(&request, target).await?;
    let mut buf = [0u8; 256];
    let _ = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| NatError::Timeout)??;
    Ok(())
}

/// The local address the OS picked towards the gateway; PCP requires the
/// client address in the request header.
async fn local_ipv4(socket: &UdpSocket, target: SocketAddr) -> Result<Ipv4Addr> {
    socket.connect(target).await?;
    match socket.local_addr()? {
        SocketAddr::V4(v4) => Ok(*v4.ip()),
        SocketAddr::V6(_) => Err(NatError::Unsupported),
    }
}
