//! UPnP-IGD client: SSDP discovery, device-description fetch and the two
//! SOAP calls (`AddPortMapping`, `DeletePortMapping`).
//!
//! The HTTP side is a minimal hand-rolled client over `TcpStream`; IGD
//! endpoints speak simple HTTP/1.1 without chunking on these paths.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use super::{MappingHandle, NatBackend, NatError, Result, DESCRIPTION_TIMEOUT, STEP_TIMEOUT};

const SSDP_ADDR: &str = "239.255.255.250:1900";
const SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";

/// Service types that can hold a port mapping, in preference order.
const SERVICE_PRIORITY: [&str; 3] = [
    "urn:schemas-upnp-org:service:WANIPConnection:2",
    "urn:schemas-upnp-org:service:WANIPConnection:1",
    "urn:schemas-upnp-org:service:WANPPPConnection:1",
];

/// Establish a UDP mapping through the first IGD that answers SSDP.
pub async fn map(internal_port: u16, lease_s: u32) -> Result<MappingHandle> {
    let location = discover().await?;
    let (host, port, path) = parse_http_url(&location).ok_or(NatError::Unsupported)?;
    let description = http_get(&host, port, &path, DESCRIPTION_TIMEOUT).await?;
    let (service_type, control_path) =
        find_control_service(&description).ok_or(NatError::Unsupported)?;

    let client_ip = local_ipv4_towards(&host, port).await?;
    soap_call(
        &host,
        port,
        &control_path,
        &service_type,
        "AddPortMapping",
        &add_mapping_body(&service_type, internal_port, client_ip, lease_s),
    )
    .await?;
    debug!(%host, service = %service_type, internal_port, "upnp mapping established");

    Ok(MappingHandle {
        backend: NatBackend::Upnp,
        external_port: internal_port,
        gateway: host.parse().ok(),
        service: Some(service_type),
        lifetime_s: lease_s,
        external_ipv4: None,
        peer_state: None,
    })
}

/// Best-effort `DeletePortMapping` against the handle's service.
pub async fn unmap(handle: &MappingHandle, timeout: Duration) -> Result<()> {
    let Some(gateway) = handle.gateway else {
        return Err(NatError::GatewayNotFound);
    };
    let Some(service_type) = &handle.service else {
        return Err(NatError::Unsupported);
    };
    // Re-discover the control path; the handle only pins the service type.
    let location = discover().await?;
    let (host, port, path) = parse_http_url(&location).ok_or(NatError::Unsupported)?;
    let description = tokio::time::timeout(timeout, http_get(&host, port, &path, timeout))
        .await
        .map_err(|_| NatError::Timeout)??;
    let (_, control_path) = find_control_service(&description).ok_or(NatError::Unsupported)?;
    soap_call(
        &host,
        port,
        &control_path,
        service_type,
        "DeletePortMapping",
        &delete_mapping_body(service_type, handle.external_port),
    )
    .await?;
    debug!(%gateway, port = handle.external_port, "upnp mapping removed");
    Ok(())
}

/// SSDP M-SEARCH; returns the LOCATION of the first IGD answer.
async fn discover() -> Result<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let request = format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {SSDP_ADDR}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 2\r\n\
         ST: {SEARCH_TARGET}\r\n\r\n"
    );
    socket.send_to(request.as_bytes(), SSDP_ADDR).await?;

    let mut buf = [0u8; 2048];
    let (len, peer) = tokio::time::timeout(STEP_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| NatError::Timeout)??;
    let response = String::from_utf8_lossy(&buf[..len]);
    let location = parse_ssdp_location(&response).ok_or(NatError::Unsupported)?;
    debug!(%peer, %location, "ssdp answer");
    Ok(location)
}

/// Pull the LOCATION header out of an SSDP answer.
pub fn parse_ssdp_location(response: &str) -> Option<String> {
    response
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("location"))
        .map(|(_, value)| value.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Split `http://host[:port]/path` into its parts. Only plain HTTP; IGD
/// descriptions are served on the LAN.
pub fn parse_http_url(url: &str) -> Option<(String, u16, String)> {
    let rest = url.strip_prefix("http://")?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().ok()?),
        None => (authority.to_string(), 80),
    };
    if host.is_empty() {
        return None;
    }
    Some((host, port, path))
}

/// Find the preferred WAN connection service and its control URL in a device
/// description. String scanning is deliberate: descriptions are small and the
/// two tags we need are flat.
pub fn find_control_service(description: &str) -> Option<(String, String)> {
    for service_type in SERVICE_PRIORITY {
        let Some(at) = description.find(service_type) else {
            continue;
        };
        let tail = &description[at..];
        let control = extract_tag(tail, "controlURL")?;
        return Some((service_type.to_string(), control));
    }
    None
}

fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    let value = xml[start..end].trim();
    (!value.is_empty()).then(|| value.to_string())
}

async fn http_get(host: &str, port: u16, path: &str, timeout: Duration) -> Result<String> {
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}:{port}\r\nConnection: close\r\n\r\n"
    );
    let (status, body) = http_exchange(host, port, request.into_bytes(), timeout).await?;
    if status != 200 {
        return Err(NatError::ProtocolError(status));
    }
    Ok(body)
}

async fn soap_call(
    host: &str,
    port: u16,
    path: &str,
    service_type: &str,
    action: &str,
    body: &str,
) -> Result<()> {
    let request = format!(
        "POST {path} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Content-Type: text/xml; charset=\"utf-8\"\r\n\
         SOAPAction: \"{service_type}#{action}\"\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    );
    let (status, _) = http_exchange(host, port, request.into_bytes(), STEP_TIMEOUT).await?;
    if status != 200 {
        return Err(NatError::ProtocolError(status));
    }
    Ok(())
}

async fn http_exchange(
    host: &str,
    port: u16,
    request: Vec<u8>,
    timeout: Duration,
) -> Result<(u16, String)> {
    let exchange = async {
        let mut stream = TcpStream::connect((host, port)).await?;
        stream.write_all(&request).await?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok::<_, std::io::Error>(response)
    };
    let response = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| NatError::Timeout)??;
    let text = String::from_utf8_lossy(&response).to_string();
    let status = parse_http_status(&text).ok_or(NatError::Unsupported)?;
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    Ok((status, body))
}

/// Status code from `HTTP/1.1 200 OK`.
pub fn parse_http_status(response: &str) -> Option<u16> {
    response
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

async fn local_ipv4_towards(host: &str, port: u16) -> Result<Ipv4Addr> {
    let target: Ipv4Addr = host.parse().map_err(|_| NatError::Unsupported)?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket
        .connect(SocketAddr::V4(SocketAddrV4::new(target, port)))
        .await?;
    match socket.local_addr()? {
        SocketAddr::V4(v4) => Ok(*v4.ip()),
        SocketAddr::V6(_) => Err(NatError::Unsupported),
    }
}

fn add_mapping_body(service_type: &str, port: u16, client: Ipv4Addr, lease_s: u32) -> String {
    format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body><u:AddPortMapping xmlns:u="{service_type}">
<NewRemoteHost></NewRemoteHost>
<NewExternalPort>{port}</NewExternalPort>
<NewProtocol>UDP</NewProtocol>
<NewInternalPort>{port}</NewInternalPort>
<NewInternalClient>{client}</NewInternalClient>
<NewEnabled>1</NewEnabled>
<NewPortMappingDescription>boxd</NewPortMappingDescription>
<NewLeaseDuration>{lease_s}</NewLeaseDuration>
</u:AddPortMapping></s:Body></s:Envelope>"#
    )
}

fn delete_mapping_body(service_type: &str, port: u16) -> String {
    format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body><u:DeletePortMapping xmlns:u="{service_type}">
<NewRemoteHost></NewRemoteHost>
<NewExternalPort>{port}</NewExternalPort>
<NewProtocol>UDP</NewProtocol>
</u:DeletePortMapping></s:Body></s:Envelope>"#
    )
}
