//! Presence publishing loop.
//!
//! Every interval (60 s by default) the publisher assembles a
//! [`LocationRecord`] from runtime state and PUTs it into the `/whoswho`
//! permanent queue at each configured root resolver — once under the node
//! UUID and once as an alias under the user UUID. Failures are logged and
//! never block the loop.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use box_core::{NodeId, TimestampMs, UserId};
use box_proto::{Command, Frame, PutPayload};

use crate::location::{
    AddressEntry, AddressSource, Connectivity, LocationRecord, PortMappingState,
};
use crate::nat::NatState;

/// Content type of published records.
const RECORD_CONTENT_TYPE: &str = "application/json";

/// What the admin channel reports about the publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceStatus {
    pub last_publish_ms: Option<u64>,
    pub last_error: Option<String>,
    pub has_global_ipv6: bool,
}

#[derive(Debug, Error)]
enum PresenceError {
    #[error("publish failed: {0}")]
    PublishFailed(String),
}

/// Periodic publisher task. Communicates with the broker only through the
/// outbound datagram channel; no callbacks into the runtime.
pub struct PresencePublisher {
    pub node_id: NodeId,
    pub user_id: UserId,
    pub listen_port: u16,
    pub resolvers: Vec<SocketAddr>,
    pub interval: Duration,
    pub node_public_key: Option<String>,
    pub nat_enabled: bool,
    /// Outbound datagrams, handed to the broker's network-output stage.
    pub outbox: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    /// Latest NAT coordinator state.
    pub nat_state: watch::Receiver<NatState>,
    /// Publisher health, read by the admin channel.
    pub status_tx: watch::Sender<PresenceStatus>,
}

impl PresencePublisher {
    /// Run until shutdown. The first publish happens immediately.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let since = TimestampMs::now();
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let record = self.build_record(since).await;
            let has_global_ipv6 = record.connectivity.has_global_ipv6;
            let now = TimestampMs::now();
            match self.publish(&record) {
                Ok(()) => {
                    let _ = self.status_tx.send(PresenceStatus {
                        last_publish_ms: Some(now.0),
                        last_error: None,
                        has_global_ipv6,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "presence publish failed");
                    let previous = self.status_tx.borrow().last_publish_ms;
                    let _ = self.status_tx.send(PresenceStatus {
                        last_publish_ms: previous,
                        last_error: Some(e.to_string()),
                        has_global_ipv6,
                    });
                }
            }
        }
        debug!("presence publisher stopped");
    }

    /// Assemble the record from current runtime state.
    pub async fn build_record(&self, since: TimestampMs) -> LocationRecord {
        let mut addresses = vec![AddressEntry::classify(
            IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            self.listen_port,
            AddressSource::Probe,
        )];

        let (global_ipv6, ipv6_probe_error) = match probe_global_ipv6().await {
            Ok(ip) => (vec![ip], None),
            Err(reason) => (Vec::new(), Some(reason)),
        };
        for ip in &global_ipv6 {
            addresses.push(AddressEntry::classify(
                IpAddr::V6(*ip),
                self.listen_port,
                AddressSource::Probe,
            ));
        }

        let nat = self.nat_state.borrow().clone();
        let port_mapping = match (&nat.mapping, &nat.error) {
            (Some(snapshot), _) => PortMappingState {
                enabled: self.nat_enabled,
                origin: "coordinator".to_string(),
                backend: Some(snapshot.backend.to_string()),
                external_ipv4: snapshot.external_ipv4,
                external_port: Some(snapshot.external_port),
                peer: snapshot.peer_state.clone(),
                reachability: None,
                status: Some("active".to_string()),
                error: None,
            },
            (None, error) => PortMappingState {
                enabled: self.nat_enabled,
                origin: "coordinator".to_string(),
                status: error.is_none().then(|| "inactive".to_string()),
                error: error.clone(),
                ..PortMappingState::default()
            },
        };

        let now = TimestampMs::now();
        LocationRecord {
            user_id: self.user_id,
            node_id: self.node_id,
            addresses,
            connectivity: Connectivity {
                has_global_ipv6: !global_ipv6.is_empty(),
                global_ipv6,
                ipv6_probe_error,
                port_mapping,
            },
            online: true,
            since_ms: since.0,
            last_seen_ms: now.0.max(since.0),
            node_public_key: self.node_public_key.clone(),
            tags: None,
        }
    }

    /// One PUT per resolver per alias (node uuid, then user uuid).
    fn publish(&self, record: &LocationRecord) -> Result<(), PresenceError> {
        let data = serde_json::to_vec(record)
            .map_err(|e| PresenceError::PublishFailed(e.to_string()))?;
        for resolver in &self.resolvers {
            for alias in [self.node_id.0, self.user_id.0] {
                let frame = self.put_frame(alias, data.clone());
                self.outbox
                    .try_send((*resolver, frame.encode()))
                    .map_err(|e| PresenceError::PublishFailed(format!("{resolver}: {e}")))?;
            }
        }
        Ok(())
    }

    fn put_frame(&self, alias: Uuid, data: Vec<u8>) -> Frame {
        let payload = PutPayload {
            queue: format!("/whoswho/{alias}"),
            content_type: RECORD_CONTENT_TYPE.to_string(),
            data,
        };
        Frame {
            command: Command::Put,
            request_id: Uuid::new_v4(),
            node_id: self.node_id,
            user_id: self.user_id,
            payload: payload.encode(),
        }
    }
}

/// Find a global IPv6 address by asking the OS to route towards a fixed
/// global literal (no packet leaves the host for a UDP connect).
pub async fn probe_global_ipv6() -> Result<Ipv6Addr, String> {
    let socket = UdpSocket::bind("[::]:0")
        .await
        .map_err(|e| format!("bind: {e}"))?;
    socket
        .connect("[2001:4860:4860::8888]:9")
        .await
        .map_err(|e| format!("connect: {e}"))?;
    match socket.local_addr().map_err(|e| format!("local_addr: {e}"))? {
        SocketAddr::V6(v6) if is_global_ipv6(v6.ip()) => Ok(*v6.ip()),
        SocketAddr::V6(v6) => Err(format!("no global ipv6 (local is {})", v6.ip())),
        SocketAddr::V4(_) => Err("no ipv6 route".to_string()),
    }
}

fn is_global_ipv6(ip: &Ipv6Addr) -> bool {
    let seg0 = ip.segments()[0];
    !ip.is_loopback()
        && !ip.is_unspecified()
        && (seg0 & 0xffc0) != 0xfe80 // link-local
        && (seg0 & 0xfe00) != 0xfc00 // unique-local
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher(outbox: mpsc::Sender<(SocketAddr, Vec<u8>)>) -> PresencePublisher {
        let (_nat_tx, nat_rx) = watch::channel(NatState::default());
        let (status_tx, _status_rx) = watch::channel(PresenceStatus::default());
        PresencePublisher {
            node_id: NodeId(Uuid::new_v4()),
            user_id: UserId(Uuid::new_v4()),
            listen_port: 16962,
            resolvers: vec!["127.0.0.1:19999".parse().unwrap()],
            interval: Duration::from_secs(60),
            node_public_key: Some(hex::encode([7u8; 32])),
            nat_enabled: true,
            outbox,
            nat_state: nat_rx,
            status_tx,
        }
    }

    #[tokio::test]
    async fn publish_emits_node_and_user_aliases() {
        let (tx, mut rx) = mpsc::channel(8);
        let publisher = publisher(tx);
        let record = publisher.build_record(TimestampMs::now()).await;
        publisher.publish(&record).unwrap();

        let mut queues = Vec::new();
        for _ in 0..2 {
            let (_, datagram) = rx.try_recv().unwrap();
            let frame = Frame::decode(&datagram).unwrap();
            assert_eq!(frame.command, Command::Put);
            let put = PutPayload::decode(&frame.payload).unwrap();
            assert_eq!(put.content_type, "application/json");
            let parsed: LocationRecord = serde_json::from_slice(&put.data).unwrap();
            assert_eq!(parsed.node_id, publisher.node_id);
            queues.push(put.queue);
        }
        assert!(queues.contains(&format!("/whoswho/{}", publisher.node_id.0)));
        assert!(queues.contains(&format!("/whoswho/{}", publisher.user_id.0)));
    }

    #[tokio::test]
    async fn full_outbox_surfaces_publish_failure() {
        let (tx, _rx) = mpsc::channel(1);
        let publisher = publisher(tx);
        let record = publisher.build_record(TimestampMs::now()).await;
        // Capacity 1 cannot hold both aliases.
        assert!(publisher.publish(&record).is_err());
    }

    #[tokio::test]
    async fn record_invariant_holds() {
        let (tx, _rx) = mpsc::channel(8);
        let publisher = publisher(tx);
        let record = publisher.build_record(TimestampMs::now()).await;
        assert!(record.last_seen_ms >= record.since_ms);
        assert!(record.online);
        assert_eq!(
            record.connectivity.has_global_ipv6,
            !record.connectivity.global_ipv6.is_empty()
        );
    }

    #[test]
    fn ipv6_scope_filter() {
        assert!(!is_global_ipv6(&"::1".parse().unwrap()));
        assert!(!is_global_ipv6(&"fe80::1".parse().unwrap()));
        assert!(!is_global_ipv6(&"fd00::1".parse().unwrap()));
        assert!(is_global_ipv6(&"2001:db8::1".parse().unwrap()));
    }
}
