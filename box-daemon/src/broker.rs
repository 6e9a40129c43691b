//! The Main stage: single consumer of the inbound event queue, owner of the
//! queue store and the location index.
//!
//! Dispatch never blocks on the network — replies go through the bounded
//! send queue — and never panics on malformed datagrams: they are logged at
//! debug and dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use box_control::{LocateAnswer, LocationIndex, NatState, PresenceStatus};
use box_core::{config::BoxConfig, NodeId, TimestampMs, UserId};
use box_proto::{
    Command, Frame, HelloPayload, LocatePayload, PutPayload, QueuePayload, Status, StatusPayload,
    MAX_PAYLOAD,
};
use box_store::{QueueName, QueueStore, StoreError};

use crate::pipeline::{Counters, Event, SendQueue};

/// Per-peer protocol state.
#[derive(Debug, Default)]
struct PeerSession {
    handshake_completed: bool,
}

/// Read-only runtime facts the broker needs for admin replies.
pub struct BrokerContext {
    pub node_id: NodeId,
    pub user_id: UserId,
    pub listen_port: u16,
    pub queue_root: PathBuf,
    pub config_path: PathBuf,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub presence_status: watch::Receiver<PresenceStatus>,
    pub nat_state: watch::Receiver<NatState>,
}

/// Admin channel request, answered with a JSON value.
pub enum AdminRequest {
    Status { reply: oneshot::Sender<Value> },
    Stats { reply: oneshot::Sender<Value> },
    Locate { target: Uuid, reply: oneshot::Sender<Value> },
    LocationSummary { reply: oneshot::Sender<Value> },
    Reload { path: Option<PathBuf>, reply: oneshot::Sender<Value> },
}

pub struct Broker {
    store: QueueStore,
    index: LocationIndex,
    sessions: HashMap<SocketAddr, PeerSession>,
    send_queue: SendQueue,
    counters: Arc<Counters>,
    ctx: BrokerContext,
    whoswho_root: QueueName,
}

impl Broker {
    pub fn new(
        store: QueueStore,
        index: LocationIndex,
        send_queue: SendQueue,
        counters: Arc<Counters>,
        ctx: BrokerContext,
    ) -> Self {
        // "/whoswho" is a builtin queue; its name always normalizes.
        #[allow(clippy::unwrap_used)]
        let whoswho_root = QueueName::normalize("/whoswho").unwrap();
        Self {
            store,
            index,
            sessions: HashMap::new(),
            send_queue,
            counters,
            ctx,
            whoswho_root,
        }
    }

    /// Event loop: datagrams and admin requests, single consumer. On the
    /// stop sentinel the queued events are drained before returning.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<Event>,
        mut admin: mpsc::Receiver<AdminRequest>,
    ) {
        let mut admin_open = true;
        loop {
            tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(Event::Datagram(peer, bytes)) => self.handle_datagram(peer, &bytes),
                    Some(Event::Stop) | None => break,
                },
                maybe_admin = admin.recv(), if admin_open => match maybe_admin {
                    Some(request) => self.handle_admin(request),
                    None => admin_open = false,
                },
            }
        }
        while let Ok(event) = events.try_recv() {
            if let Event::Datagram(peer, bytes) = event {
                self.handle_datagram(peer, &bytes);
            }
        }
        self.send_queue.close();
        info!("broker stopped");
    }

    pub fn handle_datagram(&mut self, peer: SocketAddr, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(box_proto::CodecError::UnsupportedCommand(id)) => {
                debug!(%peer, command = id, "unknown command");
                if let Some(request_id) = raw_request_id(bytes) {
                    self.send_status(peer, request_id, Status::BadRequest, "unsupported-command");
                }
                return;
            }
            Err(e) => {
                debug!(%peer, error = %e, "dropping malformed datagram");
                return;
            }
        };
        Counters::bump(&self.counters.frames_dispatched);

        let session = self.sessions.entry(peer).or_default();
        session.handshake_completed = true;

        match frame.command {
            Command::Hello => self.on_hello(peer, &frame),
            Command::Put => self.on_put(peer, &frame),
            Command::Get => self.on_get(peer, &frame),
            Command::Delete => self.on_delete(peer, &frame),
            Command::Status => self.send_status(peer, frame.request_id, Status::Ok, "pong"),
            Command::Locate => self.on_locate(peer, &frame),
            Command::Bye => {
                self.sessions.remove(&peer);
            }
            Command::Search => {
                self.send_status(peer, frame.request_id, Status::BadRequest, "unsupported")
            }
        }
    }

    fn on_hello(&mut self, peer: SocketAddr, frame: &Frame) {
        let hello = match HelloPayload::decode(&frame.payload) {
            Ok(hello) => hello,
            Err(e) => {
                debug!(%peer, error = %e, "bad hello payload");
                return self.send_status(peer, frame.request_id, Status::BadRequest, "bad-request");
            }
        };
        if hello.versions.is_empty() {
            return self.send_status(peer, frame.request_id, Status::BadRequest, "bad-request");
        }
        if !hello.versions.contains(&HelloPayload::SUPPORTED_VERSION) {
            return self.send_status(
                peer,
                frame.request_id,
                Status::BadRequest,
                "unsupported-version",
            );
        }
        let reply = Frame::anonymous(
            Command::Hello,
            frame.request_id,
            HelloPayload::supported(Status::Ok).encode(),
        );
        self.send(peer, reply);
    }

    fn on_put(&mut self, peer: SocketAddr, frame: &Frame) {
        let put = match PutPayload::decode(&frame.payload) {
            Ok(put) => put,
            Err(e) => {
                debug!(%peer, error = %e, "bad put payload");
                return self.send_status(peer, frame.request_id, Status::BadRequest, "bad-put");
            }
        };
        let queue = match QueueName::normalize(&put.queue) {
            Ok(queue) => queue,
            Err(_) => {
                return self.send_status(
                    peer,
                    frame.request_id,
                    Status::BadRequest,
                    "bad-queue-name",
                )
            }
        };
        match self.store.put(&queue, &put.content_type, &put.data) {
            Ok(_) => {
                if queue.is_under(&self.whoswho_root) {
                    self.index_whoswho(&put.data);
                }
                self.send_status(peer, frame.request_id, Status::Ok, "stored");
            }
            Err(StoreError::TooLarge { .. }) => {
                self.send_status(peer, frame.request_id, Status::TooLarge, "too-large");
            }
            Err(e) => {
                warn!(%queue, error = %e, "store put failed");
                Counters::bump(&self.counters.store_errors);
                self.send_status(peer, frame.request_id, Status::InternalError, "internal-error");
            }
        }
    }

    /// Root-resolver role: a PUT under /whoswho refreshes the index entry.
    fn index_whoswho(&mut self, data: &[u8]) {
        match serde_json::from_slice(data) {
            Ok(record) => self.index.upsert(record, TimestampMs::now()),
            Err(e) => debug!(error = %e, "whoswho object is not a location record"),
        }
    }

    fn on_get(&mut self, peer: SocketAddr, frame: &Frame) {
        let request = match QueuePayload::decode(&frame.payload) {
            Ok(request) => request,
            Err(e) => {
                debug!(%peer, error = %e, "bad get payload");
                return self.send_status(peer, frame.request_id, Status::BadRequest, "bad-request");
            }
        };
        let queue = match QueueName::normalize(&request.queue) {
            Ok(queue) => queue,
            Err(_) => {
                return self.send_status(
                    peer,
                    frame.request_id,
                    Status::BadRequest,
                    "bad-queue-name",
                )
            }
        };
        match self.store.get(&queue) {
            Ok(object) => {
                let payload = PutPayload {
                    queue: queue.as_str().to_string(),
                    content_type: object.content_type,
                    data: object.payload,
                };
                let encoded = payload.encode();
                if encoded.len() > MAX_PAYLOAD {
                    // The object was stored out-of-band and cannot ride one
                    // datagram back.
                    return self.send_status(peer, frame.request_id, Status::TooLarge, "too-large");
                }
                self.send(peer, self.response(Command::Put, frame.request_id, encoded));
            }
            Err(StoreError::NotFound) => {
                self.send_status(peer, frame.request_id, Status::NotFound, "not-found");
            }
            Err(e) => {
                warn!(%queue, error = %e, "store get failed");
                Counters::bump(&self.counters.store_errors);
                self.send_status(peer, frame.request_id, Status::InternalError, "internal-error");
            }
        }
    }

    fn on_delete(&mut self, peer: SocketAddr, frame: &Frame) {
        let request = match QueuePayload::decode(&frame.payload) {
            Ok(request) => request,
            Err(_) => {
                return self.send_status(peer, frame.request_id, Status::BadRequest, "bad-request")
            }
        };
        let queue = match QueueName::normalize(&request.queue) {
            Ok(queue) => queue,
            Err(_) => {
                return self.send_status(
                    peer,
                    frame.request_id,
                    Status::BadRequest,
                    "bad-queue-name",
                )
            }
        };
        match self.store.purge(&queue) {
            Ok(removed) => {
                debug!(%queue, removed, "queue drained");
                self.send_status(peer, frame.request_id, Status::Ok, "deleted");
            }
            Err(StoreError::NotFound) => {
                self.send_status(peer, frame.request_id, Status::NotFound, "not-found");
            }
            Err(e) => {
                warn!(%queue, error = %e, "store delete failed");
                Counters::bump(&self.counters.store_errors);
                self.send_status(peer, frame.request_id, Status::InternalError, "internal-error");
            }
        }
    }

    fn on_locate(&mut self, peer: SocketAddr, frame: &Frame) {
        let locate = match LocatePayload::decode(&frame.payload) {
            Ok(locate) => locate,
            Err(_) => {
                return self.send_status(peer, frame.request_id, Status::BadRequest, "bad-request")
            }
        };
        let answer = self.index.lookup(locate.target, TimestampMs::now());
        let found = match &answer {
            Some(LocateAnswer::Node(_)) => true,
            Some(LocateAnswer::User(records)) => !records.is_empty(),
            None => false,
        };
        if !found {
            return self.send_status(peer, frame.request_id, Status::NotFound, "not-found");
        }
        let data = match serde_json::to_vec(&answer) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "locate serialization failed");
                return self.send_status(
                    peer,
                    frame.request_id,
                    Status::InternalError,
                    "internal-error",
                );
            }
        };
        let payload = PutPayload {
            queue: format!("/whoswho/{}", locate.target),
            content_type: "application/json".to_string(),
            data,
        };
        self.send(peer, self.response(Command::Put, frame.request_id, payload.encode()));
    }

    fn response(&self, command: Command, request_id: Uuid, payload: Vec<u8>) -> Frame {
        Frame {
            command,
            request_id,
            node_id: self.ctx.node_id,
            user_id: self.ctx.user_id,
            payload,
        }
    }

    fn send_status(&self, peer: SocketAddr, request_id: Uuid, status: Status, message: &str) {
        let payload = StatusPayload::new(status, message).encode();
        self.send(peer, self.response(Command::Status, request_id, payload));
    }

    fn send(&self, peer: SocketAddr, frame: Frame) {
        self.send_queue.push(peer, frame.encode());
    }

    // ---------------- Admin channel ----------------

    fn handle_admin(&mut self, request: AdminRequest) {
        match request {
            AdminRequest::Status { reply } => {
                let _ = reply.send(self.admin_status());
            }
            AdminRequest::Stats { reply } => {
                let _ = reply.send(self.admin_stats());
            }
            AdminRequest::Locate { target, reply } => {
                let _ = reply.send(self.admin_locate(target));
            }
            AdminRequest::LocationSummary { reply } => {
                let summary = self.index.summary(TimestampMs::now());
                if summary.stale_nodes.is_empty() && summary.stale_users.is_empty() {
                    debug!(total = summary.total_nodes, "location summary computed");
                } else {
                    warn!(
                        stale_nodes = summary.stale_nodes.len(),
                        stale_users = summary.stale_users.len(),
                        "stale presence records"
                    );
                }
                let _ = reply.send(json!({ "status": "ok", "summary": summary }));
            }
            AdminRequest::Reload { path, reply } => {
                let _ = reply.send(self.admin_reload(path));
            }
        }
    }

    fn admin_status(&self) -> Value {
        let metrics = self.store.metrics().unwrap_or_default();
        let presence = self.ctx.presence_status.borrow().clone();
        let nat = self.ctx.nat_state.borrow().clone();
        json!({
            "status": "ok",
            "nodeUUID": self.ctx.node_id.0,
            "userUUID": self.ctx.user_id.0,
            "port": self.ctx.listen_port,
            "hasGlobalIPv6": presence.has_global_ipv6,
            "queueRoot": self.ctx.queue_root.display().to_string(),
            "queueCount": metrics.queue_count,
            "objects": metrics.object_count,
            "freeBytes": free_bytes(&self.ctx.queue_root),
            "portMapping": nat.mapping,
            "portMappingError": nat.error,
            "onlineSince": self.ctx.started_at.to_rfc3339(),
            "lastPresenceUpdate": presence.last_publish_ms,
            "presenceError": presence.last_error,
        })
    }

    fn admin_stats(&self) -> Value {
        let metrics = self.store.metrics().unwrap_or_default();
        json!({
            "status": "ok",
            "datagramsIn": Counters::read(&self.counters.datagrams_in),
            "datagramsOut": Counters::read(&self.counters.datagrams_out),
            "framesDispatched": Counters::read(&self.counters.frames_dispatched),
            "rejectedEvents": Counters::read(&self.counters.rejected_events),
            "storeErrors": Counters::read(&self.counters.store_errors),
            "sessions": self
                .sessions
                .values()
                .filter(|s| s.handshake_completed)
                .count(),
            "queueCount": metrics.queue_count,
            "objects": metrics.object_count,
        })
    }

    fn admin_locate(&self, target: Uuid) -> Value {
        match self.index.lookup(target, TimestampMs::now()) {
            Some(LocateAnswer::Node(record)) => json!({ "status": "ok", "node": record }),
            Some(LocateAnswer::User(records)) if !records.is_empty() => {
                json!({ "status": "ok", "nodes": records })
            }
            _ => json!({ "status": "error", "message": "node-not-found" }),
        }
    }

    fn admin_reload(&mut self, path: Option<PathBuf>) -> Value {
        let path = path.unwrap_or_else(|| self.ctx.config_path.clone());
        let config = match BoxConfig::from_file(&path) {
            Ok(config) => config,
            Err(e) => return json!({ "status": "error", "message": e.to_string() }),
        };
        match QueueStore::open(
            &self.ctx.queue_root,
            config.queues.permanent.clone(),
            config.queues.max_object_bytes,
        ) {
            Ok(store) => self.store = store,
            Err(e) => {
                return json!({
                    "status": "error",
                    "message": format!("storage unavailable: {e}"),
                })
            }
        }
        self.index
            .set_stale_threshold(config.presence.stale_threshold_ms);
        info!(path = %path.display(), "configuration reloaded");
        json!({
            "status": "ok",
            "config": {
                "listenPort": config.network.listen_port,
                "permanentQueues": config.queues.permanent,
                "maxObjectBytes": config.queues.max_object_bytes,
                "publishIntervalS": config.presence.publish_interval_s,
                "staleThresholdMs": config.presence.stale_threshold_ms,
                "rootResolvers": config.presence.root_resolvers,
                "natEnabled": config.nat.enabled,
                "logLevel": config.log.level,
                "logTarget": config.log.target,
            },
        })
    }
}

/// Best-effort request-id recovery from a frame whose command id is unknown;
/// the fixed layout still holds.
fn raw_request_id(bytes: &[u8]) -> Option<Uuid> {
    if bytes.len() < 26 {
        return None;
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&bytes[10..26]);
    Some(Uuid::from_bytes(id))
}

/// Available bytes on the filesystem holding `path`, by longest mount-point
/// prefix match.
fn free_bytes(path: &std::path::Path) -> Option<u64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(sysinfo::Disk::available_space)
}
