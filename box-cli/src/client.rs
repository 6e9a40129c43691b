//! Network client: one request frame out, one reply frame back.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use uuid::Uuid;

use box_core::{NodeId, UserId};
use box_proto::{
    Command, Frame, HelloPayload, LocatePayload, PutPayload, QueuePayload, Status, StatusPayload,
};
use box_transport::{SecureTransport, TransportMode};

/// GET result: the object, or the broker's STATUS verdict.
pub enum GetOutcome {
    Object { content_type: String, data: Vec<u8> },
    Status(StatusPayload),
}

/// LOCATE result: the JSON answer, or the broker's STATUS verdict.
pub enum LocateOutcome {
    Found(serde_json::Value),
    Status(StatusPayload),
}

pub struct BrokerClient {
    transport: SecureTransport,
    server: SocketAddr,
    node_id: NodeId,
    user_id: UserId,
    timeout: Duration,
}

impl BrokerClient {
    pub fn connect(
        server: SocketAddr,
        mode: TransportMode,
        node_id: NodeId,
        user_id: UserId,
        timeout: Duration,
    ) -> Result<Self> {
        let bind: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let transport = SecureTransport::bind(bind, mode).context("binding client socket")?;
        Ok(Self {
            transport,
            server,
            node_id,
            user_id,
            timeout,
        })
    }

    /// Negotiate versions. The broker either answers HELLO or refuses with a
    /// STATUS frame.
    pub async fn hello(&mut self) -> Result<Vec<u16>> {
        let reply = self
            .call(Frame::anonymous(
                Command::Hello,
                Uuid::new_v4(),
                HelloPayload::supported(Status::Ok).encode(),
            ))
            .await?;
        match reply.command {
            Command::Hello => Ok(HelloPayload::decode(&reply.payload)?.versions),
            Command::Status => {
                let status = StatusPayload::decode(&reply.payload)?;
                bail!("broker refused hello: {:?} {}", status.status, status.message)
            }
            other => bail!("unexpected reply command {other:?}"),
        }
    }

    pub async fn put(
        &mut self,
        queue: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<StatusPayload> {
        let payload = PutPayload {
            queue: queue.to_string(),
            content_type: content_type.to_string(),
            data: data.to_vec(),
        };
        let reply = self.call(self.request(Command::Put, payload.encode())).await?;
        self.expect_status(&reply)
    }

    pub async fn get(&mut self, queue: &str) -> Result<GetOutcome> {
        let payload = QueuePayload {
            queue: queue.to_string(),
        };
        let reply = self.call(self.request(Command::Get, payload.encode())).await?;
        match reply.command {
            // The broker echoes the stored object as a PUT frame.
            Command::Put => {
                let object = PutPayload::decode(&reply.payload)?;
                Ok(GetOutcome::Object {
                    content_type: object.content_type,
                    data: object.data,
                })
            }
            Command::Status => Ok(GetOutcome::Status(StatusPayload::decode(&reply.payload)?)),
            other => bail!("unexpected reply command {other:?}"),
        }
    }

    pub async fn locate(&mut self, target: Uuid) -> Result<LocateOutcome> {
        let reply = self
            .call(self.request(Command::Locate, LocatePayload { target }.encode()))
            .await?;
        match reply.command {
            Command::Put => {
                let object = PutPayload::decode(&reply.payload)?;
                Ok(LocateOutcome::Found(serde_json::from_slice(&object.data)?))
            }
            Command::Status => Ok(LocateOutcome::Status(StatusPayload::decode(&reply.payload)?)),
            other => bail!("unexpected reply command {other:?}"),
        }
    }

    fn request(&self, command: Command, payload: Vec<u8>) -> Frame {
        Frame {
            command,
            request_id: Uuid::new_v4(),
            node_id: self.node_id,
            user_id: self.user_id,
            payload,
        }
    }

    /// Send one frame and wait for the matching reply, skipping stray frames
    /// with foreign request ids.
    async fn call(&mut self, frame: Frame) -> Result<Frame> {
        let request_id = frame.request_id;
        self.transport
            .send_to(self.server, &frame.encode())
            .await
            .context("sending request")?;
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                bail!("no reply from {} within {:?}", self.server, self.timeout);
            }
            let (peer, datagram) =
                match tokio::time::timeout(remaining, self.transport.recv_from()).await {
                    Ok(Ok(received)) => received,
                    Ok(Err(e)) => return Err(e).context("receiving reply"),
                    Err(_) => bail!("no reply from {} within {:?}", self.server, self.timeout),
                };
            if peer != self.server {
                continue;
            }
            let reply = Frame::decode(&datagram).context("decoding reply")?;
            if reply.request_id == request_id {
                return Ok(reply);
            }
        }
    }

    fn expect_status(&self, reply: &Frame) -> Result<StatusPayload> {
        if reply.command != Command::Status {
            bail!("unexpected reply command {:?}", reply.command);
        }
        Ok(StatusPayload::decode(&reply.payload)?)
    }
}
