//! Pipeline plumbing: the inbound event type, the outbound send queue with
//! per-peer eviction, stage counters, and the two network stage tasks.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, warn};

use box_transport::{TransportError, TransportReader, TransportWriter};

/// Inbound pipeline event. `Stop` is the drain sentinel.
#[derive(Debug)]
pub enum Event {
    /// One authenticated (or cleartext) datagram.
    Datagram(SocketAddr, Vec<u8>),
    Stop,
}

/// Stage counters for the admin `stats` command.
#[derive(Debug, Default)]
pub struct Counters {
    pub datagrams_in: AtomicU64,
    pub datagrams_out: AtomicU64,
    pub frames_dispatched: AtomicU64,
    pub rejected_events: AtomicU64,
    pub store_errors: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Bounded FIFO between Main and NetworkOutput.
///
/// Pushing never blocks: when the queue is full, the oldest pending send to
/// the same peer is evicted first, falling back to the oldest overall.
/// Per-peer FIFO order is preserved for everything that stays queued.
#[derive(Clone)]
pub struct SendQueue {
    inner: Arc<SendQueueInner>,
}

struct SendQueueInner {
    entries: Mutex<SendQueueState>,
    notify: Notify,
    capacity: usize,
}

struct SendQueueState {
    queue: VecDeque<(SocketAddr, Vec<u8>)>,
    closed: bool,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(SendQueueInner {
                entries: Mutex::new(SendQueueState {
                    queue: VecDeque::new(),
                    closed: false,
                }),
                notify: Notify::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Enqueue one datagram, evicting under pressure as described above.
    /// Returns false when the queue is already closed.
    pub fn push(&self, peer: SocketAddr, datagram: Vec<u8>) -> bool {
        let mut state = match self.inner.entries.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.closed {
            return false;
        }
        if state.queue.len() >= self.inner.capacity {
            let evict_at = state
                .queue
                .iter()
                .position(|(queued_peer, _)| *queued_peer == peer)
                .unwrap_or(0);
            let (evicted_peer, _) = state.queue.remove(evict_at).unwrap_or((peer, Vec::new()));
            debug!(peer = %evicted_peer, "send queue full, evicting oldest pending send");
        }
        state.queue.push_back((peer, datagram));
        drop(state);
        self.inner.notify.notify_one();
        true
    }

    /// Dequeue the next datagram; `None` once closed and drained.
    pub async fn pop(&self) -> Option<(SocketAddr, Vec<u8>)> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = match self.inner.entries.lock() {
                    Ok(state) => state,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(entry) = state.queue.pop_front() {
                    return Some(entry);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close for new pushes; consumers drain what is left.
    pub fn close(&self) {
        let mut state = match self.inner.entries.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.closed = true;
        drop(state);
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        match self.inner.entries.lock() {
            Ok(state) => state.queue.len(),
            Err(poisoned) => poisoned.into_inner().queue.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// NetworkInput: the receive loop. Decryption happens inside the transport
/// reader; only authenticated plaintext reaches the event queue. Posting is
/// non-blocking — a full Main queue drops the event and bumps the counter.
pub async fn network_input(
    mut reader: TransportReader,
    events: mpsc::Sender<Event>,
    counters: Arc<Counters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut socket_errors = 0u32;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = reader.recv_from() => match received {
                Ok((peer, plaintext)) => {
                    socket_errors = 0;
                    Counters::bump(&counters.datagrams_in);
                    if events.try_send(Event::Datagram(peer, plaintext)).is_err() {
                        Counters::bump(&counters.rejected_events);
                        warn!(%peer, "event queue full, dropping datagram");
                    }
                }
                Err(TransportError::Rejected(_)) => {
                    // Already logged at debug by the transport; keep serving.
                    Counters::bump(&counters.rejected_events);
                }
                Err(TransportError::Socket(e)) => {
                    socket_errors += 1;
                    error!(error = %e, "udp recv error");
                    if socket_errors >= 5 {
                        // The fd is unusable; escalate to shutdown.
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "unexpected receive failure");
                }
            }
        }
    }
    let _ = events.send(Event::Stop).await;
    debug!("network input stopped");
}

/// NetworkOutput: drains the send queue onto the socket. Encryption happens
/// inside the transport writer. Runs until the queue is closed and empty.
pub async fn network_output(
    mut writer: TransportWriter,
    queue: SendQueue,
    counters: Arc<Counters>,
) {
    while let Some((peer, datagram)) = queue.pop().await {
        match writer.send_to(peer, &datagram).await {
            Ok(_) => Counters::bump(&counters.datagrams_out),
            Err(e) => warn!(%peer, error = %e, "discarding pending send"),
        }
    }
    debug!("network output stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn push_pop_fifo() {
        let queue = SendQueue::new(8);
        assert!(queue.push(addr(1), b"a".to_vec()));
        assert!(queue.push(addr(2), b"b".to_vec()));
        assert_eq!(queue.pop().await.unwrap().1, b"a");
        assert_eq!(queue.pop().await.unwrap().1, b"b");
    }

    #[tokio::test]
    async fn full_queue_evicts_same_peer_first() {
        let queue = SendQueue::new(3);
        queue.push(addr(1), b"peer1-old".to_vec());
        queue.push(addr(2), b"peer2".to_vec());
        queue.push(addr(1), b"peer1-new".to_vec());

        // Full; pushing for peer 1 must evict peer 1's oldest, not peer 2's.
        queue.push(addr(1), b"peer1-newest".to_vec());
        let drained: Vec<Vec<u8>> = [
            queue.pop().await.unwrap().1,
            queue.pop().await.unwrap().1,
            queue.pop().await.unwrap().1,
        ]
        .to_vec();
        assert_eq!(drained, vec![b"peer2".to_vec(), b"peer1-new".to_vec(), b"peer1-newest".to_vec()]);
    }

    #[tokio::test]
    async fn full_queue_falls_back_to_oldest_overall() {
        let queue = SendQueue::new(2);
        queue.push(addr(1), b"oldest".to_vec());
        queue.push(addr(2), b"middle".to_vec());
        // Peer 3 has nothing queued; the oldest overall goes.
        queue.push(addr(3), b"newest".to_vec());

        assert_eq!(queue.pop().await.unwrap().1, b"middle");
        assert_eq!(queue.pop().await.unwrap().1, b"newest");
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = SendQueue::new(4);
        queue.push(addr(1), b"left over".to_vec());
        queue.close();
        assert!(!queue.push(addr(1), b"rejected".to_vec()));
        assert_eq!(queue.pop().await.unwrap().1, b"left over");
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn per_peer_order_survives_eviction() {
        let queue = SendQueue::new(4);
        for i in 0..4u8 {
            queue.push(addr(1), vec![i]);
        }
        queue.push(addr(1), vec![9]);
        let mut seen = Vec::new();
        while let Some((_, d)) = queue.pop().await {
            seen.push(d[0]);
            if queue.is_empty() {
                break;
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 9]);
    }
}
