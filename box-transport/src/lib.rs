#![forbid(unsafe_code)]

//! Box UDP transport adapter.
//!
//! Wraps a single `UdpSocket` as a peer-to-peer session that authenticates
//! and replay-protects each datagram. Two modes, selected at construction:
//!
//! * [`TransportMode::Clear`] — no crypto, datagrams pass through unchanged.
//! * [`TransportMode::AeadPsk`] — XChaCha20-Poly1305 under a pre-shared key
//!   ("Noise-lite"): a 4-byte associated header, a `salt || counter` nonce,
//!   peer-salt pinning and a 64-bit sliding replay window.
//!
//! The session splits into an encryptor half and a decryptor half so the
//! broker's input and output stages each own their direction exclusively.

pub mod session;

pub use session::{RxSession, TxSession};

use std::net::SocketAddr;
use std::sync::Arc;

use box_crypto::AeadKey;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::debug;

/// Maximum datagram size the transport will emit or expect.
pub const MAX_DATAGRAM: usize = 1200;

/// Framing mode selected at construction.
#[derive(Clone)]
pub enum TransportMode {
    /// Cleartext passthrough.
    Clear,
    /// PSK AEAD framing.
    AeadPsk(AeadKey),
}

impl TransportMode {
    /// AEAD mode keyed by a pre-shared secret (zero-padded to 32 bytes).
    pub fn psk(psk: &[u8]) -> Self {
        Self::AeadPsk(AeadKey::from_psk(psk))
    }
}

/// Internal rejection reason. The public boundary treats all of these as the
/// same opaque rejection; the tag exists for tests and debug logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reject {
    /// First four bytes are not the frame tag.
    BadHeader,
    /// Frame salt differs from the pinned peer salt.
    SaltMismatch,
    /// Counter already seen inside the window.
    Replay,
    /// Counter more than 63 behind the window head.
    TooOld,
    /// Tag verification failed.
    AeadFailure,
}

/// Transport failure surface.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The inbound frame was dropped. Opaque by design; the internal tag is
    /// for tests.
    #[error("frame rejected")]
    Rejected(Reject),
    /// Plaintext plus framing overhead would exceed [`MAX_DATAGRAM`].
    #[error("datagram too large ({0} bytes)")]
    Oversize(usize),
    /// The 64-bit nonce counter is exhausted; wrap is forbidden.
    #[error("nonce counter exhausted")]
    CounterExhausted,
    /// Socket errors surface unchanged.
    #[error("socket: {0}")]
    Socket(#[from] std::io::Error),
}

pub type Result<T, E = TransportError> = core::result::Result<T, E>;

/// Decryptor half: owns the receive path and the replay window.
pub struct TransportReader {
    socket: Arc<UdpSocket>,
    session: RxSession,
}

impl TransportReader {
    /// Read one datagram, authenticate and replay-check it.
    ///
    /// The replay window is updated strictly before the plaintext is handed
    /// to the caller, so a replayed frame is never dispatched.
    pub async fn recv_from(&mut self) -> Result<(SocketAddr, Vec<u8>)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, peer) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        match self.session.open(&buf) {
            Ok(plaintext) => Ok((peer, plaintext)),
            Err(reason) => {
                debug!(%peer, ?reason, "dropping datagram");
                Err(TransportError::Rejected(reason))
            }
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Encryptor half: owns the send path and the nonce counter.
pub struct TransportWriter {
    socket: Arc<UdpSocket>,
    session: TxSession,
    last_frame: Option<(SocketAddr, Vec<u8>)>,
}

impl TransportWriter {
    /// Encrypt and transmit one frame. Returns the number of plaintext bytes
    /// submitted; never partial.
    pub async fn send_to(&mut self, peer: SocketAddr, plaintext: &[u8]) -> Result<usize> {
        let datagram = self.session.seal(plaintext)?;
        self.socket.send_to(&datagram, peer).await?;
        self.last_frame = Some((peer, datagram));
        Ok(plaintext.len())
    }

    /// Retransmit the most recent ciphertext verbatim. Debug builds only;
    /// exists so replay-rejection tests can produce a byte-identical frame.
    #[cfg(debug_assertions)]
    pub async fn resend_last_frame(&mut self) -> Result<()> {
        if let Some((peer, datagram)) = &self.last_frame {
            self.socket.send_to(datagram, *peer).await?;
        }
        Ok(())
    }

    /// Debug builds only: position the nonce counter, for exhaustion tests.
    #[cfg(debug_assertions)]
    pub fn force_counter(&mut self, counter: u64) {
        self.session.force_counter(counter);
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// A bound transport, both directions in one handle. Split it for the broker
/// pipeline; use it whole from the client.
pub struct SecureTransport {
    reader: TransportReader,
    writer: TransportWriter,
}

impl SecureTransport {
    /// Bind on `addr` with address reuse, the given framing mode applied to
    /// both directions.
    pub fn bind(addr: SocketAddr, mode: TransportMode) -> std::io::Result<Self> {
        let domain = socket2::Domain::for_address(addr);
        let raw = socket2::Socket::new(domain, socket2::Type::DGRAM, None)?;
        raw.set_reuse_address(true)?;
        if addr.is_ipv6() {
            // IPv6-first: one dual-stack socket where the platform allows it.
            let _ = raw.set_only_v6(false);
        }
        raw.bind(&addr.into())?;
        let std_sock: std::net::UdpSocket = raw.into();
        std_sock.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_sock)?);

        let (tx, rx) = match mode {
            TransportMode::Clear => (TxSession::clear(), RxSession::clear()),
            TransportMode::AeadPsk(key) => (TxSession::aead(&key), RxSession::aead(&key)),
        };
        Ok(Self {
            reader: TransportReader {
                socket: socket.clone(),
                session: rx,
            },
            writer: TransportWriter {
                socket,
                session: tx,
                last_frame: None,
            },
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.reader.local_addr()
    }

    /// Split into the decryptor and encryptor halves.
    pub fn split(self) -> (TransportReader, TransportWriter) {
        (self.reader, self.writer)
    }

    pub async fn recv_from(&mut self) -> Result<(SocketAddr, Vec<u8>)> {
        self.reader.recv_from().await
    }

    pub async fn send_to(&mut self, peer: SocketAddr, plaintext: &[u8]) -> Result<usize> {
        self.writer.send_to(peer, plaintext).await
    }

    #[cfg(debug_assertions)]
    pub async fn resend_last_frame(&mut self) -> Result<()> {
        self.writer.resend_last_frame().await
    }

    #[cfg(debug_assertions)]
    pub fn force_counter(&mut self, counter: u64) {
        self.writer.force_counter(counter);
    }
}
