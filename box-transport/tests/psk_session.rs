#![forbid(unsafe_code)]

//! End-to-end session behavior over loopback sockets.

use std::net::SocketAddr;

use box_transport::{Reject, SecureTransport, TransportError, TransportMode};

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[tokio::test]
async fn psk_echo() {
    let mut server = SecureTransport::bind(loopback(), TransportMode::psk(b"psk123")).unwrap();
    let mut client = SecureTransport::bind(loopback(), TransportMode::psk(b"psk123")).unwrap();
    let server_addr = server.local_addr().unwrap();

    client.send_to(server_addr, b"ping").await.unwrap();
    let (peer, msg) = server.recv_from().await.unwrap();
    assert_eq!(msg, b"ping");

    server.send_to(peer, b"pong").await.unwrap();
    let (_, reply) = client.recv_from().await.unwrap();
    assert_eq!(reply, b"pong");
}

#[tokio::test]
async fn replayed_ciphertext_rejected() {
    let mut server = SecureTransport::bind(loopback(), TransportMode::psk(b"psk123")).unwrap();
    let mut client = SecureTransport::bind(loopback(), TransportMode::psk(b"psk123")).unwrap();
    let server_addr = server.local_addr().unwrap();

    client.send_to(server_addr, b"ping").await.unwrap();
    let (_, msg) = server.recv_from().await.unwrap();
    assert_eq!(msg, b"ping");

    // Byte-identical retransmission of the last ciphertext.
    client.resend_last_frame().await.unwrap();
    match server.recv_from().await {
        Err(TransportError::Rejected(Reject::Replay)) => {}
        other => panic!("expected replay rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn wrong_key_rejected() {
    let mut server = SecureTransport::bind(loopback(), TransportMode::psk(b"wrong")).unwrap();
    let mut client = SecureTransport::bind(loopback(), TransportMode::psk(b"psk123")).unwrap();
    let server_addr = server.local_addr().unwrap();

    client.send_to(server_addr, b"hello").await.unwrap();
    match server.recv_from().await {
        Err(TransportError::Rejected(Reject::AeadFailure)) => {}
        other => panic!("expected aead rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn clear_mode_passthrough() {
    let mut server = SecureTransport::bind(loopback(), TransportMode::Clear).unwrap();
    let mut client = SecureTransport::bind(loopback(), TransportMode::Clear).unwrap();
    let server_addr = server.local_addr().unwrap();

    client.send_to(server_addr, b"raw bytes").await.unwrap();
    let (_, msg) = server.recv_from().await.unwrap();
    assert_eq!(msg, b"raw bytes");
}

#[tokio::test]
async fn counter_exhaustion_is_a_send_error() {
    let mut client = SecureTransport::bind(loopback(), TransportMode::psk(b"psk123")).unwrap();
    let target = client.local_addr().unwrap();
    client.force_counter(u64::MAX);
    match client.send_to(target, b"never leaves").await {
        Err(TransportError::CounterExhausted) => {}
        other => panic!("expected exhaustion, got {other:?}"),
    }
}
