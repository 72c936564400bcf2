//! Passive checks through the listener

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use hostwatch::actors::listener::{ListenerConfig, ListenerHandle, PeerFilter};
use hostwatch::actors::scheduler::SchedulerHandle;
use hostwatch::address::Address;
use hostwatch::protocol::{AcceptOptions, ConnectOptions, Connection, exchange, frame};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::helpers::{TIMEOUT, gate, scheduler};

async fn listener(scheduler: SchedulerHandle, peers: PeerFilter) -> ListenerHandle {
    ListenerHandle::spawn(
        ListenerConfig {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            peers,
            accept: AcceptOptions::plain(TIMEOUT),
            timeout: TIMEOUT,
        },
        scheduler,
    )
    .await
    .unwrap()
}

fn address(listener: &ListenerHandle) -> Address {
    Address::new("127.0.0.1", listener.local_addr().port())
}

async fn ask(listener: &ListenerHandle, key: &str) -> Vec<u8> {
    exchange(&address(listener), key.as_bytes(), &ConnectOptions::plain(TIMEOUT))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_framed_request() {
    let listener = listener(scheduler(gate(&[], &[])), PeerFilter::default()).await;

    assert_eq!(ask(&listener, "agent.ping").await, b"1");
    assert_eq!(ask(&listener, "agent.hostname").await, b"test-host");
    assert_eq!(
        ask(&listener, "no.such.key").await,
        b"ZBX_NOTSUPPORTED\0Unsupported item key."
    );
    assert!(
        ask(&listener, "agent.ping[").await.starts_with(b"ZBX_NOTSUPPORTED\0Invalid item key format")
    );

    listener.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reply_compression_follows_request() {
    let listener = listener(scheduler(gate(&[], &[])), PeerFilter::default()).await;

    let options = ConnectOptions {
        compress: false,
        ..ConnectOptions::plain(TIMEOUT)
    };
    let mut conn = Connection::connect(&address(&listener), &options).await.unwrap();
    conn.send(b"agent.ping").await.unwrap();

    let reply = conn.recv().await.unwrap();
    assert_eq!(reply, b"1");
}

#[tokio::test]
async fn test_legacy_request_gets_raw_reply() {
    let listener = listener(scheduler(gate(&[], &[])), PeerFilter::default()).await;

    let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();
    stream.write_all(b"agent.ping\n").await.unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();

    assert_eq!(reply, b"1");
}

#[tokio::test]
async fn test_json_request_is_not_supported() {
    let listener = listener(scheduler(gate(&[], &[])), PeerFilter::default()).await;
    let reply = ask(&listener, r#"{"request":"passive checks"}"#).await;
    assert!(reply.starts_with(b"ZBX_NOTSUPPORTED\0"));
}

#[tokio::test]
async fn test_denied_key_is_not_supported() {
    let listener = listener(scheduler(gate(&[], &["agent.version"])), PeerFilter::default()).await;

    assert_eq!(
        ask(&listener, "agent.version").await,
        b"ZBX_NOTSUPPORTED\0Unsupported item key."
    );
    assert_eq!(ask(&listener, "agent.ping").await, b"1");
}

#[tokio::test]
async fn test_unlisted_peer_gets_no_reply() {
    let peers = PeerFilter::from_ips([IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))]);
    let listener = listener(scheduler(gate(&[], &[])), peers).await;

    let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();
    let message = frame::encode(b"agent.ping", true).unwrap();
    // the peer may already have closed the socket
    let _ = stream.write_all(&message).await;

    let mut reply = Vec::new();
    let read = tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut reply)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));
    assert!(reply.is_empty());
}
