#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Transport-level integration tests for the connection multiplexer:
//! byte-exact delivery across many write events, drain semantics,
//! failure isolation, and UDP transmission stamping.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use peermux::error::PeermuxError;
use peermux::mux::{
    ChannelEvents, ConnectionId, ListenerId, Multiplexer, UdpDirection, UdpRegistrationId,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum Ev {
    Accepted(ConnectionId, SocketAddr),
    Connected(ConnectionId, SocketAddr),
    ConnectFailed(String),
    Data(ConnectionId, Bytes),
    Datagram(UdpRegistrationId, i32, Bytes),
    Closed(ConnectionId, Option<String>),
}

struct Forwarder(mpsc::UnboundedSender<Ev>);

impl ChannelEvents for Forwarder {
    fn accepted(&mut self, _listener: ListenerId, id: ConnectionId, peer: SocketAddr) {
        let _ = self.0.send(Ev::Accepted(id, peer));
    }

    fn connected(&mut self, id: ConnectionId, peer: SocketAddr) {
        let _ = self.0.send(Ev::Connected(id, peer));
    }

    fn connect_failed(&mut self, endpoint: &str, _cause: PeermuxError) {
        let _ = self.0.send(Ev::ConnectFailed(endpoint.to_string()));
    }

    fn data(&mut self, id: ConnectionId, bytes: Bytes) {
        let _ = self.0.send(Ev::Data(id, bytes));
    }

    fn datagram(
        &mut self,
        registration: UdpRegistrationId,
        _from: SocketAddr,
        transmission_id: i32,
        payload: Bytes,
    ) {
        let _ = self.0.send(Ev::Datagram(registration, transmission_id, payload));
    }

    fn closed(&mut self, id: ConnectionId, cause: Option<PeermuxError>) {
        let _ = self.0.send(Ev::Closed(id, cause.map(|c| c.to_string())));
    }
}

fn spawn_mux() -> (Multiplexer, mpsc::UnboundedReceiver<Ev>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mux = Multiplexer::spawn(move |_| Box::new(Forwarder(tx)));
    (mux, rx)
}

async fn next_ev(rx: &mut mpsc::UnboundedReceiver<Ev>) -> Ev {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Deterministic payload so any corruption or reordering is visible.
fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Collect Data events for `id` until `expected` bytes arrived.
async fn collect_bytes(
    rx: &mut mpsc::UnboundedReceiver<Ev>,
    id: ConnectionId,
    expected: usize,
) -> Vec<u8> {
    let mut received = Vec::with_capacity(expected);
    while received.len() < expected {
        match next_ev(rx).await {
            Ev::Data(got, bytes) if got == id => received.extend_from_slice(&bytes),
            Ev::Data(..) => {}
            other => panic!("unexpected event while collecting: {other:?}"),
        }
    }
    received
}

#[tokio::test]
async fn accept_connect_and_exchange() {
    let (server, mut server_rx) = spawn_mux();
    let (client, mut client_rx) = spawn_mux();

    let (_listener, addr) = server.listen("127.0.0.1:0").await.unwrap();
    client.connect(&addr.to_string()).unwrap();

    let server_conn = match next_ev(&mut server_rx).await {
        Ev::Accepted(id, _) => id,
        other => panic!("expected accept, got {other:?}"),
    };
    let client_conn = match next_ev(&mut client_rx).await {
        Ev::Connected(id, _) => id,
        other => panic!("expected connect, got {other:?}"),
    };

    client.send(client_conn, Bytes::from_static(b"ping")).unwrap();
    let received = collect_bytes(&mut server_rx, server_conn, 4).await;
    assert_eq!(received, b"ping");

    server.send(server_conn, Bytes::from_static(b"pong")).unwrap();
    let received = collect_bytes(&mut client_rx, client_conn, 4).await;
    assert_eq!(received, b"pong");

    server.shutdown();
    client.shutdown();
}

#[tokio::test]
async fn large_payload_survives_many_write_events() {
    let (server, mut server_rx) = spawn_mux();
    let (client, mut client_rx) = spawn_mux();

    let (_listener, addr) = server.listen("127.0.0.1:0").await.unwrap();
    client.connect(&addr.to_string()).unwrap();

    let server_conn = match next_ev(&mut server_rx).await {
        Ev::Accepted(id, _) => id,
        other => panic!("expected accept, got {other:?}"),
    };
    let client_conn = match next_ev(&mut client_rx).await {
        Ev::Connected(id, _) => id,
        other => panic!("expected connect, got {other:?}"),
    };

    // Far larger than any single writable chunk; must arrive byte-exact
    // with no reordering across the partial writes.
    let payload = patterned(8 * 1024 * 1024);
    client.send(client_conn, Bytes::from(payload.clone())).unwrap();

    let received = collect_bytes(&mut server_rx, server_conn, payload.len()).await;
    assert_eq!(received, payload);

    server.shutdown();
    client.shutdown();
}

#[tokio::test]
async fn drain_then_close_delivers_every_buffered_byte() {
    let (server, mut server_rx) = spawn_mux();
    let (client, mut client_rx) = spawn_mux();

    let (_listener, addr) = server.listen("127.0.0.1:0").await.unwrap();
    client.connect(&addr.to_string()).unwrap();

    let server_conn = match next_ev(&mut server_rx).await {
        Ev::Accepted(id, _) => id,
        other => panic!("expected accept, got {other:?}"),
    };
    let client_conn = match next_ev(&mut client_rx).await {
        Ev::Connected(id, _) => id,
        other => panic!("expected connect, got {other:?}"),
    };

    let payload = patterned(4 * 1024 * 1024);
    for chunk in payload.chunks(64 * 1024) {
        client
            .send(client_conn, Bytes::copy_from_slice(chunk))
            .unwrap();
    }
    client.disconnect_after_drain(client_conn).unwrap();

    // Every previously buffered byte lands before the close.
    let received = collect_bytes(&mut server_rx, server_conn, payload.len()).await;
    assert_eq!(received, payload);
    match next_ev(&mut server_rx).await {
        Ev::Closed(id, cause) => {
            assert_eq!(id, server_conn);
            assert!(cause.is_none());
        }
        other => panic!("expected close, got {other:?}"),
    }
    match next_ev(&mut client_rx).await {
        Ev::Closed(id, _) => assert_eq!(id, client_conn),
        other => panic!("expected close, got {other:?}"),
    }

    server.shutdown();
    client.shutdown();
}

#[tokio::test]
async fn disconnect_without_drain_closes_immediately() {
    let (server, mut server_rx) = spawn_mux();
    let (client, mut client_rx) = spawn_mux();

    let (_listener, addr) = server.listen("127.0.0.1:0").await.unwrap();
    client.connect(&addr.to_string()).unwrap();

    let server_conn = match next_ev(&mut server_rx).await {
        Ev::Accepted(id, _) => id,
        other => panic!("expected accept, got {other:?}"),
    };
    let client_conn = match next_ev(&mut client_rx).await {
        Ev::Connected(id, _) => id,
        other => panic!("expected connect, got {other:?}"),
    };

    // Queue a large amount and cut the connection: unsent bytes are
    // discarded, not flushed.
    let total = 32 * 1024 * 1024;
    for _ in 0..(total / (64 * 1024)) {
        client
            .send(client_conn, Bytes::from(vec![0xCD; 64 * 1024]))
            .unwrap();
    }
    client.disconnect(client_conn).unwrap();

    match next_ev(&mut client_rx).await {
        Ev::Closed(id, cause) => {
            assert_eq!(id, client_conn);
            assert!(cause.is_none());
        }
        other => panic!("expected close, got {other:?}"),
    }

    // The server sees whatever made it out, then the stream ends.
    let mut received = 0usize;
    loop {
        match next_ev(&mut server_rx).await {
            Ev::Data(id, bytes) if id == server_conn => received += bytes.len(),
            Ev::Closed(id, _) => {
                assert_eq!(id, server_conn);
                break;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(received <= total);

    server.shutdown();
    client.shutdown();
}

#[tokio::test]
async fn connect_failure_surfaces_endpoint_and_cause() {
    let (client, mut client_rx) = spawn_mux();

    // Bind-then-drop guarantees a dead port.
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = dead.local_addr().unwrap();
    drop(dead);

    client.connect(&addr.to_string()).unwrap();
    match next_ev(&mut client_rx).await {
        Ev::ConnectFailed(endpoint) => assert_eq!(endpoint, addr.to_string()),
        other => panic!("expected connect failure, got {other:?}"),
    }

    client.shutdown();
}

#[tokio::test]
async fn one_connection_failure_leaves_others_untouched() {
    let (server, mut server_rx) = spawn_mux();
    let (client, mut client_rx) = spawn_mux();

    let (_listener, addr) = server.listen("127.0.0.1:0").await.unwrap();
    client.connect(&addr.to_string()).unwrap();
    client.connect(&addr.to_string()).unwrap();

    let mut client_conns = Vec::new();
    for _ in 0..2 {
        match next_ev(&mut client_rx).await {
            Ev::Connected(id, _) => client_conns.push(id),
            other => panic!("expected connect, got {other:?}"),
        }
    }
    let mut server_conns = Vec::new();
    for _ in 0..2 {
        match next_ev(&mut server_rx).await {
            Ev::Accepted(id, _) => server_conns.push(id),
            other => panic!("expected accept, got {other:?}"),
        }
    }

    // Tear down the first connection; the second keeps working.
    client.disconnect(client_conns[0]).unwrap();
    match next_ev(&mut client_rx).await {
        Ev::Closed(id, _) => assert_eq!(id, client_conns[0]),
        other => panic!("expected close, got {other:?}"),
    }

    client
        .send(client_conns[1], Bytes::from_static(b"still alive"))
        .unwrap();
    let mut survivor_bytes = Vec::new();
    while survivor_bytes.len() < 11 {
        match next_ev(&mut server_rx).await {
            Ev::Data(_, bytes) => survivor_bytes.extend_from_slice(&bytes),
            // The torn-down sibling closing is expected noise here.
            Ev::Closed(..) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(survivor_bytes, b"still alive");

    server.shutdown();
    client.shutdown();
}

#[tokio::test]
async fn udp_datagrams_carry_incrementing_transmission_ids() {
    let (sender, _sender_rx) = spawn_mux();
    let (receiver, mut receiver_rx) = spawn_mux();

    let (_reg_in, recv_addr) = receiver
        .register_udp("127.0.0.1:0", None, UdpDirection::Read)
        .await
        .unwrap();
    let (reg_out, _addr) = sender
        .register_udp("127.0.0.1:0", Some(recv_addr), UdpDirection::Write)
        .await
        .unwrap();

    for i in 0..3u8 {
        sender
            .send_udp(reg_out, Bytes::from(vec![i; 16]))
            .unwrap();
    }

    // Datagrams may reorder in principle; match stamps to payloads.
    let mut seen = Vec::new();
    for _ in 0..3 {
        match next_ev(&mut receiver_rx).await {
            Ev::Datagram(_, transmission_id, payload) => {
                assert_eq!(payload.len(), 16);
                assert_eq!(payload[0] as i32, transmission_id);
                seen.push(transmission_id);
            }
            other => panic!("expected datagram, got {other:?}"),
        }
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);

    sender.shutdown();
    receiver.shutdown();
}

#[tokio::test]
async fn shutdown_closes_every_open_connection() {
    let (server, mut server_rx) = spawn_mux();
    let (client, mut client_rx) = spawn_mux();

    let (_listener, addr) = server.listen("127.0.0.1:0").await.unwrap();
    client.connect(&addr.to_string()).unwrap();

    let server_conn = match next_ev(&mut server_rx).await {
        Ev::Accepted(id, _) => id,
        other => panic!("expected accept, got {other:?}"),
    };
    match next_ev(&mut client_rx).await {
        Ev::Connected(..) => {}
        other => panic!("expected connect, got {other:?}"),
    }

    server.shutdown();
    match next_ev(&mut server_rx).await {
        Ev::Closed(id, _) => assert_eq!(id, server_conn),
        other => panic!("expected close, got {other:?}"),
    }

    client.shutdown();
}
