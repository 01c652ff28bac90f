use std::io::ErrorKind;
use std::net::SocketAddr;

use serde_json::json;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;

use tether_core::config::HolePunchSettings;
use tether_core::punch::{PunchKind, PunchPacket};
use tether_services::{
    HolePunchError, HolePuncher, NullEvents, PunchNames, UdpChannel, UdpRendezvous,
};

use crate::*;

fn fast() -> HolePunchSettings {
    HolePunchSettings {
        hello_interval_ms: 50,
        punch_timeout_ms: 3_000,
        lookup_timeout_ms: 5_000,
        ..HolePunchSettings::default()
    }
}

/// Answers `pending` for the first `pending` requests, then `peer_info`
/// for "bob" and `peer_not_found` for anyone else.
async fn directory(ports: Vec<u16>, pending: usize) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        let mut answered = 0;
        loop {
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            let request: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();
            assert_eq!(request["type"], "resolve_peer");
            assert_eq!(request["username"], "alice");
            let reply = if answered < pending {
                json!({ "type": "peer_pending" })
            } else if request["target"] == "bob" {
                json!({ "type": "peer_info", "address": "127.0.0.1", "ports": ports })
            } else {
                json!({ "type": "peer_not_found" })
            };
            answered += 1;
            socket.send_to(reply.to_string().as_bytes(), from).await.unwrap();
        }
    });
    addr
}

/// Bob's side of one candidate port: answers HELLO with HELLO_ACK and
/// reports every punch packet it sees.
fn responder(socket: UdpSocket) -> UnboundedReceiver<(PunchKind, SocketAddr)> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            let packet = PunchPacket::decode(&buf[..len]).unwrap();
            assert_eq!((packet.sender.as_str(), packet.target.as_str()), ("alice", "bob"));
            if packet.kind == PunchKind::Hello {
                let ack = PunchPacket::new(PunchKind::HelloAck, "bob", "alice").encode().unwrap();
                socket.send_to(&ack, from).await.unwrap();
            }
            if tx.send((packet.kind, from)).is_err() {
                return;
            }
        }
    });
    rx
}

/// Like `responder`, but hands the socket back once ESTABLISHED arrives.
async fn respond_until_established(socket: UdpSocket) -> (UdpSocket, SocketAddr) {
    let mut buf = [0u8; 512];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await.unwrap();
        match PunchPacket::decode(&buf[..len]).unwrap().kind {
            PunchKind::Hello => {
                let ack = PunchPacket::new(PunchKind::HelloAck, "bob", "alice").encode().unwrap();
                socket.send_to(&ack, from).await.unwrap();
            }
            PunchKind::Established => return (socket, from),
            PunchKind::HelloAck => {}
        }
    }
}

#[tokio::test]
async fn punch_succeeds_on_second_candidate_port() {
    // Port A swallows everything; port B answers.
    let black_hole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port_b_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port_a = black_hole.local_addr().unwrap().port();
    let addr_b = port_b_socket.local_addr().unwrap();
    let mut seen = responder(port_b_socket);

    let dir = directory(vec![port_a, addr_b.port()], 1).await;
    let mut rendezvous = UdpRendezvous::connect(dir).await.unwrap();
    let puncher = HolePuncher::new("alice", fast());

    let link = puncher.connect(&mut rendezvous, "bob").await.unwrap();
    assert_eq!(link.peer, addr_b);
    assert_eq!(link.candidate_index, Some(1));
    let winner_port = link.socket.local_addr().unwrap().port();

    let mut hello_ports = Vec::new();
    let established_from = loop {
        let (kind, from) = tokio::time::timeout(Duration::from_secs(2), seen.recv())
            .await
            .unwrap()
            .unwrap();
        match kind {
            PunchKind::Established => break from,
            PunchKind::Hello => hello_ports.push(from.port()),
            PunchKind::HelloAck => {}
        }
    };
    assert_eq!(established_from.port(), winner_port);

    // Every attempt has stopped: after in-flight HELLOs drain, nothing more
    // arrives for many intervals.
    tokio::time::sleep(Duration::from_millis(150)).await;
    while let Ok((_, from)) = seen.try_recv() {
        hello_ports.push(from.port());
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(seen.try_recv().is_err(), "punch sockets still sending");

    // The losing socket is closed: a datagram to it is refused.
    for port in hello_ports.into_iter().filter(|p| *p != winner_port) {
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        probe.connect(("127.0.0.1", port)).await.unwrap();
        probe.send(b"probe").await.unwrap();
        let mut buf = [0u8; 16];
        match tokio::time::timeout(Duration::from_secs(2), probe.recv(&mut buf)).await {
            Ok(Err(e)) => assert_eq!(e.kind(), ErrorKind::ConnectionRefused),
            other => panic!("losing socket on port {port} still open: {other:?}"),
        }
    }
    drop(black_hole);
}

#[tokio::test]
async fn unknown_peer_is_reported() {
    let dir = directory(vec![1], 0).await;
    let mut rendezvous = UdpRendezvous::connect(dir).await.unwrap();
    let puncher = HolePuncher::new("alice", fast());
    let err = puncher.connect(&mut rendezvous, "carol").await.unwrap_err();
    assert!(matches!(err, HolePunchError::PeerNotFound(name) if name == "carol"));
}

#[tokio::test]
async fn silent_candidates_time_out() {
    let black_hole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = black_hole.local_addr().unwrap().port();
    let dir = directory(vec![port], 0).await;
    let mut rendezvous = UdpRendezvous::connect(dir).await.unwrap();

    let settings = HolePunchSettings {
        punch_timeout_ms: 400,
        ..fast()
    };
    let err = HolePuncher::new("alice", settings)
        .connect(&mut rendezvous, "bob")
        .await
        .unwrap_err();
    assert!(matches!(err, HolePunchError::PunchTimeout(d) if d == Duration::from_millis(400)));
}

#[tokio::test]
async fn punched_link_carries_a_message() {
    let bob_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let bob_addr = bob_socket.local_addr().unwrap();
    let bob_side = tokio::spawn(respond_until_established(bob_socket));

    let dir = directory(vec![bob_addr.port()], 0).await;
    let mut rendezvous = UdpRendezvous::connect(dir).await.unwrap();
    let link = HolePuncher::new("alice", fast())
        .connect(&mut rendezvous, "bob")
        .await
        .unwrap();
    let (bob_socket, alice_addr) = bob_side.await.unwrap();

    let (shutdown, _) = broadcast::channel(1);
    let config = TetherConfig::default();

    let (alice_tx, alice_rx) = mpsc::channel(1024);
    let alice_channel = UdpChannel::spawn_punched(
        link,
        PunchNames {
            local: "alice".into(),
            peer: "bob".into(),
        },
        alice_tx,
        &shutdown,
    );
    let alice = Arc::new(PeerSession::new(
        alice_channel,
        &config,
        "bob",
        Arc::new(NullEvents),
        Arc::new(RejectAll),
    ));

    let (bob_tx, bob_rx) = mpsc::channel(1024);
    let bob_channel = UdpChannel::spawn(bob_socket, alice_addr, bob_tx, &shutdown);
    let (events, mut bob_events) = EventStream::new();
    let bob = Arc::new(PeerSession::new(
        bob_channel,
        &config,
        "alice",
        Arc::new(events),
        Arc::new(RejectAll),
    ));

    let alice_workers = alice.spawn(alice_rx, &shutdown);
    let bob_workers = bob.spawn(bob_rx, &shutdown);

    let text = payload(2000);
    alice.send_message(text.clone()).unwrap().wait().await.unwrap();
    match tokio::time::timeout(Duration::from_secs(5), bob_events.recv()).await.unwrap() {
        Some(TransferEvent::MessageComplete { sender_id, bytes, .. }) => {
            assert_eq!(sender_id, "alice");
            assert_eq!(bytes, text);
        }
        other => panic!("unexpected {other:?}"),
    }

    shutdown.send(()).unwrap();
    alice_workers.join().await;
    bob_workers.join().await;
}
