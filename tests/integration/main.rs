//! Tether integration test harness.
//!
//! Everything runs in-process: two `PeerSession`s joined by a loopback
//! channel pair, with taps that record and optionally drop or rewrite
//! packets in flight. Hole-punch tests use localhost UDP sockets.
//!
//!   cargo test --test integration

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use tether_core::config::TetherConfig;
use tether_core::wire::{FilePacket, MessagePacket};
use tether_services::{
    DirectoryAcceptor, EventStream, FileAcceptor, LoopbackChannel, PacketFilter, PeerSession,
    RejectAll, SessionWorkers, TransferEvent,
};

mod failures;
mod files;
mod hole_punch;
mod messaging;

// ── Taps ──────────────────────────────────────────────────────────────────────

/// Records every packet offered to one direction of a link, before the rule
/// decides its fate.
#[derive(Default)]
pub struct Tap {
    seen: Mutex<Vec<Bytes>>,
}

impl Tap {
    pub fn packets(&self) -> Vec<Bytes> {
        self.seen.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<MessagePacket> {
        self.packets()
            .iter()
            .filter_map(|p| MessagePacket::decode(p).ok())
            .collect()
    }

    pub fn files(&self) -> Vec<FilePacket> {
        self.packets()
            .iter()
            .filter_map(|p| FilePacket::decode(p).ok())
            .collect()
    }

    /// File DATA sequence numbers in send order.
    pub fn file_data_seqs(&self) -> Vec<u32> {
        self.files()
            .into_iter()
            .filter_map(|p| match p {
                FilePacket::Data(chunk) => Some(chunk.seq_no),
                _ => None,
            })
            .collect()
    }

    pub fn file_nacks(&self) -> Vec<u32> {
        self.files()
            .into_iter()
            .filter_map(|p| match p {
                FilePacket::Nack { seq_no, .. } => Some(seq_no),
                _ => None,
            })
            .collect()
    }
}

/// A tap whose rule sees each packet; `None` drops it.
pub fn tap(rule: impl Fn(&Bytes) -> Option<Bytes> + Send + Sync + 'static) -> (Arc<Tap>, PacketFilter) {
    let tap = Arc::new(Tap::default());
    let recorder = tap.clone();
    let filter: PacketFilter = Arc::new(move |packet: &Bytes| {
        recorder.seen.lock().unwrap().push(packet.clone());
        rule(packet)
    });
    (tap, filter)
}

/// A tap that delivers everything.
pub fn pass() -> (Arc<Tap>, PacketFilter) {
    tap(|p| Some(p.clone()))
}

// ── Sessions ──────────────────────────────────────────────────────────────────

pub struct Node {
    pub session: Arc<PeerSession>,
    pub events: mpsc::UnboundedReceiver<TransferEvent>,
    workers: SessionWorkers,
}

impl Node {
    /// Next event. Panics after five minutes of (usually paused) time.
    pub async fn next_event(&mut self) -> TransferEvent {
        tokio::time::timeout(Duration::from_secs(300), self.events.recv())
            .await
            .expect("no event within five minutes")
            .expect("event stream closed")
    }
}

/// Alice sends, Bob receives into `download`.
pub struct Pair {
    pub alice: Node,
    pub bob: Node,
    pub download: tempfile::TempDir,
    shutdown: broadcast::Sender<()>,
}

impl Pair {
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        self.alice.workers.join().await;
        self.bob.workers.join().await;
    }
}

pub fn pair(a_to_b: PacketFilter, b_to_a: PacketFilter) -> Pair {
    pair_with(a_to_b, b_to_a, None)
}

/// Must be called inside a runtime. `bob_acceptor` defaults to accepting
/// into the pair's temporary download directory.
pub fn pair_with(
    a_to_b: PacketFilter,
    b_to_a: PacketFilter,
    bob_acceptor: Option<Arc<dyn FileAcceptor>>,
) -> Pair {
    let download = tempfile::tempdir().unwrap();
    let (shutdown, _) = broadcast::channel(1);
    let (a, b) = LoopbackChannel::pair_filtered(Some(a_to_b), Some(b_to_a));
    let config = TetherConfig::default();

    let (alice_events, alice_rx) = EventStream::new();
    let alice = Arc::new(PeerSession::new(
        a.channel,
        &config,
        "bob",
        Arc::new(alice_events),
        Arc::new(RejectAll),
    ));
    let (bob_events, bob_rx) = EventStream::new();
    let acceptor: Arc<dyn FileAcceptor> = match bob_acceptor {
        Some(acceptor) => acceptor,
        None => Arc::new(DirectoryAcceptor::new(download.path())),
    };
    let bob = Arc::new(PeerSession::new(
        b.channel,
        &config,
        "alice",
        Arc::new(bob_events),
        acceptor,
    ));

    let alice_workers = alice.spawn(a.inbound, &shutdown);
    let bob_workers = bob.spawn(b.inbound, &shutdown);
    Pair {
        alice: Node {
            session: alice,
            events: alice_rx,
            workers: alice_workers,
        },
        bob: Node {
            session: bob,
            events: bob_rx,
            workers: bob_workers,
        },
        download,
        shutdown,
    }
}

/// Deterministic non-repeating test payload.
pub fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i * 31 % 251) as u8).collect::<Vec<_>>())
}
