//! Channel abstraction: the ordered, already-encrypted byte-message carrier
//! underneath every transfer engine.
//!
//! Engines only ever call `send` and `state`. Inbound bytes flow the other
//! way: the carrier pushes each received message into the `mpsc::Sender`
//! sink owned by the peer session.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ChannelState::Connecting,
            1 => ChannelState::Open,
            _ => ChannelState::Closed,
        }
    }
}

/// A point-to-point message carrier.
///
/// `send` must not block on network I/O: implementations enqueue and return.
/// A returned error means the message was not accepted at all.
pub trait Channel: Send + Sync {
    fn send(&self, packet: Bytes) -> Result<(), ChannelError>;

    fn state(&self) -> ChannelState;

    fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }
}

/// Atomic holder for a channel's lifecycle state.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ChannelState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ChannelState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

// ── Loopback ──────────────────────────────────────────────────────────────────

/// Decides the fate of one packet in flight: `None` drops it, `Some` delivers
/// the (possibly rewritten) bytes.
pub type PacketFilter = Arc<dyn Fn(&Bytes) -> Option<Bytes> + Send + Sync>;

/// Inbound queue depth for each loopback end.
pub const LOOPBACK_QUEUE: usize = 65_536;

/// One end of an in-process channel pair. Useful for wiring two sessions
/// inside one process and for loss/corruption scenarios via a filter.
pub struct LoopbackChannel {
    peer_inbound: mpsc::Sender<Bytes>,
    state: StateCell,
    filter: Option<PacketFilter>,
}

/// A loopback end plus the queue its peer's packets arrive on.
pub struct LoopbackEnd {
    pub channel: Arc<LoopbackChannel>,
    pub inbound: mpsc::Receiver<Bytes>,
}

impl LoopbackChannel {
    /// Two open ends that deliver everything.
    pub fn pair() -> (LoopbackEnd, LoopbackEnd) {
        Self::pair_filtered(None, None)
    }

    /// Two open ends; `a_to_b` sees every packet A sends, `b_to_a` every
    /// packet B sends.
    pub fn pair_filtered(
        a_to_b: Option<PacketFilter>,
        b_to_a: Option<PacketFilter>,
    ) -> (LoopbackEnd, LoopbackEnd) {
        let (tx_a, rx_a) = mpsc::channel(LOOPBACK_QUEUE);
        let (tx_b, rx_b) = mpsc::channel(LOOPBACK_QUEUE);
        let a = LoopbackEnd {
            channel: Arc::new(LoopbackChannel {
                peer_inbound: tx_b,
                state: StateCell::new(ChannelState::Open),
                filter: a_to_b,
            }),
            inbound: rx_a,
        };
        let b = LoopbackEnd {
            channel: Arc::new(LoopbackChannel {
                peer_inbound: tx_a,
                state: StateCell::new(ChannelState::Open),
                filter: b_to_a,
            }),
            inbound: rx_b,
        };
        (a, b)
    }

    pub fn set_state(&self, state: ChannelState) {
        self.state.set(state);
    }
}

impl Channel for LoopbackChannel {
    fn send(&self, packet: Bytes) -> Result<(), ChannelError> {
        if self.state.get() != ChannelState::Open {
            return Err(ChannelError::NotOpen);
        }
        let packet = match &self.filter {
            Some(filter) => match filter(&packet) {
                Some(p) => p,
                // Dropped in flight: the sender cannot tell.
                None => return Ok(()),
            },
            None => packet,
        };
        self.peer_inbound.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }

    fn state(&self) -> ChannelState {
        self.state.get()
    }
}
