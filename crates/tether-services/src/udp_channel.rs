//! Direct-UDP channel adapter.
//!
//! Wraps one UDP socket talking to one peer endpoint. `send` enqueues onto a
//! bounded queue drained by a writer task; a reader task forwards every
//! datagram from the peer into the session's inbound sink. Both tasks stop
//! on the shutdown broadcast, after which the channel reports `Closed`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use tether_core::punch::{PunchKind, PunchPacket};

use crate::channel::{Channel, ChannelState, StateCell};
use crate::error::ChannelError;
use crate::hole_punch::PunchedLink;

/// Outbound datagrams buffered ahead of the writer task.
pub const UDP_QUEUE: usize = 8192;

const MAX_DATAGRAM: usize = 65_535;

/// Bind a non-blocking UDP socket, optionally sizing its receive buffer.
pub fn bind_udp(addr: SocketAddr, recv_buffer: usize) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if recv_buffer > 0 {
        socket.set_recv_buffer_size(recv_buffer)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Names used during hole punching. A punched link can still see HELLOs from
/// a peer that missed our ESTABLISHED; those are answered here and never
/// reach the session.
#[derive(Debug, Clone)]
pub struct PunchNames {
    pub local: String,
    pub peer: String,
}

impl PunchNames {
    fn straggler(&self, datagram: &[u8]) -> Option<PunchKind> {
        let packet = PunchPacket::decode(datagram).ok()?;
        (packet.sender == self.peer && packet.target == self.local).then_some(packet.kind)
    }
}

pub struct UdpChannel {
    outbound: mpsc::Sender<Bytes>,
    state: Arc<StateCell>,
    peer: SocketAddr,
}

impl UdpChannel {
    /// Start the reader and writer tasks. Must be called inside a runtime.
    pub fn spawn(
        socket: UdpSocket,
        peer: SocketAddr,
        inbound: mpsc::Sender<Bytes>,
        shutdown: &broadcast::Sender<()>,
    ) -> Arc<Self> {
        Self::start(socket, peer, None, inbound, shutdown)
    }

    pub fn spawn_punched(
        link: PunchedLink,
        names: PunchNames,
        inbound: mpsc::Sender<Bytes>,
        shutdown: &broadcast::Sender<()>,
    ) -> Arc<Self> {
        Self::start(link.socket, link.peer, Some(names), inbound, shutdown)
    }

    fn start(
        socket: UdpSocket,
        peer: SocketAddr,
        names: Option<PunchNames>,
        inbound: mpsc::Sender<Bytes>,
        shutdown: &broadcast::Sender<()>,
    ) -> Arc<Self> {
        let socket = Arc::new(socket);
        let state = Arc::new(StateCell::new(ChannelState::Open));
        let (outbound, outbound_rx) = mpsc::channel(UDP_QUEUE);

        tokio::spawn(writer(
            socket.clone(),
            peer,
            outbound_rx,
            state.clone(),
            shutdown.subscribe(),
        ));
        tokio::spawn(reader(
            socket,
            peer,
            names,
            inbound,
            state.clone(),
            shutdown.subscribe(),
        ));
        tracing::info!(peer = %peer, "udp channel open");

        Arc::new(Self {
            outbound,
            state,
            peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Channel for UdpChannel {
    fn send(&self, packet: Bytes) -> Result<(), ChannelError> {
        match self.state.get() {
            ChannelState::Open => {}
            ChannelState::Connecting => return Err(ChannelError::NotOpen),
            ChannelState::Closed => return Err(ChannelError::Closed),
        }
        self.outbound.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }

    fn state(&self) -> ChannelState {
        self.state.get()
    }
}

async fn writer(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut outbound: mpsc::Receiver<Bytes>,
    state: Arc<StateCell>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            packet = outbound.recv() => {
                let Some(packet) = packet else { break };
                if let Err(e) = socket.send_to(&packet, peer).await {
                    tracing::debug!(peer = %peer, error = %e, "udp send failed");
                }
            }
        }
    }
    state.set(ChannelState::Closed);
    tracing::debug!(peer = %peer, "udp writer stopped");
}

async fn reader(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    names: Option<PunchNames>,
    inbound: mpsc::Sender<Bytes>,
    state: Arc<StateCell>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.recv() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "udp recv failed");
                    continue;
                }
            },
        };
        if from != peer {
            tracing::trace!(from = %from, "datagram from unexpected address dropped");
            continue;
        }

        let datagram = &buf[..len];
        if let Some(names) = &names {
            if let Some(kind) = names.straggler(datagram) {
                if kind != PunchKind::Established {
                    answer_straggler(&socket, peer, names).await;
                }
                continue;
            }
        }

        if inbound.send(Bytes::copy_from_slice(datagram)).await.is_err() {
            tracing::debug!(peer = %peer, "inbound sink closed");
            break;
        }
    }
    state.set(ChannelState::Closed);
    tracing::debug!(peer = %peer, "udp reader stopped");
}

async fn answer_straggler(socket: &UdpSocket, peer: SocketAddr, names: &PunchNames) {
    let reply = PunchPacket::new(PunchKind::Established, &names.local, &names.peer);
    match reply.encode() {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, peer).await {
                tracing::debug!(peer = %peer, error = %e, "ESTABLISHED resend failed");
            }
        }
        Err(e) => tracing::debug!(error = %e, "ESTABLISHED encode failed"),
    }
}
