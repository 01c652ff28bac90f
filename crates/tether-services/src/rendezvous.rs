//! Directory (rendezvous) client used by the hole puncher.
//!
//! The directory learns a requester's public endpoint from the resolve
//! request itself, so asking for a peer doubles as registering ourselves.
//! Messages are JSON objects tagged by `type`:
//!
//! ```text
//! -> {"type":"resolve_peer","username":"alice","target":"bob"}
//! <- {"type":"peer_info","address":"203.0.113.7","ports":[40001,40002]}
//! <- {"type":"peer_not_found"}
//! <- {"type":"peer_pending"}
//! ```

use std::future::Future;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use crate::error::HolePunchError;

/// Largest directory datagram accepted.
const MAX_REPLY: usize = 2048;

/// Public endpoint candidates for a peer, as seen by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCandidate {
    pub address: IpAddr,
    pub ports: Vec<u16>,
}

impl PeerCandidate {
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.ports
            .iter()
            .map(|&port| SocketAddr::new(self.address, port))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryReply {
    PeerInfo(PeerCandidate),
    NotFound,
    /// Target has not contacted the directory yet.
    Pending,
}

/// Directory wire messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirectoryMessage {
    ResolvePeer { username: String, target: String },
    PeerInfo { address: String, ports: Vec<u16> },
    PeerNotFound,
    PeerPending,
}

impl DirectoryMessage {
    pub fn into_reply(self) -> Result<DirectoryReply, HolePunchError> {
        match self {
            DirectoryMessage::PeerInfo { address, ports } => {
                let address = address
                    .parse::<IpAddr>()
                    .map_err(|e| HolePunchError::Directory(format!("bad address {address:?}: {e}")))?;
                Ok(DirectoryReply::PeerInfo(PeerCandidate { address, ports }))
            }
            DirectoryMessage::PeerNotFound => Ok(DirectoryReply::NotFound),
            DirectoryMessage::PeerPending => Ok(DirectoryReply::Pending),
            DirectoryMessage::ResolvePeer { .. } => Err(HolePunchError::Directory(
                "unexpected resolve_peer from directory".into(),
            )),
        }
    }
}

/// Signaling transport to a directory server.
///
/// `recv_reply` must be cancel safe: the lookup loop races it against its
/// poll timer.
pub trait Rendezvous: Send {
    fn send_resolve(
        &mut self,
        username: &str,
        target: &str,
    ) -> impl Future<Output = Result<(), HolePunchError>> + Send;

    fn recv_reply(&mut self) -> impl Future<Output = Result<DirectoryReply, HolePunchError>> + Send;
}

/// JSON-over-UDP directory client.
pub struct UdpRendezvous {
    socket: UdpSocket,
    server: SocketAddr,
    buf: Vec<u8>,
}

impl UdpRendezvous {
    pub async fn connect(server: SocketAddr) -> Result<Self, HolePunchError> {
        let bind: SocketAddr = match server {
            SocketAddr::V4(_) => (std::net::Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;
        Ok(Self::from_socket(socket, server))
    }

    /// Wraps a socket already connected to `server`.
    pub fn from_socket(socket: UdpSocket, server: SocketAddr) -> Self {
        Self {
            socket,
            server,
            buf: vec![0u8; MAX_REPLY],
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }
}

impl Rendezvous for UdpRendezvous {
    async fn send_resolve(&mut self, username: &str, target: &str) -> Result<(), HolePunchError> {
        let request = DirectoryMessage::ResolvePeer {
            username: username.to_string(),
            target: target.to_string(),
        };
        let body = serde_json::to_vec(&request).map_err(|e| HolePunchError::Directory(e.to_string()))?;
        self.socket.send(&body).await?;
        tracing::debug!(server = %self.server, target, "resolve request sent");
        Ok(())
    }

    async fn recv_reply(&mut self) -> Result<DirectoryReply, HolePunchError> {
        let len = self.socket.recv(&mut self.buf).await?;
        let message: DirectoryMessage = serde_json::from_slice(&self.buf[..len]).map_err(|e| {
            HolePunchError::Directory(format!("{e} in {}", hex::encode(&self.buf[..len.min(32)])))
        })?;
        message.into_reply()
    }
}
