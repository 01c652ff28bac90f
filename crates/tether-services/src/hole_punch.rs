//! UDP hole punching.
//!
//! Phase one asks the directory for the target's candidate endpoints. Phase
//! two opens one socket per candidate and races them: every socket sends
//! HELLO to every candidate each interval, answers HELLO with HELLO_ACK and
//! goes live on HELLO_ACK (answering ESTABLISHED) or on ESTABLISHED. The
//! first live socket wins and the rest are dropped.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use tether_core::config::HolePunchSettings;
use tether_core::punch::{PunchKind, PunchPacket};

use crate::error::HolePunchError;
use crate::rendezvous::{DirectoryReply, PeerCandidate, Rendezvous};
use crate::udp_channel::bind_udp;

/// How often the resolve request is repeated while the lookup waits.
const LOOKUP_POLL: Duration = Duration::from_secs(1);

const MAX_PUNCH_DATAGRAM: usize = 1500;

/// A socket that completed the punch exchange with the peer.
#[derive(Debug)]
pub struct PunchedLink {
    pub socket: UdpSocket,
    /// Endpoint the winning exchange was made with.
    pub peer: SocketAddr,
    /// Position of `peer` in the directory's candidate list, when it is one
    /// of them. A NAT may present a different source port.
    pub candidate_index: Option<usize>,
}

pub struct HolePuncher {
    username: String,
    settings: HolePunchSettings,
    recv_buffer: usize,
}

impl HolePuncher {
    pub fn new(username: impl Into<String>, settings: HolePunchSettings) -> Self {
        Self {
            username: username.into(),
            settings,
            recv_buffer: 0,
        }
    }

    /// Receive buffer for the punch sockets; the winner keeps it.
    pub fn with_recv_buffer(mut self, bytes: usize) -> Self {
        self.recv_buffer = bytes;
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Lookup then punch.
    pub async fn connect<R: Rendezvous>(
        &self,
        rendezvous: &mut R,
        target: &str,
    ) -> Result<PunchedLink, HolePunchError> {
        let candidate = self.resolve(rendezvous, target).await?;
        self.punch(&candidate, target).await
    }

    /// Directory lookup. `Pending` replies keep the loop waiting without
    /// extending the overall budget. Socket errors, such as an ICMP refusal
    /// while the directory restarts, are retried inside the same budget.
    pub async fn resolve<R: Rendezvous>(
        &self,
        rendezvous: &mut R,
        target: &str,
    ) -> Result<PeerCandidate, HolePunchError> {
        let budget = self.settings.lookup_timeout();
        let deadline = Instant::now() + budget;

        tracing::info!(peer = target, "resolving peer");
        let mut last_error = None;
        self.request(rendezvous, target, &mut last_error).await?;
        let mut last_request = Instant::now();

        loop {
            let now = Instant::now();
            if now >= deadline {
                match &last_error {
                    Some(e) => tracing::warn!(peer = target, ?budget, error = %e, "directory lookup timed out"),
                    None => tracing::warn!(peer = target, ?budget, "directory lookup timed out"),
                }
                return Err(HolePunchError::LookupTimeout(budget));
            }
            let wait = (deadline - now).min(LOOKUP_POLL);

            match tokio::time::timeout(wait, rendezvous.recv_reply()).await {
                Ok(Ok(DirectoryReply::PeerInfo(candidate))) => {
                    if candidate.ports.is_empty() {
                        return Err(HolePunchError::NoCandidates);
                    }
                    tracing::info!(
                        peer = target,
                        address = %candidate.address,
                        ports = ?candidate.ports,
                        "peer resolved"
                    );
                    return Ok(candidate);
                }
                Ok(Ok(DirectoryReply::NotFound)) => {
                    return Err(HolePunchError::PeerNotFound(target.to_string()));
                }
                Ok(Ok(DirectoryReply::Pending)) => {
                    tracing::debug!(peer = target, "peer not registered yet");
                }
                Ok(Err(HolePunchError::Directory(reason))) => {
                    tracing::trace!(%reason, "malformed directory reply dropped");
                }
                Ok(Err(HolePunchError::Io(e))) => {
                    tracing::debug!(peer = target, error = %e, "directory unreachable, retrying");
                    last_error = Some(e);
                    // Wait out the poll interval instead of spinning on a
                    // socket that keeps failing.
                    tokio::time::sleep_until((last_request + LOOKUP_POLL).min(deadline)).await;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {}
            }

            if last_request.elapsed() >= LOOKUP_POLL {
                self.request(rendezvous, target, &mut last_error).await?;
                last_request = Instant::now();
            }
        }
    }

    /// Send one resolve request. An I/O failure is kept for the timeout
    /// report; any other error ends the lookup.
    async fn request<R: Rendezvous>(
        &self,
        rendezvous: &mut R,
        target: &str,
        last_error: &mut Option<std::io::Error>,
    ) -> Result<(), HolePunchError> {
        match rendezvous.send_resolve(&self.username, target).await {
            Ok(()) => Ok(()),
            Err(HolePunchError::Io(e)) => {
                tracing::debug!(peer = target, error = %e, "resolve request failed, retrying");
                *last_error = Some(e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Race one socket per candidate endpoint until one goes live.
    pub async fn punch(
        &self,
        candidate: &PeerCandidate,
        target: &str,
    ) -> Result<PunchedLink, HolePunchError> {
        let endpoints = candidate.endpoints();
        if endpoints.is_empty() {
            return Err(HolePunchError::NoCandidates);
        }

        let bind = match candidate.address {
            IpAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            IpAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
        };
        let hello = PunchPacket::new(PunchKind::Hello, &self.username, target).encode()?;

        let mut attempts: Vec<BoxFuture<'_, Result<PunchedLink, HolePunchError>>> =
            Vec::with_capacity(endpoints.len());
        for index in 0..endpoints.len() {
            let socket = bind_udp(bind, self.recv_buffer)?;
            tracing::debug!(
                socket = index,
                local = ?socket.local_addr().ok(),
                "punch socket bound"
            );
            attempts.push(self.attempt(socket, &endpoints, target, hello.clone()).boxed());
        }

        let budget = self.settings.punch_timeout();
        let outcome = match tokio::time::timeout(budget, future::select_ok(attempts)).await {
            Ok(Ok((link, losers))) => {
                // Dropping the losing attempts closes their sockets.
                drop(losers);
                tracing::info!(
                    peer = target,
                    endpoint = %link.peer,
                    candidate = ?link.candidate_index,
                    "hole punched"
                );
                Ok(link)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!(peer = target, ?budget, "no candidate answered");
                Err(HolePunchError::PunchTimeout(budget))
            }
        };
        outcome
    }

    async fn attempt(
        &self,
        socket: UdpSocket,
        endpoints: &[SocketAddr],
        target: &str,
        hello: Bytes,
    ) -> Result<PunchedLink, HolePunchError> {
        let mut interval = tokio::time::interval(self.settings.hello_interval());
        let mut buf = vec![0u8; MAX_PUNCH_DATAGRAM];

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for endpoint in endpoints {
                        if let Err(e) = socket.send_to(&hello, endpoint).await {
                            tracing::trace!(endpoint = %endpoint, error = %e, "HELLO send failed");
                        }
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    // ICMP unreachable from a closed candidate surfaces here.
                    let (len, from) = match received {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::trace!(error = %e, "punch recv failed");
                            continue;
                        }
                    };
                    let packet = match PunchPacket::decode(&buf[..len]) {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::trace!(from = %from, error = %e, "non-punch datagram dropped");
                            continue;
                        }
                    };
                    if packet.sender != target || packet.target != self.username {
                        tracing::trace!(
                            from = %from,
                            sender = %packet.sender,
                            intended = %packet.target,
                            "punch packet for another pair dropped"
                        );
                        continue;
                    }

                    match packet.kind {
                        PunchKind::Hello => {
                            self.reply(&socket, PunchKind::HelloAck, target, from).await?;
                        }
                        PunchKind::HelloAck => {
                            self.reply(&socket, PunchKind::Established, target, from).await?;
                            return Ok(live(socket, from, endpoints));
                        }
                        PunchKind::Established => return Ok(live(socket, from, endpoints)),
                    }
                }
            }
        }
    }

    async fn reply(
        &self,
        socket: &UdpSocket,
        kind: PunchKind,
        target: &str,
        to: SocketAddr,
    ) -> Result<(), HolePunchError> {
        let packet = PunchPacket::new(kind, &self.username, target).encode()?;
        if let Err(e) = socket.send_to(&packet, to).await {
            tracing::debug!(to = %to, ?kind, error = %e, "punch reply failed");
        }
        Ok(())
    }
}

fn live(socket: UdpSocket, peer: SocketAddr, endpoints: &[SocketAddr]) -> PunchedLink {
    PunchedLink {
        socket,
        peer,
        candidate_index: endpoints.iter().position(|e| *e == peer),
    }
}
