//! tetherd — point-to-point message and file transfer daemon.
//!
//! ```text
//! tetherd connect <addr> [name]   direct UDP to a known endpoint
//! tetherd punch <username>        directory lookup + hole punch
//! ```
//!
//! Once linked, stdin lines are sent as messages; `/send <path>` offers a
//! file and `/quit` shuts down.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use tether_core::config::TetherConfig;
use tether_services::udp_channel::UDP_QUEUE;
use tether_services::{
    bind_udp, Channel, DirectoryAcceptor, HolePuncher, PeerSession, PunchNames, TracingEvents,
    UdpChannel, UdpRendezvous,
};

enum Link {
    Direct { peer: SocketAddr, name: String },
    Punch { username: String },
}

fn parse_args() -> Result<Link> {
    let mut args = std::env::args().skip(1);
    match (args.next().as_deref(), args.next()) {
        (Some("connect"), Some(addr)) => {
            let peer: SocketAddr = addr.parse().with_context(|| format!("bad address {addr:?}"))?;
            let name = args.next().unwrap_or_else(|| peer.to_string());
            Ok(Link::Direct { peer, name })
        }
        (Some("punch"), Some(username)) => Ok(Link::Punch { username }),
        _ => bail!("usage: tetherd connect <addr> [name] | tetherd punch <username>"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let link = parse_args()?;

    if let Err(e) = TetherConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TetherConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TetherConfig::default()
    });
    tracing::info!(username = %config.identity.username, "tetherd starting");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Link ─────────────────────────────────────────────────────────────────
    let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(UDP_QUEUE);
    let (channel, peer_name): (Arc<dyn Channel>, String) = match link {
        Link::Direct { peer, name } => {
            let bind = SocketAddr::new(unspecified_for(&peer), config.network.bind_port);
            let socket = bind_udp(bind, config.network.udp_recv_buffer)
                .with_context(|| format!("failed to bind {bind}"))?;
            tracing::info!(local = %socket.local_addr()?, peer = %peer, "direct link");
            let channel: Arc<dyn Channel> = UdpChannel::spawn(socket, peer, inbound_tx, &shutdown_tx);
            (channel, name)
        }
        Link::Punch { username } => {
            let directory = tokio::net::lookup_host(&config.hole_punch.directory_addr)
                .await
                .context("directory lookup failed")?
                .next()
                .context("directory address resolved to nothing")?;
            let mut rendezvous = UdpRendezvous::connect(directory)
                .await
                .context("failed to reach directory")?;
            let puncher = HolePuncher::new(config.identity.username.clone(), config.hole_punch.clone())
                .with_recv_buffer(config.network.udp_recv_buffer);
            let punched = puncher
                .connect(&mut rendezvous, &username)
                .await
                .with_context(|| format!("hole punch to {username} failed"))?;
            let names = PunchNames {
                local: config.identity.username.clone(),
                peer: username.clone(),
            };
            let channel: Arc<dyn Channel> =
                UdpChannel::spawn_punched(punched, names, inbound_tx, &shutdown_tx);
            (channel, username)
        }
    };

    // ── Session ──────────────────────────────────────────────────────────────
    let download_dir = config.file_transfer.download_dir.clone();
    tracing::info!(path = %download_dir.display(), "download directory");
    let session = Arc::new(PeerSession::new(
        channel,
        &config,
        peer_name,
        Arc::new(TracingEvents),
        Arc::new(DirectoryAcceptor::new(download_dir)),
    ));
    let workers = session.spawn(inbound_rx, &shutdown_tx);

    let console = tokio::spawn(console_loop(session.clone(), shutdown_tx.clone()));

    workers.join().await;
    console.abort();
    tracing::info!("tetherd stopped");
    Ok(())
}

fn unspecified_for(addr: &SocketAddr) -> std::net::IpAddr {
    match addr {
        SocketAddr::V4(_) => std::net::Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => std::net::Ipv6Addr::UNSPECIFIED.into(),
    }
}

async fn console_loop(session: Arc<PeerSession>, shutdown: broadcast::Sender<()>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "/quit" {
            break;
        }
        if let Some(path) = line.strip_prefix("/send ") {
            send_file(&session, PathBuf::from(path.trim()));
            continue;
        }
        match session.send_message(Bytes::copy_from_slice(line.as_bytes())) {
            Ok(pending) => {
                tokio::spawn(async move {
                    let id = pending.id();
                    match pending.wait().await {
                        Ok(()) => tracing::info!(message_id = id, "message delivered"),
                        Err(e) => tracing::warn!(message_id = id, error = %e, "message failed"),
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "message not sent"),
        }
    }
    let _ = shutdown.send(());
}

fn send_file(session: &PeerSession, path: PathBuf) {
    match session.send_file(&path) {
        Ok(pending) => {
            tokio::spawn(async move {
                let id = pending.id();
                match pending.wait().await {
                    Ok(report) => tracing::info!(
                        file_id = id,
                        path = %path.display(),
                        bytes = report.bytes,
                        retransmits = report.retransmits,
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        "file delivered"
                    ),
                    Err(e) => tracing::warn!(file_id = id, path = %path.display(), error = %e, "file failed"),
                }
            });
        }
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "file not sent"),
    }
}
