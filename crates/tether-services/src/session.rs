//! One peer, one channel: the messaging and file engines plus the dispatcher
//! that feeds them, and the two workers that drive everything.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use tether_core::config::TetherConfig;

use crate::channel::Channel;
use crate::dispatch::PacketDispatcher;
use crate::error::TransferError;
use crate::events::TransferEvents;
use crate::file_transfer::{FileAcceptor, FileSendReport, FileTransferSession};
use crate::ids::TransferIds;
use crate::pending::PendingTransfer;
use crate::reliable::ReliableChannel;

pub struct PeerSession {
    peer_id: Arc<str>,
    channel: Arc<dyn Channel>,
    messaging: ReliableChannel,
    files: FileTransferSession,
    dispatcher: PacketDispatcher,
    tick: std::time::Duration,
}

/// Handles to a session's workers.
pub struct SessionWorkers {
    pub dispatch: JoinHandle<()>,
    pub timer: JoinHandle<()>,
}

impl SessionWorkers {
    pub async fn join(self) {
        if let Err(e) = self.dispatch.await {
            tracing::error!(error = %e, "dispatch worker panicked");
        }
        if let Err(e) = self.timer.await {
            tracing::error!(error = %e, "timer worker panicked");
        }
    }
}

impl PeerSession {
    pub fn new(
        channel: Arc<dyn Channel>,
        config: &TetherConfig,
        peer_id: impl Into<Arc<str>>,
        events: Arc<dyn TransferEvents>,
        acceptor: Arc<dyn FileAcceptor>,
    ) -> Self {
        let peer_id: Arc<str> = peer_id.into();
        // Messages and files draw from one id space so a FIN is never
        // ambiguous between the two engines' tables.
        let ids = Arc::new(TransferIds::new());

        let messaging = ReliableChannel::new(
            channel.clone(),
            config.messaging.clone(),
            peer_id.clone(),
            events.clone(),
            ids.clone(),
        );
        let files = FileTransferSession::new(
            channel.clone(),
            config.file_transfer.clone(),
            peer_id.clone(),
            events,
            acceptor,
            ids,
        );

        let mut dispatcher = PacketDispatcher::new();
        dispatcher.register(Arc::new(messaging.clone()));
        dispatcher.register(Arc::new(files.clone()));

        Self {
            peer_id,
            channel,
            messaging,
            files,
            dispatcher,
            tick: config.messaging.tick(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn messaging(&self) -> &ReliableChannel {
        &self.messaging
    }

    pub fn files(&self) -> &FileTransferSession {
        &self.files
    }

    pub fn send_message(&self, payload: Bytes) -> Result<PendingTransfer<()>, TransferError> {
        self.messaging.send_message(payload)
    }

    pub fn send_file(&self, path: &Path) -> Result<PendingTransfer<FileSendReport>, TransferError> {
        self.files.send_file(path)
    }

    /// Feed one inbound packet. Returns false if nothing claimed it.
    pub fn handle_inbound(&self, packet: Bytes) -> bool {
        self.dispatcher.dispatch(packet)
    }

    /// One timer pass over both engines.
    pub fn tick(&self, now: Instant) {
        self.messaging.tick(now);
        self.files.tick(now);
    }

    /// Fail everything still in flight.
    pub fn close(&self) {
        self.messaging.fail_all(TransferError::Shutdown);
        self.files.fail_all(TransferError::Shutdown);
    }

    /// Start the dispatch and timer workers. Both stop on `shutdown`; the
    /// timer worker then fails every live transfer.
    pub fn spawn(
        self: &Arc<Self>,
        inbound: mpsc::Receiver<Bytes>,
        shutdown: &broadcast::Sender<()>,
    ) -> SessionWorkers {
        SessionWorkers {
            dispatch: tokio::spawn(dispatch_worker(self.clone(), inbound, shutdown.subscribe())),
            timer: tokio::spawn(timer_worker(self.clone(), shutdown.subscribe())),
        }
    }
}

async fn dispatch_worker(
    session: Arc<PeerSession>,
    mut inbound: mpsc::Receiver<Bytes>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::debug!(peer = %session.peer_id, "dispatch worker started");
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            packet = inbound.recv() => match packet {
                Some(packet) => {
                    session.handle_inbound(packet);
                }
                None => {
                    tracing::debug!(peer = %session.peer_id, "inbound closed");
                    break;
                }
            },
        }
    }
    tracing::debug!(peer = %session.peer_id, "dispatch worker stopped");
}

async fn timer_worker(session: Arc<PeerSession>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(session.tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                session.close();
                break;
            }
            _ = interval.tick() => session.tick(Instant::now()),
        }
    }
    tracing::debug!(peer = %session.peer_id, "timer worker stopped");
}
