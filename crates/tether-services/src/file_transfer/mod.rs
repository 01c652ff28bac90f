//! File transfer engine.
//!
//! A send starts with a `UR_RECEIVER` offer on the control overlay. Only
//! after `OK_SNDFILE` does the sender open the timed SYN / ACK / SYN_ACK
//! handshake, so the receiver's state always exists before the SYN lands.
//! DATA is streamed once, paced, followed by FIN. From then on the receiver
//! pulls whatever is missing with NACKs; it echoes FIN once every chunk is
//! on disk, which is what completes the send.

pub mod acceptor;
pub mod receiver;
pub mod sender;

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use tether_core::config::FileTransferSettings;
use tether_core::control::ControlMessage;
use tether_core::wire::{signal, Family, FileChunk, FilePacket, HandshakeKind};

use crate::channel::Channel;
use crate::chunk_store::{open_file_sink, ChunkSink, ChunkSource};
use crate::dispatch::PacketHandler;
use crate::error::TransferError;
use crate::events::TransferEvents;
use crate::ids::TransferIds;
use crate::pending::{pending, PendingTransfer, Resolver, TransferResult};

pub use acceptor::{DirectoryAcceptor, FileAcceptor, FileOffer, RejectAll};
pub use receiver::{FileReceive, FileReceiveEffect, FileReceivePhase};
pub use sender::{FileSend, FileSendEffect, FileSendPhase, FileSendReport};

#[derive(Debug)]
pub struct OutgoingFile {
    pub state: FileSend,
    resolver: Resolver<FileSendReport>,
    /// Set when the send leaves the table; the DATA loop checks it per chunk.
    stop: Arc<AtomicBool>,
}

pub type FileSendTable = Arc<DashMap<u64, OutgoingFile>>;
pub type FileReceiveTable = Arc<DashMap<u64, FileReceive>>;
type CompletedFiles = Arc<DashMap<u64, Instant>>;

struct StreamJob {
    file_id: u64,
    source: ChunkSource,
    stop: Arc<AtomicBool>,
}

struct SendActions {
    packets: Vec<Bytes>,
    stream: Option<StreamJob>,
    terminal: Option<TransferResult<FileSendReport>>,
}

fn realize(outgoing: &OutgoingFile, effects: Vec<FileSendEffect>, now: Instant) -> SendActions {
    let state = &outgoing.state;
    let mut actions = SendActions {
        packets: Vec::new(),
        stream: None,
        terminal: None,
    };
    for effect in effects {
        match effect {
            FileSendEffect::Offer => actions.packets.push(state.offer().encode()),
            FileSendEffect::Syn => actions.packets.push(state.handshake(HandshakeKind::Syn).encode()),
            FileSendEffect::SynAck => actions
                .packets
                .push(state.handshake(HandshakeKind::SynAck).encode()),
            FileSendEffect::Stream => {
                actions.stream = Some(StreamJob {
                    file_id: state.file_id(),
                    source: state.source().clone(),
                    stop: outgoing.stop.clone(),
                })
            }
            FileSendEffect::Chunk(seq) => {
                if let Some(packet) = state.chunk_packet(seq) {
                    actions.packets.push(packet.encode());
                }
            }
            FileSendEffect::Fin => actions.packets.push(
                FilePacket::Fin {
                    file_id: state.file_id(),
                }
                .encode(),
            ),
            FileSendEffect::Complete => actions.terminal = Some(Ok(state.report(now))),
            FileSendEffect::Fail(e) => actions.terminal = Some(Err(e)),
        }
    }
    actions
}

/// Report progress about a hundred times per file.
fn progress_step(total: u32) -> u32 {
    (total / 100).max(1)
}

/// File engine for one peer channel. Cheap to clone; clones share tables.
#[derive(Clone)]
pub struct FileTransferSession {
    channel: Arc<dyn Channel>,
    settings: Arc<FileTransferSettings>,
    peer_id: Arc<str>,
    events: Arc<dyn TransferEvents>,
    acceptor: Arc<dyn FileAcceptor>,
    ids: Arc<TransferIds>,
    sends: FileSendTable,
    receives: FileReceiveTable,
    completed: CompletedFiles,
}

impl FileTransferSession {
    pub fn new(
        channel: Arc<dyn Channel>,
        settings: FileTransferSettings,
        peer_id: impl Into<Arc<str>>,
        events: Arc<dyn TransferEvents>,
        acceptor: Arc<dyn FileAcceptor>,
        ids: Arc<TransferIds>,
    ) -> Self {
        Self {
            channel,
            settings: Arc::new(settings),
            peer_id: peer_id.into(),
            events,
            acceptor,
            ids,
            sends: Arc::new(DashMap::new()),
            receives: Arc::new(DashMap::new()),
            completed: Arc::new(DashMap::new()),
        }
    }

    pub fn live_sends(&self) -> usize {
        self.sends.len()
    }

    pub fn live_receives(&self) -> usize {
        self.receives.len()
    }

    pub fn send_phase(&self, file_id: u64) -> Option<FileSendPhase> {
        self.sends.get(&file_id).map(|s| s.state.phase())
    }

    /// Offer the file at `path` to the peer. The file is mapped read-only and
    /// must not change until the transfer resolves.
    pub fn send_file(&self, path: &Path) -> Result<PendingTransfer<FileSendReport>, TransferError> {
        if !self.channel.is_open() {
            return Err(TransferError::ChannelNotOpen);
        }
        let source = ChunkSource::map_file(path, self.settings.chunk_size)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        self.send_source(name, source)
    }

    /// Offer an in-memory payload as a file called `name`.
    pub fn send_bytes(&self, name: &str, data: Bytes) -> Result<PendingTransfer<FileSendReport>, TransferError> {
        if !self.channel.is_open() {
            return Err(TransferError::ChannelNotOpen);
        }
        let source = ChunkSource::from_bytes(data, self.settings.chunk_size)?;
        self.send_source(name.to_string(), source)
    }

    fn send_source(&self, name: String, source: ChunkSource) -> Result<PendingTransfer<FileSendReport>, TransferError> {
        let id = self.ids.allocate();
        let now = Instant::now();
        tracing::info!(
            file_id = id,
            name = %name,
            size = source.len(),
            chunks = source.chunk_count(),
            "offering file"
        );

        let mut state = FileSend::new(id, name, source, now);
        let effects = state.start(now);
        let (resolver, pending) = pending(id);
        let outgoing = OutgoingFile {
            state,
            resolver,
            stop: Arc::new(AtomicBool::new(false)),
        };
        let actions = realize(&outgoing, effects, now);
        self.sends.insert(id, outgoing);
        self.apply_send(id, actions);
        Ok(pending)
    }

    fn send_raw(&self, file_id: u64, packet: Bytes) {
        if let Err(e) = self.channel.send(packet) {
            tracing::debug!(file_id, error = %e, "channel refused packet");
        }
    }

    // ── Sender plumbing ───────────────────────────────────────────────────────

    fn drive_send(&self, id: u64, f: impl FnOnce(&mut FileSend) -> Vec<FileSendEffect>) {
        let actions = match self.sends.get_mut(&id) {
            Some(mut outgoing) => {
                let effects = f(&mut outgoing.state);
                realize(&outgoing, effects, Instant::now())
            }
            None => {
                tracing::trace!(file_id = id, "no live file send for id");
                return;
            }
        };
        self.apply_send(id, actions);
    }

    fn apply_send(&self, id: u64, actions: SendActions) {
        for packet in actions.packets {
            self.send_raw(id, packet);
        }
        if let Some(job) = actions.stream {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(self.clone().stream(job));
                }
                Err(_) => {
                    self.finish_send(id, Err(TransferError::Shutdown));
                    return;
                }
            }
        }
        if let Some(result) = actions.terminal {
            self.finish_send(id, result);
        }
    }

    fn finish_send(&self, id: u64, result: TransferResult<FileSendReport>) {
        let Some((_, outgoing)) = self.sends.remove(&id) else {
            return;
        };
        outgoing.stop.store(true, Ordering::Release);
        self.ids.release(id);
        match &result {
            Ok(report) => tracing::info!(
                file_id = id,
                bytes = report.bytes,
                chunks = report.chunks,
                retransmits = report.retransmits,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "file delivered"
            ),
            Err(e) => {
                tracing::warn!(file_id = id, error = %e, "file send failed");
                self.events.on_transfer_failed(id, &e.to_string());
            }
        }
        outgoing.resolver.resolve(result);
    }

    /// Paced DATA loop: every chunk once, a settle delay, then FIN. A channel
    /// error ends the transfer.
    async fn stream(self, job: StreamJob) {
        let StreamJob {
            file_id,
            source,
            stop,
        } = job;
        let total = source.chunk_count();
        let pacing = self.settings.pacing();
        let mut next = Instant::now();
        tracing::debug!(file_id, chunks = total, "streaming file");

        for seq in 0..total {
            if stop.load(Ordering::Acquire) {
                return;
            }
            let Some(payload) = source.chunk(seq) else {
                break;
            };
            let packet = FilePacket::Data(FileChunk::new(file_id, seq, total, payload)).encode();
            if let Err(e) = self.channel.send(packet) {
                self.finish_send(file_id, Err(TransferError::ChannelSend(e)));
                return;
            }

            if pacing.is_zero() {
                if seq % 256 == 255 {
                    tokio::task::yield_now().await;
                }
                continue;
            }
            // Timer resolution is coarser than the pacing interval, so pace
            // against a schedule and let short bursts catch up.
            next += pacing;
            let now = Instant::now();
            if next > now {
                tokio::time::sleep_until(next).await;
            } else if now - next > pacing * 64 {
                next = now;
            }
        }

        tokio::time::sleep(self.settings.settle()).await;
        if stop.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.channel.send(FilePacket::Fin { file_id }.encode()) {
            self.finish_send(file_id, Err(TransferError::ChannelSend(e)));
            return;
        }
        tracing::debug!(file_id, "all chunks sent, FIN out");
        let timeout = self.settings.completion_timeout();
        self.drive_send(file_id, |s| s.on_fin_sent(Instant::now(), timeout));
    }

    // ── Receiver plumbing ─────────────────────────────────────────────────────

    fn opener(&self) -> impl FnOnce(&Path, u64) -> io::Result<Box<dyn ChunkSink>> {
        let settings = self.settings.clone();
        move |path: &Path, size: u64| open_file_sink(path, size, settings.chunk_size, &settings)
    }

    /// Run `f` on a live receive and act on its effects. False if there is
    /// no receive state for `id`.
    fn drive_receive<F>(&self, id: u64, f: F) -> bool
    where
        F: FnOnce(&mut FileReceive) -> io::Result<Vec<FileReceiveEffect>>,
    {
        let outcome = match self.receives.get_mut(&id) {
            Some(mut state) => f(&mut *state).map(|effects| {
                let mut packets = Vec::new();
                let mut progress = None;
                let mut complete = false;
                for effect in effects {
                    match effect {
                        FileReceiveEffect::Ack => packets.push(state.ack_packet().encode()),
                        FileReceiveEffect::Nack(seq) => packets.push(
                            FilePacket::Nack {
                                file_id: id,
                                seq_no: seq,
                            }
                            .encode(),
                        ),
                        FileReceiveEffect::Progress(done) => {
                            progress = Some((done, state.total_chunks()))
                        }
                        FileReceiveEffect::Complete => complete = true,
                    }
                }
                (packets, progress, complete)
            }),
            None => return false,
        };

        match outcome {
            Ok((packets, progress, complete)) => {
                for packet in packets {
                    self.send_raw(id, packet);
                }
                if let Some((done, total)) = progress {
                    if done % progress_step(total) == 0 {
                        self.events.on_transfer_progress(id, done, total);
                    }
                }
                if complete {
                    self.finalize_receive(id);
                }
            }
            Err(e) => {
                if let Some((_, state)) = self.receives.remove(&id) {
                    self.fail_receive(state, e.into());
                }
            }
        }
        true
    }

    fn finalize_receive(&self, id: u64) {
        let Some((_, mut state)) = self.receives.remove(&id) else {
            return;
        };
        let now = Instant::now();
        if let Err(e) = state.finish() {
            self.fail_receive(state, e.into());
            return;
        }

        let size = state.file_size();
        let elapsed = state.elapsed(now);
        let secs = elapsed.as_secs_f64();
        let bytes_per_sec = if secs > 0.0 {
            (size as f64 / secs) as u64
        } else {
            size
        };

        self.completed.insert(id, now);
        // Confirmation echo; the sender completes on it.
        self.send_raw(id, FilePacket::Fin { file_id: id }.encode());
        tracing::info!(
            file_id = id,
            path = %state.path().display(),
            size,
            elapsed_ms = elapsed.as_millis() as u64,
            bytes_per_sec,
            "file received"
        );
        let total = state.total_chunks();
        self.events.on_transfer_progress(id, total, total);
        self.events
            .on_file_complete(&self.peer_id, id, state.path(), size);
    }

    fn fail_receive(&self, state: FileReceive, error: TransferError) {
        let id = state.file_id();
        self.ids.release(id);
        tracing::warn!(
            file_id = id,
            path = %state.path().display(),
            error = %error,
            "file receive failed"
        );
        state.discard();
        self.events.on_transfer_failed(id, &error.to_string());
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    pub fn handle_control(&self, message: ControlMessage) {
        match message {
            ControlMessage::UrReceiver {
                file_id,
                file_size,
                file_name,
            } => self.on_offer(FileOffer {
                file_id,
                file_size,
                file_name,
            }),
            ControlMessage::OkSendFile { file_id } => {
                tracing::debug!(file_id, "peer ready, starting handshake");
                self.drive_send(file_id, |s| s.on_ok_to_send(Instant::now()));
            }
        }
    }

    fn on_offer(&self, offer: FileOffer) {
        let id = offer.file_id;
        if self.completed.contains_key(&id) {
            return;
        }
        let reply = match self.receives.entry(id) {
            Entry::Occupied(_) => {
                tracing::debug!(file_id = id, "duplicate file offer");
                true
            }
            // A FIN carries no direction, so a receive may never share an id
            // with one of our sends.
            Entry::Vacant(_) if !self.ids.reserve(id) => {
                tracing::warn!(file_id = id, name = %offer.file_name, "offer id collides with a live transfer, declining");
                false
            }
            Entry::Vacant(slot) => match self.acceptor.accept(&offer) {
                Some(path) => {
                    tracing::info!(
                        file_id = id,
                        name = %offer.file_name,
                        size = offer.file_size,
                        path = %path.display(),
                        "accepted file offer"
                    );
                    slot.insert(FileReceive::new(
                        offer,
                        path,
                        self.settings.chunk_size,
                        Instant::now(),
                    ));
                    true
                }
                None => {
                    self.ids.release(id);
                    tracing::info!(file_id = id, name = %offer.file_name, "file offer declined");
                    false
                }
            },
        };
        if reply {
            self.send_raw(id, ControlMessage::OkSendFile { file_id: id }.encode());
        }
    }

    pub fn handle(&self, packet: FilePacket) {
        match packet {
            FilePacket::Handshake {
                kind: HandshakeKind::Syn,
                file_id,
                file_size,
                total_chunks,
            } => {
                let handled = self.drive_receive(file_id, |r| {
                    Ok(r.on_syn(file_size, total_chunks, Instant::now()))
                });
                if !handled && !self.completed.contains_key(&file_id) {
                    tracing::warn!(file_id, "SYN without an accepted offer, dropping");
                }
            }
            FilePacket::Handshake {
                kind: HandshakeKind::Ack,
                file_id,
                ..
            } => self.drive_send(file_id, |s| s.on_ack(Instant::now())),
            FilePacket::Handshake {
                kind: HandshakeKind::SynAck,
                file_id,
                ..
            } => {
                let open = self.opener();
                self.drive_receive(file_id, |r| r.on_syn_ack(Instant::now(), open));
            }
            FilePacket::Data(chunk) => {
                let file_id = chunk.file_id;
                let open = self.opener();
                if !self.drive_receive(file_id, |r| r.on_data(chunk, Instant::now(), open)) {
                    tracing::trace!(file_id, "DATA for unknown file");
                }
            }
            FilePacket::Nack { file_id, seq_no } => {
                tracing::debug!(file_id, chunk = seq_no, "NACK received");
                let settle = self.settings.settle();
                let timeout = self.settings.completion_timeout();
                self.drive_send(file_id, |s| s.on_nack(seq_no, Instant::now(), settle, timeout));
            }
            FilePacket::Fin { file_id } => self.on_fin(file_id),
        }
    }

    fn on_fin(&self, file_id: u64) {
        if self.sends.contains_key(&file_id) {
            self.drive_send(file_id, |s| s.on_fin_echo());
            return;
        }
        let mut missing = 0usize;
        let handled = self.drive_receive(file_id, |r| {
            let effects = r.on_fin(Instant::now());
            missing = effects.len();
            Ok(effects)
        });
        if handled {
            if missing > 0 {
                tracing::debug!(file_id, missing, "FIN sweep, NACKing missing chunks");
            }
            return;
        }
        if self.completed.contains_key(&file_id) {
            self.send_raw(file_id, FilePacket::Fin { file_id }.encode());
        }
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    /// Handshake, confirmation and idle deadlines.
    pub fn tick(&self, now: Instant) {
        let mut batches = Vec::new();
        for mut entry in self.sends.iter_mut() {
            let id = *entry.key();
            let effects = entry.state.on_tick(now, &self.settings);
            if !effects.is_empty() {
                batches.push((id, realize(&entry, effects, now)));
            }
        }
        for (id, actions) in batches {
            self.apply_send(id, actions);
        }

        let idle = self.settings.receive_idle_timeout();
        let stale: Vec<u64> = self
            .receives
            .iter()
            .filter(|r| r.idle_for(now) >= idle)
            .map(|r| *r.key())
            .collect();
        for id in stale {
            if let Some((_, state)) = self.receives.remove_if(&id, |_, r| r.idle_for(now) >= idle) {
                self.fail_receive(state, TransferError::Abandoned(idle));
            }
        }

        self.completed.retain(|id, at| {
            let keep = now.saturating_duration_since(*at) < idle;
            if !keep {
                self.ids.release(*id);
            }
            keep
        });
    }

    /// Resolve every live send with `error` and drop every partial receive.
    pub fn fail_all(&self, error: TransferError) {
        let sends: Vec<u64> = self.sends.iter().map(|e| *e.key()).collect();
        for id in sends {
            self.finish_send(id, Err(error.clone()));
        }
        let receives: Vec<u64> = self.receives.iter().map(|e| *e.key()).collect();
        for id in receives {
            if let Some((_, state)) = self.receives.remove(&id) {
                self.fail_receive(state, error.clone());
            }
        }
    }
}

impl PacketHandler for FileTransferSession {
    fn name(&self) -> &'static str {
        "file-transfer"
    }

    fn signals(&self) -> Vec<u8> {
        let mut signals = Family::File.signals().to_vec();
        signals.extend_from_slice(Family::Control.signals());
        signals
    }

    fn handle_packet(&self, packet: Bytes) {
        let preview = |p: &Bytes| hex::encode(&p[..p.len().min(16)]);
        if packet.first() == Some(&signal::CONTROL) {
            match ControlMessage::decode(&packet) {
                Ok(message) => self.handle_control(message),
                Err(e) => tracing::trace!(error = %e, preview = preview(&packet), "dropping malformed control packet"),
            }
            return;
        }
        match FilePacket::decode(&packet) {
            Ok(decoded) => self.handle(decoded),
            Err(e) => tracing::trace!(error = %e, preview = preview(&packet), "dropping malformed file packet"),
        }
    }
}
