//! Reliable delivery for short messages.
//!
//! A message is cut into at most 64 chunks so a single 64-bit selective ACK
//! can cover all of them. The sender transmits every chunk once, then relies
//! on three things: ACK bitmaps merged monotonically, NACKs answered with an
//! immediate single-chunk resend, and a periodic scan that resends chunks
//! older than the RTO until their retry budget runs out.
//!
//! State transitions live in `MessageSend` / `MessageReceive` as plain
//! methods returning effects. `ReliableChannel` owns the tables and turns
//! effects into packets, callbacks, and caller results.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;

use tether_core::config::MessagingSettings;
use tether_core::wire::{Family, MessageChunk, MessagePacket, MAX_MESSAGE_CHUNKS};

use crate::bitmap::ChunkBitmap;
use crate::channel::Channel;
use crate::chunk_store::{ChunkAssembler, ChunkSource};
use crate::dispatch::PacketHandler;
use crate::error::TransferError;
use crate::events::TransferEvents;
use crate::ids::TransferIds;
use crate::pending::{pending, PendingTransfer, Resolver, TransferResult};

// ── Sender state machine ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    Idle,
    Sending,
    WaitingAck,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendEffect {
    Transmit(u32),
    Fin,
    Complete,
    Fail(TransferError),
}

#[derive(Debug)]
pub struct MessageSend {
    id: u64,
    source: ChunkSource,
    total: u32,
    acked: ChunkBitmap,
    in_flight: ChunkBitmap,
    retries: Vec<u32>,
    last_sent: Vec<Option<Instant>>,
    phase: SendPhase,
}

impl MessageSend {
    /// An empty payload still travels as one empty chunk.
    pub fn new(id: u64, source: ChunkSource) -> Self {
        let total = source.chunk_count().max(1);
        Self {
            id,
            source,
            total,
            acked: ChunkBitmap::new(total),
            in_flight: ChunkBitmap::new(total),
            retries: vec![0; total as usize],
            last_sent: vec![None; total as usize],
            phase: SendPhase::Idle,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> SendPhase {
        self.phase
    }

    pub fn total_chunks(&self) -> u32 {
        self.total
    }

    pub fn acked(&self) -> &ChunkBitmap {
        &self.acked
    }

    /// Chunks transmitted at least once.
    pub fn in_flight(&self) -> &ChunkBitmap {
        &self.in_flight
    }

    pub fn retries(&self, chunk: u32) -> u32 {
        self.retries.get(chunk as usize).copied().unwrap_or(0)
    }

    pub fn is_live(&self) -> bool {
        matches!(self.phase, SendPhase::Sending | SendPhase::WaitingAck)
    }

    pub fn packet(&self, chunk: u32) -> Option<MessagePacket> {
        if chunk >= self.total {
            return None;
        }
        let payload = self.source.chunk(chunk).unwrap_or_default();
        Some(MessagePacket::Data(MessageChunk::new(
            self.id, chunk, self.total, payload,
        )))
    }

    fn mark_sent(&mut self, chunk: u32, now: Instant) {
        self.in_flight.set(chunk);
        self.last_sent[chunk as usize] = Some(now);
    }

    /// Idle → Sending → WaitingAck: every chunk once, then FIN.
    pub fn start(&mut self, now: Instant) -> Vec<SendEffect> {
        if self.phase != SendPhase::Idle {
            return Vec::new();
        }
        self.phase = SendPhase::Sending;
        let mut effects = Vec::with_capacity(self.total as usize + 1);
        for chunk in 0..self.total {
            self.mark_sent(chunk, now);
            effects.push(SendEffect::Transmit(chunk));
        }
        effects.push(SendEffect::Fin);
        self.phase = SendPhase::WaitingAck;
        effects
    }

    pub fn on_ack(&mut self, bitmap: u64) -> Vec<SendEffect> {
        if !self.is_live() {
            return Vec::new();
        }
        self.acked.merge_first_word(bitmap);
        if self.acked.is_complete() {
            self.phase = SendPhase::Complete;
            return vec![SendEffect::Complete];
        }
        Vec::new()
    }

    /// Out-of-band resend. Does not touch the retry budget.
    pub fn on_nack(&mut self, chunk: u32, now: Instant) -> Vec<SendEffect> {
        if !self.is_live() || chunk >= self.total || self.acked.get(chunk) {
            return Vec::new();
        }
        self.mark_sent(chunk, now);
        vec![SendEffect::Transmit(chunk)]
    }

    /// Resend every unacked chunk older than `rto`. A chunk already resent
    /// `max_retries` times fails the whole message instead.
    pub fn on_tick(&mut self, now: Instant, rto: Duration, max_retries: u32) -> Vec<SendEffect> {
        if self.phase != SendPhase::WaitingAck {
            return Vec::new();
        }
        let mut effects = Vec::new();
        for chunk in self.acked.missing() {
            let due = match self.last_sent[chunk as usize] {
                Some(at) => now.saturating_duration_since(at) >= rto,
                None => true,
            };
            if !due {
                continue;
            }
            let retries = self.retries[chunk as usize];
            if retries >= max_retries {
                self.phase = SendPhase::Failed;
                return vec![SendEffect::Fail(TransferError::RetriesExhausted { chunk, retries })];
            }
            self.retries[chunk as usize] = retries + 1;
            self.mark_sent(chunk, now);
            effects.push(SendEffect::Transmit(chunk));
        }
        effects
    }
}

// ── Receiver state machine ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEffect {
    Nack(u32),
    ScheduleAck,
    Progress(u32),
    Complete(Bytes),
}

#[derive(Debug)]
pub struct MessageReceive {
    id: u64,
    total: u32,
    assembler: ChunkAssembler,
    received: ChunkBitmap,
    first_chunk_at: Instant,
    last_activity: Instant,
    ack_pending: bool,
}

impl MessageReceive {
    pub fn new(id: u64, total: u32, now: Instant) -> Self {
        Self {
            id,
            total,
            assembler: ChunkAssembler::new(total),
            received: ChunkBitmap::new(total),
            first_chunk_at: now,
            last_activity: now,
            ack_pending: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn received(&self) -> u32 {
        self.received.count()
    }

    pub fn ack_bitmap(&self) -> u64 {
        self.received.first_word()
    }

    pub fn on_data(&mut self, chunk: MessageChunk, now: Instant) -> Vec<ReceiveEffect> {
        if chunk.total_chunks != self.total || chunk.chunk_id >= self.total {
            tracing::trace!(message_id = self.id, chunk = chunk.chunk_id, "chunk does not fit message");
            return Vec::new();
        }
        self.last_activity = now;
        if !chunk.verify() {
            return vec![ReceiveEffect::Nack(chunk.chunk_id)];
        }
        if !self.received.set(chunk.chunk_id) {
            // Duplicate: the sender probably missed our ACK.
            return vec![ReceiveEffect::ScheduleAck];
        }
        self.assembler.insert(chunk.chunk_id, chunk.payload);
        if self.received.is_complete() {
            return match self.assembler.assemble() {
                Some(bytes) => vec![ReceiveEffect::Complete(bytes)],
                None => Vec::new(),
            };
        }
        vec![
            ReceiveEffect::Progress(self.received.count()),
            ReceiveEffect::ScheduleAck,
        ]
    }

    /// Claims the debounce slot. False while an ACK is already scheduled.
    fn claim_ack(&mut self) -> bool {
        !std::mem::replace(&mut self.ack_pending, true)
    }

    fn release_ack(&mut self) -> u64 {
        self.ack_pending = false;
        self.ack_bitmap()
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct OutgoingMessage {
    pub state: MessageSend,
    resolver: Resolver<()>,
}

#[derive(Debug, Clone, Copy)]
struct CompletedMessage {
    bitmap: u64,
    at: Instant,
}

pub type MessageSendTable = Arc<DashMap<u64, OutgoingMessage>>;
pub type MessageReceiveTable = Arc<DashMap<u64, MessageReceive>>;
type CompletedTable = Arc<DashMap<u64, CompletedMessage>>;

/// Packets and terminal result produced from a batch of send effects.
struct Realized {
    packets: Vec<Bytes>,
    terminal: Option<TransferResult<()>>,
}

fn realize(state: &MessageSend, effects: Vec<SendEffect>) -> Realized {
    let mut realized = Realized {
        packets: Vec::with_capacity(effects.len()),
        terminal: None,
    };
    for effect in effects {
        match effect {
            SendEffect::Transmit(chunk) => {
                if let Some(packet) = state.packet(chunk) {
                    realized.packets.push(packet.encode());
                }
            }
            SendEffect::Fin => realized.packets.push(
                MessagePacket::Fin {
                    message_id: state.id(),
                }
                .encode(),
            ),
            SendEffect::Complete => realized.terminal = Some(Ok(())),
            SendEffect::Fail(e) => realized.terminal = Some(Err(e)),
        }
    }
    realized
}

/// Messaging engine for one peer channel. Cheap to clone; clones share
/// tables.
#[derive(Clone)]
pub struct ReliableChannel {
    channel: Arc<dyn Channel>,
    settings: Arc<MessagingSettings>,
    peer_id: Arc<str>,
    events: Arc<dyn TransferEvents>,
    ids: Arc<TransferIds>,
    sends: MessageSendTable,
    receives: MessageReceiveTable,
    completed: CompletedTable,
}

impl ReliableChannel {
    pub fn new(
        channel: Arc<dyn Channel>,
        settings: MessagingSettings,
        peer_id: impl Into<Arc<str>>,
        events: Arc<dyn TransferEvents>,
        ids: Arc<TransferIds>,
    ) -> Self {
        Self {
            channel,
            settings: Arc::new(settings),
            peer_id: peer_id.into(),
            events,
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

    /// Start sending `payload`. Fails immediately if the channel is not open
    /// or the payload needs more chunks than one ACK bitmap covers.
    pub fn send_message(&self, payload: Bytes) -> Result<PendingTransfer<()>, TransferError> {
        if !self.channel.is_open() {
            return Err(TransferError::ChannelNotOpen);
        }
        let size = payload.len();
        let source = ChunkSource::from_bytes(payload, self.settings.chunk_size)?;
        if source.chunk_count().max(1) > self.settings.chunk_limit() {
            return Err(TransferError::MessageTooLarge {
                size,
                max: self.settings.max_message_bytes(),
            });
        }

        let id = self.ids.allocate();
        let mut state = MessageSend::new(id, source);
        let effects = state.start(Instant::now());
        let realized = realize(&state, effects);
        let (resolver, pending) = pending(id);

        tracing::debug!(
            message_id = id,
            size,
            chunks = state.total_chunks(),
            "sending message"
        );
        // Table entry first, so an ACK racing the sends below finds it.
        self.sends.insert(id, OutgoingMessage { state, resolver });
        for packet in realized.packets {
            self.transmit(id, packet);
        }
        Ok(pending)
    }

    /// Fire-and-forget send. A refused packet is left for the RTO scan.
    fn transmit(&self, id: u64, packet: Bytes) {
        if let Err(e) = self.channel.send(packet) {
            tracing::debug!(message_id = id, error = %e, "channel refused packet");
        }
    }

    fn finish_send(&self, id: u64, result: TransferResult<()>) {
        let Some((_, outgoing)) = self.sends.remove(&id) else {
            return;
        };
        self.ids.release(id);
        match &result {
            Ok(()) => tracing::debug!(message_id = id, "message acknowledged"),
            Err(e) => {
                tracing::warn!(message_id = id, error = %e, "message failed");
                self.events.on_transfer_failed(id, &e.to_string());
            }
        }
        outgoing.resolver.resolve(result);
    }

    /// Apply effects produced by `f` on a live send, if there is one.
    fn drive_send(&self, id: u64, f: impl FnOnce(&mut MessageSend) -> Vec<SendEffect>) {
        let realized = match self.sends.get_mut(&id) {
            Some(mut outgoing) => {
                let effects = f(&mut outgoing.state);
                realize(&outgoing.state, effects)
            }
            None => {
                tracing::trace!(message_id = id, "no live send for id");
                return;
            }
        };
        for packet in realized.packets {
            self.transmit(id, packet);
        }
        if let Some(result) = realized.terminal {
            self.finish_send(id, result);
        }
    }

    pub fn handle(&self, packet: MessagePacket) {
        match packet {
            MessagePacket::Data(chunk) => self.on_data(chunk),
            MessagePacket::Ack { message_id, bitmap } => {
                self.drive_send(message_id, |state| state.on_ack(bitmap))
            }
            MessagePacket::Nack {
                message_id,
                chunk_id,
            } => {
                tracing::debug!(message_id, chunk = chunk_id, "NACK received");
                self.drive_send(message_id, |state| state.on_nack(chunk_id, Instant::now()))
            }
            MessagePacket::Fin { message_id } => self.on_fin(message_id),
        }
    }

    fn send_ack(&self, id: u64, bitmap: u64) {
        self.transmit(
            id,
            MessagePacket::Ack {
                message_id: id,
                bitmap,
            }
            .encode(),
        );
    }

    fn on_data(&self, chunk: MessageChunk) {
        let id = chunk.message_id;
        let total = chunk.total_chunks;
        if total == 0 || total > MAX_MESSAGE_CHUNKS || chunk.chunk_id >= total {
            tracing::trace!(message_id = id, total, chunk = chunk.chunk_id, "dropping malformed chunk");
            return;
        }
        if let Some(bitmap) = self.completed.get(&id).map(|c| c.bitmap) {
            // Already delivered; only the ACK was lost.
            self.send_ack(id, bitmap);
            return;
        }

        let now = Instant::now();
        let effects = self
            .receives
            .entry(id)
            .or_insert_with(|| MessageReceive::new(id, total, now))
            .on_data(chunk, now);

        for effect in effects {
            match effect {
                ReceiveEffect::Nack(chunk) => {
                    tracing::debug!(message_id = id, chunk, "CRC mismatch, sending NACK");
                    self.transmit(
                        id,
                        MessagePacket::Nack {
                            message_id: id,
                            chunk_id: chunk,
                        }
                        .encode(),
                    );
                }
                ReceiveEffect::ScheduleAck => self.schedule_ack(id),
                ReceiveEffect::Progress(done) => {
                    self.events.on_transfer_progress(id, done, total)
                }
                ReceiveEffect::Complete(bytes) => self.complete_receive(id, bytes, now),
            }
        }
    }

    /// Coalesce ACKs: the first chunk after a quiet period arms a timer, and
    /// the ACK it sends carries whatever has arrived by then.
    fn schedule_ack(&self, id: u64) {
        let armed = self
            .receives
            .get_mut(&id)
            .map(|mut r| r.claim_ack())
            .unwrap_or(false);
        if !armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.flush_ack(id);
            return;
        };
        let this = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(this.settings.ack_delay()).await;
            this.flush_ack(id);
        });
    }

    fn flush_ack(&self, id: u64) {
        // Gone means the message completed and its final ACK already went out.
        let Some(bitmap) = self.receives.get_mut(&id).map(|mut r| r.release_ack()) else {
            return;
        };
        self.send_ack(id, bitmap);
    }

    fn complete_receive(&self, id: u64, bytes: Bytes, now: Instant) {
        let Some((_, state)) = self.receives.remove(&id) else {
            return;
        };
        let bitmap = state.ack_bitmap();
        self.completed.insert(id, CompletedMessage { bitmap, at: now });
        self.send_ack(id, bitmap);
        tracing::debug!(
            message_id = id,
            len = bytes.len(),
            elapsed_ms = now.saturating_duration_since(state.first_chunk_at).as_millis() as u64,
            "message reassembled"
        );
        self.events.on_message_complete(&self.peer_id, id, bytes);
    }

    fn on_fin(&self, id: u64) {
        if let Some(bitmap) = self.completed.get(&id).map(|c| c.bitmap) {
            self.send_ack(id, bitmap);
        } else if let Some(bitmap) = self.receives.get(&id).map(|r| r.ack_bitmap()) {
            self.send_ack(id, bitmap);
        }
    }

    /// Retransmission scan plus receive-side housekeeping.
    pub fn tick(&self, now: Instant) {
        let rto = self.settings.rto();
        let max_retries = self.settings.max_retries;
        let mut packets = Vec::new();
        let mut terminal = Vec::new();
        for mut entry in self.sends.iter_mut() {
            let id = *entry.key();
            let effects = entry.state.on_tick(now, rto, max_retries);
            let realized = realize(&entry.state, effects);
            packets.extend(realized.packets.into_iter().map(|p| (id, p)));
            if let Some(result) = realized.terminal {
                terminal.push((id, result));
            }
        }
        for (id, packet) in packets {
            tracing::trace!(message_id = id, "retransmitting chunk");
            self.transmit(id, packet);
        }
        for (id, result) in terminal {
            self.finish_send(id, result);
        }

        let linger = self.settings.completed_linger();
        self.completed
            .retain(|_, c| now.saturating_duration_since(c.at) < linger);

        let stale: Vec<u64> = self
            .receives
            .iter()
            .filter(|r| now.saturating_duration_since(r.last_activity) >= linger)
            .map(|r| *r.key())
            .collect();
        for id in stale {
            let expired = self
                .receives
                .remove_if(&id, |_, r| now.saturating_duration_since(r.last_activity) >= linger);
            if expired.is_some() {
                let reason = TransferError::Abandoned(linger).to_string();
                tracing::debug!(message_id = id, "dropping incomplete message");
                self.events.on_transfer_failed(id, &reason);
            }
        }
    }

    /// Resolve every live send with `error`.
    pub fn fail_all(&self, error: TransferError) {
        let ids: Vec<u64> = self.sends.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.finish_send(id, Err(error.clone()));
        }
    }
}

impl PacketHandler for ReliableChannel {
    fn name(&self) -> &'static str {
        "messaging"
    }

    fn signals(&self) -> Vec<u8> {
        Family::Message.signals().to_vec()
    }

    fn handle_packet(&self, packet: Bytes) {
        match MessagePacket::decode(&packet) {
            Ok(decoded) => self.handle(decoded),
            Err(e) => tracing::trace!(
                error = %e,
                preview = hex::encode(&packet[..packet.len().min(16)]),
                "dropping malformed messaging packet"
            ),
        }
    }
}
