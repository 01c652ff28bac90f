//! Sender side of a file transfer.
//!
//! ```text
//! Offering --OK_SNDFILE/SYN--> WaitingAck --ACK/SYN_ACK--> Sending
//!     --last chunk, settle, FIN--> WaitingNack --FIN echo--> Complete
//! ```
//!
//! Any timeout moves to Failed. NACKs are served in Sending and WaitingNack
//! and are the only way a file chunk is ever resent.

use std::time::Duration;

use tokio::time::Instant;

use tether_core::config::FileTransferSettings;
use tether_core::control::ControlMessage;
use tether_core::wire::{FileChunk, FilePacket, HandshakeKind};

use crate::chunk_store::ChunkSource;
use crate::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSendPhase {
    Offering,
    WaitingAck,
    Sending,
    WaitingNack,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSendEffect {
    Offer,
    Syn,
    SynAck,
    /// Start the paced DATA loop.
    Stream,
    Chunk(u32),
    Fin,
    Complete,
    Fail(TransferError),
}

/// What the caller gets back from a file send that completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSendReport {
    pub file_id: u64,
    pub bytes: u64,
    pub chunks: u32,
    /// Chunks resent on NACK.
    pub retransmits: u32,
    /// SYN_ACK to confirmation.
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct FileSend {
    file_id: u64,
    file_name: String,
    source: ChunkSource,
    phase: FileSendPhase,
    created: Instant,
    phase_since: Instant,
    last_control: Instant,
    last_fin: Instant,
    fin_due: Option<Instant>,
    deadline: Option<Instant>,
    retransmits: u32,
}

impl FileSend {
    pub fn new(file_id: u64, file_name: impl Into<String>, source: ChunkSource, now: Instant) -> Self {
        Self {
            file_id,
            file_name: file_name.into(),
            source,
            phase: FileSendPhase::Offering,
            created: now,
            phase_since: now,
            last_control: now,
            last_fin: now,
            fin_due: None,
            deadline: None,
            retransmits: 0,
        }
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn phase(&self) -> FileSendPhase {
        self.phase
    }

    pub fn source(&self) -> &ChunkSource {
        &self.source
    }

    pub fn total_chunks(&self) -> u32 {
        self.source.chunk_count()
    }

    pub fn offer(&self) -> ControlMessage {
        ControlMessage::UrReceiver {
            file_id: self.file_id,
            file_size: self.source.len(),
            file_name: self.file_name.clone(),
        }
    }

    pub fn handshake(&self, kind: HandshakeKind) -> FilePacket {
        FilePacket::Handshake {
            kind,
            file_id: self.file_id,
            file_size: self.source.len(),
            total_chunks: self.total_chunks(),
        }
    }

    pub fn chunk_packet(&self, seq: u32) -> Option<FilePacket> {
        let payload = self.source.chunk(seq)?;
        Some(FilePacket::Data(FileChunk::new(
            self.file_id,
            seq,
            self.total_chunks(),
            payload,
        )))
    }

    fn enter(&mut self, phase: FileSendPhase, now: Instant) {
        self.phase = phase;
        self.phase_since = now;
    }

    fn fail(&mut self, error: TransferError) -> Vec<FileSendEffect> {
        self.phase = FileSendPhase::Failed;
        vec![FileSendEffect::Fail(error)]
    }

    pub fn start(&mut self, now: Instant) -> Vec<FileSendEffect> {
        self.last_control = now;
        vec![FileSendEffect::Offer]
    }

    /// Receiver granted the offer: begin the timed handshake.
    pub fn on_ok_to_send(&mut self, now: Instant) -> Vec<FileSendEffect> {
        if self.phase != FileSendPhase::Offering {
            return Vec::new();
        }
        self.enter(FileSendPhase::WaitingAck, now);
        self.last_control = now;
        vec![FileSendEffect::Syn]
    }

    pub fn on_ack(&mut self, now: Instant) -> Vec<FileSendEffect> {
        if self.phase != FileSendPhase::WaitingAck {
            return Vec::new();
        }
        self.enter(FileSendPhase::Sending, now);
        vec![FileSendEffect::SynAck, FileSendEffect::Stream]
    }

    /// The DATA loop has sent its FIN.
    pub fn on_fin_sent(&mut self, now: Instant, completion_timeout: Duration) -> Vec<FileSendEffect> {
        if self.phase == FileSendPhase::Sending {
            self.phase = FileSendPhase::WaitingNack;
            self.last_fin = now;
            self.deadline = Some(now + completion_timeout);
        }
        Vec::new()
    }

    pub fn on_nack(&mut self, seq: u32, now: Instant, settle: Duration, completion_timeout: Duration) -> Vec<FileSendEffect> {
        let serving = matches!(self.phase, FileSendPhase::Sending | FileSendPhase::WaitingNack);
        if !serving || seq >= self.total_chunks() {
            return Vec::new();
        }
        self.retransmits += 1;
        if self.phase == FileSendPhase::WaitingNack {
            // Sweep again once this burst of NACKs has been served.
            self.fin_due = Some(now + settle);
            self.deadline = Some(now + completion_timeout);
        }
        vec![FileSendEffect::Chunk(seq)]
    }

    /// The receiver confirmed it holds every chunk.
    pub fn on_fin_echo(&mut self) -> Vec<FileSendEffect> {
        match self.phase {
            FileSendPhase::Sending | FileSendPhase::WaitingNack => {
                self.phase = FileSendPhase::Complete;
                vec![FileSendEffect::Complete]
            }
            _ => Vec::new(),
        }
    }

    pub fn on_tick(&mut self, now: Instant, settings: &FileTransferSettings) -> Vec<FileSendEffect> {
        match self.phase {
            FileSendPhase::Offering => {
                if now.saturating_duration_since(self.created) >= settings.offer_timeout() {
                    return self.fail(TransferError::OfferTimeout(settings.offer_timeout()));
                }
                if now.saturating_duration_since(self.last_control) >= settings.offer_retry() {
                    self.last_control = now;
                    return vec![FileSendEffect::Offer];
                }
                Vec::new()
            }
            FileSendPhase::WaitingAck => {
                if now.saturating_duration_since(self.phase_since) >= settings.handshake_timeout() {
                    return self.fail(TransferError::HandshakeTimeout(settings.handshake_timeout()));
                }
                if now.saturating_duration_since(self.last_control) >= settings.syn_retry() {
                    self.last_control = now;
                    return vec![FileSendEffect::Syn];
                }
                Vec::new()
            }
            FileSendPhase::WaitingNack => {
                if self.deadline.is_some_and(|d| now >= d) {
                    return self.fail(TransferError::NoConfirmation(settings.completion_timeout()));
                }
                // A NACK burst sweeps after `settle`; otherwise FIN repeats
                // until the echo arrives, covering a lost FIN or echo.
                let swept = self.fin_due.is_some_and(|d| now >= d);
                let idle = self.fin_due.is_none()
                    && now.saturating_duration_since(self.last_fin) >= settings.fin_retry();
                if swept || idle {
                    self.fin_due = None;
                    self.last_fin = now;
                    return vec![FileSendEffect::Fin];
                }
                Vec::new()
            }
            FileSendPhase::Sending | FileSendPhase::Complete | FileSendPhase::Failed => Vec::new(),
        }
    }

    pub fn report(&self, now: Instant) -> FileSendReport {
        FileSendReport {
            file_id: self.file_id,
            bytes: self.source.len(),
            chunks: self.total_chunks(),
            retransmits: self.retransmits,
            elapsed: now.saturating_duration_since(self.phase_since),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn send(len: usize) -> (FileSend, Instant) {
        let now = Instant::now();
        let source = ChunkSource::from_bytes(Bytes::from(vec![1u8; len]), 1450).unwrap();
        (FileSend::new(9, "a.bin", source, now), now)
    }

    #[test]
    fn handshake_happy_path() {
        let (mut s, now) = send(10 * 1450);
        assert_eq!(s.start(now), vec![FileSendEffect::Offer]);
        assert!(s.on_ack(now).is_empty(), "ACK before SYN is ignored");
        assert_eq!(s.on_ok_to_send(now), vec![FileSendEffect::Syn]);
        assert!(s.on_ok_to_send(now).is_empty(), "duplicate OK");
        assert_eq!(s.on_ack(now), vec![FileSendEffect::SynAck, FileSendEffect::Stream]);
        assert!(s.on_ack(now).is_empty(), "duplicate ACK");
        assert_eq!(s.phase(), FileSendPhase::Sending);

        s.on_fin_sent(now, Duration::from_secs(30));
        assert_eq!(s.phase(), FileSendPhase::WaitingNack);
        assert_eq!(s.on_fin_echo(), vec![FileSendEffect::Complete]);
        assert_eq!(s.report(now).chunks, 10);
    }

    #[test]
    fn handshake_times_out_without_data() {
        let (mut s, now) = send(1450);
        let settings = FileTransferSettings::default();
        s.start(now);
        s.on_ok_to_send(now);

        let mut syns = 0;
        let mut t = now;
        loop {
            t += Duration::from_secs(1);
            let effects = s.on_tick(t, &settings);
            assert!(!effects.contains(&FileSendEffect::Stream));
            if effects.contains(&FileSendEffect::Syn) {
                syns += 1;
            }
            if let Some(FileSendEffect::Fail(e)) = effects.first() {
                assert_eq!(*e, TransferError::HandshakeTimeout(Duration::from_secs(30)));
                break;
            }
        }
        assert_eq!(t - now, Duration::from_secs(30));
        assert_eq!(syns, 5, "resent every 5 s before the deadline");
        assert_eq!(s.phase(), FileSendPhase::Failed);
    }

    #[test]
    fn offer_is_repeated_then_abandoned() {
        let (mut s, now) = send(1);
        let settings = FileTransferSettings::default();
        s.start(now);
        assert_eq!(s.on_tick(now + Duration::from_secs(2), &settings), vec![FileSendEffect::Offer]);
        assert!(s.on_tick(now + Duration::from_secs(3), &settings).is_empty());
        assert_eq!(
            s.on_tick(now + Duration::from_secs(60), &settings),
            vec![FileSendEffect::Fail(TransferError::OfferTimeout(Duration::from_secs(60)))]
        );
    }

    #[test]
    fn nack_after_fin_rearms_fin_and_deadline() {
        let (mut s, now) = send(10 * 1450);
        let settings = FileTransferSettings::default();
        s.start(now);
        s.on_ok_to_send(now);
        s.on_ack(now);
        s.on_fin_sent(now, settings.completion_timeout());

        let t = now + Duration::from_secs(20);
        assert_eq!(
            s.on_nack(7, t, settings.settle(), settings.completion_timeout()),
            vec![FileSendEffect::Chunk(7)]
        );
        assert!(s.on_nack(10, t, settings.settle(), settings.completion_timeout()).is_empty());
        assert_eq!(s.on_tick(t + settings.settle(), &settings), vec![FileSendEffect::Fin]);
        assert!(s.on_tick(t + settings.settle(), &settings).is_empty(), "one FIN per sweep");

        // Original deadline (now + 30 s) was pushed out by the NACK.
        let later = s.on_tick(now + Duration::from_secs(31), &settings);
        assert!(!later.iter().any(|e| matches!(e, FileSendEffect::Fail(_))));
        assert_eq!(
            s.on_tick(t + settings.completion_timeout(), &settings),
            vec![FileSendEffect::Fail(TransferError::NoConfirmation(Duration::from_secs(30)))]
        );
        assert_eq!(s.report(t).retransmits, 1);
    }

    #[test]
    fn fin_repeats_until_echo() {
        let (mut s, now) = send(4 * 1450);
        let settings = FileTransferSettings::default();
        s.start(now);
        s.on_ok_to_send(now);
        s.on_ack(now);
        s.on_fin_sent(now, settings.completion_timeout());

        let retry = settings.fin_retry();
        assert!(s.on_tick(now + retry - Duration::from_millis(1), &settings).is_empty());
        assert_eq!(s.on_tick(now + retry, &settings), vec![FileSendEffect::Fin]);
        assert!(s.on_tick(now + retry, &settings).is_empty());
        assert_eq!(s.on_tick(now + retry * 2, &settings), vec![FileSendEffect::Fin]);

        assert_eq!(s.on_fin_echo(), vec![FileSendEffect::Complete]);
        assert!(s.on_tick(now + retry * 3, &settings).is_empty());
    }

    #[test]
    fn data_packets_carry_crc32c() {
        let (s, _) = send(1450 + 3);
        match s.chunk_packet(1).unwrap() {
            FilePacket::Data(chunk) => {
                assert_eq!(chunk.payload.len(), 3);
                assert_eq!(chunk.total_chunks, 2);
                assert!(chunk.verify());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(s.chunk_packet(2).is_none());
    }
}
