//! Receiver side of a file transfer.
//!
//! ```text
//! AwaitingSyn --SYN/ACK--> WaitingSynAck --SYN_ACK (or first DATA)--> Receiving
//!     --every chunk present--> Complete
//! ```
//!
//! State exists from the moment an offer is accepted, so a SYN always finds
//! it. FIN only ever drives the missing-chunk sweep; completion is decided
//! by the received bitmap alone.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

use tether_core::wire::{FileChunk, FilePacket, HandshakeKind};

use crate::bitmap::ChunkBitmap;
use crate::chunk_store::{chunk_count, ChunkSink};
use crate::file_transfer::acceptor::FileOffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileReceivePhase {
    AwaitingSyn,
    WaitingSynAck,
    Receiving,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileReceiveEffect {
    Ack,
    Nack(u32),
    Progress(u32),
    Complete,
}

pub struct FileReceive {
    offer: FileOffer,
    path: PathBuf,
    chunk_size: usize,
    total: u32,
    received: ChunkBitmap,
    sink: Option<Box<dyn ChunkSink>>,
    phase: FileReceivePhase,
    started: Option<Instant>,
    last_activity: Instant,
}

impl std::fmt::Debug for FileReceive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReceive")
            .field("file_id", &self.offer.file_id)
            .field("path", &self.path)
            .field("phase", &self.phase)
            .field("received", &self.received.count())
            .field("total", &self.total)
            .finish()
    }
}

impl FileReceive {
    pub fn new(offer: FileOffer, path: PathBuf, chunk_size: usize, now: Instant) -> Self {
        Self {
            offer,
            path,
            chunk_size,
            total: 0,
            received: ChunkBitmap::new(0),
            sink: None,
            phase: FileReceivePhase::AwaitingSyn,
            started: None,
            last_activity: now,
        }
    }

    pub fn file_id(&self) -> u64 {
        self.offer.file_id
    }

    pub fn file_size(&self) -> u64 {
        self.offer.file_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn phase(&self) -> FileReceivePhase {
        self.phase
    }

    pub fn total_chunks(&self) -> u32 {
        self.total
    }

    pub fn received(&self) -> &ChunkBitmap {
        &self.received
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// SYN_ACK (or implicit SYN_ACK) to now.
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.started
            .map(|s| now.saturating_duration_since(s))
            .unwrap_or_default()
    }

    pub fn ack_packet(&self) -> FilePacket {
        FilePacket::Handshake {
            kind: HandshakeKind::Ack,
            file_id: self.offer.file_id,
            file_size: self.offer.file_size,
            total_chunks: self.total,
        }
    }

    /// Payload length chunk `seq` must carry.
    fn expected_len(&self, seq: u32) -> usize {
        if seq + 1 < self.total {
            return self.chunk_size;
        }
        let rem = (self.offer.file_size % self.chunk_size as u64) as usize;
        if rem == 0 {
            self.chunk_size
        } else {
            rem
        }
    }

    pub fn on_syn(&mut self, file_size: u64, total_chunks: u32, now: Instant) -> Vec<FileReceiveEffect> {
        match self.phase {
            FileReceivePhase::AwaitingSyn => {
                let expected = chunk_count(file_size, self.chunk_size).ok();
                if file_size != self.offer.file_size || expected != Some(total_chunks) {
                    tracing::warn!(
                        file_id = self.offer.file_id,
                        offered = self.offer.file_size,
                        file_size,
                        total_chunks,
                        "SYN disagrees with accepted offer, dropping"
                    );
                    return Vec::new();
                }
                self.last_activity = now;
                self.total = total_chunks;
                self.received = ChunkBitmap::new(total_chunks);
                self.phase = FileReceivePhase::WaitingSynAck;
                vec![FileReceiveEffect::Ack]
            }
            FileReceivePhase::WaitingSynAck | FileReceivePhase::Receiving => {
                // Our ACK was lost.
                self.last_activity = now;
                vec![FileReceiveEffect::Ack]
            }
            FileReceivePhase::Complete => Vec::new(),
        }
    }

    /// Open the sink, pre-sized to the declared file size.
    pub fn on_syn_ack<F>(&mut self, now: Instant, open: F) -> io::Result<Vec<FileReceiveEffect>>
    where
        F: FnOnce(&Path, u64) -> io::Result<Box<dyn ChunkSink>>,
    {
        if self.phase != FileReceivePhase::WaitingSynAck {
            return Ok(Vec::new());
        }
        self.sink = Some(open(&self.path, self.offer.file_size)?);
        self.started = Some(now);
        self.last_activity = now;
        self.phase = FileReceivePhase::Receiving;
        if self.received.is_complete() {
            // Zero-chunk file: nothing will ever arrive.
            self.phase = FileReceivePhase::Complete;
            return Ok(vec![FileReceiveEffect::Complete]);
        }
        Ok(Vec::new())
    }

    pub fn on_data<F>(&mut self, chunk: FileChunk, now: Instant, open: F) -> io::Result<Vec<FileReceiveEffect>>
    where
        F: FnOnce(&Path, u64) -> io::Result<Box<dyn ChunkSink>>,
    {
        if self.phase == FileReceivePhase::WaitingSynAck {
            // SYN_ACK was lost but the sender is already streaming.
            self.on_syn_ack(now, open)?;
        }
        if self.phase != FileReceivePhase::Receiving {
            return Ok(Vec::new());
        }

        let seq = chunk.seq_no;
        if seq >= self.total
            || chunk.total_chunks != self.total
            || chunk.payload.len() != self.expected_len(seq)
        {
            tracing::trace!(
                file_id = self.offer.file_id,
                chunk = seq,
                len = chunk.payload.len(),
                "dropping malformed DATA"
            );
            return Ok(Vec::new());
        }
        self.last_activity = now;
        if !chunk.verify() {
            return Ok(vec![FileReceiveEffect::Nack(seq)]);
        }
        if self.received.get(seq) {
            return Ok(Vec::new());
        }

        let Some(sink) = self.sink.as_mut() else {
            return Ok(Vec::new());
        };
        sink.write_chunk(seq, &chunk.payload)?;
        self.received.set(seq);

        if self.received.is_complete() {
            self.phase = FileReceivePhase::Complete;
            return Ok(vec![FileReceiveEffect::Complete]);
        }
        Ok(vec![FileReceiveEffect::Progress(self.received.count())])
    }

    /// One NACK per missing chunk.
    pub fn on_fin(&mut self, now: Instant) -> Vec<FileReceiveEffect> {
        match self.phase {
            FileReceivePhase::WaitingSynAck | FileReceivePhase::Receiving => {
                self.last_activity = now;
                self.received
                    .missing()
                    .into_iter()
                    .map(FileReceiveEffect::Nack)
                    .collect()
            }
            FileReceivePhase::AwaitingSyn | FileReceivePhase::Complete => Vec::new(),
        }
    }

    /// Flush the sink. Call once, after the Complete effect.
    pub fn finish(&mut self) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.finish(),
            None => Ok(()),
        }
    }

    /// Close the sink and delete the file, written or only reserved.
    pub fn discard(mut self) {
        drop(self.sink.take());
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                file_id = self.offer.file_id,
                path = %self.path.display(),
                error = %e,
                "failed to remove partial file"
            ),
        }
    }
}
