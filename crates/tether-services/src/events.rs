//! Completion callbacks.
//!
//! Engines report to a `TransferEvents` sink. The sink is called from the
//! session workers, so implementations must return quickly and must not
//! call back into the session.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::sync::mpsc;

pub trait TransferEvents: Send + Sync {
    fn on_message_complete(&self, sender_id: &str, message_id: u64, bytes: Bytes);

    fn on_file_complete(&self, sender_id: &str, file_id: u64, path: &Path, size: u64);

    fn on_transfer_failed(&self, transfer_id: u64, reason: &str);

    fn on_transfer_progress(&self, _transfer_id: u64, _chunks_done: u32, _chunks_total: u32) {}
}

/// Logs every event.
pub struct TracingEvents;

impl TransferEvents for TracingEvents {
    fn on_message_complete(&self, sender_id: &str, message_id: u64, bytes: Bytes) {
        tracing::info!(peer = sender_id, message_id, len = bytes.len(), "message received");
    }

    fn on_file_complete(&self, sender_id: &str, file_id: u64, path: &Path, size: u64) {
        tracing::info!(
            peer = sender_id,
            file_id,
            path = %path.display(),
            size,
            "file received"
        );
    }

    fn on_transfer_failed(&self, transfer_id: u64, reason: &str) {
        tracing::warn!(transfer_id, reason, "transfer failed");
    }

    fn on_transfer_progress(&self, transfer_id: u64, chunks_done: u32, chunks_total: u32) {
        tracing::trace!(transfer_id, chunks_done, chunks_total, "transfer progress");
    }
}

/// Drops every event.
pub struct NullEvents;

impl TransferEvents for NullEvents {
    fn on_message_complete(&self, _: &str, _: u64, _: Bytes) {}
    fn on_file_complete(&self, _: &str, _: u64, _: &Path, _: u64) {}
    fn on_transfer_failed(&self, _: u64, _: &str) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    MessageComplete {
        sender_id: String,
        message_id: u64,
        bytes: Bytes,
    },
    FileComplete {
        sender_id: String,
        file_id: u64,
        path: PathBuf,
        size: u64,
    },
    Failed {
        transfer_id: u64,
        reason: String,
    },
    Progress {
        transfer_id: u64,
        chunks_done: u32,
        chunks_total: u32,
    },
}

/// Forwards events into an unbounded channel, for consumers that prefer to
/// `recv().await` rather than implement the trait.
pub struct EventStream {
    tx: mpsc::UnboundedSender<TransferEvent>,
    progress: bool,
}

impl EventStream {
    /// Progress events are left out; use `with_progress` to include them.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, progress: false }, rx)
    }

    pub fn with_progress() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, progress: true }, rx)
    }

    fn emit(&self, event: TransferEvent) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

impl TransferEvents for EventStream {
    fn on_message_complete(&self, sender_id: &str, message_id: u64, bytes: Bytes) {
        self.emit(TransferEvent::MessageComplete {
            sender_id: sender_id.to_string(),
            message_id,
            bytes,
        });
    }

    fn on_file_complete(&self, sender_id: &str, file_id: u64, path: &Path, size: u64) {
        self.emit(TransferEvent::FileComplete {
            sender_id: sender_id.to_string(),
            file_id,
            path: path.to_path_buf(),
            size,
        });
    }

    fn on_transfer_failed(&self, transfer_id: u64, reason: &str) {
        self.emit(TransferEvent::Failed {
            transfer_id,
            reason: reason.to_string(),
        });
    }

    fn on_transfer_progress(&self, transfer_id: u64, chunks_done: u32, chunks_total: u32) {
        if self.progress {
            self.emit(TransferEvent::Progress {
                transfer_id,
                chunks_done,
                chunks_total,
            });
        }
    }
}
