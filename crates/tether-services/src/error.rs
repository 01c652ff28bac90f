//! Error types for the transfer engines.
//!
//! `TransferError`'s Display text doubles as the failure reason reported to
//! `TransferEvents::on_transfer_failed` and to the awaiting caller.

use std::time::Duration;

/// Failure at the channel boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is not open")]
    NotOpen,

    #[error("channel send queue is full")]
    QueueFull,

    #[error("channel closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("channel is not open")]
    ChannelNotOpen,

    #[error("channel send failed: {0}")]
    ChannelSend(ChannelError),

    #[error("message of {size} bytes exceeds the {max}-byte limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("chunk {chunk} unacknowledged after {retries} retries")]
    RetriesExhausted { chunk: u32, retries: u32 },

    #[error("file offer was not accepted within {0:?}")]
    OfferTimeout(Duration),

    #[error("no handshake ACK within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("no completion confirmation within {0:?}")]
    NoConfirmation(Duration),

    #[error("transfer abandoned after {0:?} of silence")]
    Abandoned(Duration),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("session shut down")]
    Shutdown,
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::Io(e.to_string())
    }
}

/// Failures of the hole-punch procedure.
#[derive(Debug, thiserror::Error)]
pub enum HolePunchError {
    #[error("directory lookup timed out after {0:?}")]
    LookupTimeout(Duration),

    #[error("peer {0:?} is not registered with the directory")]
    PeerNotFound(String),

    #[error("directory returned no candidate ports")]
    NoCandidates,

    #[error("no candidate answered within {0:?}")]
    PunchTimeout(Duration),

    #[error("directory protocol error: {0}")]
    Directory(String),

    #[error("punch packet: {0}")]
    Wire(#[from] tether_core::wire::WireError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
