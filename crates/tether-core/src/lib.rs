//! tether-core — wire formats, chunk constants, and configuration.
//! Every other Tether crate depends on this one. Nothing here performs I/O.

pub mod config;
pub mod control;
pub mod punch;
pub mod wire;

pub use control::ControlMessage;
pub use punch::{PunchKind, PunchPacket};
pub use wire::{FileChunk, FilePacket, HandshakeKind, MessageChunk, MessagePacket, WireError};
