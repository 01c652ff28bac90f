//! Tether wire format: byte-exact packets for the file-transfer and
//! messaging families carried over one peer channel.
//!
//! Every packet starts with a one-byte signal. The signal alone decides
//! which family (and which decoder) a packet belongs to, so the receive
//! path can route a datagram before parsing anything else.
//!
//! Fixed headers are `#[repr(C)]` zerocopy structs built from big-endian
//! byteorder fields. Their sizes are compile-time guarded: if one of the
//! `assert_eq_size!` lines fails, the wire format has silently changed.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Signals ───────────────────────────────────────────────────────────────────

/// Leading signal bytes. The file family lives in 0x00–0x11, messaging in
/// 0x20–0x23, and the control text overlay at 0xF0.
pub mod signal {
    pub const FILE_DATA: u8 = 0x00;
    pub const FILE_SYN: u8 = 0x01;
    pub const FILE_NACK: u8 = 0x02;
    pub const FILE_FIN: u8 = 0x03;
    pub const FILE_ACK: u8 = 0x10;
    pub const FILE_SYN_ACK: u8 = 0x11;

    pub const MSG_DATA: u8 = 0x20;
    pub const MSG_ACK: u8 = 0x21;
    pub const MSG_NACK: u8 = 0x22;
    pub const MSG_FIN: u8 = 0x23;

    pub const CONTROL: u8 = 0xF0;
}

/// Sub-protocol a signal byte belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    File,
    Message,
    Control,
}

impl Family {
    pub fn of(signal_byte: u8) -> Option<Family> {
        match signal_byte {
            signal::FILE_DATA
            | signal::FILE_SYN
            | signal::FILE_NACK
            | signal::FILE_FIN
            | signal::FILE_ACK
            | signal::FILE_SYN_ACK => Some(Family::File),
            signal::MSG_DATA..=signal::MSG_FIN => Some(Family::Message),
            signal::CONTROL => Some(Family::Control),
            _ => None,
        }
    }

    /// Every signal byte owned by this family.
    pub fn signals(self) -> &'static [u8] {
        match self {
            Family::File => &[
                signal::FILE_DATA,
                signal::FILE_SYN,
                signal::FILE_NACK,
                signal::FILE_FIN,
                signal::FILE_ACK,
                signal::FILE_SYN_ACK,
            ],
            Family::Message => &[
                signal::MSG_DATA,
                signal::MSG_ACK,
                signal::MSG_NACK,
                signal::MSG_FIN,
            ],
            Family::Control => &[signal::CONTROL],
        }
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// File chunk payload size. Chosen to keep a DATA packet MTU-safe.
pub const FILE_CHUNK_SIZE: usize = 1450;

/// Messaging chunk payload size. Smaller than the file chunk to leave room
/// for the messaging header inside the same outer transport MTU.
pub const MESSAGE_CHUNK_SIZE: usize = 1131;

/// Width of the messaging selective-ACK bitmap. A message can never span
/// more chunks than this.
pub const MAX_MESSAGE_CHUNKS: u32 = 64;

// ── Fixed headers ─────────────────────────────────────────────────────────────

/// SYN / ACK / SYN_ACK. Wire size: 21 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct HandshakeHeader {
    pub signal: u8,
    pub file_id: U64<BigEndian>,
    pub file_size: U64<BigEndian>,
    pub total_chunks: U32<BigEndian>,
}

assert_eq_size!(HandshakeHeader, [u8; 21]);

/// File DATA header; `length` payload bytes follow. Wire size: 25 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FileDataHeader {
    pub signal: u8,
    pub file_id: U64<BigEndian>,
    pub seq_no: U32<BigEndian>,
    pub total_chunks: U32<BigEndian>,
    pub length: U32<BigEndian>,
    /// CRC-32C (Castagnoli) of the payload bytes.
    pub crc: U32<BigEndian>,
}

assert_eq_size!(FileDataHeader, [u8; 25]);

/// File NACK. Wire size: 13 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FileNackPacket {
    pub signal: u8,
    pub file_id: U64<BigEndian>,
    pub seq_no: U32<BigEndian>,
}

assert_eq_size!(FileNackPacket, [u8; 13]);

/// FIN for either family: signal plus the 8-byte transfer id. Wire size: 9 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FinPacket {
    pub signal: u8,
    pub id: U64<BigEndian>,
}

assert_eq_size!(FinPacket, [u8; 9]);

/// Messaging DATA header; the payload runs to the end of the packet.
/// Wire size: 21 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct MessageDataHeader {
    pub signal: u8,
    pub message_id: U64<BigEndian>,
    pub chunk_id: U32<BigEndian>,
    pub total_chunks: U32<BigEndian>,
    /// Standard CRC-32 (IEEE) of the payload. Not Castagnoli: peers on the
    /// messaging family expect this exact algorithm.
    pub crc: U32<BigEndian>,
}

assert_eq_size!(MessageDataHeader, [u8; 21]);

/// Messaging selective ACK. Bit `i` set means chunk `i` was received.
/// Wire size: 17 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct MessageAckPacket {
    pub signal: u8,
    pub message_id: U64<BigEndian>,
    pub bitmap: U64<BigEndian>,
}

assert_eq_size!(MessageAckPacket, [u8; 17]);

/// Messaging NACK. Wire size: 13 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct MessageNackPacket {
    pub signal: u8,
    pub message_id: U64<BigEndian>,
    pub chunk_id: U32<BigEndian>,
}

assert_eq_size!(MessageNackPacket, [u8; 13]);

pub const HANDSHAKE_LEN: usize = std::mem::size_of::<HandshakeHeader>();
pub const FILE_DATA_HEADER_LEN: usize = std::mem::size_of::<FileDataHeader>();
pub const FILE_NACK_LEN: usize = std::mem::size_of::<FileNackPacket>();
pub const FIN_LEN: usize = std::mem::size_of::<FinPacket>();
pub const MESSAGE_DATA_HEADER_LEN: usize = std::mem::size_of::<MessageDataHeader>();
pub const MESSAGE_ACK_LEN: usize = std::mem::size_of::<MessageAckPacket>();
pub const MESSAGE_NACK_LEN: usize = std::mem::size_of::<MessageNackPacket>();

// ── Checksums ─────────────────────────────────────────────────────────────────

/// CRC used by the file data plane.
pub fn file_crc(payload: &[u8]) -> u32 {
    crc32c::crc32c(payload)
}

/// CRC used by the messaging data plane.
pub fn message_crc(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Leading signal byte, if any.
pub fn signal_of(packet: &[u8]) -> Option<u8> {
    packet.first().copied()
}

fn require(packet: &[u8], min: usize) -> Result<(), WireError> {
    match packet.first() {
        None => Err(WireError::Empty),
        Some(&signal) if packet.len() < min => Err(WireError::Truncated {
            signal,
            len: packet.len(),
            min,
        }),
        Some(_) => Ok(()),
    }
}

fn header<T: FromBytes>(packet: &[u8], min: usize) -> Result<T, WireError> {
    require(packet, min)?;
    T::read_from_prefix(packet).ok_or(WireError::Truncated {
        signal: packet[0],
        len: packet.len(),
        min,
    })
}

// ── File-transfer family ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    Syn,
    Ack,
    SynAck,
}

impl HandshakeKind {
    pub fn signal(self) -> u8 {
        match self {
            HandshakeKind::Syn => signal::FILE_SYN,
            HandshakeKind::Ack => signal::FILE_ACK,
            HandshakeKind::SynAck => signal::FILE_SYN_ACK,
        }
    }
}

/// One sequenced, checksummed slice of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub file_id: u64,
    pub seq_no: u32,
    pub total_chunks: u32,
    pub crc: u32,
    pub payload: Bytes,
}

impl FileChunk {
    /// Build a chunk and compute its CRC-32C.
    pub fn new(file_id: u64, seq_no: u32, total_chunks: u32, payload: Bytes) -> Self {
        let crc = file_crc(&payload);
        Self {
            file_id,
            seq_no,
            total_chunks,
            crc,
            payload,
        }
    }

    /// True when the carried CRC matches the payload.
    pub fn verify(&self) -> bool {
        file_crc(&self.payload) == self.crc
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePacket {
    Handshake {
        kind: HandshakeKind,
        file_id: u64,
        file_size: u64,
        total_chunks: u32,
    },
    Data(FileChunk),
    Nack {
        file_id: u64,
        seq_no: u32,
    },
    Fin {
        file_id: u64,
    },
}

impl FilePacket {
    pub fn file_id(&self) -> u64 {
        match self {
            FilePacket::Handshake { file_id, .. }
            | FilePacket::Nack { file_id, .. }
            | FilePacket::Fin { file_id } => *file_id,
            FilePacket::Data(chunk) => chunk.file_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            FilePacket::Handshake {
                kind,
                file_id,
                file_size,
                total_chunks,
            } => {
                let header = HandshakeHeader {
                    signal: kind.signal(),
                    file_id: U64::new(*file_id),
                    file_size: U64::new(*file_size),
                    total_chunks: U32::new(*total_chunks),
                };
                Bytes::copy_from_slice(header.as_bytes())
            }
            FilePacket::Data(chunk) => {
                let header = FileDataHeader {
                    signal: signal::FILE_DATA,
                    file_id: U64::new(chunk.file_id),
                    seq_no: U32::new(chunk.seq_no),
                    total_chunks: U32::new(chunk.total_chunks),
                    length: U32::new(chunk.payload.len() as u32),
                    crc: U32::new(chunk.crc),
                };
                let mut buf = BytesMut::with_capacity(FILE_DATA_HEADER_LEN + chunk.payload.len());
                buf.put_slice(header.as_bytes());
                buf.put_slice(&chunk.payload);
                buf.freeze()
            }
            FilePacket::Nack { file_id, seq_no } => {
                let nack = FileNackPacket {
                    signal: signal::FILE_NACK,
                    file_id: U64::new(*file_id),
                    seq_no: U32::new(*seq_no),
                };
                Bytes::copy_from_slice(nack.as_bytes())
            }
            FilePacket::Fin { file_id } => {
                let fin = FinPacket {
                    signal: signal::FILE_FIN,
                    id: U64::new(*file_id),
                };
                Bytes::copy_from_slice(fin.as_bytes())
            }
        }
    }

    /// Decode a file-family packet. DATA payloads are sliced out of `packet`
    /// without copying and never extend past the declared `length`.
    pub fn decode(packet: &Bytes) -> Result<Self, WireError> {
        let signal_byte = signal_of(packet).ok_or(WireError::Empty)?;
        match signal_byte {
            signal::FILE_SYN | signal::FILE_ACK | signal::FILE_SYN_ACK => {
                let h: HandshakeHeader = header(packet, HANDSHAKE_LEN)?;
                let kind = match signal_byte {
                    signal::FILE_SYN => HandshakeKind::Syn,
                    signal::FILE_ACK => HandshakeKind::Ack,
                    _ => HandshakeKind::SynAck,
                };
                Ok(FilePacket::Handshake {
                    kind,
                    file_id: h.file_id.get(),
                    file_size: h.file_size.get(),
                    total_chunks: h.total_chunks.get(),
                })
            }
            signal::FILE_DATA => {
                let h: FileDataHeader = header(packet, FILE_DATA_HEADER_LEN)?;
                let declared = h.length.get() as usize;
                let available = packet.len() - FILE_DATA_HEADER_LEN;
                if declared > available {
                    return Err(WireError::LengthMismatch {
                        declared,
                        available,
                    });
                }
                Ok(FilePacket::Data(FileChunk {
                    file_id: h.file_id.get(),
                    seq_no: h.seq_no.get(),
                    total_chunks: h.total_chunks.get(),
                    crc: h.crc.get(),
                    payload: packet.slice(FILE_DATA_HEADER_LEN..FILE_DATA_HEADER_LEN + declared),
                }))
            }
            signal::FILE_NACK => {
                let n: FileNackPacket = header(packet, FILE_NACK_LEN)?;
                Ok(FilePacket::Nack {
                    file_id: n.file_id.get(),
                    seq_no: n.seq_no.get(),
                })
            }
            signal::FILE_FIN => {
                let f: FinPacket = header(packet, FIN_LEN)?;
                Ok(FilePacket::Fin {
                    file_id: f.id.get(),
                })
            }
            other => Err(WireError::UnknownSignal(other)),
        }
    }
}

// ── Messaging family ──────────────────────────────────────────────────────────

/// One chunk of a short message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageChunk {
    pub message_id: u64,
    pub chunk_id: u32,
    pub total_chunks: u32,
    pub crc: u32,
    pub payload: Bytes,
}

impl MessageChunk {
    /// Build a chunk and compute its CRC-32.
    pub fn new(message_id: u64, chunk_id: u32, total_chunks: u32, payload: Bytes) -> Self {
        let crc = message_crc(&payload);
        Self {
            message_id,
            chunk_id,
            total_chunks,
            crc,
            payload,
        }
    }

    pub fn verify(&self) -> bool {
        message_crc(&self.payload) == self.crc
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePacket {
    Data(MessageChunk),
    Ack { message_id: u64, bitmap: u64 },
    Nack { message_id: u64, chunk_id: u32 },
    Fin { message_id: u64 },
}

impl MessagePacket {
    pub fn message_id(&self) -> u64 {
        match self {
            MessagePacket::Data(chunk) => chunk.message_id,
            MessagePacket::Ack { message_id, .. }
            | MessagePacket::Nack { message_id, .. }
            | MessagePacket::Fin { message_id } => *message_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            MessagePacket::Data(chunk) => {
                let header = MessageDataHeader {
                    signal: signal::MSG_DATA,
                    message_id: U64::new(chunk.message_id),
                    chunk_id: U32::new(chunk.chunk_id),
                    total_chunks: U32::new(chunk.total_chunks),
                    crc: U32::new(chunk.crc),
                };
                let mut buf =
                    BytesMut::with_capacity(MESSAGE_DATA_HEADER_LEN + chunk.payload.len());
                buf.put_slice(header.as_bytes());
                buf.put_slice(&chunk.payload);
                buf.freeze()
            }
            MessagePacket::Ack { message_id, bitmap } => {
                let ack = MessageAckPacket {
                    signal: signal::MSG_ACK,
                    message_id: U64::new(*message_id),
                    bitmap: U64::new(*bitmap),
                };
                Bytes::copy_from_slice(ack.as_bytes())
            }
            MessagePacket::Nack {
                message_id,
                chunk_id,
            } => {
                let nack = MessageNackPacket {
                    signal: signal::MSG_NACK,
                    message_id: U64::new(*message_id),
                    chunk_id: U32::new(*chunk_id),
                };
                Bytes::copy_from_slice(nack.as_bytes())
            }
            MessagePacket::Fin { message_id } => {
                let fin = FinPacket {
                    signal: signal::MSG_FIN,
                    id: U64::new(*message_id),
                };
                Bytes::copy_from_slice(fin.as_bytes())
            }
        }
    }

    pub fn decode(packet: &Bytes) -> Result<Self, WireError> {
        let signal_byte = signal_of(packet).ok_or(WireError::Empty)?;
        match signal_byte {
            signal::MSG_DATA => {
                let h: MessageDataHeader = header(packet, MESSAGE_DATA_HEADER_LEN)?;
                Ok(MessagePacket::Data(MessageChunk {
                    message_id: h.message_id.get(),
                    chunk_id: h.chunk_id.get(),
                    total_chunks: h.total_chunks.get(),
                    crc: h.crc.get(),
                    payload: packet.slice(MESSAGE_DATA_HEADER_LEN..),
                }))
            }
            signal::MSG_ACK => {
                let a: MessageAckPacket = header(packet, MESSAGE_ACK_LEN)?;
                Ok(MessagePacket::Ack {
                    message_id: a.message_id.get(),
                    bitmap: a.bitmap.get(),
                })
            }
            signal::MSG_NACK => {
                let n: MessageNackPacket = header(packet, MESSAGE_NACK_LEN)?;
                Ok(MessagePacket::Nack {
                    message_id: n.message_id.get(),
                    chunk_id: n.chunk_id.get(),
                })
            }
            signal::MSG_FIN => {
                let f: FinPacket = header(packet, FIN_LEN)?;
                Ok(MessagePacket::Fin {
                    message_id: f.id.get(),
                })
            }
            other => Err(WireError::UnknownSignal(other)),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty packet")]
    Empty,

    #[error("packet with signal 0x{signal:02x} is {len} bytes, minimum is {min}")]
    Truncated { signal: u8, len: usize, min: usize },

    #[error("unknown signal byte: 0x{0:02x}")]
    UnknownSignal(u8),

    #[error("declared payload length {declared} exceeds the {available} bytes present")]
    LengthMismatch { declared: usize, available: usize },

    #[error("invalid control message: {0}")]
    InvalidControl(String),

    #[error("invalid name field: {0}")]
    InvalidName(&'static str),

    #[error("name of {0} bytes does not fit a u16 length prefix")]
    NameTooLong(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
