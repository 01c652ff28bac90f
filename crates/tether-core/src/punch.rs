//! Hole-punch packets.
//!
//! These travel on dedicated raw UDP sockets, never on a peer channel, so
//! their signal bytes intentionally reuse the 0x20 range of the messaging
//! family without conflict.
//!
//! ```text
//! signal(1) | senderLen(2) | sender | targetLen(2) | target
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::WireError;

pub mod signal {
    pub const HELLO: u8 = 0x20;
    pub const HELLO_ACK: u8 = 0x21;
    pub const ESTABLISHED: u8 = 0x22;
}

/// Smallest valid packet: signal plus two empty names.
pub const MIN_PUNCH_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchKind {
    Hello,
    HelloAck,
    Established,
}

impl PunchKind {
    pub fn signal(self) -> u8 {
        match self {
            PunchKind::Hello => signal::HELLO,
            PunchKind::HelloAck => signal::HELLO_ACK,
            PunchKind::Established => signal::ESTABLISHED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunchPacket {
    pub kind: PunchKind,
    /// Username of the peer that sent this packet.
    pub sender: String,
    /// Username the packet is meant for.
    pub target: String,
}

impl PunchPacket {
    pub fn new(kind: PunchKind, sender: &str, target: &str) -> Self {
        Self {
            kind,
            sender: sender.to_string(),
            target: target.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let sender = self.sender.as_bytes();
        let target = self.target.as_bytes();
        let sender_len = u16::try_from(sender.len()).map_err(|_| WireError::NameTooLong(sender.len()))?;
        let target_len = u16::try_from(target.len()).map_err(|_| WireError::NameTooLong(target.len()))?;

        let mut buf = BytesMut::with_capacity(MIN_PUNCH_LEN + sender.len() + target.len());
        buf.put_u8(self.kind.signal());
        buf.put_u16(sender_len);
        buf.put_slice(sender);
        buf.put_u16(target_len);
        buf.put_slice(target);
        Ok(buf.freeze())
    }

    pub fn decode(packet: &[u8]) -> Result<Self, WireError> {
        let signal_byte = *packet.first().ok_or(WireError::Empty)?;
        let kind = match signal_byte {
            signal::HELLO => PunchKind::Hello,
            signal::HELLO_ACK => PunchKind::HelloAck,
            signal::ESTABLISHED => PunchKind::Established,
            other => return Err(WireError::UnknownSignal(other)),
        };
        if packet.len() < MIN_PUNCH_LEN {
            return Err(WireError::Truncated {
                signal: signal_byte,
                len: packet.len(),
                min: MIN_PUNCH_LEN,
            });
        }

        let (sender, rest) = read_name(signal_byte, packet, &packet[1..])?;
        let (target, _) = read_name(signal_byte, packet, rest)?;
        Ok(Self {
            kind,
            sender,
            target,
        })
    }
}

/// Reads one `len(2) | bytes` field, returning the name and the remainder.
fn read_name<'a>(
    signal_byte: u8,
    packet: &[u8],
    field: &'a [u8],
) -> Result<(String, &'a [u8]), WireError> {
    let truncated = |min: usize| WireError::Truncated {
        signal: signal_byte,
        len: packet.len(),
        min,
    };
    let consumed = packet.len() - field.len();
    if field.len() < 2 {
        return Err(truncated(consumed + 2));
    }
    let len = u16::from_be_bytes([field[0], field[1]]) as usize;
    let body = &field[2..];
    if body.len() < len {
        return Err(truncated(consumed + 2 + len));
    }
    let name = std::str::from_utf8(&body[..len])
        .map_err(|_| WireError::InvalidName("not UTF-8"))?
        .to_string();
    Ok((name, &body[len..]))
}
