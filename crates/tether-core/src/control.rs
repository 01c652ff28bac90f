//! Control-plane text overlay (signal 0xF0).
//!
//! Gates a file transfer on application readiness before the binary
//! handshake starts. Payload after the signal byte is UTF-8, pipe-delimited:
//!
//! ```text
//! TETHER_CTRL|UR_RECEIVER|<fileId>|<fileSize>|<base64(fileName)>
//! TETHER_CTRL|OK_SNDFILE|<fileId>
//! ```
//!
//! Numbers are decimal. The file name is base64 so it may contain pipes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::{signal, WireError};

pub const CTRL_PREFIX: &str = "TETHER_CTRL";

const UR_RECEIVER: &str = "UR_RECEIVER";
const OK_SNDFILE: &str = "OK_SNDFILE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Sender announces a file it wants to push.
    UrReceiver {
        file_id: u64,
        file_size: u64,
        file_name: String,
    },
    /// Receiver is ready; the sender may start the binary handshake.
    OkSendFile { file_id: u64 },
}

impl ControlMessage {
    pub fn file_id(&self) -> u64 {
        match self {
            ControlMessage::UrReceiver { file_id, .. } | ControlMessage::OkSendFile { file_id } => {
                *file_id
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let text = match self {
            ControlMessage::UrReceiver {
                file_id,
                file_size,
                file_name,
            } => format!(
                "{CTRL_PREFIX}|{UR_RECEIVER}|{file_id}|{file_size}|{}",
                STANDARD.encode(file_name.as_bytes())
            ),
            ControlMessage::OkSendFile { file_id } => {
                format!("{CTRL_PREFIX}|{OK_SNDFILE}|{file_id}")
            }
        };
        let mut buf = BytesMut::with_capacity(1 + text.len());
        buf.put_u8(signal::CONTROL);
        buf.put_slice(text.as_bytes());
        buf.freeze()
    }

    pub fn decode(packet: &[u8]) -> Result<Self, WireError> {
        match packet.first() {
            None => return Err(WireError::Empty),
            Some(&signal::CONTROL) => {}
            Some(&other) => return Err(WireError::UnknownSignal(other)),
        }
        let text = std::str::from_utf8(&packet[1..])
            .map_err(|_| invalid("payload is not UTF-8"))?;
        let fields: Vec<&str> = text.split('|').collect();

        if fields.first() != Some(&CTRL_PREFIX) {
            return Err(invalid("missing control prefix"));
        }

        match fields.as_slice() {
            [_, UR_RECEIVER, file_id, file_size, name] => {
                let raw_name = STANDARD
                    .decode(name)
                    .map_err(|e| invalid(&format!("file name is not base64: {e}")))?;
                let file_name = String::from_utf8(raw_name)
                    .map_err(|_| invalid("file name is not UTF-8"))?;
                Ok(ControlMessage::UrReceiver {
                    file_id: parse_number(file_id, "fileId")?,
                    file_size: parse_number(file_size, "fileSize")?,
                    file_name,
                })
            }
            [_, OK_SNDFILE, file_id] => Ok(ControlMessage::OkSendFile {
                file_id: parse_number(file_id, "fileId")?,
            }),
            [_, kind, ..] => Err(invalid(&format!("unexpected message type {kind:?}"))),
            _ => Err(invalid("missing message type")),
        }
    }
}

fn parse_number(field: &str, what: &str) -> Result<u64, WireError> {
    field
        .parse()
        .map_err(|_| invalid(&format!("{what} {field:?} is not a decimal u64")))
}

fn invalid(reason: &str) -> WireError {
    WireError::InvalidControl(reason.to_string())
}
