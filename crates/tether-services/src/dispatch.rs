//! Routes inbound packets to the engine that owns their signal byte.
//!
//! Each sub-protocol registers independently for the signals it handles;
//! the dispatcher itself never looks past the first byte.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

/// An engine that consumes one or more signal families.
pub trait PacketHandler: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Leading signal bytes this handler owns.
    fn signals(&self) -> Vec<u8>;

    /// Handle one packet whose first byte is one of `signals()`.
    ///
    /// Malformed input must be dropped inside the handler; nothing here may
    /// take down the dispatch loop.
    fn handle_packet(&self, packet: Bytes);
}

/// Maps signal bytes to handlers.
#[derive(Default)]
pub struct PacketDispatcher {
    handlers: HashMap<u8, Arc<dyn PacketHandler>>,
}

impl PacketDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every signal it declares. A later registration
    /// for the same signal replaces the earlier one.
    pub fn register(&mut self, handler: Arc<dyn PacketHandler>) {
        for signal in handler.signals() {
            if let Some(previous) = self.handlers.insert(signal, handler.clone()) {
                tracing::warn!(
                    signal = format_args!("0x{signal:02x}"),
                    replaced = previous.name(),
                    by = handler.name(),
                    "signal handler replaced"
                );
            }
        }
    }

    /// Dispatch one packet. Returns false if it was empty or no handler
    /// claims its signal.
    pub fn dispatch(&self, packet: Bytes) -> bool {
        let Some(&signal) = packet.first() else {
            tracing::trace!("dropping empty packet");
            return false;
        };
        match self.handlers.get(&signal) {
            Some(handler) => {
                handler.handle_packet(packet);
                true
            }
            None => {
                tracing::trace!(
                    signal = format_args!("0x{signal:02x}"),
                    preview = hex::encode(&packet[..packet.len().min(16)]),
                    "dropping packet with unknown signal"
                );
                false
            }
        }
    }

    pub fn handles(&self, signal: u8) -> bool {
        self.handlers.contains_key(&signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        signals: Vec<u8>,
        seen: Mutex<Vec<Bytes>>,
    }

    impl PacketHandler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn signals(&self) -> Vec<u8> {
            self.signals.clone()
        }

        fn handle_packet(&self, packet: Bytes) {
            self.seen.lock().unwrap().push(packet);
        }
    }

    #[test]
    fn routes_by_leading_byte() {
        let files = Arc::new(Recorder {
            signals: vec![0x00, 0x01],
            seen: Mutex::new(Vec::new()),
        });
        let messages = Arc::new(Recorder {
            signals: vec![0x20],
            seen: Mutex::new(Vec::new()),
        });
        let mut dispatcher = PacketDispatcher::new();
        dispatcher.register(files.clone());
        dispatcher.register(messages.clone());

        assert!(dispatcher.dispatch(Bytes::from_static(&[0x01, 9])));
        assert!(dispatcher.dispatch(Bytes::from_static(&[0x20])));
        assert!(!dispatcher.dispatch(Bytes::from_static(&[0x7f, 1, 2])));
        assert!(!dispatcher.dispatch(Bytes::new()));

        assert_eq!(files.seen.lock().unwrap().len(), 1);
        assert_eq!(&messages.seen.lock().unwrap()[0][..], &[0x20]);
        assert!(dispatcher.handles(0x00));
        assert!(!dispatcher.handles(0x02));
    }
}
