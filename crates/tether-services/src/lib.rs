//! tether-services — transfer engines, channel adapters, and hole punching.
//!
//! A [`PeerSession`] binds one [`Channel`] to a messaging engine
//! ([`ReliableChannel`]) and a file engine ([`FileTransferSession`]). The
//! [`HolePuncher`] is independent: it produces a UDP socket that
//! [`UdpChannel`] can wrap.

pub mod bitmap;
pub mod channel;
pub mod chunk_store;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod file_transfer;
pub mod hole_punch;
pub mod ids;
pub mod pending;
pub mod reliable;
pub mod rendezvous;
pub mod session;
pub mod udp_channel;

pub use bitmap::ChunkBitmap;
pub use channel::{Channel, ChannelState, LoopbackChannel, LoopbackEnd, PacketFilter};
pub use chunk_store::{open_file_sink, ChunkAssembler, ChunkSink, ChunkSource};
pub use dispatch::{PacketDispatcher, PacketHandler};
pub use error::{ChannelError, HolePunchError, TransferError};
pub use events::{EventStream, NullEvents, TracingEvents, TransferEvent, TransferEvents};
pub use file_transfer::{
    DirectoryAcceptor, FileAcceptor, FileOffer, FileSendPhase, FileSendReport, FileTransferSession,
    RejectAll,
};
pub use hole_punch::{HolePuncher, PunchedLink};
pub use ids::TransferIds;
pub use pending::{PendingTransfer, TransferResult};
pub use reliable::ReliableChannel;
pub use rendezvous::{DirectoryReply, PeerCandidate, Rendezvous, UdpRendezvous};
pub use session::{PeerSession, SessionWorkers};
pub use udp_channel::{bind_udp, PunchNames, UdpChannel};
