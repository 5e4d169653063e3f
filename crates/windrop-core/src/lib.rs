//! # windrop-core
//!
//! Core types for windrop rooms: identifiers and the room data model, the
//! control-message codec, the transport contract with an in-memory
//! implementation for tests, and the contracts of the two external
//! collaborators (content exchange, room directory).
//!
//! Everything above this crate (CRDT state, the sync engine, the hub)
//! talks to the network exclusively through [`RoomTransport`] and frames
//! everything it says as a [`ControlMsg`].

pub mod content;
pub mod directory;
pub mod error;
pub mod ids;
pub mod memory_transport;
pub mod message;
pub mod seen;
pub mod transport;

pub use content::{ContentClient, MemoryContentClient};
pub use directory::{RoomDirectory, RoomRecord};
pub use error::{CodecError, ContentError, PublishError, TransportError};
pub use ids::{
    ChatMessage, ContentId, DISCOVERY_TOPIC, FileEntry, Manifest, PeerId, ROOM_TOPIC_PREFIX,
    RoomId, Topic,
};
pub use memory_transport::{MemoryBroker, MemoryTransport};
pub use message::{ControlMsg, DEFAULT_SYNC_TTL, MAX_FRAME_SIZE, fresh_msg_id, split_frame};
pub use seen::{SEEN_CAP, SeenSet};
pub use transport::{
    ConnectionInfo, DIAL_TIMEOUT, InboundStream, ProtocolStream, RoomTransport, TransportEvent,
};

/// Protocol identifier for hub sync streams.
pub const SYNC_PROTOCOL: &str = "/y-sync/1.0.0";
