//! # windrop-sync
//!
//! The peer-side room synchronization engine. A [`SyncEngine`] sits on one
//! transport endpoint and manages any number of joined rooms; each
//! [`RoomHandle`] drives the snapshot request/response handshake,
//! broadcasts local deltas, deduplicates and forwards inbound control
//! messages, and opportunistically keeps a direct stream open to a hub.
//!
//! The state machine per room: load persisted state, subscribe to the
//! topic, dial a hub, request a snapshot after a short delay, retry until
//! the first delta or snapshot arrives, then go quiet and exchange
//! incremental updates.

pub mod engine;
pub mod error;
pub mod hub_session;
pub mod outbox;

pub use engine::{ControlHandler, FilesHandler, JoinOptions, ManifestHandler, RoomHandle, SyncEngine};
pub use error::SyncError;
pub use hub_session::HubLink;
pub use outbox::Outbox;
