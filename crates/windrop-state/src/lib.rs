//! # windrop-state
//!
//! The replicated state of one room: an Automerge document holding the
//! file manifest and the chat log, with origin-tagged updates, observer
//! registries and a watchable sync status.
//!
//! The merge laws the rest of the system leans on:
//! - applying the same delta twice is a no-op,
//! - merging snapshots commutes with snapshotting merges,
//! - a replica rebuilt from persistence is observably identical to one
//!   rebuilt from the ordered deltas that produced it.

pub mod doc;
pub mod error;
pub mod status;

pub use automerge::ChangeHash;
pub use doc::{ObserverToken, Origin, RoomDoc};
pub use error::StateError;
pub use status::{SyncStatus, SyncStatusCell};
