//! # windrop-hub
//!
//! The always-on side of a windrop room: a server process that accepts
//! direct `/y-sync/1.0.0` streams, bridges them with the room's gossip
//! topic, persists every room's state to disk, and (in mirror mode) pins
//! all content the manifests reference.
//!
//! The hub holds no authority; it is one more CRDT replica that happens
//! to never go offline.

pub mod config;
pub mod error;
pub mod hub;
pub mod pinning;
pub mod room;
pub mod stats;
pub mod upload;

pub use config::{HubArgs, Modes};
pub use error::HubError;
pub use hub::{Hub, HubConfig};
pub use pinning::Pinner;
pub use room::{HubRoom, RoomRegistry};
