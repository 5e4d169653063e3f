//! Room directory contract
//!
//! The home screen lists rooms the user has visited: name, manifest
//! summary, last-seen time. Storage is opaque to the sync core; the store
//! crate ships a redb-backed implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ids::{Manifest, RoomId};

/// One entry in the local room directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: RoomId,
    pub name: Option<String>,
    pub manifest: Option<Manifest>,
    /// Wall-clock millis of the last visit.
    pub last_seen: Option<u64>,
}

impl RoomRecord {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            name: None,
            manifest: None,
            last_seen: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn seen_now(mut self) -> Self {
        self.last_seen = Some(chrono::Utc::now().timestamp_millis() as u64);
        self
    }
}

/// Persistent directory of known rooms.
///
/// `save_room` merges: fields set on the record overwrite, unset fields
/// keep their stored values.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn save_room(&self, record: RoomRecord) -> Result<(), Self::Error>;

    async fn get_room(&self, id: &RoomId) -> Result<Option<RoomRecord>, Self::Error>;

    /// All known rooms, most recently seen first.
    async fn get_rooms(&self) -> Result<Vec<RoomRecord>, Self::Error>;

    async fn update_room_last_seen(&self, id: &RoomId) -> Result<(), Self::Error>;
}
