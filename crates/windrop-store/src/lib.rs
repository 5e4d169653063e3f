//! # windrop-store
//!
//! Persistence for room state. A [`SnapshotStore`] keeps the latest
//! full-state snapshot of one room document; the snapshot law (merging a
//! snapshot equals replaying the deltas that produced it) lets every save
//! collapse history into a single whole-state replacement.
//!
//! Two interchangeable back-ends:
//! - [`FileSnapshotStore`]: one `<name>.bin` file per document
//! - [`RedbSnapshotStore`]: a table in an embedded redb database, which
//!   also hosts the local room directory

pub mod error;
pub mod file;
pub mod redb_store;

pub use error::StoreError;
pub use file::FileSnapshotStore;
pub use redb_store::{RedbRoomDirectory, RedbSnapshotStore, RedbStorage};

use async_trait::async_trait;

/// Append-or-overwrite byte storage for one room document's snapshot.
///
/// `save` is whole-state replacement, never append. Implementations must
/// tolerate `load` before any `save` (returns `None`) and interleaved
/// stores for different document names.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Prepare storage for this document name.
    async fn init(&mut self, doc_name: &str) -> Result<(), StoreError>;

    /// The most recent persisted snapshot, if any.
    async fn load(&self) -> Result<Option<Vec<u8>>, StoreError>;

    /// Atomically replace the stored snapshot.
    async fn save(&self, bytes: &[u8]) -> Result<(), StoreError>;
}
