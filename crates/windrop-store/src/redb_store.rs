//! redb-backed storage
//!
//! The embedded keyed alternative to the file store: one database file
//! holds a `snapshots` table (doc name → latest full-state bytes) and a
//! `rooms` table backing the local room directory.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use windrop_core::{RoomDirectory, RoomId, RoomRecord};

use crate::SnapshotStore;
use crate::error::StoreError;

// Key: doc name, Value: full-state snapshot bytes
const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");

// Key: room id, Value: serialized RoomRecord
const ROOMS: TableDefinition<&str, &[u8]> = TableDefinition::new("rooms");

/// Shared handle to one redb database file.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create the database and make sure the tables exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(|e| StoreError::Database(e.to_string()))?;

        let write_txn = db
            .begin_write()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        write_txn
            .open_table(SNAPSHOTS)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        write_txn
            .open_table(ROOMS)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        write_txn
            .commit()
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(path = %path.display(), "redb storage opened");
        Ok(Self { db: Arc::new(db) })
    }

    /// A snapshot store view over this database.
    pub fn snapshot_store(&self) -> RedbSnapshotStore {
        RedbSnapshotStore {
            storage: self.clone(),
            doc_name: None,
        }
    }

    /// A room directory view over this database.
    pub fn room_directory(&self) -> RedbRoomDirectory {
        RedbRoomDirectory {
            storage: self.clone(),
        }
    }

    fn put(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &[u8],
    ) -> Result<(), StoreError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        {
            let mut t = write_txn
                .open_table(table)
                .map_err(|e| StoreError::Database(e.to_string()))?;
            t.insert(key, value)
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    fn get(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let t = read_txn
            .open_table(table)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let value = t
            .get(key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn scan(&self, table: TableDefinition<&str, &[u8]>) -> Result<Vec<Vec<u8>>, StoreError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let t = read_txn
            .open_table(table)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let mut values = Vec::new();
        for entry in t.iter().map_err(|e| StoreError::Database(e.to_string()))? {
            let (_, value) = entry.map_err(|e| StoreError::Database(e.to_string()))?;
            values.push(value.value().to_vec());
        }
        Ok(values)
    }
}

impl std::fmt::Debug for RedbStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStorage").finish_non_exhaustive()
    }
}

/// Snapshot store over the `snapshots` table.
#[derive(Debug)]
pub struct RedbSnapshotStore {
    storage: RedbStorage,
    doc_name: Option<String>,
}

#[async_trait]
impl SnapshotStore for RedbSnapshotStore {
    async fn init(&mut self, doc_name: &str) -> Result<(), StoreError> {
        self.doc_name = Some(doc_name.to_string());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let name = self.doc_name.as_ref().ok_or(StoreError::NotInitialized)?;
        self.storage.get(SNAPSHOTS, name)
    }

    async fn save(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let name = self.doc_name.as_ref().ok_or(StoreError::NotInitialized)?;
        self.storage.put(SNAPSHOTS, name, bytes)
    }
}

/// Room directory over the `rooms` table.
///
/// `save_room` merges field-wise: fields set on the incoming record
/// overwrite, unset fields keep their stored values.
pub struct RedbRoomDirectory {
    storage: RedbStorage,
}

#[async_trait]
impl RoomDirectory for RedbRoomDirectory {
    type Error = StoreError;

    async fn save_room(&self, record: RoomRecord) -> Result<(), StoreError> {
        let merged = match self.get_room(&record.id).await? {
            Some(existing) => RoomRecord {
                id: record.id.clone(),
                name: record.name.or(existing.name),
                manifest: record.manifest.or(existing.manifest),
                last_seen: record.last_seen.or(existing.last_seen),
            },
            None => record.clone(),
        };
        let bytes = postcard::to_allocvec(&merged)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.storage.put(ROOMS, merged.id.as_str(), &bytes)
    }

    async fn get_room(&self, id: &RoomId) -> Result<Option<RoomRecord>, StoreError> {
        match self.storage.get(ROOMS, id.as_str())? {
            Some(bytes) => {
                let record = postcard::from_bytes(&bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn get_rooms(&self) -> Result<Vec<RoomRecord>, StoreError> {
        let mut rooms = Vec::new();
        for bytes in self.storage.scan(ROOMS)? {
            let record: RoomRecord = postcard::from_bytes(&bytes)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            rooms.push(record);
        }
        rooms.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(rooms)
    }

    async fn update_room_last_seen(&self, id: &RoomId) -> Result<(), StoreError> {
        let record = self
            .get_room(id)
            .await?
            .unwrap_or_else(|| RoomRecord::new(id.clone()));
        self.save_room(RoomRecord {
            last_seen: Some(chrono::Utc::now().timestamp_millis() as u64),
            ..record
        })
        .await
    }
}
