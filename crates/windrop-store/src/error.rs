//! Error types for snapshot storage

use thiserror::Error;

/// Errors from the snapshot store back-ends.
///
/// Nothing here is fatal to a room: load failures mean "no prior state",
/// save failures mean "the next save will try again". Callers log and
/// move on; the in-memory document stays authoritative.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store not initialized (init was never called)")]
    NotInitialized,

    #[error("storage I/O error: {0}")]
    Io(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}
