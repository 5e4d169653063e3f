//! Error types for room state

use thiserror::Error;

/// Errors from the room document.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("document operation failed: {0}")]
    Document(String),

    #[error("update could not be applied: {0}")]
    ApplyFailed(String),

    #[error("chat entry could not be decoded: {0}")]
    ChatDecode(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<automerge::AutomergeError> for StateError {
    fn from(e: automerge::AutomergeError) -> Self {
        StateError::Document(e.to_string())
    }
}
