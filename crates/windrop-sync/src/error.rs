//! Error types for the sync engine

use thiserror::Error;

/// Errors surfaced by the peer-side sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(#[from] windrop_core::TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] windrop_core::CodecError),

    #[error("state error: {0}")]
    State(#[from] windrop_state::StateError),

    #[error("store error: {0}")]
    Store(#[from] windrop_store::StoreError),

    #[error("room was destroyed")]
    RoomDestroyed,

    #[error("no hub completed the sync handshake")]
    HubUnavailable,
}
