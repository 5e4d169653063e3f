//! Error types for the hub

use thiserror::Error;

/// Errors surfaced by the hub.
///
/// Only startup errors are fatal; everything in the steady-state loops is
/// caught at the handler boundary and logged.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("transport error: {0}")]
    Transport(#[from] windrop_core::TransportError),

    #[error("state error: {0}")]
    State(#[from] windrop_state::StateError),

    #[error("store error: {0}")]
    Store(#[from] windrop_store::StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] windrop_core::CodecError),

    #[error("startup failed: {0}")]
    Startup(String),
}
