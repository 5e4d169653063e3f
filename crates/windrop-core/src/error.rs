//! Error types for the core layer

use thiserror::Error;

use crate::ids::Topic;

/// Errors from the control-message codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),
}

/// Errors from publishing on a topic.
///
/// `NoSubscribers` is distinguishable because callers treat it as an
/// expected condition: the outbox absorbs it, the hub ignores it.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("no peers subscribed to topic {0}")]
    NoSubscribers(Topic),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("publish failed: {0}")]
    Other(String),
}

impl PublishError {
    pub fn is_no_subscribers(&self) -> bool {
        matches!(self, PublishError::NoSubscribers(_))
    }
}

/// Errors from the transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not subscribed to topic {0}")]
    NotSubscribed(Topic),

    #[error("peer {0} is not reachable")]
    PeerUnreachable(String),

    #[error("protocol {0} is not handled by the remote peer")]
    ProtocolUnsupported(String),

    #[error("dial timed out after {0:?}")]
    DialTimeout(std::time::Duration),

    #[error("stream closed")]
    StreamClosed,

    #[error("transport error: {0}")]
    Other(String),
}

/// Errors from the content-exchange collaborator.
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("block {0} not found")]
    NotFound(String),

    #[error("pin failed: {0}")]
    PinFailed(String),

    #[error("invalid block data: {0}")]
    InvalidBlock(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subscribers_is_distinguishable() {
        let err = PublishError::NoSubscribers(Topic::new("wc/room"));
        assert!(err.is_no_subscribers());
        assert!(err.to_string().contains("wc/room"));

        let err = PublishError::Other("boom".to_string());
        assert!(!err.is_no_subscribers());
    }
}
