//! Transport contract
//!
//! The sync layer depends only on this surface: topic publish/subscribe
//! with subscriber introspection, an event stream, and protocol streams
//! dialed to specific peers. Any substrate satisfying it works; the
//! in-memory broker in [`crate::memory_transport`] backs the tests and
//! the iroh adapter backs production.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::error::{PublishError, TransportError};
use crate::ids::{PeerId, Topic};

/// Default timeout for dialing a protocol stream.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Events surfaced by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A datagram arrived on a subscribed topic.
    Message {
        topic: Topic,
        from: PeerId,
        data: Vec<u8>,
    },
    /// A new peer connection was established.
    PeerConnected(PeerId),
    /// A peer connection went away.
    PeerDisconnected(PeerId),
}

/// One live connection, for stats.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: PeerId,
    /// Transport label, e.g. `memory`, `quic`, `relay`.
    pub transport: &'static str,
}

/// A bidirectional, frame-oriented protocol stream.
///
/// Frames are whole messages; the substrate handles length delimiting.
/// Dropping either half closes the stream for the remote side.
#[derive(Debug)]
pub struct ProtocolStream {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ProtocolStream {
    /// Create a connected pair of streams (used by in-process transports
    /// and by adapters pumping a real socket into frame channels).
    pub fn pair(buffer: usize) -> (ProtocolStream, ProtocolStream) {
        let (a_tx, b_rx) = mpsc::channel(buffer);
        let (b_tx, a_rx) = mpsc::channel(buffer);
        (
            ProtocolStream { tx: a_tx, rx: a_rx },
            ProtocolStream { tx: b_tx, rx: b_rx },
        )
    }

    /// Send one frame to the remote side.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::StreamClosed)
    }

    /// Receive the next frame; `None` once the remote side is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Split into an outbound sender and an inbound receiver.
    pub fn split(self) -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        (self.tx, self.rx)
    }
}

/// An inbound protocol stream, paired with the dialing peer.
#[derive(Debug)]
pub struct InboundStream {
    pub peer: PeerId,
    pub stream: ProtocolStream,
}

/// Topic-based pubsub plus direct protocol streams.
#[async_trait]
pub trait RoomTransport: Send + Sync + 'static {
    /// Our own peer id on this transport.
    fn local_peer(&self) -> PeerId;

    /// Join a topic; messages start flowing on the event stream.
    async fn subscribe(&self, topic: &Topic) -> Result<(), TransportError>;

    /// Leave a topic.
    async fn unsubscribe(&self, topic: &Topic) -> Result<(), TransportError>;

    /// Publish a datagram to everyone else subscribed to the topic.
    async fn publish(&self, topic: &Topic, data: Vec<u8>) -> Result<(), PublishError>;

    /// Peers currently known to subscribe to the topic (excluding us).
    fn subscribers(&self, topic: &Topic) -> Vec<PeerId>;

    /// All peers currently reachable.
    fn peers(&self) -> Vec<PeerId>;

    /// All live connections, for stats.
    fn connections(&self) -> Vec<ConnectionInfo>;

    /// Subscribe to transport events. Every call returns an independent
    /// receiver on the same broadcast stream.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Register a handler for inbound streams on a protocol id.
    /// Replaces any previous handler for the same protocol.
    fn handle_protocol(&self, protocol: &str, handler: mpsc::Sender<InboundStream>);

    /// Open a protocol stream to a peer, bounded by `timeout`.
    async fn dial(
        &self,
        peer: &PeerId,
        protocol: &str,
        timeout: Duration,
    ) -> Result<ProtocolStream, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_pair_is_connected() {
        let (a, mut b) = ProtocolStream::pair(8);
        a.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), vec![1, 2, 3]);

        drop(a);
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_close_errors() {
        let (a, b) = ProtocolStream::pair(8);
        drop(b);
        assert!(a.send(vec![0]).await.is_err());
    }
}
