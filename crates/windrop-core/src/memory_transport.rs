//! In-memory transport for testing
//!
//! A [`MemoryBroker`] connects any number of in-process endpoints. Topic
//! publishes fan out to every other subscriber, protocol dials hand a
//! paired [`ProtocolStream`] to the registered handler, and endpoints see
//! each other come and go through [`TransportEvent`]s. This is the pubsub
//! substitute the engine and hub tests run on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::trace;

use crate::error::{PublishError, TransportError};
use crate::ids::{PeerId, Topic};
use crate::transport::{
    ConnectionInfo, InboundStream, ProtocolStream, RoomTransport, TransportEvent,
};

const EVENT_BUFFER: usize = 256;
const STREAM_BUFFER: usize = 64;

struct Endpoint {
    events: broadcast::Sender<TransportEvent>,
    protocols: DashMap<String, mpsc::Sender<InboundStream>>,
}

struct BrokerInner {
    endpoints: DashMap<PeerId, Arc<Endpoint>>,
    /// topic -> subscribed peers
    subscriptions: DashMap<Topic, Vec<PeerId>>,
    /// Partitioned peers deliver nothing and count as disconnected.
    partitioned: Mutex<Vec<PeerId>>,
}

/// In-process message broker connecting [`MemoryTransport`] endpoints.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                endpoints: DashMap::new(),
                subscriptions: DashMap::new(),
                partitioned: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a new endpoint on the broker.
    ///
    /// Existing endpoints observe a `PeerConnected` event, and the new
    /// endpoint's event stream starts out empty.
    pub fn endpoint(&self, peer: impl Into<PeerId>) -> MemoryTransport {
        let peer = peer.into();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let endpoint = Arc::new(Endpoint {
            events,
            protocols: DashMap::new(),
        });
        self.inner.endpoints.insert(peer.clone(), endpoint.clone());

        for entry in self.inner.endpoints.iter() {
            if entry.key() != &peer {
                let _ = entry
                    .value()
                    .events
                    .send(TransportEvent::PeerConnected(peer.clone()));
            }
        }

        MemoryTransport {
            peer,
            endpoint,
            broker: self.inner.clone(),
        }
    }

    /// Drop an endpoint, as if the peer's process died.
    ///
    /// Subscriptions vanish and everyone else observes `PeerDisconnected`.
    pub async fn kill(&self, peer: &PeerId) {
        self.inner.endpoints.remove(peer);
        for mut entry in self.inner.subscriptions.iter_mut() {
            entry.value_mut().retain(|p| p != peer);
        }
        for entry in self.inner.endpoints.iter() {
            let _ = entry
                .value()
                .events
                .send(TransportEvent::PeerDisconnected(peer.clone()));
        }
    }

    /// Cut a peer off without tearing its endpoint down.
    pub async fn partition(&self, peer: &PeerId) {
        let mut partitioned = self.inner.partitioned.lock().await;
        if !partitioned.contains(peer) {
            partitioned.push(peer.clone());
        }
    }

    /// Heal a partition; everyone observes the peer connecting again.
    pub async fn heal(&self, peer: &PeerId) {
        self.inner.partitioned.lock().await.retain(|p| p != peer);
        for entry in self.inner.endpoints.iter() {
            if entry.key() != peer {
                let _ = entry
                    .value()
                    .events
                    .send(TransportEvent::PeerConnected(peer.clone()));
            }
        }
    }

    fn is_partitioned(&self, peer: &PeerId) -> bool {
        // try_lock is fine: contention only with partition/heal in tests.
        match self.inner.partitioned.try_lock() {
            Ok(guard) => guard.contains(peer),
            Err(_) => false,
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint on a [`MemoryBroker`].
pub struct MemoryTransport {
    peer: PeerId,
    endpoint: Arc<Endpoint>,
    broker: Arc<BrokerInner>,
}

impl MemoryTransport {
    fn broker(&self) -> MemoryBroker {
        MemoryBroker {
            inner: self.broker.clone(),
        }
    }
}

#[async_trait]
impl RoomTransport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.peer.clone()
    }

    async fn subscribe(&self, topic: &Topic) -> Result<(), TransportError> {
        let mut subs = self.broker.subscriptions.entry(topic.clone()).or_default();
        if !subs.contains(&self.peer) {
            subs.push(self.peer.clone());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), TransportError> {
        if let Some(mut subs) = self.broker.subscriptions.get_mut(topic) {
            subs.retain(|p| p != &self.peer);
        }
        Ok(())
    }

    async fn publish(&self, topic: &Topic, data: Vec<u8>) -> Result<(), PublishError> {
        let broker = self.broker();
        if broker.is_partitioned(&self.peer) {
            return Err(PublishError::NoSubscribers(topic.clone()));
        }

        let targets: Vec<PeerId> = self
            .broker
            .subscriptions
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .filter(|p| *p != &self.peer && !broker.is_partitioned(p))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if targets.is_empty() {
            return Err(PublishError::NoSubscribers(topic.clone()));
        }

        trace!(topic = %topic, from = %self.peer, targets = targets.len(), "memory publish");
        for target in targets {
            if let Some(endpoint) = self.broker.endpoints.get(&target) {
                let _ = endpoint.events.send(TransportEvent::Message {
                    topic: topic.clone(),
                    from: self.peer.clone(),
                    data: data.clone(),
                });
            }
        }
        Ok(())
    }

    fn subscribers(&self, topic: &Topic) -> Vec<PeerId> {
        let broker = self.broker();
        if broker.is_partitioned(&self.peer) {
            return Vec::new();
        }
        self.broker
            .subscriptions
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .filter(|p| *p != &self.peer && !broker.is_partitioned(p))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn peers(&self) -> Vec<PeerId> {
        let broker = self.broker();
        if broker.is_partitioned(&self.peer) {
            return Vec::new();
        }
        self.broker
            .endpoints
            .iter()
            .map(|e| e.key().clone())
            .filter(|p| p != &self.peer && !broker.is_partitioned(p))
            .collect()
    }

    fn connections(&self) -> Vec<ConnectionInfo> {
        self.peers()
            .into_iter()
            .map(|peer| ConnectionInfo {
                peer,
                transport: "memory",
            })
            .collect()
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.endpoint.events.subscribe()
    }

    fn handle_protocol(&self, protocol: &str, handler: mpsc::Sender<InboundStream>) {
        self.endpoint.protocols.insert(protocol.to_string(), handler);
    }

    async fn dial(
        &self,
        peer: &PeerId,
        protocol: &str,
        timeout: Duration,
    ) -> Result<ProtocolStream, TransportError> {
        let broker = self.broker();
        if broker.is_partitioned(&self.peer) || broker.is_partitioned(peer) {
            return Err(TransportError::PeerUnreachable(peer.to_string()));
        }

        let endpoint = self
            .broker
            .endpoints
            .get(peer)
            .ok_or_else(|| TransportError::PeerUnreachable(peer.to_string()))?
            .clone();
        let handler = endpoint
            .protocols
            .get(protocol)
            .ok_or_else(|| TransportError::ProtocolUnsupported(protocol.to_string()))?
            .clone();

        let (ours, theirs) = ProtocolStream::pair(STREAM_BUFFER);
        let inbound = InboundStream {
            peer: self.peer.clone(),
            stream: theirs,
        };
        tokio::time::timeout(timeout, handler.send(inbound))
            .await
            .map_err(|_| TransportError::DialTimeout(timeout))?
            .map_err(|_| TransportError::ProtocolUnsupported(protocol.to_string()))?;

        Ok(ours)
    }
}
