//! # windrop-transport
//!
//! Production transport for windrop rooms over iroh: gossip topics carry
//! room control messages, QUIC bi-streams carry `/y-sync/1.0.0` hub
//! sessions, and topic neighbor events drive the subscriber counts the
//! engine's outbox and ticker key off.
//!
//! Topic ids are the BLAKE3 hash of the topic string, so `wc/<room>`
//! maps deterministically onto the 32-byte gossip topic space.

mod streams;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, Router};
use iroh::{Endpoint, EndpointId, SecretKey};
use iroh_gossip::api::{Event as GossipEvent, GossipSender};
use iroh_gossip::net::{GOSSIP_ALPN, Gossip};
use tokio::sync::{Mutex as TokioMutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use windrop_core::{
    ConnectionInfo, InboundStream, PeerId, ProtocolStream, PublishError, RoomTransport,
    SYNC_PROTOCOL, Topic, TransportError, TransportEvent,
};

use crate::streams::frame_stream;

const EVENT_BUFFER: usize = 256;

/// Configuration for [`IrohRoomTransport::bind`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Secret key; generated when absent.
    pub secret_key: Option<SecretKey>,
    /// UDP port to bind (0 picks one).
    pub port: u16,
    /// Whether to use iroh's relay infrastructure for NAT-bound peers.
    pub enable_relay: bool,
    /// Bootstrap endpoints handed to every topic subscription.
    pub bootstrap: Vec<EndpointId>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            port: 0,
            enable_relay: true,
            bootstrap: Vec::new(),
        }
    }
}

struct TopicState {
    sender: Arc<TokioMutex<GossipSender>>,
    neighbors: Arc<DashSet<EndpointId>>,
    pump: JoinHandle<()>,
}

/// iroh-backed implementation of [`RoomTransport`].
pub struct IrohRoomTransport {
    endpoint: Endpoint,
    gossip: Gossip,
    _router: Router,
    local: PeerId,
    bootstrap: Vec<EndpointId>,
    topics: DashMap<Topic, TopicState>,
    events: broadcast::Sender<TransportEvent>,
    protocols: Arc<DashMap<String, mpsc::Sender<InboundStream>>>,
}

impl IrohRoomTransport {
    /// Bind an endpoint, spawn gossip, and register the sync ALPN.
    pub async fn bind(config: TransportConfig) -> Result<Self, TransportError> {
        let secret_key = config.secret_key.unwrap_or_else(SecretKey::generate);

        let mut builder = Endpoint::builder(iroh::endpoint::presets::N0)
            .secret_key(secret_key)
            .alpns(vec![GOSSIP_ALPN.to_vec(), SYNC_PROTOCOL.as_bytes().to_vec()]);
        if config.port != 0 {
            builder = builder
                .bind_addr(std::net::SocketAddr::V4(std::net::SocketAddrV4::new(
                    std::net::Ipv4Addr::UNSPECIFIED,
                    config.port,
                )))
                .map_err(|e| TransportError::Other(format!("endpoint bind addr: {e}")))?;
        }
        let endpoint = builder
            .bind()
            .await
            .map_err(|e| TransportError::Other(format!("endpoint bind: {e}")))?;

        let gossip = Gossip::builder().spawn(endpoint.clone());
        let protocols: Arc<DashMap<String, mpsc::Sender<InboundStream>>> =
            Arc::new(DashMap::new());

        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .accept(
                SYNC_PROTOCOL.as_bytes(),
                SyncStreamHandler {
                    protocols: Arc::clone(&protocols),
                },
            )
            .spawn();

        let local = PeerId::new(endpoint.id().to_string());
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        info!(peer = %local, relay = config.enable_relay, "iroh transport bound");

        Ok(Self {
            endpoint,
            gossip,
            _router: router,
            local,
            bootstrap: config.bootstrap,
            topics: DashMap::new(),
            events,
            protocols,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn topic_id(topic: &Topic) -> iroh_gossip::proto::TopicId {
        iroh_gossip::proto::TopicId::from_bytes(*blake3::hash(topic.as_str().as_bytes()).as_bytes())
    }
}

#[async_trait]
impl RoomTransport for IrohRoomTransport {
    fn local_peer(&self) -> PeerId {
        self.local.clone()
    }

    async fn subscribe(&self, topic: &Topic) -> Result<(), TransportError> {
        if self.topics.contains_key(topic) {
            return Ok(());
        }

        let gossip_topic = self
            .gossip
            .subscribe(Self::topic_id(topic), self.bootstrap.clone())
            .await
            .map_err(|e| TransportError::Other(format!("gossip subscribe: {e}")))?;
        let (sender, mut receiver) = gossip_topic.split();

        let neighbors: Arc<DashSet<EndpointId>> = Arc::new(DashSet::new());
        let pump_neighbors = Arc::clone(&neighbors);
        let pump_events = self.events.clone();
        let pump_topic = topic.clone();

        let pump = tokio::spawn(async move {
            use n0_future::StreamExt;
            loop {
                match receiver.try_next().await {
                    Ok(Some(GossipEvent::Received(msg))) => {
                        let _ = pump_events.send(TransportEvent::Message {
                            topic: pump_topic.clone(),
                            from: PeerId::new(msg.delivered_from.to_string()),
                            data: msg.content.to_vec(),
                        });
                    }
                    Ok(Some(GossipEvent::NeighborUp(id))) => {
                        pump_neighbors.insert(id);
                        let _ = pump_events
                            .send(TransportEvent::PeerConnected(PeerId::new(id.to_string())));
                    }
                    Ok(Some(GossipEvent::NeighborDown(id))) => {
                        pump_neighbors.remove(&id);
                        let _ = pump_events
                            .send(TransportEvent::PeerDisconnected(PeerId::new(id.to_string())));
                    }
                    Ok(Some(GossipEvent::Lagged)) => {
                        warn!(topic = %pump_topic, "gossip receiver lagged");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(topic = %pump_topic, error = %e, "gossip receiver ended");
                        break;
                    }
                }
            }
        });

        self.topics.insert(
            topic.clone(),
            TopicState {
                sender: Arc::new(TokioMutex::new(sender)),
                neighbors,
                pump,
            },
        );
        debug!(topic = %topic, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), TransportError> {
        // Dropping the handles tears the gossip subscription down.
        if let Some((_, state)) = self.topics.remove(topic) {
            state.pump.abort();
        }
        Ok(())
    }

    async fn publish(&self, topic: &Topic, data: Vec<u8>) -> Result<(), PublishError> {
        let state = self
            .topics
            .get(topic)
            .ok_or_else(|| PublishError::TransportUnavailable(format!("not subscribed: {topic}")))?;

        // Gossip buffers quietly with an empty mesh; surface that as the
        // distinguishable no-subscribers error instead.
        if state.neighbors.is_empty() {
            return Err(PublishError::NoSubscribers(topic.clone()));
        }

        let sender = Arc::clone(&state.sender);
        drop(state);
        sender
            .lock()
            .await
            .broadcast(data.into())
            .await
            .map_err(|e| PublishError::Other(e.to_string()))
    }

    fn subscribers(&self, topic: &Topic) -> Vec<PeerId> {
        self.topics
            .get(topic)
            .map(|state| {
                state
                    .neighbors
                    .iter()
                    .map(|id| PeerId::new(id.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn peers(&self) -> Vec<PeerId> {
        let mut peers = std::collections::HashSet::new();
        for state in self.topics.iter() {
            for id in state.neighbors.iter() {
                peers.insert(PeerId::new(id.to_string()));
            }
        }
        peers.into_iter().collect()
    }

    fn connections(&self) -> Vec<ConnectionInfo> {
        self.peers()
            .into_iter()
            .map(|peer| ConnectionInfo {
                peer,
                transport: "iroh",
            })
            .collect()
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn handle_protocol(&self, protocol: &str, handler: mpsc::Sender<InboundStream>) {
        self.protocols.insert(protocol.to_string(), handler);
    }

    async fn dial(
        &self,
        peer: &PeerId,
        protocol: &str,
        timeout: Duration,
    ) -> Result<ProtocolStream, TransportError> {
        let endpoint_id: EndpointId = peer
            .as_str()
            .parse()
            .map_err(|_| TransportError::PeerUnreachable(peer.to_string()))?;

        let connection: Connection =
            tokio::time::timeout(timeout, self.endpoint.connect(endpoint_id, protocol.as_bytes()))
                .await
                .map_err(|_| TransportError::DialTimeout(timeout))?
                .map_err(|e| TransportError::Other(format!("connect: {e}")))?;

        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Other(format!("open stream: {e}")))?;
        Ok(frame_stream(send, recv))
    }
}

/// Dispatches accepted `/y-sync/1.0.0` connections to the registered
/// handler, one bi-stream per connection.
#[derive(Debug, Clone)]
struct SyncStreamHandler {
    protocols: Arc<DashMap<String, mpsc::Sender<InboundStream>>>,
}

impl iroh::protocol::ProtocolHandler for SyncStreamHandler {
    async fn accept(&self, connection: Connection) -> Result<(), AcceptError> {
        let peer = PeerId::new(connection.remote_id().to_string());
        let Some(handler) = self
            .protocols
            .get(SYNC_PROTOCOL)
            .map(|h| h.value().clone())
        else {
            debug!(peer = %peer, "no sync handler registered, dropping connection");
            return Ok(());
        };

        let (send, recv) = connection.accept_bi().await.map_err(|e| {
            AcceptError::from(std::io::Error::other(format!("accept stream: {e}")))
        })?;

        let stream = frame_stream(send, recv);
        handler
            .send(InboundStream { peer, stream })
            .await
            .map_err(|_| {
                AcceptError::from(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "stream handler channel closed",
                ))
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_ids_are_deterministic() {
        let a = IrohRoomTransport::topic_id(&Topic::new("wc/abcdef0123456789"));
        let b = IrohRoomTransport::topic_id(&Topic::new("wc/abcdef0123456789"));
        let c = IrohRoomTransport::topic_id(&Topic::new("wc/other-room-here"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
