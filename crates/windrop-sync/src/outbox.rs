//! Per-topic retry queue for outbound control messages
//!
//! When the gossip substrate has no subscribers yet (mesh still forming,
//! single peer in the room), publishes land here instead of failing. A
//! flush timer retries with exponential backoff; any new peer connection
//! nudges every queue so a formed mesh drains promptly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use windrop_core::{ControlMsg, RoomTransport, Topic};

/// Base delay before the first flush attempt.
const BASE_DELAY: Duration = Duration::from_millis(250);
/// Ceiling on the backoff delay.
const MAX_DELAY: Duration = Duration::from_millis(8_000);
/// Attempts counter saturates here (keeps the delay at the ceiling).
const MAX_ATTEMPTS: u8 = 8;
/// Bound on queued messages per topic; oldest are dropped beyond this.
const MAX_QUEUE_DEPTH: usize = 1024;

#[derive(Default)]
struct TopicQueue {
    queue: VecDeque<ControlMsg>,
    attempts: u8,
    timer: Option<JoinHandle<()>>,
}

impl TopicQueue {
    fn timer_armed(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// Outbox over one transport, shared by every room on the engine.
pub struct Outbox {
    transport: Arc<dyn RoomTransport>,
    topics: DashMap<Topic, Arc<Mutex<TopicQueue>>>,
}

impl Outbox {
    pub fn new(transport: Arc<dyn RoomTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            topics: DashMap::new(),
        })
    }

    /// Queue a message for the topic and make sure a flush is coming.
    pub async fn enqueue(self: &Arc<Self>, topic: &Topic, msg: ControlMsg) {
        let entry = self.entry(topic);
        let mut queue = entry.lock().await;
        if queue.queue.len() >= MAX_QUEUE_DEPTH {
            queue.queue.pop_front();
            warn!(topic = %topic, "outbox full, dropping oldest message");
        }
        queue.queue.push_back(msg);
        if !queue.timer_armed() {
            let delay = flush_delay(queue.attempts);
            queue.timer = Some(self.spawn_flush(topic.clone(), delay));
        }
    }

    /// Number of messages currently queued for a topic.
    pub async fn depth(&self, topic: &Topic) -> usize {
        match self.topics.get(topic) {
            Some(entry) => entry.lock().await.queue.len(),
            None => 0,
        }
    }

    /// A peer connected somewhere: reset backoff and nudge every queue.
    pub async fn notify_peer_connected(self: &Arc<Self>) {
        let topics: Vec<Topic> = self.topics.iter().map(|e| e.key().clone()).collect();
        for topic in topics {
            let entry = self.entry(&topic);
            let mut queue = entry.lock().await;
            if queue.queue.is_empty() {
                continue;
            }
            queue.attempts = 0;
            if let Some(timer) = queue.timer.take() {
                timer.abort();
            }
            queue.timer = Some(self.spawn_flush(topic.clone(), flush_delay(0)));
        }
    }

    /// Drop a topic's queue, cancelling its timer.
    pub async fn drop_topic(&self, topic: &Topic) {
        if let Some((_, entry)) = self.topics.remove(topic) {
            let mut queue = entry.lock().await;
            if let Some(timer) = queue.timer.take() {
                timer.abort();
            }
            if !queue.queue.is_empty() {
                warn!(
                    topic = %topic,
                    dropped = queue.queue.len(),
                    "dropping queued outbox messages"
                );
            }
        }
    }

    fn entry(&self, topic: &Topic) -> Arc<Mutex<TopicQueue>> {
        self.topics.entry(topic.clone()).or_default().clone()
    }

    fn spawn_flush(self: &Arc<Self>, topic: Topic, delay: Duration) -> JoinHandle<()> {
        let outbox = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            outbox.flush(&topic).await;
        })
    }

    async fn flush(self: &Arc<Self>, topic: &Topic) {
        let entry = self.entry(topic);
        let mut queue = entry.lock().await;
        queue.timer = None;

        if queue.queue.is_empty() {
            return;
        }

        // Still nobody listening: back off and try again.
        if self.transport.subscribers(topic).is_empty() {
            queue.attempts = (queue.attempts + 1).min(MAX_ATTEMPTS);
            let delay = flush_delay(queue.attempts);
            debug!(
                topic = %topic,
                attempts = queue.attempts,
                delay_ms = delay.as_millis() as u64,
                "outbox flush deferred, no subscribers"
            );
            queue.timer = Some(self.spawn_flush(topic.clone(), delay));
            return;
        }

        while let Some(msg) = queue.queue.pop_front() {
            let data = match msg.encode() {
                Ok(data) => data,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "dropping unencodable outbox message");
                    continue;
                }
            };
            if let Err(e) = self.transport.publish(topic, data).await {
                debug!(topic = %topic, error = %e, "outbox publish failed, requeueing");
                queue.queue.push_front(msg);
                let delay = flush_delay(queue.attempts);
                queue.timer = Some(self.spawn_flush(topic.clone(), delay));
                return;
            }
        }
        queue.attempts = 0;
        debug!(topic = %topic, "outbox drained");
    }
}

/// `min(250ms · 2^attempts, 8s)` plus up to 200 ms of jitter.
fn flush_delay(attempts: u8) -> Duration {
    let base = BASE_DELAY
        .checked_mul(1u32 << attempts.min(MAX_ATTEMPTS) as u32)
        .unwrap_or(MAX_DELAY)
        .min(MAX_DELAY);
    base + Duration::from_millis(rand::rng().random_range(0..200))
}

#[cfg(test)]
mod tests {
    use super::*;
    use windrop_core::{MemoryBroker, RoomId, TransportEvent};

    fn chat_like_msg(room: &RoomId, n: usize) -> ControlMsg {
        ControlMsg::YUpdate {
            room_id: room.clone(),
            update: vec![n as u8],
            msg_id: Some(format!("m-{n}")),
            ttl: Some(0),
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        assert!(flush_delay(0) >= BASE_DELAY);
        assert!(flush_delay(0) < BASE_DELAY + Duration::from_millis(200));
        assert!(flush_delay(3) >= Duration::from_millis(2_000));
        assert!(flush_delay(8) >= MAX_DELAY);
        assert!(flush_delay(8) < MAX_DELAY + Duration::from_millis(200));
    }

    #[tokio::test]
    async fn queue_drains_in_order_once_subscribed() {
        let broker = MemoryBroker::new();
        let sender = broker.endpoint("peer-send");
        let room = RoomId::from("room-outbox-order");
        let topic = room.topic();
        sender.subscribe(&topic).await.unwrap();

        let transport: Arc<dyn RoomTransport> = Arc::new(sender);
        let outbox = Outbox::new(Arc::clone(&transport));
        for n in 0..3 {
            outbox.enqueue(&topic, chat_like_msg(&room, n)).await;
        }
        assert_eq!(outbox.depth(&topic).await, 3);

        // Second peer subscribes; the nudge drains the queue.
        let receiver = broker.endpoint("peer-recv");
        receiver.subscribe(&topic).await.unwrap();
        let mut events = receiver.events();
        outbox.notify_peer_connected().await;

        let mut got = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(8), events.recv())
                .await
                .expect("queue must drain within the backoff window")
                .unwrap();
            if let TransportEvent::Message { data, .. } = event {
                got.push(ControlMsg::decode(&data).unwrap());
            }
        }
        let ids: Vec<_> = got.iter().map(|m| m.msg_id().unwrap().to_string()).collect();
        assert_eq!(ids, vec!["m-0", "m-1", "m-2"]);
        assert_eq!(outbox.depth(&topic).await, 0);
    }

    #[tokio::test]
    async fn queue_depth_is_bounded() {
        let broker = MemoryBroker::new();
        let transport: Arc<dyn RoomTransport> = Arc::new(broker.endpoint("peer-a"));
        let outbox = Outbox::new(Arc::clone(&transport));
        let room = RoomId::from("room-outbox-bound");
        let topic = room.topic();

        for n in 0..(MAX_QUEUE_DEPTH + 10) {
            outbox.enqueue(&topic, chat_like_msg(&room, n)).await;
        }
        assert_eq!(outbox.depth(&topic).await, MAX_QUEUE_DEPTH);
    }

    #[tokio::test]
    async fn drop_topic_discards_queue() {
        let broker = MemoryBroker::new();
        let transport: Arc<dyn RoomTransport> = Arc::new(broker.endpoint("peer-a"));
        let outbox = Outbox::new(Arc::clone(&transport));
        let room = RoomId::from("room-outbox-drop");
        let topic = room.topic();

        outbox.enqueue(&topic, chat_like_msg(&room, 0)).await;
        outbox.drop_topic(&topic).await;
        assert_eq!(outbox.depth(&topic).await, 0);
    }
}
