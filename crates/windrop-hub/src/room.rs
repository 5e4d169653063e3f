//! Per-room hub state and the gossip ↔ stream bridge
//!
//! The hub keeps one [`HubRoom`] per room it has heard of: the room's
//! document, the set of open sync streams, and a seen-set so a delta that
//! arrives twice (stream plus its own gossip echo) is applied once.
//!
//! Bridge semantics: a delta injected over gossip is re-emitted to every
//! stream; a delta injected over a stream is re-emitted to every *other*
//! stream and to gossip. The injecting path never receives an echo.
//! Updates the hub originates locally (storage load aside, it rarely
//! does) go to every stream and to gossip via the document observer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use windrop_core::{
    ControlMsg, InboundStream, PeerId, RoomId, RoomTransport, SeenSet, Topic, fresh_msg_id,
};
use windrop_state::{Origin, RoomDoc};
use windrop_store::{FileSnapshotStore, SnapshotStore};

use crate::error::HubError;
use crate::pinning::Pinner;

/// Buffer for each stream's outbound queue.
const STREAM_QUEUE: usize = 64;

/// One room as the hub sees it.
pub struct HubRoom {
    room_id: RoomId,
    topic: Topic,
    transport: Arc<dyn RoomTransport>,
    doc: Arc<Mutex<RoomDoc>>,
    streams: Arc<DashMap<PeerId, mpsc::Sender<Vec<u8>>>>,
    seen: Mutex<SeenSet>,
    bridge_tx: mpsc::UnboundedSender<Vec<u8>>,
    persist_tx: mpsc::UnboundedSender<()>,
    /// Held until `ensure_setup` spawns the persist pump with the store.
    persist_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    pinner: std::sync::Mutex<Option<Arc<Pinner>>>,
    setup_started: AtomicBool,
    broadcast_setup: AtomicBool,
    pinning_setup: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl HubRoom {
    fn new(room_id: RoomId, transport: Arc<dyn RoomTransport>) -> Result<Self, HubError> {
        let topic = room_id.topic();
        let doc = Arc::new(Mutex::new(RoomDoc::new()?));
        let streams: Arc<DashMap<PeerId, mpsc::Sender<Vec<u8>>>> = Arc::new(DashMap::new());

        let (bridge_tx, bridge_rx) = mpsc::unbounded_channel();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel::<()>();

        let room = Self {
            room_id: room_id.clone(),
            topic: topic.clone(),
            transport: Arc::clone(&transport),
            doc,
            streams: Arc::clone(&streams),
            seen: Mutex::new(SeenSet::new()),
            bridge_tx,
            persist_tx,
            persist_rx: std::sync::Mutex::new(Some(persist_rx)),
            pinner: std::sync::Mutex::new(None),
            setup_started: AtomicBool::new(false),
            broadcast_setup: AtomicBool::new(false),
            pinning_setup: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
        };

        room.tasks.lock().unwrap().push(tokio::spawn(bridge_pump(
            bridge_rx,
            room_id,
            topic,
            transport,
            streams,
        )));
        Ok(room)
    }

    /// One-time setup: load persisted state, install observers, subscribe.
    /// Safe to call from concurrent creators; registration is flag-guarded.
    async fn ensure_setup(
        &self,
        ydocs_dir: &Path,
        pinner: Option<&Arc<Pinner>>,
    ) -> Result<(), HubError> {
        if self.setup_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Persisted state first, before any observer can see it: the
        // storage origin must neither re-save nor re-broadcast.
        let mut store = FileSnapshotStore::new(ydocs_dir);
        store.init(self.room_id.as_str()).await?;
        match store.load().await {
            Ok(Some(bytes)) => {
                let mut doc = self.doc.lock().await;
                if let Err(e) = doc.apply_update(&bytes, Origin::Storage) {
                    warn!(room = %self.room_id, error = %e, "persisted room state did not apply");
                } else {
                    info!(room = %self.room_id, len = bytes.len(), "restored room from disk");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(room = %self.room_id, error = %e, "room state load failed"),
        }

        if let Some(persist_rx) = self.persist_rx.lock().unwrap().take() {
            self.tasks.lock().unwrap().push(tokio::spawn(persist_pump(
                persist_rx,
                self.room_id.clone(),
                Arc::clone(&self.doc),
                Arc::new(store) as Arc<dyn SnapshotStore>,
            )));
        }

        if !self.broadcast_setup.swap(true, Ordering::SeqCst) {
            let mut doc = self.doc.lock().await;

            let persist = self.persist_tx.clone();
            doc.observe_updates(Box::new(move |_, origin| {
                if !origin.is_storage() {
                    let _ = persist.send(());
                }
            }));

            let bridge = self.bridge_tx.clone();
            doc.observe_updates(Box::new(move |delta, origin| {
                if origin.hub_rebroadcasts() {
                    let _ = bridge.send(delta.to_vec());
                }
            }));
        }

        if let Some(pinner) = pinner {
            if !self.pinning_setup.swap(true, Ordering::SeqCst) {
                *self.pinner.lock().unwrap() = Some(Arc::clone(pinner));
                let observer_pinner = Arc::clone(pinner);
                let mut doc = self.doc.lock().await;
                doc.observe_manifest(Box::new(move |manifest| {
                    observer_pinner.observe_manifest(manifest);
                }));
                // Initial fire covers files already in the loaded state.
                match doc.manifest() {
                    Ok(manifest) => pinner.observe_manifest(&manifest),
                    Err(e) => warn!(room = %self.room_id, error = %e, "manifest read failed"),
                }
            }
        }

        self.transport.subscribe(&self.topic).await?;
        debug!(room = %self.room_id, "hub room ready");
        Ok(())
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub async fn manifest_len(&self) -> usize {
        self.doc
            .lock()
            .await
            .manifest()
            .map(|m| m.files.len())
            .unwrap_or(0)
    }

    pub async fn chat_len(&self) -> usize {
        self.doc
            .lock()
            .await
            .chat_messages()
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub async fn full_state(&self) -> Vec<u8> {
        self.doc.lock().await.encode_full_state()
    }

    /// Handle one decoded message that arrived over gossip.
    pub async fn handle_gossip(&self, from: &PeerId, data: &[u8]) {
        let msg = match ControlMsg::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(room = %self.room_id, from = %from, error = %e, "ignoring malformed gossip");
                return;
            }
        };
        if let Some(id) = msg.msg_id() {
            if !self.seen.lock().await.insert(id) {
                return;
            }
        }

        match &msg {
            ControlMsg::YUpdate { update, .. } => {
                if let Err(e) = self.doc.lock().await.apply_update(update, Origin::Gossip) {
                    warn!(room = %self.room_id, from = %from, error = %e, "gossip delta did not apply");
                    return;
                }
                // Gossip injected: every stream gets a copy, gossip does not.
                self.send_to_streams(&msg, None).await;
            }
            ControlMsg::SnapshotRequest { .. } => {
                let full = self.doc.lock().await.encode_full_state();
                let mut reply = ControlMsg::Snapshot {
                    room_id: self.room_id.clone(),
                    update: full,
                    msg_id: None,
                    ttl: None,
                };
                reply.ensure_msg_id();
                if let Some(id) = reply.msg_id() {
                    self.seen.lock().await.insert(id);
                }
                self.publish_gossip(&reply).await;
            }
            ControlMsg::Snapshot { update, .. } => {
                if let Err(e) = self.doc.lock().await.apply_update(update, Origin::Gossip) {
                    warn!(room = %self.room_id, from = %from, error = %e, "gossip snapshot did not apply");
                }
            }
            ControlMsg::FileRequest { cids, .. } => {
                // A pin hint, not a correctness requirement: mirroring
                // hubs start fetching before the manifest update lands.
                let pinner = self.pinner.lock().unwrap().clone();
                if let Some(pinner) = pinner {
                    pinner.pin_cids(cids.clone());
                }
            }
            ControlMsg::JoinRoom { .. } | ControlMsg::SyncFullState { .. } => {}
        }
    }

    /// Handle one frame that arrived on `peer`'s sync stream.
    pub async fn handle_stream_frame(&self, peer: &PeerId, frame: &[u8]) {
        let msg = match ControlMsg::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(room = %self.room_id, peer = %peer, error = %e, "ignoring malformed stream frame");
                return;
            }
        };
        let ControlMsg::YUpdate { ref update, .. } = msg else {
            return;
        };
        if let Some(id) = msg.msg_id() {
            if !self.seen.lock().await.insert(id) {
                return;
            }
        }
        if let Err(e) = self.doc.lock().await.apply_update(update, Origin::Stream) {
            warn!(room = %self.room_id, peer = %peer, error = %e, "stream delta did not apply");
            return;
        }
        // Stream injected: every other stream plus gossip; no echo back.
        self.send_to_streams(&msg, Some(peer)).await;
        self.publish_gossip(&msg).await;
    }

    /// Attach a peer's outbound stream queue and send the full state.
    ///
    /// The queue is registered before the full state is computed, so a
    /// delta that lands in between still reaches the peer (it queues
    /// behind the full state and merges idempotently).
    pub async fn attach_stream(&self, peer: PeerId, tx: mpsc::Sender<Vec<u8>>) {
        self.streams.insert(peer.clone(), tx.clone());
        let full = self.doc.lock().await.encode_full_state();
        let hello = ControlMsg::SyncFullState {
            room_id: self.room_id.clone(),
            update: full,
        };
        match hello.encode() {
            Ok(frame) => {
                if tx.send(frame).await.is_err() {
                    debug!(room = %self.room_id, peer = %peer, "stream died before full state");
                    self.streams.remove(&peer);
                    return;
                }
            }
            Err(e) => {
                warn!(room = %self.room_id, error = %e, "full state encode failed");
                self.streams.remove(&peer);
                return;
            }
        }
        info!(room = %self.room_id, peer = %peer, streams = self.streams.len(), "sync stream attached");
    }

    /// Drop a peer's stream queue (stream handler cleanup path).
    pub fn detach_stream(&self, peer: &PeerId) {
        if self.streams.remove(peer).is_some() {
            info!(room = %self.room_id, peer = %peer, streams = self.streams.len(), "sync stream detached");
        }
    }

    async fn send_to_streams(&self, msg: &ControlMsg, skip: Option<&PeerId>) {
        let frame = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(room = %self.room_id, error = %e, "stream fan-out encode failed");
                return;
            }
        };
        let targets: Vec<(PeerId, mpsc::Sender<Vec<u8>>)> = self
            .streams
            .iter()
            .filter(|entry| skip != Some(entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (peer, tx) in targets {
            if tx.send(frame.clone()).await.is_err() {
                debug!(room = %self.room_id, peer = %peer, "dropping dead stream queue");
                self.streams.remove(&peer);
            }
        }
    }

    async fn publish_gossip(&self, msg: &ControlMsg) {
        let data = match msg.encode() {
            Ok(data) => data,
            Err(e) => {
                warn!(room = %self.room_id, error = %e, "gossip encode failed");
                return;
            }
        };
        match self.transport.publish(&self.topic, data).await {
            Ok(()) => {}
            // Expected while no peer is on the mesh yet.
            Err(e) if e.is_no_subscribers() => {}
            Err(e) => debug!(room = %self.room_id, error = %e, "gossip publish failed"),
        }
    }

    fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for HubRoom {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for HubRoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubRoom")
            .field("room_id", &self.room_id)
            .field("streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}

/// Registry of all rooms this hub serves.
pub struct RoomRegistry {
    transport: Arc<dyn RoomTransport>,
    ydocs_dir: PathBuf,
    pinner: Option<Arc<Pinner>>,
    rooms: DashMap<RoomId, Arc<HubRoom>>,
}

impl RoomRegistry {
    pub fn new(
        transport: Arc<dyn RoomTransport>,
        data_dir: impl AsRef<Path>,
        pinner: Option<Arc<Pinner>>,
    ) -> Self {
        Self {
            transport,
            ydocs_dir: data_dir.as_ref().join("ydocs"),
            pinner,
            rooms: DashMap::new(),
        }
    }

    /// Get an existing room or create and set it up. Hubs are cold for
    /// rooms they have not heard of; any gossip message or stream join
    /// warms one up.
    pub async fn get_or_create(&self, room_id: &RoomId) -> Result<Arc<HubRoom>, HubError> {
        let room = match self.rooms.get(room_id) {
            Some(room) => Arc::clone(room.value()),
            None => {
                let fresh = Arc::new(HubRoom::new(room_id.clone(), Arc::clone(&self.transport))?);
                match self.rooms.entry(room_id.clone()) {
                    dashmap::mapref::entry::Entry::Occupied(existing) => {
                        Arc::clone(existing.get())
                    }
                    dashmap::mapref::entry::Entry::Vacant(slot) => {
                        slot.insert(Arc::clone(&fresh));
                        fresh
                    }
                }
            }
        };
        room.ensure_setup(&self.ydocs_dir, self.pinner.as_ref())
            .await?;
        Ok(room)
    }

    pub fn get(&self, room_id: &RoomId) -> Option<Arc<HubRoom>> {
        self.rooms.get(room_id).map(|r| Arc::clone(r.value()))
    }

    pub fn pinner(&self) -> Option<&Arc<Pinner>> {
        self.pinner.as_ref()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn rooms(&self) -> Vec<Arc<HubRoom>> {
        self.rooms.iter().map(|r| Arc::clone(r.value())).collect()
    }
}

/// Serve one inbound `/y-sync/1.0.0` stream until it closes.
///
/// The cleanup at the bottom runs on every exit path: the peer's queue
/// leaves the room's stream set and the writer task stops.
pub async fn serve_stream(registry: Arc<RoomRegistry>, inbound: InboundStream) {
    let peer = inbound.peer;
    let mut stream = inbound.stream;

    let Some(first) = stream.recv().await else {
        return;
    };
    let room_id = match ControlMsg::decode(&first) {
        Ok(ControlMsg::JoinRoom { room_id }) => room_id,
        Ok(other) => {
            warn!(peer = %peer, tag = other.tag(), "stream opened without JOIN_ROOM");
            return;
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "undecodable stream opener");
            return;
        }
    };

    let room = match registry.get_or_create(&room_id).await {
        Ok(room) => room,
        Err(e) => {
            warn!(room = %room_id, peer = %peer, error = %e, "room setup failed for stream");
            return;
        }
    };

    let (stream_tx, mut stream_rx) = stream.split();
    let (queue_tx, mut queue_rx) = mpsc::channel::<Vec<u8>>(STREAM_QUEUE);
    let writer = tokio::spawn(async move {
        while let Some(frame) = queue_rx.recv().await {
            if stream_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    room.attach_stream(peer.clone(), queue_tx).await;

    while let Some(frame) = stream_rx.recv().await {
        room.handle_stream_frame(&peer, &frame).await;
    }

    room.detach_stream(&peer);
    writer.abort();
}

/// Hub-local updates (anything the gossip and stream handlers did not
/// inject themselves) fan out to every stream and to gossip.
async fn bridge_pump(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    room_id: RoomId,
    topic: Topic,
    transport: Arc<dyn RoomTransport>,
    streams: Arc<DashMap<PeerId, mpsc::Sender<Vec<u8>>>>,
) {
    while let Some(delta) = rx.recv().await {
        let msg = ControlMsg::YUpdate {
            room_id: room_id.clone(),
            update: delta,
            msg_id: Some(fresh_msg_id()),
            ttl: Some(0),
        };
        let frame = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(room = %room_id, error = %e, "bridge encode failed");
                continue;
            }
        };
        let targets: Vec<mpsc::Sender<Vec<u8>>> =
            streams.iter().map(|e| e.value().clone()).collect();
        for tx in targets {
            let _ = tx.send(frame.clone()).await;
        }
        match transport.publish(&topic, frame).await {
            Ok(()) => {}
            Err(e) if e.is_no_subscribers() => {}
            Err(e) => debug!(room = %room_id, error = %e, "bridge gossip publish failed"),
        }
    }
}

/// Coalesced whole-state saves on every non-storage update.
async fn persist_pump(
    mut rx: mpsc::UnboundedReceiver<()>,
    room_id: RoomId,
    doc: Arc<Mutex<RoomDoc>>,
    store: Arc<dyn SnapshotStore>,
) {
    while rx.recv().await.is_some() {
        while rx.try_recv().is_ok() {}
        let snapshot = doc.lock().await.encode_full_state();
        if let Err(e) = store.save(&snapshot).await {
            warn!(room = %room_id, error = %e, "room snapshot save failed");
        }
    }
}
