//! Peer-side sync engine
//!
//! One engine per transport endpoint. `join` hands out a [`RoomHandle`]
//! that owns the room's document, its snapshot-request ticker, the hub
//! session and the observer cleanup stack. Local mutations broadcast
//! incremental deltas to the hub stream (when open) and to gossip
//! (always); inbound control messages are deduplicated, applied, and
//! forwarded one hop while their ttl lasts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use windrop_core::{
    ChatMessage, ContentId, ControlMsg, FileEntry, Manifest, PeerId, RoomId, RoomTransport,
    SeenSet, Topic, TransportEvent, fresh_msg_id,
};
use windrop_state::{Origin, RoomDoc, SyncStatus, SyncStatusCell};
use windrop_store::SnapshotStore;

use crate::error::SyncError;
use crate::hub_session::{self, HubLink, HubSessionContext};
use crate::outbox::Outbox;

/// Window for the first snapshot request after join.
const INITIAL_REQUEST_DELAY_MS: std::ops::Range<u64> = 1_000..2_000;
/// Window between snapshot-request retries.
const RETRY_DELAY_MS: std::ops::Range<u64> = 2_000..5_000;
/// After this long, publish requests even when the subscriber count
/// reads zero; a wrong signal must not starve sync forever.
const MESH_TIMEOUT: Duration = Duration::from_secs(10);
/// Jitter window before re-publishing a forwarded message.
const FORWARD_JITTER_MS: std::ops::Range<u64> = 50..170;

/// Handler for decoded manifest updates.
pub type ManifestHandler = Box<dyn Fn(Manifest) + Send + Sync>;
/// Handler for files newly added to the manifest.
pub type FilesHandler = Box<dyn Fn(Vec<FileEntry>) + Send + Sync>;
/// Handler for non-CRDT control messages (`FILE_REQUEST`).
pub type ControlHandler = Box<dyn Fn(&ControlMsg) + Send + Sync>;

type Cleanup = Box<dyn FnOnce(&mut RoomDoc) + Send>;

/// Options for [`SyncEngine::join`].
///
/// The callbacks run synchronously inside the document update path; they
/// must not call back into the room handle. Hand the data to a task if
/// more work is needed.
#[derive(Default)]
pub struct JoinOptions {
    /// Peers believed to advertise the hub sync protocol.
    pub hub_peers: Vec<PeerId>,
    /// Local persistence for this room, if any. Only the first join's
    /// store is used; rejoins keep it.
    pub store: Option<Box<dyn SnapshotStore>>,
    /// Fires with the decoded manifest on every manifest change.
    pub on_manifest_update: Option<ManifestHandler>,
    /// Fires with files whose cids were not previously in the manifest.
    pub on_new_files: Option<FilesHandler>,
}

impl JoinOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hub_peers(mut self, peers: Vec<PeerId>) -> Self {
        self.hub_peers = peers;
        self
    }

    pub fn with_store(mut self, store: Box<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn on_manifest_update(mut self, handler: ManifestHandler) -> Self {
        self.on_manifest_update = Some(handler);
        self
    }

    pub fn on_new_files(mut self, handler: FilesHandler) -> Self {
        self.on_new_files = Some(handler);
        self
    }
}

/// The sync engine for one transport endpoint.
pub struct SyncEngine {
    transport: Arc<dyn RoomTransport>,
    outbox: Arc<Outbox>,
    rooms: Arc<DashMap<RoomId, Arc<RoomHandle>>>,
    event_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Create an engine and start dispatching transport events.
    pub fn new(transport: Arc<dyn RoomTransport>) -> Arc<Self> {
        let outbox = Outbox::new(Arc::clone(&transport));
        let rooms: Arc<DashMap<RoomId, Arc<RoomHandle>>> = Arc::new(DashMap::new());

        let engine = Arc::new(Self {
            transport: Arc::clone(&transport),
            outbox: Arc::clone(&outbox),
            rooms: Arc::clone(&rooms),
            event_task: std::sync::Mutex::new(None),
        });

        let events = transport.events();
        let task = tokio::spawn(event_loop(events, rooms, outbox));
        *engine.event_task.lock().unwrap() = Some(task);
        engine
    }

    /// Join a room, idempotently.
    ///
    /// On re-entry the room's observers are torn down and reinstalled and
    /// the ticker restarts; document state is kept.
    pub async fn join(
        &self,
        room_id: RoomId,
        options: JoinOptions,
    ) -> Result<Arc<RoomHandle>, SyncError> {
        if let Some(existing) = self.rooms.get(&room_id).map(|r| Arc::clone(r.value())) {
            existing.rejoin(options).await?;
            return Ok(existing);
        }

        let room = RoomHandle::create(
            room_id.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.outbox),
            options,
        )
        .await?;
        self.rooms.insert(room_id, Arc::clone(&room));
        Ok(room)
    }

    /// Look up a joined room.
    pub fn room(&self, room_id: &RoomId) -> Option<Arc<RoomHandle>> {
        self.rooms.get(room_id).map(|r| Arc::clone(r.value()))
    }

    /// Tear a room down. Persistence remains.
    pub async fn destroy(&self, room_id: &RoomId) -> Result<(), SyncError> {
        if let Some((_, room)) = self.rooms.remove(room_id) {
            room.destroy().await;
        }
        Ok(())
    }

    /// Stop the engine: destroy every room and the event loop.
    pub async fn shutdown(&self) {
        let ids: Vec<RoomId> = self.rooms.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            let _ = self.destroy(&id).await;
        }
        if let Some(task) = self.event_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

async fn event_loop(
    mut events: broadcast::Receiver<TransportEvent>,
    rooms: Arc<DashMap<RoomId, Arc<RoomHandle>>>,
    outbox: Arc<Outbox>,
) {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Message { topic, from, data }) => {
                let Some(room_id) = topic.room_id() else {
                    continue;
                };
                let Some(room) = rooms.get(&room_id).map(|r| Arc::clone(r.value())) else {
                    continue;
                };
                room.handle_inbound(&from, &data).await;
            }
            Ok(TransportEvent::PeerConnected(peer)) => {
                outbox.notify_peer_connected().await;
                for room in rooms.iter() {
                    Arc::clone(room.value()).maybe_connect_hub(Some(peer.clone()));
                }
            }
            Ok(TransportEvent::PeerDisconnected(_)) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "transport event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Handle to one joined room.
pub struct RoomHandle {
    room_id: RoomId,
    topic: Topic,
    local_peer: PeerId,
    transport: Arc<dyn RoomTransport>,
    outbox: Arc<Outbox>,
    doc: Arc<Mutex<RoomDoc>>,
    status: Arc<SyncStatusCell>,
    seen: Arc<Mutex<SeenSet>>,
    store: Arc<std::sync::Mutex<Option<Arc<dyn SnapshotStore>>>>,
    control_handlers: Arc<std::sync::Mutex<Vec<ControlHandler>>>,
    cleanups: Mutex<Vec<Cleanup>>,
    hub_link: Arc<std::sync::Mutex<Option<HubLink>>>,
    hub_candidates: std::sync::Mutex<Vec<PeerId>>,
    hub_connecting: AtomicBool,
    broadcast_tx: mpsc::UnboundedSender<Vec<u8>>,
    persist_tx: mpsc::UnboundedSender<()>,
    ticker: std::sync::Mutex<Option<JoinHandle<()>>>,
    pumps: std::sync::Mutex<Vec<JoinHandle<()>>>,
    joined_at: std::sync::Mutex<Instant>,
    destroyed: AtomicBool,
}

impl RoomHandle {
    async fn create(
        room_id: RoomId,
        transport: Arc<dyn RoomTransport>,
        outbox: Arc<Outbox>,
        mut options: JoinOptions,
    ) -> Result<Arc<Self>, SyncError> {
        let topic = room_id.topic();
        let local_peer = transport.local_peer();
        let doc = Arc::new(Mutex::new(RoomDoc::new()?));
        let status = Arc::new(SyncStatusCell::new());
        let seen = Arc::new(Mutex::new(SeenSet::new()));
        let hub_link: Arc<std::sync::Mutex<Option<HubLink>>> =
            Arc::new(std::sync::Mutex::new(None));

        // Load prior state before anything is observing; the storage
        // origin keeps it from being rebroadcast or re-saved.
        let store_slot: Arc<std::sync::Mutex<Option<Arc<dyn SnapshotStore>>>> =
            Arc::new(std::sync::Mutex::new(None));
        if let Some(mut store) = options.store.take() {
            store.init(room_id.as_str()).await?;
            match store.load().await {
                Ok(Some(bytes)) => {
                    if let Err(e) = doc.lock().await.apply_update(&bytes, Origin::Storage) {
                        warn!(room = %room_id, error = %e, "persisted state did not apply, starting fresh");
                    } else {
                        debug!(room = %room_id, len = bytes.len(), "loaded persisted room state");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(room = %room_id, error = %e, "persistence load failed"),
            }
            *store_slot.lock().unwrap() = Some(Arc::from(store));
        }
        status.mark_syncing();

        transport.subscribe(&topic).await?;

        // Broadcast pump: local deltas out to the hub stream and gossip.
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
        // Persist pump: coalesced full-state saves.
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();

        let mut pumps = Vec::new();
        pumps.push(tokio::spawn(broadcast_pump(
            broadcast_rx,
            room_id.clone(),
            topic.clone(),
            Arc::clone(&transport),
            Arc::clone(&outbox),
            Arc::clone(&seen),
            Arc::clone(&hub_link),
        )));
        pumps.push(tokio::spawn(persist_pump(
            persist_rx,
            room_id.clone(),
            Arc::clone(&doc),
            Arc::clone(&store_slot),
        )));

        let room = Arc::new(Self {
            room_id,
            topic,
            local_peer,
            transport,
            outbox,
            doc,
            status,
            seen,
            store: store_slot,
            control_handlers: Arc::new(std::sync::Mutex::new(Vec::new())),
            cleanups: Mutex::new(Vec::new()),
            hub_link,
            hub_candidates: std::sync::Mutex::new(options.hub_peers.clone()),
            hub_connecting: AtomicBool::new(false),
            broadcast_tx,
            persist_tx,
            ticker: std::sync::Mutex::new(None),
            pumps: std::sync::Mutex::new(pumps),
            joined_at: std::sync::Mutex::new(Instant::now()),
            destroyed: AtomicBool::new(false),
        });

        room.install_observers(options.on_manifest_update, options.on_new_files)
            .await;
        room.start_ticker();
        Arc::clone(&room).maybe_connect_hub(None);
        Ok(room)
    }

    /// Idempotent re-entry: tear down every observer registered by the
    /// previous join, then reinstall. Document state is untouched.
    async fn rejoin(self: &Arc<Self>, options: JoinOptions) -> Result<(), SyncError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SyncError::RoomDestroyed);
        }

        {
            let mut cleanups = self.cleanups.lock().await;
            let mut doc = self.doc.lock().await;
            for cleanup in cleanups.drain(..) {
                cleanup(&mut doc);
            }
        }

        if !options.hub_peers.is_empty() {
            *self.hub_candidates.lock().unwrap() = options.hub_peers.clone();
        }
        *self.joined_at.lock().unwrap() = Instant::now();
        self.status.reset_for_rejoin();

        self.install_observers(options.on_manifest_update, options.on_new_files)
            .await;
        self.start_ticker();
        Arc::clone(self).maybe_connect_hub(None);
        Ok(())
    }

    async fn install_observers(
        &self,
        on_manifest_update: Option<ManifestHandler>,
        on_new_files: Option<FilesHandler>,
    ) {
        let mut cleanups = self.cleanups.lock().await;
        let mut doc = self.doc.lock().await;

        // Local deltas feed the broadcast pump.
        let tx = self.broadcast_tx.clone();
        let token = doc.observe_updates(Box::new(move |delta, origin| {
            if origin.is_local() {
                let _ = tx.send(delta.to_vec());
            }
        }));
        cleanups.push(Box::new(move |doc: &mut RoomDoc| doc.unobserve(token)));

        // Every non-storage update schedules a snapshot save.
        if self.store.lock().unwrap().is_some() {
            let tx = self.persist_tx.clone();
            let token = doc.observe_updates(Box::new(move |_, origin| {
                if !origin.is_storage() {
                    let _ = tx.send(());
                }
            }));
            cleanups.push(Box::new(move |doc: &mut RoomDoc| doc.unobserve(token)));
        }

        if let Some(handler) = on_manifest_update {
            let handler = Arc::new(handler);
            let observer = Arc::clone(&handler);
            let token = doc.observe_manifest(Box::new(move |manifest| observer(manifest.clone())));
            cleanups.push(Box::new(move |doc: &mut RoomDoc| doc.unobserve(token)));
            // Initial fire with the state at install time, so callers see
            // the starting point before the first change.
            match doc.manifest() {
                Ok(manifest) => handler(manifest),
                Err(e) => warn!(room = %self.room_id, error = %e, "manifest read failed"),
            }
        }

        if let Some(handler) = on_new_files {
            let known: std::sync::Mutex<std::collections::HashSet<ContentId>> =
                std::sync::Mutex::new(
                    doc.manifest()
                        .map(|m| m.cids().cloned().collect())
                        .unwrap_or_default(),
                );
            let token = doc.observe_manifest(Box::new(move |manifest| {
                let mut known = known.lock().unwrap();
                let added: Vec<FileEntry> = manifest
                    .files
                    .iter()
                    .filter(|f| !known.contains(&f.cid))
                    .cloned()
                    .collect();
                for file in &added {
                    known.insert(file.cid.clone());
                }
                if !added.is_empty() {
                    handler(added);
                }
            }));
            cleanups.push(Box::new(move |doc: &mut RoomDoc| doc.unobserve(token)));
        }
    }

    // ============================================================
    // Public surface
    // ============================================================

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn status(&self) -> SyncStatus {
        self.status.get()
    }

    pub fn watch_status(&self) -> tokio::sync::watch::Receiver<SyncStatus> {
        self.status.watch()
    }

    /// Register a handler for non-CRDT control messages (`FILE_REQUEST`).
    pub fn subscribe(&self, handler: ControlHandler) {
        self.control_handlers.lock().unwrap().push(handler);
    }

    /// Append a chat message; the resulting delta broadcasts.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<ChatMessage, SyncError> {
        self.ensure_alive()?;
        let message = ChatMessage::now(text, self.local_peer.clone());
        self.doc.lock().await.append_chat(&message)?;
        Ok(message)
    }

    /// Replace the manifest; the resulting delta broadcasts.
    pub async fn set_manifest(&self, manifest: &Manifest) -> Result<(), SyncError> {
        self.ensure_alive()?;
        self.doc.lock().await.set_manifest(manifest)?;
        Ok(())
    }

    pub async fn manifest(&self) -> Result<Manifest, SyncError> {
        Ok(self.doc.lock().await.manifest()?)
    }

    pub async fn chat_messages(&self) -> Result<Vec<ChatMessage>, SyncError> {
        Ok(self.doc.lock().await.chat_messages()?)
    }

    /// Current document heads, for convergence checks.
    pub async fn heads(&self) -> Vec<windrop_state::ChangeHash> {
        self.doc.lock().await.heads()
    }

    /// Broadcast a hint that we want the listed content fetched. Purely
    /// an optimization signal; convergence never depends on it.
    pub async fn request_files(&self, cids: Vec<ContentId>) -> Result<(), SyncError> {
        self.ensure_alive()?;
        let msg = ControlMsg::FileRequest {
            room_id: self.room_id.clone(),
            cids,
            from: self.local_peer.clone(),
        };
        self.publish_control(msg).await;
        Ok(())
    }

    /// Publish a control message, falling back to the outbox while the
    /// topic has no subscribers.
    pub async fn publish_control(&self, mut msg: ControlMsg) {
        msg.ensure_msg_id();
        if let Some(id) = msg.msg_id() {
            self.seen.lock().await.insert(id);
        }
        publish_or_enqueue(&self.transport, &self.outbox, &self.topic, msg).await;
    }

    /// Clean teardown: stops the ticker and pumps, removes observers,
    /// closes the hub stream, unsubscribes and drops queued messages.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(ticker) = self.ticker.lock().unwrap().take() {
            ticker.abort();
        }
        for pump in self.pumps.lock().unwrap().drain(..) {
            pump.abort();
        }
        {
            let mut cleanups = self.cleanups.lock().await;
            let mut doc = self.doc.lock().await;
            for cleanup in cleanups.drain(..) {
                cleanup(&mut doc);
            }
        }
        if let Some(link) = self.hub_link.lock().unwrap().take() {
            link.close();
        }
        if let Err(e) = self.transport.unsubscribe(&self.topic).await {
            debug!(room = %self.room_id, error = %e, "unsubscribe on destroy failed");
        }
        self.outbox.drop_topic(&self.topic).await;
        debug!(room = %self.room_id, "room destroyed");
    }

    fn ensure_alive(&self) -> Result<(), SyncError> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(SyncError::RoomDestroyed)
        } else {
            Ok(())
        }
    }

    /// Number of observers currently registered on the document.
    pub async fn observer_count(&self) -> usize {
        self.doc.lock().await.observer_count()
    }

    /// Whether a hub stream is currently open.
    pub fn has_hub_stream(&self) -> bool {
        self.hub_link
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|link| !link.is_closed())
    }

    // ============================================================
    // Inbound dispatch
    // ============================================================

    async fn handle_inbound(self: &Arc<Self>, from: &PeerId, data: &[u8]) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let msg = match ControlMsg::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(room = %self.room_id, from = %from, error = %e, "ignoring malformed message");
                return;
            }
        };
        if msg.room_id() != &self.room_id {
            return;
        }
        if let Some(id) = msg.msg_id() {
            if !self.seen.lock().await.insert(id) {
                return;
            }
        }

        let forward = msg.effective_ttl() > 0;

        match &msg {
            ControlMsg::YUpdate { update, .. } => {
                if let Err(e) = self.doc.lock().await.apply_update(update, Origin::Network) {
                    warn!(room = %self.room_id, from = %from, error = %e, "delta did not apply");
                } else {
                    // Any applied delta means some peer is live: retrying
                    // snapshot requests would be noise.
                    self.status.mark_synced();
                }
            }
            ControlMsg::SnapshotRequest { .. } => {
                let full = self.doc.lock().await.encode_full_state();
                self.publish_control(ControlMsg::Snapshot {
                    room_id: self.room_id.clone(),
                    update: full,
                    msg_id: None,
                    ttl: None,
                })
                .await;
            }
            ControlMsg::Snapshot { update, .. } => {
                match self.doc.lock().await.apply_update(update, Origin::Network) {
                    Ok(()) => self.status.mark_synced(),
                    Err(e) => {
                        warn!(room = %self.room_id, from = %from, error = %e, "snapshot did not apply");
                    }
                }
                // Bidirectional sync: hand the responder our state so
                // both sides converge off one handshake.
                let full = self.doc.lock().await.encode_full_state();
                self.publish_control(ControlMsg::YUpdate {
                    room_id: self.room_id.clone(),
                    update: full,
                    msg_id: None,
                    ttl: None,
                })
                .await;
            }
            ControlMsg::FileRequest { .. } => {
                let handlers = self.control_handlers.lock().unwrap();
                for handler in handlers.iter() {
                    handler(&msg);
                }
            }
            // Stream-only tags have no business on gossip.
            ControlMsg::JoinRoom { .. } | ControlMsg::SyncFullState { .. } => return,
        }

        if forward {
            self.forward_one_hop(msg.forwarded());
        }
    }

    /// Re-publish a message once after random jitter. Receivers that
    /// already processed the original drop it on their seen-set.
    fn forward_one_hop(&self, msg: ControlMsg) {
        let transport = Arc::clone(&self.transport);
        let topic = self.topic.clone();
        tokio::spawn(async move {
            let jitter = rand::rng().random_range(FORWARD_JITTER_MS);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
            if let Ok(data) = msg.encode() {
                let _ = transport.publish(&topic, data).await;
            }
        });
    }

    // ============================================================
    // Snapshot-request ticker
    // ============================================================

    fn start_ticker(self: &Arc<Self>) {
        let mut slot = self.ticker.lock().unwrap();
        if let Some(old) = slot.take() {
            old.abort();
        }
        let room = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            room.run_ticker().await;
        }));
    }

    async fn run_ticker(self: Arc<Self>) {
        let initial = rand::rng().random_range(INITIAL_REQUEST_DELAY_MS);
        tokio::time::sleep(Duration::from_millis(initial)).await;

        let mut status_rx = self.status.watch();
        if self.status.is_synced() || self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.publish_snapshot_request().await;

        loop {
            let retry = rand::rng().random_range(RETRY_DELAY_MS);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(retry)) => {}
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            if self.status.is_synced() || self.destroyed.load(Ordering::SeqCst) {
                return;
            }
            // Hold off while the mesh is still forming; after the mesh
            // timeout, publish regardless of what the subscriber count
            // claims.
            let joined_elapsed = self.joined_at.lock().unwrap().elapsed();
            let skip = self.transport.subscribers(&self.topic).is_empty()
                && !self.transport.peers().is_empty()
                && joined_elapsed < MESH_TIMEOUT;
            if !skip {
                self.publish_snapshot_request().await;
            }
        }
    }

    async fn publish_snapshot_request(&self) {
        debug!(room = %self.room_id, "publishing snapshot request");
        self.publish_control(ControlMsg::SnapshotRequest {
            room_id: self.room_id.clone(),
            msg_id: fresh_msg_id(),
            ttl: None,
        })
        .await;
    }

    // ============================================================
    // Hub session management
    // ============================================================

    /// Try to open a hub stream if none is active. `just_connected`
    /// narrows the attempt to one peer on connect events.
    fn maybe_connect_hub(self: Arc<Self>, just_connected: Option<PeerId>) {
        if self.destroyed.load(Ordering::SeqCst) || self.has_hub_stream() {
            return;
        }
        let candidates: Vec<PeerId> = {
            let known = self.hub_candidates.lock().unwrap();
            match &just_connected {
                Some(peer) if known.contains(peer) => vec![peer.clone()],
                Some(_) => return,
                None => known.clone(),
            }
        };
        if candidates.is_empty() {
            return;
        }
        if self.hub_connecting.swap(true, Ordering::SeqCst) {
            return;
        }

        tokio::spawn(async move {
            for peer in candidates {
                if self.destroyed.load(Ordering::SeqCst) || self.has_hub_stream() {
                    break;
                }
                let weak = Arc::downgrade(&self);
                let ctx = HubSessionContext {
                    transport: Arc::clone(&self.transport),
                    room_id: self.room_id.clone(),
                    topic: self.topic.clone(),
                    doc: Arc::clone(&self.doc),
                    status: Arc::clone(&self.status),
                    seen: Arc::clone(&self.seen),
                    on_closed: Box::new(move || {
                        if let Some(room) = weak.upgrade() {
                            room.hub_link.lock().unwrap().take();
                        }
                    }),
                };
                match hub_session::connect(peer.clone(), ctx).await {
                    Ok(link) => {
                        debug!(room = %self.room_id, hub = %peer, "hub session established");
                        *self.hub_link.lock().unwrap() = Some(link);
                        break;
                    }
                    Err(e) => {
                        debug!(room = %self.room_id, hub = %peer, error = %e, "hub dial failed");
                    }
                }
            }
            self.hub_connecting.store(false, Ordering::SeqCst);
        });
    }
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle")
            .field("room_id", &self.room_id)
            .field("status", &self.status.get())
            .finish_non_exhaustive()
    }
}

/// Broadcast policy for local deltas: hub stream first when open, gossip
/// regardless. Both carry the same msg id so downstream dedup holds.
async fn broadcast_pump(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    room_id: RoomId,
    topic: Topic,
    transport: Arc<dyn RoomTransport>,
    outbox: Arc<Outbox>,
    seen: Arc<Mutex<SeenSet>>,
    hub_link: Arc<std::sync::Mutex<Option<HubLink>>>,
) {
    while let Some(delta) = rx.recv().await {
        let mut msg = ControlMsg::YUpdate {
            room_id: room_id.clone(),
            update: delta,
            msg_id: None,
            ttl: None,
        };
        msg.ensure_msg_id();
        if let Some(id) = msg.msg_id() {
            seen.lock().await.insert(id);
        }

        let link_send = {
            let guard = hub_link.lock().unwrap();
            guard.as_ref().map(|link| link.sender())
        };
        if let Some(sender) = link_send {
            match msg.encode() {
                Ok(data) => {
                    if sender.send(data).await.is_err() {
                        debug!(room = %room_id, "hub stream rejected delta, gossip only");
                    }
                }
                Err(e) => warn!(room = %room_id, error = %e, "delta encode failed"),
            }
        }

        publish_or_enqueue(&transport, &outbox, &topic, msg).await;
    }
}

/// Coalesced persistence: every wakeup writes the current full state.
async fn persist_pump(
    mut rx: mpsc::UnboundedReceiver<()>,
    room_id: RoomId,
    doc: Arc<Mutex<RoomDoc>>,
    store: Arc<std::sync::Mutex<Option<Arc<dyn SnapshotStore>>>>,
) {
    while rx.recv().await.is_some() {
        while rx.try_recv().is_ok() {}
        let Some(store) = store.lock().unwrap().clone() else {
            continue;
        };
        let snapshot = doc.lock().await.encode_full_state();
        if let Err(e) = store.save(&snapshot).await {
            // Never poisons the document; the next update tries again.
            warn!(room = %room_id, error = %e, "snapshot save failed");
        }
    }
}

async fn publish_or_enqueue(
    transport: &Arc<dyn RoomTransport>,
    outbox: &Arc<Outbox>,
    topic: &Topic,
    msg: ControlMsg,
) {
    if transport.subscribers(topic).is_empty() {
        outbox.enqueue(topic, msg).await;
        return;
    }
    let data = match msg.encode() {
        Ok(data) => data,
        Err(e) => {
            warn!(topic = %topic, error = %e, "message encode failed");
            return;
        }
    };
    if let Err(e) = transport.publish(topic, data).await {
        debug!(topic = %topic, error = %e, "publish failed, queueing");
        outbox.enqueue(topic, msg).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windrop_core::MemoryBroker;

    fn test_room() -> RoomId {
        RoomId::from("abcdef0123456789")
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let broker = MemoryBroker::new();
        let engine = SyncEngine::new(Arc::new(broker.endpoint("peer-a")));
        let room = engine.join(test_room(), JoinOptions::new()).await.unwrap();
        let again = engine.join(test_room(), JoinOptions::new()).await.unwrap();
        assert!(Arc::ptr_eq(&room, &again));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn observers_do_not_accumulate_across_rejoins() {
        let broker = MemoryBroker::new();
        let engine = SyncEngine::new(Arc::new(broker.endpoint("peer-a")));

        let mut count_after_first = 0;
        for i in 0..5 {
            let options = JoinOptions::new()
                .on_manifest_update(Box::new(|_| {}))
                .on_new_files(Box::new(|_| {}));
            let room = engine.join(test_room(), options).await.unwrap();
            let count = room.observer_count().await;
            if i == 0 {
                count_after_first = count;
            }
            assert_eq!(count, count_after_first, "rejoin {i} leaked observers");
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn local_mutations_survive_with_zero_peers() {
        let broker = MemoryBroker::new();
        let engine = SyncEngine::new(Arc::new(broker.endpoint("peer-a")));
        let room = engine.join(test_room(), JoinOptions::new()).await.unwrap();

        room.send_chat("alone in here").await.unwrap();
        let manifest = Manifest::new(
            vec![FileEntry::new("a.txt", Some(7), ContentId::from("bafy-a"))],
            Some(1),
        );
        room.set_manifest(&manifest).await.unwrap();

        assert_eq!(room.chat_messages().await.unwrap().len(), 1);
        assert_eq!(room.manifest().await.unwrap(), manifest);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn destroyed_room_rejects_mutations() {
        let broker = MemoryBroker::new();
        let engine = SyncEngine::new(Arc::new(broker.endpoint("peer-a")));
        let room = engine.join(test_room(), JoinOptions::new()).await.unwrap();
        engine.destroy(&test_room()).await.unwrap();

        assert!(matches!(
            room.send_chat("too late").await,
            Err(SyncError::RoomDestroyed)
        ));
        assert!(engine.room(&test_room()).is_none());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn file_request_reaches_control_handlers() {
        let broker = MemoryBroker::new();
        let engine_a = SyncEngine::new(Arc::new(broker.endpoint("peer-a")));
        let engine_b = SyncEngine::new(Arc::new(broker.endpoint("peer-b")));

        let _room_a = engine_a.join(test_room(), JoinOptions::new()).await.unwrap();
        let room_b = engine_b.join(test_room(), JoinOptions::new()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        room_b.subscribe(Box::new(move |msg| {
            if let ControlMsg::FileRequest { cids, .. } = msg {
                let _ = tx.send(cids.clone());
            }
        }));

        let room_a = engine_a.room(&test_room()).unwrap();
        room_a
            .request_files(vec![ContentId::from("bafy-wanted")])
            .await
            .unwrap();

        let cids = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("file request should arrive")
            .unwrap();
        assert_eq!(cids, vec![ContentId::from("bafy-wanted")]);

        engine_a.shutdown().await;
        engine_b.shutdown().await;
    }
}
