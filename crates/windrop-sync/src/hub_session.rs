//! Opportunistic direct stream to a hub
//!
//! A peer that can reach a hub advertising `/y-sync/1.0.0` opens a stream,
//! sends `JoinRoom`, and receives the room's full state in return. After
//! the handshake either side sends `YUpdate`s at any time. Losing the
//! stream is never an error the user sees: the session detaches and the
//! room falls back to gossip until a reconnect opportunity shows up.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use windrop_core::{
    ControlMsg, DIAL_TIMEOUT, PeerId, RoomId, RoomTransport, SYNC_PROTOCOL, SeenSet, Topic,
};
use windrop_state::{Origin, RoomDoc, SyncStatusCell};

use crate::error::SyncError;

/// An established hub stream for one room.
pub struct HubLink {
    peer: PeerId,
    outbound: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
}

impl HubLink {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Queue a message for the hub. Errors mean the stream is gone; the
    /// caller falls back to gossip, which it was using anyway.
    pub async fn send(&self, msg: &ControlMsg) -> Result<(), SyncError> {
        let data = msg.encode()?;
        self.outbound
            .send(data)
            .await
            .map_err(|_| SyncError::Transport(windrop_core::TransportError::StreamClosed))
    }

    /// Clone of the outbound frame sender, for use without holding any
    /// lock on the link itself.
    pub fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.outbound.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_finished() || self.outbound.is_closed()
    }

    pub fn close(&self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for HubLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubLink").field("peer", &self.peer).finish()
    }
}

/// Shared pieces of room state the stream reader needs.
pub(crate) struct HubSessionContext {
    pub transport: Arc<dyn RoomTransport>,
    pub room_id: RoomId,
    pub topic: Topic,
    pub doc: Arc<Mutex<RoomDoc>>,
    pub status: Arc<SyncStatusCell>,
    pub seen: Arc<Mutex<SeenSet>>,
    /// Invoked once when the stream dies, so the owner clears its slot.
    pub on_closed: Box<dyn Fn() + Send + Sync>,
}

/// Dial a hub and run the `/y-sync/1.0.0` handshake.
///
/// The dial itself is bounded by [`DIAL_TIMEOUT`]; the first response is
/// not, since it depends on hub load.
pub(crate) async fn connect(peer: PeerId, ctx: HubSessionContext) -> Result<HubLink, SyncError> {
    let stream = ctx
        .transport
        .dial(&peer, SYNC_PROTOCOL, DIAL_TIMEOUT)
        .await?;

    let join = ControlMsg::JoinRoom {
        room_id: ctx.room_id.clone(),
    };
    stream.send(join.encode()?).await?;

    let (tx, mut rx) = stream.split();
    debug!(room = %ctx.room_id, hub = %peer, "hub stream open, awaiting full state");

    let reader_peer = peer.clone();
    let reader = tokio::spawn(async move {
        let mut first = true;
        while let Some(frame) = rx.recv().await {
            let msg = match ControlMsg::decode(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(hub = %reader_peer, error = %e, "malformed hub frame, skipping");
                    continue;
                }
            };
            if let Err(e) = handle_hub_message(&ctx, msg, first).await {
                warn!(hub = %reader_peer, error = %e, "hub message handling failed");
            }
            first = false;
        }
        debug!(hub = %reader_peer, room = %ctx.room_id, "hub stream closed, falling back to gossip");
        (ctx.on_closed)();
    });

    Ok(HubLink {
        peer,
        outbound: tx,
        reader,
    })
}

async fn handle_hub_message(
    ctx: &HubSessionContext,
    msg: ControlMsg,
    first: bool,
) -> Result<(), SyncError> {
    match msg {
        ControlMsg::SyncFullState { update, .. } => {
            ctx.doc
                .lock()
                .await
                .apply_update(&update, Origin::HubStream)?;
            ctx.status.mark_synced();
            debug!(room = %ctx.room_id, len = update.len(), "applied hub full state");
            Ok(())
        }
        ControlMsg::YUpdate { ref update, .. } => {
            if let Some(id) = msg.msg_id() {
                if !ctx.seen.lock().await.insert(id) {
                    return Ok(());
                }
            }
            ctx.doc
                .lock()
                .await
                .apply_update(update, Origin::HubStream)?;
            ctx.status.mark_synced();

            // One-hop relay onto gossip so stream-only updates still reach
            // mesh peers; their seen-sets drop the echo.
            if msg.effective_ttl() > 0 {
                let forwarded = msg.forwarded();
                let transport = Arc::clone(&ctx.transport);
                let topic = ctx.topic.clone();
                tokio::spawn(async move {
                    let jitter = rand::rng().random_range(50..170);
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                    if let Ok(data) = forwarded.encode() {
                        let _ = transport.publish(&topic, data).await;
                    }
                });
            }
            Ok(())
        }
        other => {
            if first {
                warn!(
                    room = %ctx.room_id,
                    tag = other.tag(),
                    "hub opened with unexpected message"
                );
            }
            Ok(())
        }
    }
}
