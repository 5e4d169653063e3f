//! Control messages and their wire codec
//!
//! Every message on a room topic or a sync stream is a tagged record,
//! encoded with postcard. CRDT payloads travel as raw byte arrays. On
//! protocol streams, messages are framed with a u32-LE length prefix;
//! gossip carries them as whole datagrams.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::ids::{ContentId, PeerId, RoomId};

/// Largest frame a stream reader will accept.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default forwarding budget for sync-bearing messages.
pub const DEFAULT_SYNC_TTL: u8 = 1;

/// Control messages exchanged between peers and hubs.
///
/// `update` fields carry opaque CRDT bytes (an incremental delta or a full
/// state snapshot, depending on the tag). A frame that does not decode to
/// one of these variants is ignored by every handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMsg {
    /// First message on a hub sync stream, names the room to join.
    JoinRoom { room_id: RoomId },

    /// Hub's reply to `JoinRoom`: the room's full state.
    SyncFullState { room_id: RoomId, update: Vec<u8> },

    /// Incremental CRDT update.
    YUpdate {
        room_id: RoomId,
        update: Vec<u8>,
        msg_id: Option<String>,
        ttl: Option<u8>,
    },

    /// Ask any peer on the topic for a full-state snapshot.
    SnapshotRequest {
        room_id: RoomId,
        msg_id: String,
        ttl: Option<u8>,
    },

    /// Full-state snapshot, answering a `SnapshotRequest`.
    Snapshot {
        room_id: RoomId,
        update: Vec<u8>,
        msg_id: Option<String>,
        ttl: Option<u8>,
    },

    /// Hint that a peer wants the listed content fetched/pinned.
    FileRequest {
        room_id: RoomId,
        cids: Vec<ContentId>,
        from: PeerId,
    },
}

impl ControlMsg {
    /// The message tag, for logs and dedup keys.
    pub fn tag(&self) -> &'static str {
        match self {
            ControlMsg::JoinRoom { .. } => "JOIN_ROOM",
            ControlMsg::SyncFullState { .. } => "SYNC_FULL_STATE",
            ControlMsg::YUpdate { .. } => "Y_UPDATE",
            ControlMsg::SnapshotRequest { .. } => "SNAPSHOT_REQUEST",
            ControlMsg::Snapshot { .. } => "SNAPSHOT",
            ControlMsg::FileRequest { .. } => "FILE_REQUEST",
        }
    }

    pub fn room_id(&self) -> &RoomId {
        match self {
            ControlMsg::JoinRoom { room_id }
            | ControlMsg::SyncFullState { room_id, .. }
            | ControlMsg::YUpdate { room_id, .. }
            | ControlMsg::SnapshotRequest { room_id, .. }
            | ControlMsg::Snapshot { room_id, .. }
            | ControlMsg::FileRequest { room_id, .. } => room_id,
        }
    }

    /// The dedup id, if this message carries one.
    pub fn msg_id(&self) -> Option<&str> {
        match self {
            ControlMsg::YUpdate { msg_id, .. } | ControlMsg::Snapshot { msg_id, .. } => {
                msg_id.as_deref()
            }
            ControlMsg::SnapshotRequest { msg_id, .. } => Some(msg_id),
            _ => None,
        }
    }

    /// Remaining forwarding budget, with per-tag defaults applied.
    pub fn effective_ttl(&self) -> u8 {
        match self {
            ControlMsg::YUpdate { ttl, .. }
            | ControlMsg::SnapshotRequest { ttl, .. }
            | ControlMsg::Snapshot { ttl, .. } => ttl.unwrap_or(DEFAULT_SYNC_TTL),
            _ => 0,
        }
    }

    /// Fill in a fresh `msg_id` where one is expected but absent.
    ///
    /// Called once on the publish path so every copy of the message that
    /// reaches the network carries the same id.
    pub fn ensure_msg_id(&mut self) {
        match self {
            ControlMsg::YUpdate { msg_id, .. } | ControlMsg::Snapshot { msg_id, .. } => {
                if msg_id.is_none() {
                    *msg_id = Some(fresh_msg_id());
                }
            }
            _ => {}
        }
    }

    /// Copy of this message with the ttl decremented, for one-hop forwarding.
    pub fn forwarded(&self) -> Self {
        let mut msg = self.clone();
        let remaining = self.effective_ttl().saturating_sub(1);
        match &mut msg {
            ControlMsg::YUpdate { ttl, .. }
            | ControlMsg::SnapshotRequest { ttl, .. }
            | ControlMsg::Snapshot { ttl, .. } => *ttl = Some(remaining),
            _ => {}
        }
        msg
    }

    /// Encode for gossip publish (unframed).
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        postcard::to_allocvec(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decode a gossip datagram or a stream frame body.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        postcard::from_bytes(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }

    /// Encode with the u32-LE length prefix used on sync streams.
    pub fn encode_framed(&self) -> Result<Vec<u8>, CodecError> {
        let body = self.encode()?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(body.len()));
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}

/// Generate a message id: a v4 uuid suffixed with the current millis.
pub fn fresh_msg_id() -> String {
    format!(
        "{}-{}",
        uuid::Uuid::new_v4(),
        chrono::Utc::now().timestamp_millis()
    )
}

/// Split a length prefix off a stream buffer.
///
/// Returns `Ok(None)` while the buffer holds less than a full frame.
pub fn split_frame(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, CodecError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(len));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let body = buf[4..4 + len].to_vec();
    buf.drain(..4 + len);
    Ok(Some(body))
}
