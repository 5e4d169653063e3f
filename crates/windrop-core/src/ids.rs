//! Identifiers and room data model
//!
//! Rooms, peers and content blobs are all named by opaque strings. The core
//! never inspects their structure; a [`RoomId`] is a bag of bytes, a
//! [`ContentId`] is whatever text form the content layer hands us.

use serde::{Deserialize, Serialize};

/// Topic prefix for room gossip topics.
pub const ROOM_TOPIC_PREFIX: &str = "wc/";

/// Installation-wide peer discovery topic.
pub const DISCOVERY_TOPIC: &str = "wc-discovery";

/// Opaque room identifier.
///
/// Treated as a bag of bytes; invite codes typically produce 16+ characters
/// but nothing here enforces that.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The gossip topic carrying this room's traffic.
    pub fn topic(&self) -> Topic {
        Topic(format!("{}{}", ROOM_TOPIC_PREFIX, self.0))
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log output.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Self-describing content address for a byte blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(cid: impl Into<String>) -> Self {
        Self(cid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A pubsub topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    pub fn new(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the room id from a `wc/<room>` topic, if it is one.
    pub fn room_id(&self) -> Option<RoomId> {
        self.0.strip_prefix(ROOM_TOPIC_PREFIX).map(RoomId::from)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One shared file in a room manifest.
///
/// `name` and `size` are informational; `cid` is authoritative and carries
/// the set semantics of the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: Option<u64>,
    pub cid: ContentId,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, size: Option<u64>, cid: ContentId) -> Self {
        Self {
            name: name.into(),
            size,
            cid,
        }
    }
}

/// The shared file list of a room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Ordered file list; order is informational, identity is by `cid`.
    pub files: Vec<FileEntry>,
    /// Advisory wall-clock millis of the last update.
    pub updated_at: Option<u64>,
}

impl Manifest {
    pub fn new(files: Vec<FileEntry>, updated_at: Option<u64>) -> Self {
        Self { files, updated_at }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// All content ids referenced by the manifest, in list order.
    pub fn cids(&self) -> impl Iterator<Item = &ContentId> {
        self.files.iter().map(|f| &f.cid)
    }

    pub fn contains_cid(&self, cid: &ContentId) -> bool {
        self.files.iter().any(|f| &f.cid == cid)
    }
}

/// One chat message, deduplicated by `msg_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub msg_id: String,
    pub text: String,
    pub from: PeerId,
    pub ts: u64,
}

impl ChatMessage {
    /// Create a message stamped with a fresh uuid and the current time.
    pub fn now(text: impl Into<String>, from: PeerId) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            from,
            ts: chrono::Utc::now().timestamp_millis() as u64,
        }
    }
}
