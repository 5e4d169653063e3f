//! Automerge document backing a room
//!
//! The RoomDoc stores:
//! - The manifest (a map with a `files` list and an `updatedAt` stamp)
//! - The chat log (postcard-encoded messages in an Automerge list)
//!
//! Document structure:
//! ```json
//! {
//!   "manifest": {
//!     "files": [ { "name": "...", "size": 7, "cid": "..." }, ... ],
//!     "updatedAt": millis
//!   },
//!   "chat": [ <serialized message bytes>, ... ]
//! }
//! ```
//!
//! Every mutation, local or applied from bytes, produces an incremental
//! delta and notifies registered observers with `(delta, origin)` plus
//! decoded container views. Merging is commutative, associative and
//! idempotent; applying a delta twice is a no-op and fires nothing.

use automerge::transaction::{CommitOptions, Transactable};
use automerge::{ActorId, AutoCommit, ObjId, ObjType, ReadDoc, ROOT, ScalarValue, Value};

use std::collections::HashSet;

use windrop_core::{ChatMessage, ContentId, FileEntry, Manifest};

use crate::error::StateError;

/// Keys used in the Automerge document structure
mod keys {
    pub const MANIFEST: &str = "manifest";
    pub const FILES: &str = "files";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const CHAT: &str = "chat";
    pub const NAME: &str = "name";
    pub const SIZE: &str = "size";
    pub const CID: &str = "cid";
}

/// Actor id used for the deterministic bootstrap change.
///
/// Every peer creates its room document independently; giving the
/// structural bootstrap a fixed actor, sequence and timestamp makes the
/// initial change byte-identical everywhere, so the root containers are
/// the same Automerge objects on every replica and later merges converge.
const BOOTSTRAP_ACTOR: &[u8] = b"windrop/room-bootstrap";

/// Where an update came from. Controls rebroadcast and persistence:
/// only `Local` updates are broadcast by the engine, and `Storage`
/// updates never trigger a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A mutation made through this document's own API.
    Local,
    /// Applied from a gossip message (peer side).
    Network,
    /// Applied from the persistence layer.
    Storage,
    /// Applied from a hub sync stream (peer side).
    HubStream,
    /// Applied from a gossip message (hub side).
    Gossip,
    /// Applied from an inbound sync stream (hub side).
    Stream,
}

impl Origin {
    /// Updates the peer-side engine rebroadcasts as deltas.
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Local)
    }

    /// Updates the persistence binding must not save again.
    pub fn is_storage(&self) -> bool {
        matches!(self, Origin::Storage)
    }

    /// Updates the hub bridge re-emits to streams and gossip.
    pub fn hub_rebroadcasts(&self) -> bool {
        !matches!(self, Origin::Gossip | Origin::Stream)
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Origin::Local => "local",
            Origin::Network => "network",
            Origin::Storage => "storage",
            Origin::HubStream => "hub-stream",
            Origin::Gossip => "gossipsub",
            Origin::Stream => "stream",
        };
        f.write_str(tag)
    }
}

/// Token returned by the observe methods; pass to [`RoomDoc::unobserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

type UpdateObserver = Box<dyn Fn(&[u8], Origin) + Send>;
type ManifestObserver = Box<dyn Fn(&Manifest) + Send>;
type ChatObserver = Box<dyn Fn(&[ChatMessage]) + Send>;

/// Automerge document holding one room's replicated state.
pub struct RoomDoc {
    doc: AutoCommit,
    next_token: u64,
    update_observers: Vec<(ObserverToken, UpdateObserver)>,
    manifest_observers: Vec<(ObserverToken, ManifestObserver)>,
    chat_observers: Vec<(ObserverToken, ChatObserver)>,
}

impl RoomDoc {
    /// Create an empty room document with the shared structure in place.
    pub fn new() -> Result<Self, StateError> {
        let mut doc = AutoCommit::new().with_actor(ActorId::from(BOOTSTRAP_ACTOR));

        let manifest = doc.put_object(ROOT, keys::MANIFEST, ObjType::Map)?;
        doc.put_object(&manifest, keys::FILES, ObjType::List)?;
        doc.put_object(ROOT, keys::CHAT, ObjType::List)?;
        doc.commit_with(CommitOptions::default().with_time(0));

        doc.set_actor(ActorId::random());
        // Checkpoint so the first local delta excludes the bootstrap.
        let _ = doc.save();

        Ok(Self {
            doc,
            next_token: 0,
            update_observers: Vec::new(),
            manifest_observers: Vec::new(),
            chat_observers: Vec::new(),
        })
    }

    // ===== Dynamic ObjId lookup helpers =====
    // Never cache ObjIds: they can change identity after a merge picks
    // a different winner for a container key.

    fn manifest_obj(&self) -> Result<ObjId, StateError> {
        self.doc
            .get(ROOT, keys::MANIFEST)?
            .map(|(_, obj)| obj)
            .ok_or_else(|| StateError::Document("manifest map missing".into()))
    }

    fn files_obj(&self) -> Result<ObjId, StateError> {
        let manifest = self.manifest_obj()?;
        self.doc
            .get(&manifest, keys::FILES)?
            .map(|(_, obj)| obj)
            .ok_or_else(|| StateError::Document("files list missing".into()))
    }

    fn chat_obj(&self) -> Result<ObjId, StateError> {
        self.doc
            .get(ROOT, keys::CHAT)?
            .map(|(_, obj)| obj)
            .ok_or_else(|| StateError::Document("chat list missing".into()))
    }

    // ============================================================
    // Snapshots and updates
    // ============================================================

    /// Export the full document state as bytes.
    pub fn encode_full_state(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Current change heads, for convergence checks.
    pub fn heads(&mut self) -> Vec<automerge::ChangeHash> {
        self.doc.get_heads()
    }

    /// Apply opaque update bytes (an incremental delta or a full-state
    /// snapshot) and notify observers.
    ///
    /// Applying bytes that are already part of the document changes
    /// nothing and fires no observers.
    pub fn apply_update(&mut self, bytes: &[u8], origin: Origin) -> Result<(), StateError> {
        let before_manifest = self.manifest()?;
        let before_chat: HashSet<String> = self
            .chat_messages()?
            .into_iter()
            .map(|m| m.msg_id)
            .collect();

        self.doc
            .load_incremental(bytes)
            .map_err(|e| StateError::ApplyFailed(e.to_string()))?;

        let delta = self.doc.save_incremental();
        if delta.is_empty() {
            return Ok(());
        }
        self.notify(&delta, origin, &before_manifest, &before_chat)?;
        Ok(())
    }

    // ============================================================
    // Local mutations
    // ============================================================

    /// Replace the manifest. The `files` list is assigned atomically: a
    /// fresh list object replaces the previous one, so concurrent
    /// replacements resolve to one winner instead of interleaving.
    ///
    /// Returns the incremental delta for broadcast.
    pub fn set_manifest(&mut self, manifest: &Manifest) -> Result<Vec<u8>, StateError> {
        let before_manifest = self.manifest()?;
        let before_chat: HashSet<String> = self
            .chat_messages()?
            .into_iter()
            .map(|m| m.msg_id)
            .collect();

        let manifest_obj = self.manifest_obj()?;
        let files = self
            .doc
            .put_object(&manifest_obj, keys::FILES, ObjType::List)?;
        for (i, entry) in manifest.files.iter().enumerate() {
            let record = self.doc.insert_object(&files, i, ObjType::Map)?;
            self.doc.put(&record, keys::NAME, entry.name.as_str())?;
            if let Some(size) = entry.size {
                self.doc.put(&record, keys::SIZE, size)?;
            }
            self.doc.put(&record, keys::CID, entry.cid.as_str())?;
        }
        if let Some(updated_at) = manifest.updated_at {
            self.doc.put(&manifest_obj, keys::UPDATED_AT, updated_at)?;
        }

        let delta = self.doc.save_incremental();
        self.notify(&delta, Origin::Local, &before_manifest, &before_chat)?;
        Ok(delta)
    }

    /// Append a chat message. Returns the incremental delta for broadcast.
    pub fn append_chat(&mut self, message: &ChatMessage) -> Result<Vec<u8>, StateError> {
        let before_manifest = self.manifest()?;
        let before_chat: HashSet<String> = self
            .chat_messages()?
            .into_iter()
            .map(|m| m.msg_id)
            .collect();

        let bytes = postcard::to_allocvec(message)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        let chat = self.chat_obj()?;
        let len = self.doc.length(&chat);
        self.doc.insert(&chat, len, ScalarValue::Bytes(bytes))?;

        let delta = self.doc.save_incremental();
        self.notify(&delta, Origin::Local, &before_manifest, &before_chat)?;
        Ok(delta)
    }

    // ============================================================
    // Readers
    // ============================================================

    /// Decode the current manifest.
    pub fn manifest(&self) -> Result<Manifest, StateError> {
        let manifest_obj = self.manifest_obj()?;
        let files_obj = self.files_obj()?;

        let mut files = Vec::new();
        for i in 0..self.doc.length(&files_obj) {
            let Some((Value::Object(ObjType::Map), record)) = self.doc.get(&files_obj, i)? else {
                continue;
            };
            let Some(name) = self.get_string(&record, keys::NAME)? else {
                continue;
            };
            let Some(cid) = self.get_string(&record, keys::CID)? else {
                continue;
            };
            let size = self.get_uint(&record, keys::SIZE)?;
            files.push(FileEntry::new(name, size, ContentId::new(cid)));
        }

        let updated_at = self.get_uint(&manifest_obj, keys::UPDATED_AT)?;
        Ok(Manifest::new(files, updated_at))
    }

    /// Decode the chat log, deduplicated by `msg_id` in document order.
    pub fn chat_messages(&self) -> Result<Vec<ChatMessage>, StateError> {
        let chat = self.chat_obj()?;
        let len = self.doc.length(&chat);
        let mut seen = HashSet::new();
        let mut messages = Vec::new();

        for i in 0..len {
            let Some((Value::Scalar(value), _)) = self.doc.get(&chat, i)? else {
                continue;
            };
            let ScalarValue::Bytes(buf) = value.as_ref() else {
                continue;
            };
            match postcard::from_bytes::<ChatMessage>(buf) {
                Ok(message) => {
                    if seen.insert(message.msg_id.clone()) {
                        messages.push(message);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping undecodable chat entry");
                }
            }
        }

        Ok(messages)
    }

    fn get_string(&self, obj: &ObjId, key: &str) -> Result<Option<String>, StateError> {
        Ok(self.doc.get(obj, key)?.and_then(|(value, _)| match value {
            Value::Scalar(s) => match s.as_ref() {
                ScalarValue::Str(text) => Some(text.to_string()),
                _ => None,
            },
            _ => None,
        }))
    }

    fn get_uint(&self, obj: &ObjId, key: &str) -> Result<Option<u64>, StateError> {
        Ok(self.doc.get(obj, key)?.and_then(|(value, _)| match value {
            Value::Scalar(s) => match s.as_ref() {
                ScalarValue::Uint(n) => Some(*n),
                ScalarValue::Int(n) => u64::try_from(*n).ok(),
                _ => None,
            },
            _ => None,
        }))
    }

    // ============================================================
    // Observers
    // ============================================================

    /// Observe every effective update as `(delta_bytes, origin)`.
    pub fn observe_updates(&mut self, observer: UpdateObserver) -> ObserverToken {
        let token = self.next_token();
        self.update_observers.push((token, observer));
        token
    }

    /// Observe manifest changes with the decoded manifest.
    pub fn observe_manifest(&mut self, observer: ManifestObserver) -> ObserverToken {
        let token = self.next_token();
        self.manifest_observers.push((token, observer));
        token
    }

    /// Observe newly appended chat messages.
    pub fn observe_chat(&mut self, observer: ChatObserver) -> ObserverToken {
        let token = self.next_token();
        self.chat_observers.push((token, observer));
        token
    }

    /// Remove one observer, whichever registry it lives in.
    pub fn unobserve(&mut self, token: ObserverToken) {
        self.update_observers.retain(|(t, _)| *t != token);
        self.manifest_observers.retain(|(t, _)| *t != token);
        self.chat_observers.retain(|(t, _)| *t != token);
    }

    /// Number of registered observers across all registries.
    pub fn observer_count(&self) -> usize {
        self.update_observers.len() + self.manifest_observers.len() + self.chat_observers.len()
    }

    fn next_token(&mut self) -> ObserverToken {
        self.next_token += 1;
        ObserverToken(self.next_token)
    }

    /// Fire observers for a non-empty delta. Manifest and chat observers
    /// only fire when their container actually changed.
    fn notify(
        &mut self,
        delta: &[u8],
        origin: Origin,
        before_manifest: &Manifest,
        before_chat: &HashSet<String>,
    ) -> Result<(), StateError> {
        if delta.is_empty() {
            return Ok(());
        }

        for (_, observer) in &self.update_observers {
            observer(delta, origin);
        }

        let manifest = self.manifest()?;
        if &manifest != before_manifest {
            for (_, observer) in &self.manifest_observers {
                observer(&manifest);
            }
        }

        if !self.chat_observers.is_empty() {
            let new_messages: Vec<ChatMessage> = self
                .chat_messages()?
                .into_iter()
                .filter(|m| !before_chat.contains(&m.msg_id))
                .collect();
            if !new_messages.is_empty() {
                for (_, observer) in &self.chat_observers {
                    observer(&new_messages);
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for RoomDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomDoc")
            .field("observers", &self.observer_count())
            .finish_non_exhaustive()
    }
}
