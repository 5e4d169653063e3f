//! Content-exchange collaborator contract
//!
//! The block layer lives outside this repository; hubs only need to pin
//! content addresses, fetch individual blocks for DAG walks, and parse
//! child links out of a block. [`MemoryContentClient`] records pins and
//! blocks in memory for tests and local mirroring.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::ContentError;
use crate::ids::ContentId;

/// Client surface of the content-exchange layer.
#[async_trait]
pub trait ContentClient: Send + Sync + 'static {
    /// Transitively fetch and retain all blocks under `cid`.
    ///
    /// Resolves once the content is pinned locally; this can take minutes
    /// for large DAGs.
    async fn pin(&self, cid: &ContentId) -> Result<(), ContentError>;

    /// Fetch a single block by content address.
    async fn get_block(&self, cid: &ContentId) -> Result<Vec<u8>, ContentError>;

    /// Store a single block under its content address (upload path).
    async fn put_block(&self, cid: &ContentId, bytes: Vec<u8>) -> Result<(), ContentError>;

    /// Parse the child links out of a block's bytes.
    fn enumerate_links(&self, block: &[u8]) -> Result<Vec<ContentId>, ContentError>;
}

/// In-memory content client.
///
/// Pins are recorded, blocks are stored verbatim, and links are read from
/// a newline-delimited `link:<cid>` convention so tests can build small
/// DAGs without a real codec.
#[derive(Default)]
pub struct MemoryContentClient {
    blocks: DashMap<ContentId, Vec<u8>>,
    pins: DashMap<ContentId, ()>,
    /// Cids whose pin calls should fail, for error-path tests.
    failing: DashMap<ContentId, ()>,
    /// Total `pin` invocations, successful or not.
    pin_calls: AtomicUsize,
}

impl MemoryContentClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a block directly (as if fetched from the network).
    pub fn put_block(&self, cid: ContentId, bytes: Vec<u8>) {
        self.blocks.insert(cid, bytes);
    }

    /// Make future `pin` calls for `cid` fail.
    pub fn fail_pin(&self, cid: ContentId) {
        self.failing.insert(cid, ());
    }

    /// Let `pin` succeed again for `cid`.
    pub fn heal_pin(&self, cid: &ContentId) {
        self.failing.remove(cid);
    }

    pub fn is_pinned(&self, cid: &ContentId) -> bool {
        self.pins.contains_key(cid)
    }

    pub fn pinned(&self) -> Vec<ContentId> {
        self.pins.iter().map(|e| e.key().clone()).collect()
    }

    pub fn pin_count(&self) -> usize {
        self.pins.len()
    }

    /// How many times `pin` has been invoked, successful or not.
    pub fn pin_call_count(&self) -> usize {
        self.pin_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentClient for MemoryContentClient {
    async fn pin(&self, cid: &ContentId) -> Result<(), ContentError> {
        self.pin_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains_key(cid) {
            return Err(ContentError::PinFailed(format!("{cid} unavailable")));
        }
        self.pins.insert(cid.clone(), ());
        // Pin children we already hold, mirroring a transitive fetch.
        if let Some(block) = self.blocks.get(cid) {
            for link in self.enumerate_links(block.value())? {
                self.pins.insert(link, ());
            }
        }
        Ok(())
    }

    async fn get_block(&self, cid: &ContentId) -> Result<Vec<u8>, ContentError> {
        self.blocks
            .get(cid)
            .map(|b| b.value().clone())
            .ok_or_else(|| ContentError::NotFound(cid.to_string()))
    }

    async fn put_block(&self, cid: &ContentId, bytes: Vec<u8>) -> Result<(), ContentError> {
        self.blocks.insert(cid.clone(), bytes);
        Ok(())
    }

    fn enumerate_links(&self, block: &[u8]) -> Result<Vec<ContentId>, ContentError> {
        let text = match std::str::from_utf8(block) {
            Ok(text) => text,
            Err(_) => return Ok(Vec::new()),
        };
        Ok(text
            .lines()
            .filter_map(|line| line.strip_prefix("link:"))
            .map(ContentId::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pin_records_cid() {
        let client = MemoryContentClient::new();
        let cid = ContentId::from("bafy-a");
        client.pin(&cid).await.unwrap();
        assert!(client.is_pinned(&cid));
    }

    #[tokio::test]
    async fn pin_failure_is_surfaced() {
        let client = MemoryContentClient::new();
        let cid = ContentId::from("bafy-a");
        client.fail_pin(cid.clone());
        assert!(client.pin(&cid).await.is_err());
        assert!(!client.is_pinned(&cid));

        client.heal_pin(&cid);
        client.pin(&cid).await.unwrap();
        assert!(client.is_pinned(&cid));
    }

    #[tokio::test]
    async fn pin_follows_links() {
        let client = MemoryContentClient::new();
        let root = ContentId::from("bafy-root");
        client.put_block(root.clone(), b"link:bafy-child-1\nlink:bafy-child-2".to_vec());
        client.pin(&root).await.unwrap();
        assert!(client.is_pinned(&ContentId::from("bafy-child-1")));
        assert!(client.is_pinned(&ContentId::from("bafy-child-2")));
    }

    #[tokio::test]
    async fn missing_block_is_not_found() {
        let client = MemoryContentClient::new();
        assert!(matches!(
            client.get_block(&ContentId::from("bafy-x")).await,
            Err(ContentError::NotFound(_))
        ));
    }
}
