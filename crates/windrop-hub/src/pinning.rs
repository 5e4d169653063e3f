//! Proactive content pinning (mirror mode)
//!
//! Watching each room's manifest, the hub pins every content id it has
//! not pinned before. Pinning is monotone: a manifest that drops a file
//! does not unpin it. The cid is inserted into the process-wide set
//! before the fetch starts (marking it in progress) and removed again on
//! failure, so the next manifest update retries.

use std::sync::Arc;

use dashmap::DashSet;
use tracing::{debug, warn};

use windrop_core::{ContentClient, ContentId, Manifest};

/// Process-wide pinning state shared by every room observer.
pub struct Pinner {
    content: Arc<dyn ContentClient>,
    pinned: DashSet<ContentId>,
}

impl Pinner {
    pub fn new(content: Arc<dyn ContentClient>) -> Arc<Self> {
        Arc::new(Self {
            content,
            pinned: DashSet::new(),
        })
    }

    /// Pin every cid in the manifest we have not already taken on.
    pub fn observe_manifest(self: &Arc<Self>, manifest: &Manifest) {
        self.pin_cids(manifest.cids().cloned().collect());
    }

    /// Pin the listed cids, skipping ones already pinned or in progress.
    pub fn pin_cids(self: &Arc<Self>, cids: Vec<ContentId>) {
        for cid in cids {
            // insert returns false for already-known cids; those are
            // either pinned or being fetched right now.
            if !self.pinned.insert(cid.clone()) {
                continue;
            }
            let pinner = Arc::clone(self);
            tokio::spawn(async move {
                match pinner.content.pin(&cid).await {
                    Ok(()) => debug!(cid = %cid, "pinned"),
                    Err(e) => {
                        warn!(cid = %cid, error = %e, "pin failed, will retry on next manifest");
                        pinner.pinned.remove(&cid);
                    }
                }
            });
        }
    }

    /// Whether a cid has been taken on (pinned or fetch in flight).
    pub fn is_tracked(&self, cid: &ContentId) -> bool {
        self.pinned.contains(cid)
    }

    pub fn tracked_count(&self) -> usize {
        self.pinned.len()
    }
}

impl std::fmt::Debug for Pinner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pinner")
            .field("tracked", &self.pinned.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use windrop_core::{FileEntry, MemoryContentClient};

    fn manifest_with(cids: &[&str]) -> Manifest {
        Manifest::new(
            cids.iter()
                .map(|cid| FileEntry::new(format!("{cid}.bin"), None, ContentId::from(*cid)))
                .collect(),
            Some(1),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn new_cids_are_pinned_once() {
        let content = Arc::new(MemoryContentClient::new());
        let pinner = Pinner::new(content.clone());

        pinner.observe_manifest(&manifest_with(&["bafy-a", "bafy-b"]));
        settle().await;
        assert!(content.is_pinned(&ContentId::from("bafy-a")));
        assert!(content.is_pinned(&ContentId::from("bafy-b")));
        assert_eq!(content.pin_count(), 2);

        // The identical manifest again: no new pin calls.
        pinner.observe_manifest(&manifest_with(&["bafy-a", "bafy-b"]));
        settle().await;
        assert_eq!(content.pin_count(), 2);
    }

    #[tokio::test]
    async fn dropped_files_stay_pinned() {
        let content = Arc::new(MemoryContentClient::new());
        let pinner = Pinner::new(content.clone());

        pinner.observe_manifest(&manifest_with(&["bafy-a", "bafy-b"]));
        settle().await;
        pinner.observe_manifest(&manifest_with(&["bafy-a"]));
        settle().await;

        assert!(content.is_pinned(&ContentId::from("bafy-b")));
        assert!(pinner.is_tracked(&ContentId::from("bafy-b")));
    }

    #[tokio::test]
    async fn failed_pins_retry_on_next_manifest() {
        let content = Arc::new(MemoryContentClient::new());
        let pinner = Pinner::new(content.clone());
        let cid = ContentId::from("bafy-flaky");

        content.fail_pin(cid.clone());
        pinner.observe_manifest(&manifest_with(&["bafy-flaky"]));
        settle().await;
        assert!(!content.is_pinned(&cid));
        assert!(!pinner.is_tracked(&cid));

        content.heal_pin(&cid);
        pinner.observe_manifest(&manifest_with(&["bafy-flaky"]));
        settle().await;
        assert!(content.is_pinned(&cid));
    }
}
