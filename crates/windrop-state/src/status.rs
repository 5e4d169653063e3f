//! Per-room sync status
//!
//! A room document moves `Loading` → `Syncing` → `Synced`. The transition
//! to `Synced` happens on the first delta or snapshot received from any
//! peer and stops the snapshot-request ticker; only an explicit rejoin
//! moves a document back to `Syncing`.

use tokio::sync::watch;

/// Sync progress of one room document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Persistence load still in flight.
    Loading,
    /// At least one snapshot request outstanding.
    Syncing,
    /// A delta or snapshot arrived from some peer.
    Synced,
}

/// Watchable sync status for one room.
#[derive(Debug)]
pub struct SyncStatusCell {
    tx: watch::Sender<SyncStatus>,
}

impl SyncStatusCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncStatus::Loading);
        Self { tx }
    }

    pub fn get(&self) -> SyncStatus {
        *self.tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Persistence settled; start syncing. Does not regress `Synced`
    /// (only [`Self::reset_for_rejoin`] may do that).
    pub fn mark_syncing(&self) {
        self.tx.send_if_modified(|status| {
            if *status == SyncStatus::Loading {
                *status = SyncStatus::Syncing;
                true
            } else {
                false
            }
        });
    }

    /// A delta or snapshot arrived. Monotone: never leaves `Synced`.
    pub fn mark_synced(&self) {
        self.tx.send_if_modified(|status| {
            if *status == SyncStatus::Synced {
                false
            } else {
                *status = SyncStatus::Synced;
                true
            }
        });
    }

    /// Explicit rejoin: drop back to `Syncing` unless still loading.
    pub fn reset_for_rejoin(&self) {
        self.tx.send_if_modified(|status| {
            if *status == SyncStatus::Synced {
                *status = SyncStatus::Syncing;
                true
            } else {
                false
            }
        });
    }

    pub fn is_synced(&self) -> bool {
        self.get() == SyncStatus::Synced
    }
}

impl Default for SyncStatusCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_progression() {
        let cell = SyncStatusCell::new();
        assert_eq!(cell.get(), SyncStatus::Loading);

        cell.mark_syncing();
        assert_eq!(cell.get(), SyncStatus::Syncing);

        cell.mark_synced();
        assert!(cell.is_synced());

        // Monotone: syncing does not regress synced.
        cell.mark_syncing();
        assert_eq!(cell.get(), SyncStatus::Synced);
    }

    #[test]
    fn rejoin_reverts_only_synced() {
        let cell = SyncStatusCell::new();
        cell.reset_for_rejoin();
        assert_eq!(cell.get(), SyncStatus::Loading);

        cell.mark_syncing();
        cell.mark_synced();
        cell.reset_for_rejoin();
        assert_eq!(cell.get(), SyncStatus::Syncing);
    }

    #[tokio::test]
    async fn watchers_observe_transitions() {
        let cell = SyncStatusCell::new();
        let mut rx = cell.watch();
        cell.mark_synced();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SyncStatus::Synced);
    }
}
