use crate::Kind;
use tokio::{sync::watch, time};
use tracing::info;

/// Tracks which kinds have not yet completed their initial listing.
///
/// Owned by the store's processing task, which marks a kind as synced only after applying every
/// notification that preceded the kind's [`Notification::Synced`](crate::Notification::Synced)
/// marker.
#[derive(Debug)]
pub struct Barrier {
    pending: Vec<Kind>,
    tx: watch::Sender<bool>,
}

/// Waits for the [`Barrier`] to open.
#[derive(Clone, Debug)]
pub struct SyncWait(watch::Receiver<bool>);

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("timed out after {0:?} waiting for caches to sync")]
    Timeout(time::Duration),

    #[error("stopped before caches synced")]
    Stopped,
}

pub fn barrier(kinds: impl IntoIterator<Item = Kind>) -> (Barrier, SyncWait) {
    let mut pending = kinds.into_iter().collect::<Vec<_>>();
    pending.dedup();
    let (tx, rx) = watch::channel(pending.is_empty());
    (Barrier { pending, tx }, SyncWait(rx))
}

// === impl Barrier ===

impl Barrier {
    pub fn mark(&mut self, kind: Kind) {
        let before = self.pending.len();
        self.pending.retain(|k| *k != kind);
        if before != self.pending.len() {
            info!(%kind, "Synced");
            if self.pending.is_empty() {
                self.tx.send_replace(true);
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.pending.is_empty()
    }
}

// === impl SyncWait ===

impl SyncWait {
    pub fn is_synced(&self) -> bool {
        *self.0.borrow()
    }

    /// Returns false if the barrier was dropped before it opened.
    pub async fn synced(&self) -> bool {
        let mut rx = self.0.clone();
        let synced = rx.wait_for(|synced| *synced).await.is_ok();
        synced
    }

    pub async fn timeout(&self, timeout: time::Duration) -> Result<(), SyncError> {
        match time::timeout(timeout, self.synced()).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(SyncError::Stopped),
            Err(_) => Err(SyncError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn opens_once_all_kinds_synced() {
        let (mut barrier, wait) = barrier(Kind::ALL);
        assert!(!wait.is_synced());

        barrier.mark(Kind::Service);
        barrier.mark(Kind::Service);
        assert!(!wait.is_synced());
        assert!(matches!(
            wait.timeout(time::Duration::from_secs(1)).await,
            Err(SyncError::Timeout(_))
        ));

        barrier.mark(Kind::Endpoints);
        assert!(barrier.is_open());
        wait.timeout(time::Duration::from_secs(1))
            .await
            .expect("barrier must open");
    }

    #[tokio::test]
    async fn dropped_barrier_never_syncs() {
        let (barrier, wait) = barrier(Kind::ALL);
        drop(barrier);
        assert!(!wait.synced().await);
    }
}
