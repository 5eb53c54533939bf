//! Debounce coalescer for snapshot updates.
//!
//! A single external action often arrives as a burst of before/after
//! notifications. Updates are keyed by directory and principal; the earliest
//! `before` and the latest `after` of a burst are kept, and one coalesced update
//! is emitted once the key has been quiet for the window.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

use groupsync_directory::ids::{DirectoryId, PrincipalId};
use groupsync_directory::types::PrincipalSnapshot;

/// Net change of a principal over one burst.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalescedUpdate {
    pub directory: DirectoryId,
    pub before: PrincipalSnapshot,
    pub after: PrincipalSnapshot,
}

#[derive(Debug)]
struct PendingUpdate {
    before: PrincipalSnapshot,
    after: PrincipalSnapshot,
    generation: u64,
}

type BurstKey = (DirectoryId, PrincipalId);

/// Trailing-edge debouncer.
#[derive(Debug, Clone)]
pub struct DebounceCoalescer {
    window: Duration,
    pending: Arc<DashMap<BurstKey, PendingUpdate>>,
    generation: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<CoalescedUpdate>,
}

impl DebounceCoalescer {
    /// Create a coalescer and the receiver its updates are delivered on.
    pub fn new(window: Duration) -> (Self, mpsc::UnboundedReceiver<CoalescedUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let coalescer = Self {
            window,
            pending: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
            tx,
        };
        (coalescer, rx)
    }

    /// Submit an observed update. Must be called from within a tokio runtime.
    pub fn submit(&self, directory: DirectoryId, before: PrincipalSnapshot, after: PrincipalSnapshot) {
        let key = (directory, after.id);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        self.pending
            .entry(key)
            .and_modify(|pending| {
                pending.after = after.clone();
                pending.generation = generation;
            })
            .or_insert_with(|| PendingUpdate {
                before,
                after,
                generation,
            });

        let pending = Arc::clone(&self.pending);
        let tx = self.tx.clone();
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;

            // A later submission owns the deadline
            let Some((_, update)) = pending.remove_if(&key, |_, p| p.generation == generation)
            else {
                return;
            };

            if update.before.grants == update.after.grants {
                trace!(directory = %key.0, principal = %key.1, "Burst cancelled out");
                return;
            }

            let _ = tx.send(CoalescedUpdate {
                directory: key.0,
                before: update.before,
                after: update.after,
            });
        });
    }

    /// Number of bursts waiting for their quiet period.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
