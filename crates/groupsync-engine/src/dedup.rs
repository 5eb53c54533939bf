//! Operation deduplication and rate limiting.
//!
//! Every mutating call is keyed by principal, directory, grant and action. A key
//! can be acquired at most once per window; later attempts inside the window are
//! dropped rather than queued. The reactive path and the reconciliation sweep
//! share one instance so they cannot double-fire the same mutation.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use groupsync_directory::ids::{DirectoryId, GrantId, PrincipalId};
use groupsync_directory::types::ActionKind;

/// Dedup key of a mutating call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct OperationKey {
    pub principal: PrincipalId,
    pub directory: DirectoryId,
    /// Absent for exclusion and expulsion calls.
    pub grant: Option<GrantId>,
    pub action: ActionKind,
}

impl OperationKey {
    pub fn grant(
        action: ActionKind,
        directory: DirectoryId,
        principal: PrincipalId,
        grant: GrantId,
    ) -> Self {
        Self {
            principal,
            directory,
            grant: Some(grant),
            action,
        }
    }

    pub fn principal(action: ActionKind, directory: DirectoryId, principal: PrincipalId) -> Self {
        Self {
            principal,
            directory,
            grant: None,
            action,
        }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.grant {
            Some(grant) => write!(
                f,
                "{}:{}:{}:{}",
                self.action, self.directory, self.principal, grant
            ),
            None => write!(f, "{}:{}:{}", self.action, self.directory, self.principal),
        }
    }
}

/// Keyed store of recent operation records with a fixed expiry window.
#[derive(Debug)]
pub struct OperationDeduplicator {
    records: DashMap<OperationKey, Instant>,
    window: Duration,
}

impl OperationDeduplicator {
    /// Create a deduplicator with the given window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            records: DashMap::new(),
            window,
        }
    }

    /// The expiry window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record an attempt for the key.
    ///
    /// Returns true if no live record existed, false if the attempt must be dropped.
    pub fn try_acquire(&self, key: &OperationKey) -> bool {
        let now = Instant::now();
        match self.records.entry(*key) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) >= self.window {
                    entry.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Drop the record for a key so the next attempt is not suppressed.
    pub fn release(&self, key: &OperationKey) {
        self.records.remove(key);
    }

    /// Whether a grant change for the principal was dispatched within the window.
    pub fn is_in_flight(
        &self,
        principal: PrincipalId,
        directory: DirectoryId,
        grant: GrantId,
    ) -> bool {
        [ActionKind::AddGrant, ActionKind::RemoveGrant]
            .into_iter()
            .any(|action| self.is_live(&OperationKey::grant(action, directory, principal, grant)))
    }

    /// Whether a live record exists for the key.
    pub fn is_live(&self, key: &OperationKey) -> bool {
        self.records
            .get(key)
            .is_some_and(|at| at.elapsed() < self.window)
    }

    /// Remove expired records, returning how many were removed.
    pub fn evict_expired(&self) -> usize {
        let before = self.records.len();
        let window = self.window;
        self.records.retain(|_, at| at.elapsed() < window);
        before.saturating_sub(self.records.len())
    }

    /// Number of stored records, live or not yet evicted.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Keys of every live record.
    pub fn live_keys(&self) -> Vec<OperationKey> {
        self.records
            .iter()
            .filter(|entry| entry.value().elapsed() < self.window)
            .map(|entry| *entry.key())
            .collect()
    }
}
