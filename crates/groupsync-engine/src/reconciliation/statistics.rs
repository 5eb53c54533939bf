//! Sweep statistics tracking.
//!
//! Tracks and aggregates counters while a reconciliation sweep runs.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use groupsync_directory::types::ActionKind;

use crate::dispatch::DispatchOutcome;
use crate::error::SyncResult;

/// Statistics for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStatistics {
    /// Principals examined across every directory.
    #[serde(default)]
    pub principals_scanned: u32,
    /// Marker and pending corrections on the primary.
    #[serde(default)]
    pub flags_corrected: u32,
    #[serde(default)]
    pub grants_added: u32,
    #[serde(default)]
    pub grants_removed: u32,
    /// Primary exclusions copied to replicas.
    #[serde(default)]
    pub exclusions_synced: u32,
    /// Mutations dropped because the reactive path already issued them.
    #[serde(default)]
    pub suppressed: u32,
    /// Mutations or reads that failed after retries.
    #[serde(default)]
    pub failures: u32,
    /// Directories that could not be listed.
    #[serde(default)]
    pub directories_failed: u32,
    #[serde(default)]
    pub duration_ms: u64,
}

impl SweepStatistics {
    /// Total corrective mutations performed (or logged in dry-run mode).
    #[must_use]
    pub fn corrections(&self) -> u32 {
        self.flags_corrected + self.grants_added + self.grants_removed + self.exclusions_synced
    }

    /// Whether the sweep ran without a single failure.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures == 0 && self.directories_failed == 0
    }
}

/// Thread-safe tracker for accumulating statistics during a sweep.
#[derive(Debug)]
pub struct StatisticsTracker {
    principals_scanned: AtomicU32,
    flags_corrected: AtomicU32,
    grants_added: AtomicU32,
    grants_removed: AtomicU32,
    exclusions_synced: AtomicU32,
    suppressed: AtomicU32,
    failures: AtomicU32,
    directories_failed: AtomicU32,
    start_time: Instant,
}

impl Default for StatisticsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsTracker {
    /// Create a new tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            principals_scanned: AtomicU32::new(0),
            flags_corrected: AtomicU32::new(0),
            grants_added: AtomicU32::new(0),
            grants_removed: AtomicU32::new(0),
            exclusions_synced: AtomicU32::new(0),
            suppressed: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            directories_failed: AtomicU32::new(0),
            start_time: Instant::now(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn increment_scanned(&self, count: usize) {
        self.principals_scanned
            .fetch_add(count as u32, Ordering::SeqCst);
    }

    /// Record the outcome of one corrective mutation.
    ///
    /// `flag` marks primary status flag corrections.
    pub fn record_outcome(
        &self,
        action: ActionKind,
        flag: bool,
        result: &SyncResult<DispatchOutcome>,
    ) {
        match result {
            Ok(outcome) if outcome.is_effective() => {
                let counter = match action {
                    _ if flag => &self.flags_corrected,
                    ActionKind::AddGrant => &self.grants_added,
                    ActionKind::RemoveGrant => &self.grants_removed,
                    ActionKind::AddExclusion | ActionKind::RemoveExclusion | ActionKind::Expel => {
                        &self.exclusions_synced
                    }
                };
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(DispatchOutcome::Suppressed) => {
                self.suppressed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(_) => {}
            Err(_) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn record_exclusions_synced(&self, count: usize) {
        self.exclusions_synced
            .fetch_add(count as u32, Ordering::SeqCst);
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn record_failures(&self, count: usize) {
        self.failures.fetch_add(count as u32, Ordering::SeqCst);
    }

    pub fn record_directory_failed(&self) {
        self.directories_failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Get elapsed duration in milliseconds.
    #[allow(clippy::cast_possible_truncation)]
    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Snapshot current statistics.
    pub fn snapshot(&self) -> SweepStatistics {
        SweepStatistics {
            principals_scanned: self.principals_scanned.load(Ordering::SeqCst),
            flags_corrected: self.flags_corrected.load(Ordering::SeqCst),
            grants_added: self.grants_added.load(Ordering::SeqCst),
            grants_removed: self.grants_removed.load(Ordering::SeqCst),
            exclusions_synced: self.exclusions_synced.load(Ordering::SeqCst),
            suppressed: self.suppressed.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
            directories_failed: self.directories_failed.load(Ordering::SeqCst),
            duration_ms: self.elapsed_ms(),
        }
    }
}
