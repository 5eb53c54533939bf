//! Full-state reconciliation sweep.
//!
//! Runs at startup and on a fixed interval. Reads every member of every
//! directory, diffs it against the primary-derived authorization, and issues
//! corrections through the same dispatcher as the reactive path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use groupsync_directory::ids::{DirectoryId, GrantId, PrincipalId};
use groupsync_directory::traits::DirectoryReader;
use groupsync_directory::types::PrincipalSnapshot;

use super::statistics::{StatisticsTracker, SweepStatistics};
use crate::dispatch::Mutation;
use crate::orchestrator::{plan_replica_diff, SyncOrchestrator};
use crate::propagation::ExclusionPropagator;

/// Report of one completed sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub dry_run: bool,
    pub statistics: SweepStatistics,
}

/// Reconciliation sweep over the primary and every replica.
#[derive(Debug, Clone)]
pub struct ReconciliationSweep {
    orchestrator: SyncOrchestrator,
    propagator: ExclusionPropagator,
    batch_size: usize,
    batch_pause: Duration,
}

impl ReconciliationSweep {
    pub fn new(
        orchestrator: SyncOrchestrator,
        propagator: ExclusionPropagator,
        batch_size: usize,
        batch_pause: Duration,
    ) -> Self {
        Self {
            orchestrator,
            propagator,
            batch_size: batch_size.max(1),
            batch_pause,
        }
    }

    /// Run one full pass. Failures are counted, never returned.
    #[instrument(skip(self), fields(run_id))]
    pub async fn run(&self) -> SweepReport {
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        let started_at = Utc::now();
        let tracker = StatisticsTracker::new();
        let dry_run = self.orchestrator.dispatcher().is_dry_run();

        info!(dry_run, "Reconciliation sweep started");

        match self.primary_pass(&tracker).await {
            Some(primary_grants) => {
                for directory in self.orchestrator.mapping().replica_directories() {
                    self.replica_pass(directory, &primary_grants, &tracker).await;
                }
            }
            None => warn!("Primary unreadable, skipping replica pass"),
        }

        self.exclusion_pass(&tracker).await;

        let statistics = tracker.snapshot();
        info!(
            principals = statistics.principals_scanned,
            corrections = statistics.corrections(),
            failures = statistics.failures,
            duration_ms = statistics.duration_ms,
            "Reconciliation sweep completed"
        );

        SweepReport {
            run_id,
            started_at,
            completed_at: Utc::now(),
            dry_run,
            statistics,
        }
    }

    /// Correct status flags on the primary and collect each member's group grants.
    ///
    /// Returns `None` when the primary cannot be listed: without it no replica
    /// grant can be judged.
    async fn primary_pass(
        &self,
        tracker: &StatisticsTracker,
    ) -> Option<HashMap<PrincipalId, BTreeSet<GrantId>>> {
        let mapping = self.orchestrator.mapping();
        let primary = mapping.primary();
        let members = match self
            .orchestrator
            .dispatcher()
            .service()
            .list_all_principals(primary)
            .await
        {
            Ok(members) => members,
            Err(e) => {
                error!(directory = %primary, error = %e, "Failed to list primary members");
                tracker.record_directory_failed();
                return None;
            }
        };
        tracker.increment_scanned(members.len());

        let corrections: Vec<(PrincipalId, Vec<Mutation>)> = members
            .iter()
            .map(|m| (m.id, self.orchestrator.plan_primary_flags(m)))
            .filter(|(_, mutations)| !mutations.is_empty())
            .collect();
        debug!(count = corrections.len(), "Primary members needing flag corrections");
        self.apply_in_batches(corrections, true, tracker).await;

        Some(
            members
                .iter()
                .map(|m| (m.id, mapping.group_grants_of(m)))
                .collect(),
        )
    }

    async fn replica_pass(
        &self,
        directory: DirectoryId,
        primary_grants: &HashMap<PrincipalId, BTreeSet<GrantId>>,
        tracker: &StatisticsTracker,
    ) {
        let members: Vec<PrincipalSnapshot> = match self
            .orchestrator
            .dispatcher()
            .service()
            .list_all_principals(directory)
            .await
        {
            Ok(members) => members,
            Err(e) => {
                error!(directory = %directory, error = %e, "Failed to list replica members");
                tracker.record_directory_failed();
                return;
            }
        };
        tracker.increment_scanned(members.len());

        let empty = BTreeSet::new();
        let mapping = self.orchestrator.mapping();
        let corrections: Vec<(PrincipalId, Vec<Mutation>)> = members
            .iter()
            .filter_map(|member| {
                let authorized_by = primary_grants.get(&member.id).unwrap_or(&empty);
                let diff = plan_replica_diff(mapping, directory, &member.grants, authorized_by);
                if diff.is_empty() {
                    return None;
                }
                let mutations = diff
                    .to_add
                    .iter()
                    .map(|g| Mutation::add_grant(directory, member.id, *g))
                    .chain(
                        diff.to_remove
                            .iter()
                            .map(|g| Mutation::remove_grant(directory, member.id, *g)),
                    )
                    .collect();
                Some((member.id, mutations))
            })
            .collect();

        info!(directory = %directory, members = members.len(), drifted = corrections.len(), "Replica scanned");
        self.apply_in_batches(corrections, false, tracker).await;
    }

    async fn exclusion_pass(&self, tracker: &StatisticsTracker) {
        match self.propagator.sync_exclusions().await {
            Ok(report) => {
                tracker.record_exclusions_synced(report.applied);
                tracker.record_failures(report.failures.len());
            }
            Err(e) => {
                error!(error = %e, "Exclusion sync failed");
                tracker.record_directory_failed();
            }
        }
    }

    /// Dispatch corrections, `batch_size` principals at a time, pausing between batches.
    async fn apply_in_batches(
        &self,
        corrections: Vec<(PrincipalId, Vec<Mutation>)>,
        flags: bool,
        tracker: &StatisticsTracker,
    ) {
        let dispatcher = self.orchestrator.dispatcher();
        let batches: Vec<_> = corrections.chunks(self.batch_size).collect();
        let batch_count = batches.len();

        for (index, batch) in batches.into_iter().enumerate() {
            for (principal, mutations) in batch {
                for mutation in mutations {
                    let result = dispatcher.dispatch(mutation).await;
                    if let Err(e) = &result {
                        warn!(principal = %principal, mutation = %mutation, error = %e, "Correction failed");
                    }
                    tracker.record_outcome(mutation.action(), flags, &result);
                }
            }

            if index + 1 < batch_count && !self.batch_pause.is_zero() {
                tokio::time::sleep(self.batch_pause).await;
            }
        }
    }
}
