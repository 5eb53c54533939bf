//! Synchronization orchestrator.
//!
//! Drives grant propagation from the primary to replicas and corrects changes
//! nobody authorized. Events are treated as wake-up triggers: every decision is
//! re-derived from the current primary state, never from event order.

use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use groupsync_directory::ids::{DirectoryId, GrantId, PrincipalId};
use groupsync_directory::traits::DirectoryReader;
use groupsync_directory::types::PrincipalSnapshot;

use crate::dispatch::{DispatchOutcome, Mutation, MutationDispatcher};
use crate::error::SyncResult;
use crate::mapping::GroupMapping;
use crate::normalizer::diff_grants;

/// Per-principal affiliation, derived from a primary snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "grant", rename_all = "snake_case")]
pub enum Affiliation {
    Unaffiliated,
    /// Joined, no group grant yet.
    Pending,
    Affiliated(GrantId),
}

impl Affiliation {
    /// Derive the affiliation. Several group grants resolve to the lowest id.
    pub fn of(
        snapshot: &PrincipalSnapshot,
        mapping: &GroupMapping,
        pending_grant: Option<GrantId>,
    ) -> Self {
        if let Some(group) = mapping.group_grants_of(snapshot).into_iter().next() {
            Self::Affiliated(group)
        } else if pending_grant.is_some_and(|p| snapshot.has_grant(p)) {
            Self::Pending
        } else {
            Self::Unaffiliated
        }
    }
}

/// Grants to add and remove on one replica for one principal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplicaDiff {
    pub to_add: BTreeSet<GrantId>,
    pub to_remove: BTreeSet<GrantId>,
}

impl ReplicaDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Diff a replica grant set against the primary-derived authorization.
///
/// Grants the engine does not manage are never touched.
pub fn plan_replica_diff(
    mapping: &GroupMapping,
    directory: DirectoryId,
    replica_grants: &BTreeSet<GrantId>,
    primary_grants: &BTreeSet<GrantId>,
) -> ReplicaDiff {
    let managed = mapping.managed_grants_in(directory);
    let authorized = mapping.authorized_grants_in(directory, primary_grants);

    ReplicaDiff {
        to_add: authorized.difference(replica_grants).copied().collect(),
        to_remove: replica_grants
            .intersection(&managed)
            .filter(|g| !authorized.contains(g))
            .copied()
            .collect(),
    }
}

/// A replica call that failed after retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FanOutFailure {
    pub directory: DirectoryId,
    /// The failed mutation, or the name of the read that failed.
    pub operation: String,
    pub error: String,
}

/// Outcome of a group of isolated mutations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    pub attempted: usize,
    /// Applied, or logged in dry-run mode.
    pub applied: usize,
    pub suppressed: usize,
    pub skipped: usize,
    pub failures: Vec<FanOutFailure>,
}

impl FanOutReport {
    pub fn record(&mut self, mutation: &Mutation, result: SyncResult<DispatchOutcome>) {
        self.attempted += 1;
        match result {
            Ok(DispatchOutcome::Applied | DispatchOutcome::DryRun) => self.applied += 1,
            Ok(DispatchOutcome::Suppressed) => self.suppressed += 1,
            Ok(DispatchOutcome::TargetMissing) => self.skipped += 1,
            Err(e) => {
                warn!(mutation = %mutation, error = %e, "Isolated mutation failed");
                self.failures.push(FanOutFailure {
                    directory: mutation.directory(),
                    operation: mutation.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Record a read that failed before any mutation could be planned.
    ///
    /// Counts as a failure but not as an attempted mutation.
    pub fn record_read_failure(
        &mut self,
        directory: DirectoryId,
        operation: &str,
        error: &impl std::fmt::Display,
    ) {
        warn!(directory = %directory, operation, error = %error, "Replica read failed");
        self.failures.push(FanOutFailure {
            directory,
            operation: operation.to_string(),
            error: error.to_string(),
        });
    }

    pub fn merge(&mut self, other: FanOutReport) {
        self.attempted += other.attempted;
        self.applied += other.applied;
        self.suppressed += other.suppressed;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
    }

    /// Whether every mutation went through (or was legitimately skipped).
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// The per-principal state machine.
#[derive(Debug, Clone)]
pub struct SyncOrchestrator {
    dispatcher: MutationDispatcher,
    mapping: Arc<GroupMapping>,
    marker_grant: GrantId,
    pending_grant: Option<GrantId>,
}

impl SyncOrchestrator {
    pub fn new(
        dispatcher: MutationDispatcher,
        mapping: Arc<GroupMapping>,
        marker_grant: GrantId,
        pending_grant: Option<GrantId>,
    ) -> Self {
        Self {
            dispatcher,
            mapping,
            marker_grant,
            pending_grant,
        }
    }

    pub fn mapping(&self) -> &Arc<GroupMapping> {
        &self.mapping
    }

    pub fn dispatcher(&self) -> &MutationDispatcher {
        &self.dispatcher
    }

    fn primary(&self) -> DirectoryId {
        self.mapping.primary()
    }

    /// Current primary affiliation of a principal, `None` if not a primary member.
    pub async fn affiliation(&self, principal: PrincipalId) -> SyncResult<Option<Affiliation>> {
        let snapshot = self
            .dispatcher
            .service()
            .fetch_principal(self.primary(), principal)
            .await?;
        Ok(snapshot.map(|s| Affiliation::of(&s, &self.mapping, self.pending_grant)))
    }

    /// Group grants currently held on the primary; empty for non-members.
    pub async fn primary_grants(&self, principal: PrincipalId) -> SyncResult<BTreeSet<GrantId>> {
        let snapshot = self
            .dispatcher
            .service()
            .fetch_principal(self.primary(), principal)
            .await?;
        Ok(snapshot
            .map(|s| self.mapping.group_grants_of(&s))
            .unwrap_or_default())
    }

    /// React to a change of a principal's grants on the primary.
    ///
    /// Primary-side failures abort the transition and are returned; replica
    /// failures are isolated in the report.
    #[instrument(skip(self, before, after), fields(principal = %after.id))]
    pub async fn on_primary_update(
        &self,
        before: &PrincipalSnapshot,
        after: &PrincipalSnapshot,
    ) -> SyncResult<FanOutReport> {
        let principal = after.id;
        let Some(mut current) = self
            .dispatcher
            .service()
            .fetch_principal(self.primary(), principal)
            .await?
        else {
            debug!("Principal no longer on primary, nothing to do");
            return Ok(FanOutReport::default());
        };

        let delta = diff_grants(before, after);
        let mut report = FanOutReport::default();

        // Several group grants added at once: the lowest id wins
        let joined = delta
            .added
            .iter()
            .copied()
            .find(|g| self.mapping.is_group_grant(*g) && current.has_grant(*g));
        if let Some(group) = joined {
            report.merge(self.affiliate(&mut current, group).await?);
        }

        let left: Vec<GrantId> = delta
            .removed
            .iter()
            .copied()
            .filter(|g| self.mapping.is_group_grant(*g) && !current.has_grant(*g))
            .collect();
        for group in left {
            report.merge(self.disaffiliate(&mut current, group).await?);
        }

        self.reconcile_primary_flags(&current).await?;
        Ok(report)
    }

    /// Transition to `Affiliated(group)`.
    pub async fn affiliate(
        &self,
        current: &mut PrincipalSnapshot,
        group: GrantId,
    ) -> SyncResult<FanOutReport> {
        let principal = current.id;
        let primary = self.primary();
        let mut report = FanOutReport::default();

        info!(
            principal = %principal,
            group = %self.mapping.name_of(group),
            "Principal joined group"
        );

        let others: Vec<GrantId> = self
            .mapping
            .group_grants_of(current)
            .into_iter()
            .filter(|g| *g != group)
            .collect();
        for other in others {
            self.dispatcher
                .dispatch(&Mutation::remove_grant(primary, principal, other))
                .await?;
            current.grants.remove(&other);
            report.merge(self.fan_out(principal, other, false).await);
        }

        if !current.has_grant(self.marker_grant) {
            self.dispatcher
                .dispatch(&Mutation::add_grant(primary, principal, self.marker_grant))
                .await?;
            current.grants.insert(self.marker_grant);
        }

        if let Some(pending) = self.pending_grant.filter(|p| current.has_grant(*p)) {
            self.dispatcher
                .dispatch(&Mutation::remove_grant(primary, principal, pending))
                .await?;
            current.grants.remove(&pending);
        }

        report.merge(self.fan_out(principal, group, true).await);
        Ok(report)
    }

    /// Transition out of `Affiliated(group)`.
    pub async fn disaffiliate(
        &self,
        current: &mut PrincipalSnapshot,
        group: GrantId,
    ) -> SyncResult<FanOutReport> {
        let principal = current.id;

        info!(
            principal = %principal,
            group = %self.mapping.name_of(group),
            "Principal left group"
        );

        if self.mapping.group_grants_of(current).is_empty() && current.has_grant(self.marker_grant)
        {
            self.dispatcher
                .dispatch(&Mutation::remove_grant(
                    self.primary(),
                    principal,
                    self.marker_grant,
                ))
                .await?;
            current.grants.remove(&self.marker_grant);
        }

        Ok(self.fan_out(principal, group, false).await)
    }

    /// Marker and pending corrections a primary member needs.
    ///
    /// The marker is held iff a group grant is held; pending is cleared once a
    /// group grant is held. Pending is never added.
    pub fn plan_primary_flags(&self, snapshot: &PrincipalSnapshot) -> Vec<Mutation> {
        let principal = snapshot.id;
        let primary = self.primary();
        let affiliated = !self.mapping.group_grants_of(snapshot).is_empty();
        let mut corrections = Vec::new();

        if affiliated && !snapshot.has_grant(self.marker_grant) {
            corrections.push(Mutation::add_grant(primary, principal, self.marker_grant));
        }
        if !affiliated && snapshot.has_grant(self.marker_grant) {
            corrections.push(Mutation::remove_grant(primary, principal, self.marker_grant));
        }
        if let Some(pending) = self.pending_grant {
            if affiliated && snapshot.has_grant(pending) {
                corrections.push(Mutation::remove_grant(primary, principal, pending));
            }
        }
        corrections
    }

    /// Apply the flag corrections of a primary member.
    ///
    /// Returns the number of corrections dispatched.
    pub async fn reconcile_primary_flags(&self, snapshot: &PrincipalSnapshot) -> SyncResult<usize> {
        let mut applied = 0;
        for mutation in &self.plan_primary_flags(snapshot) {
            debug!(mutation = %mutation, "Correcting status flag");
            if self.dispatcher.dispatch(mutation).await?.is_effective() {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// React to a change of a principal's grants on a replica.
    ///
    /// Managed grants that changed are re-checked against the primary and put back
    /// into the authorized state.
    #[instrument(skip(self, before, after), fields(principal = %after.id))]
    pub async fn on_replica_update(
        &self,
        directory: DirectoryId,
        before: &PrincipalSnapshot,
        after: &PrincipalSnapshot,
    ) -> SyncResult<FanOutReport> {
        let delta = diff_grants(before, after);
        let managed = self.mapping.managed_grants_in(directory);
        let changed: BTreeSet<GrantId> = delta
            .added
            .union(&delta.removed)
            .filter(|g| managed.contains(g))
            .copied()
            .collect();
        if changed.is_empty() {
            return Ok(FanOutReport::default());
        }

        let principal = after.id;
        let primary_grants = self.primary_grants(principal).await?;
        let Some(current) = self
            .dispatcher
            .service()
            .fetch_principal(directory, principal)
            .await?
        else {
            return Ok(FanOutReport::default());
        };

        let diff = plan_replica_diff(&self.mapping, directory, &current.grants, &primary_grants);
        let mut report = FanOutReport::default();
        for grant in diff.to_add.intersection(&changed) {
            info!(principal = %principal, directory = %directory, grant = %grant, "Restoring authorized grant");
            let mutation = Mutation::add_grant(directory, principal, *grant);
            let result = self.dispatcher.dispatch(&mutation).await;
            report.record(&mutation, result);
        }
        for grant in diff.to_remove.intersection(&changed) {
            info!(principal = %principal, directory = %directory, grant = %grant, "Removing unauthorized grant");
            let mutation = Mutation::remove_grant(directory, principal, *grant);
            let result = self.dispatcher.dispatch(&mutation).await;
            report.record(&mutation, result);
        }
        Ok(report)
    }

    /// React to a principal joining a directory.
    ///
    /// The notification payload may be stale by the time it is handled, so the
    /// member is read back first. A member that already left needs nothing.
    #[instrument(skip(self, snapshot), fields(principal = %snapshot.id))]
    pub async fn on_principal_joined(
        &self,
        directory: DirectoryId,
        snapshot: &PrincipalSnapshot,
    ) -> SyncResult<FanOutReport> {
        let Some(current) = self
            .dispatcher
            .service()
            .fetch_principal(directory, snapshot.id)
            .await?
        else {
            debug!(directory = %directory, "Joined principal already gone");
            return Ok(FanOutReport::default());
        };

        if directory == self.primary() {
            self.reconcile_primary_flags(&current).await?;
            return Ok(FanOutReport::default());
        }

        let primary_grants = self.primary_grants(current.id).await?;
        Ok(self
            .reconcile_replica_principal(directory, &current, &primary_grants)
            .await)
    }

    /// Bring one principal's managed grants on a replica in line with the primary.
    pub async fn reconcile_replica_principal(
        &self,
        directory: DirectoryId,
        snapshot: &PrincipalSnapshot,
        primary_grants: &BTreeSet<GrantId>,
    ) -> FanOutReport {
        let diff = plan_replica_diff(&self.mapping, directory, &snapshot.grants, primary_grants);
        let mut report = FanOutReport::default();

        let mutations = diff
            .to_add
            .iter()
            .map(|g| Mutation::add_grant(directory, snapshot.id, *g))
            .chain(
                diff.to_remove
                    .iter()
                    .map(|g| Mutation::remove_grant(directory, snapshot.id, *g)),
            );
        for mutation in mutations {
            let result = self.dispatcher.dispatch(&mutation).await;
            report.record(&mutation, result);
        }
        report
    }

    /// Add or remove a group's replica grants on every mapped replica, concurrently.
    async fn fan_out(&self, principal: PrincipalId, group: GrantId, add: bool) -> FanOutReport {
        let Ok(targets) = self.mapping.targets_for(group) else {
            return FanOutReport::default();
        };

        let mutations: Vec<Mutation> = targets
            .iter()
            .map(|(directory, grant)| {
                if add {
                    Mutation::add_grant(*directory, principal, *grant)
                } else {
                    Mutation::remove_grant(*directory, principal, *grant)
                }
            })
            .collect();

        let results = join_all(mutations.iter().map(|m| self.dispatcher.dispatch(m))).await;

        let mut report = FanOutReport::default();
        for (mutation, result) in mutations.iter().zip(results) {
            report.record(mutation, result);
        }
        report
    }
}
