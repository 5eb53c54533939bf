//! Selection sets and exclusivity enforcement.
//!
//! An exclusive set allows a principal at most one of its grants. Once a
//! selection has been made the set is never left empty: an external removal is
//! undone, and when several members end up held the newest one wins.
//!
//! The same module serves the presentation surface: submitting a selection and
//! reading the current one.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use groupsync_directory::error::DirectoryError;
use groupsync_directory::ids::{DirectoryId, GrantId, PrincipalId};
use groupsync_directory::traits::DirectoryReader;
use groupsync_directory::types::PrincipalSnapshot;

use crate::config::{SelectionMode, SelectionOption, SelectionSetConfig};
use crate::dispatch::{Mutation, MutationDispatcher};
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::FanOutReport;

/// Corrections needed to restore exclusivity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExclusivePlan {
    /// Previously held grant to add back.
    pub restore: Option<GrantId>,
    /// Grant kept when several were held.
    pub keep: Option<GrantId>,
    pub remove: BTreeSet<GrantId>,
}

impl ExclusivePlan {
    pub fn is_noop(&self) -> bool {
        self.restore.is_none() && self.remove.is_empty()
    }
}

/// Plan exclusivity corrections for one set between two observations.
pub fn plan_exclusive(
    set: &BTreeSet<GrantId>,
    before: &BTreeSet<GrantId>,
    after: &BTreeSet<GrantId>,
) -> ExclusivePlan {
    let held_before: BTreeSet<GrantId> = before.intersection(set).copied().collect();
    let held_after: BTreeSet<GrantId> = after.intersection(set).copied().collect();

    if held_after.is_empty() {
        return ExclusivePlan {
            restore: held_before.first().copied(),
            ..ExclusivePlan::default()
        };
    }

    if held_after.len() == 1 {
        return ExclusivePlan::default();
    }

    let added: BTreeSet<GrantId> = held_after.difference(&held_before).copied().collect();
    let keep = added
        .first()
        .or_else(|| held_after.first())
        .copied();

    ExclusivePlan {
        restore: None,
        keep,
        remove: held_after
            .into_iter()
            .filter(|g| Some(*g) != keep)
            .collect(),
    }
}

/// Result of a submitted selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SelectionOutcome {
    Applied {
        added: Vec<GrantId>,
        removed: Vec<GrantId>,
    },
    /// The chosen grant was already the only one held.
    AlreadyHeld { grant: GrantId },
    /// Multi-choice submission matching the current state.
    Unchanged,
}

/// Default hold placed on a set while a submitted selection settles.
pub const DEFAULT_SELECTION_HOLD: Duration = Duration::from_secs(30);

/// Sets with a recently submitted selection, keyed by (set, principal).
///
/// Enforcement stays off a held set until the hold expires, which covers the
/// coalesced echo of a submission whose calls were still retrying.
#[derive(Debug)]
pub struct SelectionHolds {
    held: DashMap<(String, PrincipalId), Instant>,
    hold: Duration,
}

impl SelectionHolds {
    #[must_use]
    pub fn new(hold: Duration) -> Self {
        Self {
            held: DashMap::new(),
            hold,
        }
    }

    pub fn hold(&self) -> Duration {
        self.hold
    }

    /// Start or restart the hold.
    pub fn mark(&self, set_id: &str, principal: PrincipalId) {
        self.held.insert((set_id.to_string(), principal), Instant::now());
    }

    pub fn is_held(&self, set_id: &str, principal: PrincipalId) -> bool {
        self.held
            .get(&(set_id.to_string(), principal))
            .is_some_and(|at| at.elapsed() < self.hold)
    }

    /// Remove expired holds, returning how many were removed.
    pub fn evict_expired(&self) -> usize {
        let before = self.held.len();
        let hold = self.hold;
        self.held.retain(|_, at| at.elapsed() < hold);
        before.saturating_sub(self.held.len())
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Exclusivity enforcer and selection surface.
#[derive(Debug, Clone)]
pub struct ExclusivityEnforcer {
    dispatcher: MutationDispatcher,
    sets: Arc<Vec<SelectionSetConfig>>,
    holds: Arc<SelectionHolds>,
}

impl ExclusivityEnforcer {
    pub fn new(dispatcher: MutationDispatcher, sets: Vec<SelectionSetConfig>) -> Self {
        Self {
            dispatcher,
            sets: Arc::new(sets),
            holds: Arc::new(SelectionHolds::new(DEFAULT_SELECTION_HOLD)),
        }
    }

    /// Replace the selection hold duration.
    #[must_use]
    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.holds = Arc::new(SelectionHolds::new(hold));
        self
    }

    pub fn holds(&self) -> &SelectionHolds {
        &self.holds
    }

    pub fn sets(&self) -> &[SelectionSetConfig] {
        &self.sets
    }

    /// Whether any exclusive set lives in the directory.
    pub fn watches(&self, directory: DirectoryId) -> bool {
        self.sets
            .iter()
            .any(|s| s.directory == directory && s.mode == SelectionMode::Exclusive)
    }

    fn set(&self, set_id: &str) -> SyncResult<&SelectionSetConfig> {
        self.sets
            .iter()
            .find(|s| s.id == set_id)
            .ok_or_else(|| SyncError::invalid_selection(format!("unknown selection set '{set_id}'")))
    }

    async fn fetch(&self, directory: DirectoryId, principal: PrincipalId) -> SyncResult<PrincipalSnapshot> {
        self.dispatcher
            .service()
            .fetch_principal(directory, principal)
            .await?
            .ok_or_else(|| DirectoryError::not_found("principal", principal).into())
    }

    /// Enforce every exclusive set of a directory after an observed change.
    ///
    /// Sets with an in-flight mutation or a held selection for the principal are
    /// skipped so the engine never reacts to its own writes.
    #[instrument(skip(self, before), fields(principal = %before.id))]
    pub async fn enforce(
        &self,
        directory: DirectoryId,
        before: &PrincipalSnapshot,
    ) -> SyncResult<FanOutReport> {
        let mut report = FanOutReport::default();
        if !self.watches(directory) {
            return Ok(report);
        }

        let principal = before.id;
        let Some(current) = self
            .dispatcher
            .service()
            .fetch_principal(directory, principal)
            .await?
        else {
            return Ok(report);
        };

        for set in self
            .sets
            .iter()
            .filter(|s| s.directory == directory && s.mode == SelectionMode::Exclusive)
        {
            if self.holds.is_held(&set.id, principal) {
                debug!(set = %set.id, "Selection recently submitted, skipping enforcement");
                continue;
            }

            let grants = set.grants();
            let dedup = self.dispatcher.dedup();
            if grants
                .iter()
                .any(|g| dedup.is_in_flight(principal, directory, *g))
            {
                debug!(set = %set.id, "Selection change in flight, skipping enforcement");
                continue;
            }

            let plan = plan_exclusive(&grants, &before.grants, &current.grants);
            if plan.is_noop() {
                continue;
            }

            info!(set = %set.id, ?plan, "Enforcing exclusive selection");
            let mutations = plan
                .restore
                .map(|g| Mutation::add_grant(directory, principal, g))
                .into_iter()
                .chain(
                    plan.remove
                        .iter()
                        .map(|g| Mutation::remove_grant(directory, principal, *g)),
                );
            for mutation in mutations {
                let result = self.dispatcher.dispatch(&mutation).await;
                report.record(&mutation, result);
            }
        }

        Ok(report)
    }

    /// Apply a selection submitted by the presentation surface.
    #[instrument(skip(self, chosen))]
    pub async fn submit_selection(
        &self,
        principal: PrincipalId,
        directory: DirectoryId,
        chosen: &[GrantId],
        set_id: &str,
    ) -> SyncResult<SelectionOutcome> {
        let set = self.set(set_id)?;
        if set.directory != directory {
            return Err(SyncError::invalid_selection(format!(
                "selection set '{set_id}' does not belong to directory {directory}"
            )));
        }
        if let Some(stray) = chosen.iter().find(|g| !set.contains(**g)) {
            return Err(SyncError::invalid_selection(format!(
                "grant {stray} is not part of selection set '{set_id}'"
            )));
        }

        let current = self.fetch(directory, principal).await?;
        let held: BTreeSet<GrantId> = current.grants.intersection(&set.grants()).copied().collect();

        match set.mode {
            SelectionMode::Exclusive => {
                let [grant] = chosen else {
                    return Err(SyncError::invalid_selection(format!(
                        "selection set '{set_id}' takes exactly one grant"
                    )));
                };
                self.holds.mark(set_id, principal);
                let outcome = self.select_exclusive(principal, directory, *grant, &held).await;
                // Rearm so the hold outlasts the echo of the final write
                self.holds.mark(set_id, principal);
                outcome
            }
            SelectionMode::Multiple => {
                let wanted: BTreeSet<GrantId> = chosen.iter().copied().collect();
                self.select_multiple(principal, directory, &wanted, &held).await
            }
        }
    }

    async fn select_exclusive(
        &self,
        principal: PrincipalId,
        directory: DirectoryId,
        grant: GrantId,
        held: &BTreeSet<GrantId>,
    ) -> SyncResult<SelectionOutcome> {
        if held.len() == 1 && held.contains(&grant) {
            return Ok(SelectionOutcome::AlreadyHeld { grant });
        }

        let previous: Vec<GrantId> = held.iter().copied().filter(|g| *g != grant).collect();
        for old in &previous {
            self.dispatcher
                .dispatch(&Mutation::remove_grant(directory, principal, *old))
                .await?;
        }

        if !held.contains(&grant) {
            if let Err(e) = self
                .dispatcher
                .dispatch(&Mutation::add_grant(directory, principal, grant))
                .await
            {
                warn!(principal = %principal, grant = %grant, error = %e, "Selection failed, restoring previous grant");
                for old in &previous {
                    let rollback = Mutation::add_grant(directory, principal, *old);
                    self.dispatcher.dedup().release(&rollback.key());
                    if let Err(rollback_err) = self.dispatcher.dispatch(&rollback).await {
                        warn!(grant = %old, error = %rollback_err, "Rollback failed");
                    }
                }
                return Err(e);
            }
        }

        info!(principal = %principal, grant = %grant, "Selection applied");
        Ok(SelectionOutcome::Applied {
            added: if held.contains(&grant) { Vec::new() } else { vec![grant] },
            removed: previous,
        })
    }

    async fn select_multiple(
        &self,
        principal: PrincipalId,
        directory: DirectoryId,
        wanted: &BTreeSet<GrantId>,
        held: &BTreeSet<GrantId>,
    ) -> SyncResult<SelectionOutcome> {
        let to_add: Vec<GrantId> = wanted.difference(held).copied().collect();
        let to_remove: Vec<GrantId> = held.difference(wanted).copied().collect();
        if to_add.is_empty() && to_remove.is_empty() {
            return Ok(SelectionOutcome::Unchanged);
        }

        let mut report = FanOutReport::default();
        let mutations = to_add
            .iter()
            .map(|g| Mutation::add_grant(directory, principal, *g))
            .chain(
                to_remove
                    .iter()
                    .map(|g| Mutation::remove_grant(directory, principal, *g)),
            );
        for mutation in mutations {
            let result = self.dispatcher.dispatch(&mutation).await;
            report.record(&mutation, result);
        }

        if !report.is_complete() {
            return Err(SyncError::partial_failure(
                "selection",
                report.failures.len(),
                report.attempted,
            ));
        }

        Ok(SelectionOutcome::Applied {
            added: to_add,
            removed: to_remove,
        })
    }

    /// The option of a selection set the principal currently holds.
    ///
    /// For multi-choice sets, the first held option in configured order.
    pub async fn current_grant(
        &self,
        principal: PrincipalId,
        set_id: &str,
    ) -> SyncResult<Option<SelectionOption>> {
        let set = self.set(set_id)?;
        let Some(snapshot) = self
            .dispatcher
            .service()
            .fetch_principal(set.directory, principal)
            .await?
        else {
            return Ok(None);
        };

        Ok(set
            .options
            .iter()
            .find(|o| snapshot.has_grant(o.grant))
            .cloned())
    }
}
