//! Exclusion and expulsion propagation.
//!
//! Exclusions on the primary are mirrored to every replica. A principal leaving
//! the primary is mirrored as an expulsion only when the primary's audit trail
//! attributes it to an administrator; a voluntary leave only strips the grants
//! the engine manages. Attribution is a time-window heuristic and inherently racy
//! against audit trail propagation delay.

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use groupsync_directory::ids::{DirectoryId, PrincipalId};
use groupsync_directory::traits::{AuditOp, DirectoryReader, ExclusionOp};
use groupsync_directory::types::ExpulsionRecord;

use crate::dispatch::{DispatchOutcome, Mutation, MutationDispatcher};
use crate::error::{SyncError, SyncResult};
use crate::mapping::GroupMapping;
use crate::orchestrator::FanOutReport;

const REASON_PREFIX: &str = "primary exclusion sync";

/// How a departure from the primary was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalKind {
    /// Attributed to an administrator: mirrored as an expulsion.
    Expulsion,
    /// No matching audit record: managed grants stripped only.
    VoluntaryLeave,
}

/// Result of propagating a departure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalOutcome {
    pub kind: RemovalKind,
    pub report: FanOutReport,
}

/// Mirrors primary exclusions and expulsions to replicas.
#[derive(Debug, Clone)]
pub struct ExclusionPropagator {
    dispatcher: MutationDispatcher,
    mapping: Arc<GroupMapping>,
    attribution_window: Duration,
}

impl ExclusionPropagator {
    pub fn new(
        dispatcher: MutationDispatcher,
        mapping: Arc<GroupMapping>,
        attribution_window: Duration,
    ) -> Self {
        Self {
            dispatcher,
            mapping,
            attribution_window,
        }
    }

    fn primary(&self) -> DirectoryId {
        self.mapping.primary()
    }

    /// Mirror a primary exclusion to every replica that lacks it.
    #[instrument(skip(self, reason))]
    pub async fn on_exclusion_added(
        &self,
        principal: PrincipalId,
        reason: Option<&str>,
    ) -> FanOutReport {
        let reason = format!("{REASON_PREFIX}: {}", reason.unwrap_or("No reason provided"));
        let replicas = self.mapping.replica_directories();

        let results = join_all(replicas.iter().map(|directory| {
            let mutation = Mutation::AddExclusion {
                directory: *directory,
                principal,
                reason: reason.clone(),
            };
            async move {
                let result = match self
                    .dispatcher
                    .service()
                    .fetch_exclusion(mutation.directory(), principal)
                    .await
                {
                    Ok(Some(_)) => Ok(DispatchOutcome::TargetMissing),
                    Ok(None) => self.dispatcher.dispatch(&mutation).await,
                    Err(e) => Err(SyncError::from(e)),
                };
                (mutation, result)
            }
        }))
        .await;

        let mut report = FanOutReport::default();
        for (mutation, result) in results {
            report.record(&mutation, result);
        }
        info!(principal = %principal, applied = report.applied, "Exclusion propagated");
        report
    }

    /// Lift the mirrored exclusion on every replica that holds one.
    #[instrument(skip(self))]
    pub async fn on_exclusion_removed(&self, principal: PrincipalId) -> FanOutReport {
        let reason = format!("{REASON_PREFIX}: exclusion lifted on primary");
        let replicas = self.mapping.replica_directories();

        let results = join_all(replicas.iter().map(|directory| {
            let mutation = Mutation::RemoveExclusion {
                directory: *directory,
                principal,
                reason: reason.clone(),
            };
            async move {
                let result = match self
                    .dispatcher
                    .service()
                    .fetch_exclusion(mutation.directory(), principal)
                    .await
                {
                    Ok(Some(_)) => self.dispatcher.dispatch(&mutation).await,
                    Ok(None) => Ok(DispatchOutcome::TargetMissing),
                    Err(e) => Err(SyncError::from(e)),
                };
                (mutation, result)
            }
        }))
        .await;

        let mut report = FanOutReport::default();
        for (mutation, result) in results {
            report.record(&mutation, result);
        }
        info!(principal = %principal, applied = report.applied, "Exclusion lift propagated");
        report
    }

    /// Classify a departure from the primary using the audit trail.
    pub async fn classify_removal(&self, principal: PrincipalId) -> Option<ExpulsionRecord> {
        let record = match self
            .dispatcher
            .service()
            .latest_expulsion(self.primary())
            .await
        {
            Ok(record) => record?,
            Err(e) => {
                warn!(principal = %principal, error = %e, "Audit trail unavailable, assuming voluntary leave");
                return None;
            }
        };

        let window = chrono::Duration::from_std(self.attribution_window).ok()?;
        let age = Utc::now().signed_duration_since(record.recorded_at);
        (record.target == principal && age <= window).then_some(record)
    }

    /// React to a principal leaving the primary.
    #[instrument(skip(self))]
    pub async fn on_principal_removed(&self, principal: PrincipalId) -> RemovalOutcome {
        match self.classify_removal(principal).await {
            Some(record) => {
                let reason = format!(
                    "primary expulsion sync: {}",
                    record.reason.as_deref().unwrap_or("No reason provided")
                );
                info!(principal = %principal, actor = ?record.actor.map(u64::from), "Expulsion attributed, mirroring");
                RemovalOutcome {
                    kind: RemovalKind::Expulsion,
                    report: self.expel_everywhere(principal, &reason).await,
                }
            }
            None => {
                info!(principal = %principal, "Voluntary leave, stripping managed grants");
                RemovalOutcome {
                    kind: RemovalKind::VoluntaryLeave,
                    report: self.strip_everywhere(principal).await,
                }
            }
        }
    }

    async fn expel_everywhere(&self, principal: PrincipalId, reason: &str) -> FanOutReport {
        let replicas = self.mapping.replica_directories();
        let results = join_all(replicas.iter().map(|directory| {
            let mutation = Mutation::Expel {
                directory: *directory,
                principal,
                reason: reason.to_string(),
            };
            async move {
                let result = match self
                    .dispatcher
                    .service()
                    .fetch_principal(mutation.directory(), principal)
                    .await
                {
                    Ok(Some(_)) => self.dispatcher.dispatch(&mutation).await,
                    Ok(None) => Ok(DispatchOutcome::TargetMissing),
                    Err(e) => Err(SyncError::from(e)),
                };
                (mutation, result)
            }
        }))
        .await;

        let mut report = FanOutReport::default();
        for (mutation, result) in results {
            report.record(&mutation, result);
        }
        report
    }

    async fn strip_everywhere(&self, principal: PrincipalId) -> FanOutReport {
        let replicas = self.mapping.replica_directories();
        let reports = join_all(
            replicas
                .iter()
                .map(|directory| self.strip_replica(*directory, principal)),
        )
        .await;

        let mut report = FanOutReport::default();
        for r in reports {
            report.merge(r);
        }
        report
    }

    async fn strip_replica(&self, directory: DirectoryId, principal: PrincipalId) -> FanOutReport {
        let mut report = FanOutReport::default();
        let snapshot = match self
            .dispatcher
            .service()
            .fetch_principal(directory, principal)
            .await
        {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return report,
            Err(e) => {
                report.record_read_failure(directory, "fetch_principal", &e);
                return report;
            }
        };

        let managed = self.mapping.managed_grants_in(directory);
        for grant in snapshot.grants.intersection(&managed) {
            let mutation = Mutation::remove_grant(directory, principal, *grant);
            let result = self.dispatcher.dispatch(&mutation).await;
            report.record(&mutation, result);
        }
        report
    }

    /// Copy every primary exclusion to replicas that lack it.
    pub async fn sync_exclusions(&self) -> SyncResult<FanOutReport> {
        let service = self.dispatcher.service();
        let primary_exclusions = service.list_exclusions(self.primary()).await?;
        let mut report = FanOutReport::default();

        for directory in self.mapping.replica_directories() {
            let existing: HashSet<PrincipalId> = match service.list_exclusions(directory).await {
                Ok(list) => list.into_iter().map(|e| e.principal).collect(),
                Err(e) => {
                    report.record_read_failure(directory, "list_exclusions", &e);
                    continue;
                }
            };

            for exclusion in primary_exclusions
                .iter()
                .filter(|e| !existing.contains(&e.principal))
            {
                let mutation = Mutation::AddExclusion {
                    directory,
                    principal: exclusion.principal,
                    reason: format!(
                        "{REASON_PREFIX}: {}",
                        exclusion.reason.as_deref().unwrap_or("No reason provided")
                    ),
                };
                let result = self.dispatcher.dispatch(&mutation).await;
                report.record(&mutation, result);
            }
        }

        Ok(report)
    }
}
