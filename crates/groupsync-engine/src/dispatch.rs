//! Mutation dispatch.
//!
//! Every mutating call goes through the same path:
//! deduplicator -> dry-run short-circuit -> retry executor -> directory service.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use groupsync_directory::error::DirectoryResult;
use groupsync_directory::ids::{DirectoryId, GrantId, PrincipalId};
use groupsync_directory::resilience::RetryExecutor;
use groupsync_directory::traits::{ExclusionOp, ExpulsionOp, GrantOp};
use groupsync_directory::types::ActionKind;
use groupsync_directory::DirectoryService;

use crate::dedup::{OperationDeduplicator, OperationKey};
use crate::error::SyncResult;

/// Shared handle to the directory service.
pub type SharedDirectory = Arc<dyn DirectoryService>;

/// A mutating call against one directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Mutation {
    AddGrant {
        directory: DirectoryId,
        principal: PrincipalId,
        grant: GrantId,
    },
    RemoveGrant {
        directory: DirectoryId,
        principal: PrincipalId,
        grant: GrantId,
    },
    AddExclusion {
        directory: DirectoryId,
        principal: PrincipalId,
        reason: String,
    },
    RemoveExclusion {
        directory: DirectoryId,
        principal: PrincipalId,
        reason: String,
    },
    Expel {
        directory: DirectoryId,
        principal: PrincipalId,
        reason: String,
    },
}

impl Mutation {
    pub fn add_grant(directory: DirectoryId, principal: PrincipalId, grant: GrantId) -> Self {
        Self::AddGrant {
            directory,
            principal,
            grant,
        }
    }

    pub fn remove_grant(directory: DirectoryId, principal: PrincipalId, grant: GrantId) -> Self {
        Self::RemoveGrant {
            directory,
            principal,
            grant,
        }
    }

    pub fn action(&self) -> ActionKind {
        match self {
            Self::AddGrant { .. } => ActionKind::AddGrant,
            Self::RemoveGrant { .. } => ActionKind::RemoveGrant,
            Self::AddExclusion { .. } => ActionKind::AddExclusion,
            Self::RemoveExclusion { .. } => ActionKind::RemoveExclusion,
            Self::Expel { .. } => ActionKind::Expel,
        }
    }

    pub fn directory(&self) -> DirectoryId {
        match self {
            Self::AddGrant { directory, .. }
            | Self::RemoveGrant { directory, .. }
            | Self::AddExclusion { directory, .. }
            | Self::RemoveExclusion { directory, .. }
            | Self::Expel { directory, .. } => *directory,
        }
    }

    pub fn principal(&self) -> PrincipalId {
        match self {
            Self::AddGrant { principal, .. }
            | Self::RemoveGrant { principal, .. }
            | Self::AddExclusion { principal, .. }
            | Self::RemoveExclusion { principal, .. }
            | Self::Expel { principal, .. } => *principal,
        }
    }

    pub fn grant(&self) -> Option<GrantId> {
        match self {
            Self::AddGrant { grant, .. } | Self::RemoveGrant { grant, .. } => Some(*grant),
            _ => None,
        }
    }

    /// Dedup key of the mutation.
    pub fn key(&self) -> OperationKey {
        OperationKey {
            principal: self.principal(),
            directory: self.directory(),
            grant: self.grant(),
            action: self.action(),
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// What happened to a dispatched mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The directory service accepted the call.
    Applied,
    /// Dry run: the call was logged, not issued.
    DryRun,
    /// A live record for the same key exists; dropped.
    Suppressed,
    /// The principal, grant or directory no longer exists; skipped.
    TargetMissing,
}

impl DispatchOutcome {
    /// Whether the mutation counts as performed (live or simulated).
    pub fn is_effective(self) -> bool {
        matches!(self, Self::Applied | Self::DryRun)
    }
}

/// Issues mutations through the shared deduplicator and retry executor.
#[derive(Clone)]
pub struct MutationDispatcher {
    service: SharedDirectory,
    dedup: Arc<OperationDeduplicator>,
    retry: RetryExecutor,
    dry_run: bool,
}

impl fmt::Debug for MutationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationDispatcher")
            .field("retry", &self.retry)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

impl MutationDispatcher {
    pub fn new(
        service: SharedDirectory,
        dedup: Arc<OperationDeduplicator>,
        retry: RetryExecutor,
        dry_run: bool,
    ) -> Self {
        Self {
            service,
            dedup,
            retry,
            dry_run,
        }
    }

    pub fn dedup(&self) -> &Arc<OperationDeduplicator> {
        &self.dedup
    }

    pub fn service(&self) -> &SharedDirectory {
        &self.service
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Dispatch one mutation.
    ///
    /// A failure that survives every retry releases the dedup record and is
    /// returned; a missing target is reported as [`DispatchOutcome::TargetMissing`].
    #[instrument(skip(self, mutation), fields(key = %mutation.key()))]
    pub async fn dispatch(&self, mutation: &Mutation) -> SyncResult<DispatchOutcome> {
        let key = mutation.key();

        if !self.dedup.try_acquire(&key) {
            debug!("Duplicate mutation suppressed");
            return Ok(DispatchOutcome::Suppressed);
        }

        info!(
            action = %mutation.action(),
            directory = %mutation.directory(),
            principal = %mutation.principal(),
            grant = ?mutation.grant().map(u64::from),
            dry_run = self.dry_run,
            "Dispatching mutation"
        );

        if self.dry_run {
            return Ok(DispatchOutcome::DryRun);
        }

        match self.retry.execute(|| self.apply(mutation)).await {
            Ok(()) => Ok(DispatchOutcome::Applied),
            Err(e) if e.is_not_found() => {
                debug!(error = %e, "Mutation target missing, skipping");
                Ok(DispatchOutcome::TargetMissing)
            }
            Err(e) => {
                self.dedup.release(&key);
                warn!(error = %e, code = e.error_code(), "Mutation failed");
                Err(e.into())
            }
        }
    }

    async fn apply(&self, mutation: &Mutation) -> DirectoryResult<()> {
        match mutation {
            Mutation::AddGrant {
                directory,
                principal,
                grant,
            } => self.service.add_grant(*directory, *principal, *grant).await,
            Mutation::RemoveGrant {
                directory,
                principal,
                grant,
            } => {
                self.service
                    .remove_grant(*directory, *principal, *grant)
                    .await
            }
            Mutation::AddExclusion {
                directory,
                principal,
                reason,
            } => {
                self.service
                    .add_exclusion(*directory, *principal, reason)
                    .await
            }
            Mutation::RemoveExclusion {
                directory,
                principal,
                reason,
            } => {
                self.service
                    .remove_exclusion(*directory, *principal, reason)
                    .await
            }
            Mutation::Expel {
                directory,
                principal,
                reason,
            } => {
                self.service
                    .remove_principal(*directory, *principal, reason)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use groupsync_directory::error::DirectoryError;
    use groupsync_directory::memory::{FailureMode, InMemoryDirectoryService};
    use groupsync_directory::resilience::RetryConfig;
    use groupsync_directory::types::PrincipalSnapshot;
    use std::time::Duration;

    const DIR: DirectoryId = DirectoryId::new(1);
    const ALICE: PrincipalId = PrincipalId::new(100);
    const ROLE: GrantId = GrantId::new(10);

    fn service() -> Arc<InMemoryDirectoryService> {
        Arc::new(
            InMemoryDirectoryService::new()
                .with_directory(DIR, "main")
                .with_grant(DIR, ROLE, "Tsunami")
                .with_principal(DIR, PrincipalSnapshot::new(ALICE, "alice")),
        )
    }

    fn dispatcher(service: Arc<InMemoryDirectoryService>, dry_run: bool) -> MutationDispatcher {
        MutationDispatcher::new(
            service,
            Arc::new(OperationDeduplicator::new(Duration::from_secs(1))),
            RetryExecutor::new(RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
                jitter: false,
                attempt_timeout: Duration::from_secs(1),
            }),
            dry_run,
        )
    }

    #[tokio::test]
    async fn test_duplicate_dispatch_issues_one_call() {
        let service = service();
        let dispatcher = dispatcher(service.clone(), false);
        let mutation = Mutation::add_grant(DIR, ALICE, ROLE);

        assert_eq!(
            dispatcher.dispatch(&mutation).await.unwrap(),
            DispatchOutcome::Applied
        );
        assert_eq!(
            dispatcher.dispatch(&mutation).await.unwrap(),
            DispatchOutcome::Suppressed
        );
        assert_eq!(service.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_records_key_without_calling() {
        let service = service();
        let dispatcher = dispatcher(service.clone(), true);
        let mutation = Mutation::add_grant(DIR, ALICE, ROLE);

        assert_eq!(
            dispatcher.dispatch(&mutation).await.unwrap(),
            DispatchOutcome::DryRun
        );
        assert!(service.calls().is_empty());
        assert!(dispatcher.dedup().is_live(&mutation.key()));
    }

    #[tokio::test]
    async fn test_missing_target_is_skipped() {
        let service = service();
        let dispatcher = dispatcher(service.clone(), false);

        let outcome = dispatcher
            .dispatch(&Mutation::add_grant(DIR, PrincipalId::new(999), ROLE))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::TargetMissing);
    }

    #[tokio::test]
    async fn test_exhausted_failure_releases_record() {
        let service = service();
        service.inject_failure(DIR, FailureMode::Unavailable, None, false);
        let dispatcher = dispatcher(service.clone(), false);
        let mutation = Mutation::add_grant(DIR, ALICE, ROLE);

        let err = dispatcher.dispatch(&mutation).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(service.calls().len(), 3);
        assert!(!dispatcher.dedup().is_live(&mutation.key()));

        service.clear_failure(DIR);
        assert_eq!(
            dispatcher.dispatch(&mutation).await.unwrap(),
            DispatchOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_within_budget() {
        let service = service();
        service.inject_failure(DIR, FailureMode::RateLimited, Some(2), false);
        let dispatcher = dispatcher(service.clone(), false);

        let outcome = dispatcher
            .dispatch(&Mutation::add_grant(DIR, ALICE, ROLE))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Applied);
        assert!(service.grants_of(DIR, ALICE).unwrap().contains(&ROLE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_times_out_and_releases_record() {
        let service = service();
        service.inject_failure(DIR, FailureMode::Hang, None, false);
        let dispatcher = dispatcher(service.clone(), false);
        let mutation = Mutation::add_grant(DIR, ALICE, ROLE);
        let start = tokio::time::Instant::now();

        let err = dispatcher.dispatch(&mutation).await.unwrap_err();

        assert!(matches!(
            err,
            SyncError::Directory(DirectoryError::Timeout { timeout_ms: 1_000 })
        ));
        assert!(err.is_retryable());
        // Three one-second attempts plus the backoff between them
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(!dispatcher.dedup().is_live(&mutation.key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_hang_is_retried() {
        let service = service();
        service.inject_failure(DIR, FailureMode::Hang, Some(1), false);
        let dispatcher = dispatcher(service.clone(), false);

        let outcome = dispatcher
            .dispatch(&Mutation::add_grant(DIR, ALICE, ROLE))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Applied);
        assert!(service.grants_of(DIR, ALICE).unwrap().contains(&ROLE));
    }

    #[test]
    fn test_mutation_key() {
        let mutation = Mutation::Expel {
            directory: DIR,
            principal: ALICE,
            reason: "kick".into(),
        };
        assert_eq!(mutation.key().grant, None);
        assert_eq!(mutation.key().action, ActionKind::Expel);
    }
}
