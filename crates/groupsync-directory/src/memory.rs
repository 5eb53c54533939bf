//! In-memory directory service.
//!
//! Holds a complete copy of one or more directories in process memory. Used by the
//! `plan` command to replay a reconciliation pass against an exported snapshot, and
//! by tests to observe every call the engine makes (with optional failure injection).
//!
//! Mutations emit the same raw notifications a live subscription would, so observer
//! races between the engine's own writes and its event feed can be reproduced.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;

use crate::error::{DirectoryError, DirectoryResult};
use crate::feed::RawDirectoryEvent;
use crate::ids::{DirectoryId, GrantId, PrincipalId};
use crate::traits::{AuditOp, DirectoryReader, ExclusionOp, ExpulsionOp, GrantOp};
use crate::types::{
    ActionKind, DirectoryInfo, Exclusion, ExpulsionRecord, GrantInfo, Page, PageRequest,
    PrincipalSnapshot,
};

/// Serialized form of one directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub id: DirectoryId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub grants: Vec<GrantInfo>,
    #[serde(default)]
    pub principals: Vec<PrincipalSnapshot>,
    #[serde(default)]
    pub exclusions: Vec<Exclusion>,
    #[serde(default)]
    pub expulsions: Vec<ExpulsionRecord>,
}

/// Serialized form of a whole service (every directory it reaches).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    #[serde(default)]
    pub directories: Vec<DirectorySnapshot>,
}

/// One mutating call observed by the in-memory service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedCall {
    pub directory: DirectoryId,
    pub principal: PrincipalId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant: Option<GrantId>,
    pub action: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Whether the call succeeded.
    pub succeeded: bool,
}

/// Kind of error produced by an injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Transient unavailability (retried by callers).
    Unavailable,
    /// Rate limit rejection (retried by callers).
    RateLimited,
    /// Permission failure (not retried).
    Forbidden,
    /// The call never returns.
    Hang,
}

impl FailureMode {
    fn into_error(self, directory: DirectoryId) -> Option<DirectoryError> {
        match self {
            FailureMode::Unavailable => Some(DirectoryError::unavailable(
                directory,
                "injected unavailability",
            )),
            FailureMode::RateLimited => Some(DirectoryError::RateLimited {
                retry_after_ms: None,
            }),
            FailureMode::Forbidden => Some(DirectoryError::forbidden("injected", directory)),
            FailureMode::Hang => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct InjectedFailure {
    mode: FailureMode,
    /// Remaining failing calls, `None` for every call.
    remaining: Option<usize>,
    /// Whether reads fail too.
    include_reads: bool,
}

impl InjectedFailure {
    /// Count one call against the failure. False once it is used up.
    fn consume(&mut self) -> bool {
        match self.remaining {
            Some(0) => false,
            Some(ref mut n) => {
                *n -= 1;
                true
            }
            None => true,
        }
    }
}

#[derive(Debug, Default)]
struct DirectoryState {
    name: String,
    grants: BTreeMap<GrantId, String>,
    principals: BTreeMap<PrincipalId, PrincipalSnapshot>,
    exclusions: BTreeMap<PrincipalId, Option<String>>,
    expulsions: Vec<ExpulsionRecord>,
}

/// Directory service backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryDirectoryService {
    directories: RwLock<BTreeMap<DirectoryId, DirectoryState>>,
    calls: Mutex<Vec<RecordedCall>>,
    failures: Mutex<HashMap<DirectoryId, InjectedFailure>>,
    grant_failures: Mutex<HashMap<(DirectoryId, GrantId), InjectedFailure>>,
    events: Mutex<Option<mpsc::UnboundedSender<RawDirectoryEvent>>>,
}

impl InMemoryDirectoryService {
    /// Create an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a service from a serialized snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: ServiceSnapshot) -> Self {
        let service = Self::new();
        {
            let mut directories = service.write_state();
            for dir in snapshot.directories {
                let mut state = DirectoryState {
                    name: dir.name,
                    ..DirectoryState::default()
                };
                for grant in dir.grants {
                    state.grants.insert(grant.id, grant.name);
                }
                for principal in dir.principals {
                    register_grants(&mut state, &principal);
                    state.principals.insert(principal.id, principal);
                }
                for exclusion in dir.exclusions {
                    state.exclusions.insert(exclusion.principal, exclusion.reason);
                }
                state.expulsions = dir.expulsions;
                directories.insert(dir.id, state);
            }
        }
        service
    }

    /// Export the current state.
    #[must_use]
    pub fn snapshot(&self) -> ServiceSnapshot {
        let directories = self.read_state();
        ServiceSnapshot {
            directories: directories
                .iter()
                .map(|(id, state)| DirectorySnapshot {
                    id: *id,
                    name: state.name.clone(),
                    grants: state
                        .grants
                        .iter()
                        .map(|(id, name)| GrantInfo {
                            id: *id,
                            name: name.clone(),
                        })
                        .collect(),
                    principals: state.principals.values().cloned().collect(),
                    exclusions: state
                        .exclusions
                        .iter()
                        .map(|(principal, reason)| Exclusion {
                            principal: *principal,
                            reason: reason.clone(),
                        })
                        .collect(),
                    expulsions: state.expulsions.clone(),
                })
                .collect(),
        }
    }

    /// Builder: add a directory.
    #[must_use]
    pub fn with_directory(self, id: DirectoryId, name: impl Into<String>) -> Self {
        self.write_state().entry(id).or_default().name = name.into();
        self
    }

    /// Builder: add a grant to a directory's catalog.
    #[must_use]
    pub fn with_grant(self, directory: DirectoryId, grant: GrantId, name: impl Into<String>) -> Self {
        self.write_state()
            .entry(directory)
            .or_default()
            .grants
            .insert(grant, name.into());
        self
    }

    /// Builder: add a member. Unknown grants held by the member are added to the catalog.
    #[must_use]
    pub fn with_principal(self, directory: DirectoryId, principal: PrincipalSnapshot) -> Self {
        self.insert_principal(directory, principal);
        self
    }

    /// Builder: add an exclusion.
    #[must_use]
    pub fn with_exclusion(
        self,
        directory: DirectoryId,
        principal: PrincipalId,
        reason: Option<&str>,
    ) -> Self {
        self.write_state()
            .entry(directory)
            .or_default()
            .exclusions
            .insert(principal, reason.map(str::to_string));
        self
    }

    /// Insert or replace a member without emitting notifications.
    pub fn insert_principal(&self, directory: DirectoryId, principal: PrincipalSnapshot) {
        let mut directories = self.write_state();
        let state = directories.entry(directory).or_default();
        register_grants(state, &principal);
        state.principals.insert(principal.id, principal);
    }

    /// Remove a member without emitting notifications.
    pub fn remove_member(&self, directory: DirectoryId, principal: PrincipalId) {
        if let Some(state) = self.write_state().get_mut(&directory) {
            state.principals.remove(&principal);
        }
    }

    /// Append an administrative removal to a directory's audit trail.
    pub fn record_expulsion(&self, directory: DirectoryId, record: ExpulsionRecord) {
        self.write_state()
            .entry(directory)
            .or_default()
            .expulsions
            .push(record);
    }

    /// Make calls against a directory fail.
    ///
    /// `remaining` bounds the number of failing calls (`None` fails forever);
    /// `include_reads` extends the failure to read calls.
    pub fn inject_failure(
        &self,
        directory: DirectoryId,
        mode: FailureMode,
        remaining: Option<usize>,
        include_reads: bool,
    ) {
        lock(&self.failures).insert(
            directory,
            InjectedFailure {
                mode,
                remaining,
                include_reads,
            },
        );
    }

    /// Make every add or remove of one grant fail.
    pub fn inject_grant_failure(&self, directory: DirectoryId, grant: GrantId, mode: FailureMode) {
        self.inject_grant_failures(directory, grant, mode, None);
    }

    /// Make the next `remaining` adds or removes of one grant fail (`None` for all).
    pub fn inject_grant_failures(
        &self,
        directory: DirectoryId,
        grant: GrantId,
        mode: FailureMode,
        remaining: Option<usize>,
    ) {
        lock(&self.grant_failures).insert(
            (directory, grant),
            InjectedFailure {
                mode,
                remaining,
                include_reads: false,
            },
        );
    }

    /// Clear injected failures for a directory.
    pub fn clear_failure(&self, directory: DirectoryId) {
        lock(&self.failures).remove(&directory);
        lock(&self.grant_failures).retain(|(dir, _), _| *dir != directory);
    }

    /// Start emitting raw notifications for every state-changing mutation.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RawDirectoryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.events) = Some(tx);
        rx
    }

    /// Every mutating call observed so far, including failed attempts.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Calls matching an action kind.
    #[must_use]
    pub fn calls_of(&self, action: ActionKind) -> Vec<RecordedCall> {
        lock(&self.calls)
            .iter()
            .filter(|call| call.action == action)
            .cloned()
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Current grants of a member, `None` if not a member.
    #[must_use]
    pub fn grants_of(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
    ) -> Option<std::collections::BTreeSet<GrantId>> {
        self.read_state()
            .get(&directory)
            .and_then(|state| state.principals.get(&principal))
            .map(|snapshot| snapshot.grants.clone())
    }

    /// Whether a principal is a member of a directory.
    #[must_use]
    pub fn is_member(&self, directory: DirectoryId, principal: PrincipalId) -> bool {
        self.grants_of(directory, principal).is_some()
    }

    /// Whether a principal is excluded from a directory.
    #[must_use]
    pub fn is_excluded(&self, directory: DirectoryId, principal: PrincipalId) -> bool {
        self.read_state()
            .get(&directory)
            .is_some_and(|state| state.exclusions.contains_key(&principal))
    }

    fn read_state(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<DirectoryId, DirectoryState>> {
        self.directories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, BTreeMap<DirectoryId, DirectoryState>> {
        self.directories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Consume one injected failure for the directory, if any applies.
    fn take_failure(&self, directory: DirectoryId, is_read: bool) -> Option<FailureMode> {
        let mut failures = lock(&self.failures);
        let failure = failures.get_mut(&directory)?;
        if is_read && !failure.include_reads {
            return None;
        }
        if failure.consume() {
            Some(failure.mode)
        } else {
            failures.remove(&directory);
            None
        }
    }

    /// Consume one injected failure for a grant, if any applies.
    fn take_grant_failure(&self, directory: DirectoryId, grant: GrantId) -> Option<FailureMode> {
        let mut failures = lock(&self.grant_failures);
        let failure = failures.get_mut(&(directory, grant))?;
        if failure.consume() {
            Some(failure.mode)
        } else {
            failures.remove(&(directory, grant));
            None
        }
    }

    /// Apply an injected failure: return its error, or never return for a hang.
    async fn fail(mode: Option<FailureMode>, directory: DirectoryId) -> DirectoryResult<()> {
        match mode.map(|m| m.into_error(directory)) {
            None => Ok(()),
            Some(Some(err)) => Err(err),
            Some(None) => std::future::pending().await,
        }
    }

    async fn gate_read(&self, directory: DirectoryId) -> DirectoryResult<()> {
        Self::fail(self.take_failure(directory, true), directory).await
    }

    fn record(&self, call: RecordedCall) {
        lock(&self.calls).push(call);
    }

    fn emit(&self, event: RawDirectoryEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Run a mutation with failure injection and call recording.
    ///
    /// `injected` is a grant-level failure already taken by the caller.
    #[allow(clippy::too_many_arguments)]
    async fn mutate<F>(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
        grant: Option<GrantId>,
        action: ActionKind,
        reason: Option<&str>,
        injected: Option<FailureMode>,
        apply: F,
    ) -> DirectoryResult<()>
    where
        F: FnOnce(&mut DirectoryState) -> DirectoryResult<Vec<RawDirectoryEvent>> + Send,
    {
        let injected = injected.or_else(|| self.take_failure(directory, false));
        let result = match Self::fail(injected, directory).await {
            Err(err) => Err(err),
            Ok(()) => {
                let mut directories = self.write_state();
                match directories.get_mut(&directory) {
                    Some(state) => apply(state),
                    None => Err(DirectoryError::not_found("directory", directory)),
                }
            }
        };

        self.record(RecordedCall {
            directory,
            principal,
            grant,
            action,
            reason: reason.map(str::to_string),
            succeeded: result.is_ok(),
        });

        result.map(|events| {
            for event in events {
                self.emit(event);
            }
        })
    }

    async fn change_grant(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
        grant: GrantId,
        add: bool,
    ) -> DirectoryResult<()> {
        let action = if add {
            ActionKind::AddGrant
        } else {
            ActionKind::RemoveGrant
        };
        let injected = self.take_grant_failure(directory, grant);
        self.mutate(directory, principal, Some(grant), action, None, injected, |state| {
            if !state.grants.contains_key(&grant) {
                return Err(DirectoryError::not_found("grant", grant));
            }
            let member = state
                .principals
                .get_mut(&principal)
                .ok_or_else(|| DirectoryError::not_found("principal", principal))?;
            let before = member.clone();
            let changed = if add {
                member.grants.insert(grant)
            } else {
                member.grants.remove(&grant)
            };
            if !changed {
                return Ok(Vec::new());
            }
            Ok(vec![RawDirectoryEvent::PrincipalUpdated {
                directory,
                before,
                after: member.clone(),
            }])
        })
        .await
    }
}

fn register_grants(state: &mut DirectoryState, principal: &PrincipalSnapshot) {
    for grant in &principal.grants {
        state
            .grants
            .entry(*grant)
            .or_insert_with(|| format!("grant-{grant}"));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl DirectoryReader for InMemoryDirectoryService {
    async fn fetch_directory(
        &self,
        directory: DirectoryId,
    ) -> DirectoryResult<Option<DirectoryInfo>> {
        self.gate_read(directory).await?;
        Ok(self.read_state().get(&directory).map(|state| DirectoryInfo {
            id: directory,
            name: state.name.clone(),
        }))
    }

    async fn fetch_principal(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
    ) -> DirectoryResult<Option<PrincipalSnapshot>> {
        self.gate_read(directory).await?;
        let directories = self.read_state();
        let state = directories
            .get(&directory)
            .ok_or_else(|| DirectoryError::not_found("directory", directory))?;
        Ok(state.principals.get(&principal).cloned())
    }

    async fn fetch_grant(
        &self,
        directory: DirectoryId,
        grant: GrantId,
    ) -> DirectoryResult<Option<GrantInfo>> {
        self.gate_read(directory).await?;
        let directories = self.read_state();
        let state = directories
            .get(&directory)
            .ok_or_else(|| DirectoryError::not_found("directory", directory))?;
        Ok(state.grants.get(&grant).map(|name| GrantInfo {
            id: grant,
            name: name.clone(),
        }))
    }

    async fn list_principals(
        &self,
        directory: DirectoryId,
        page: PageRequest,
    ) -> DirectoryResult<Page<PrincipalSnapshot>> {
        self.gate_read(directory).await?;
        let directories = self.read_state();
        let state = directories
            .get(&directory)
            .ok_or_else(|| DirectoryError::not_found("directory", directory))?;

        let limit = page.limit.clamp(1, PageRequest::MAX_LIMIT);
        let mut remaining = state
            .principals
            .values()
            .filter(|p| page.after.map_or(true, |after| p.id > after));
        let items: Vec<PrincipalSnapshot> = remaining.by_ref().take(limit).cloned().collect();
        let next = if remaining.next().is_some() {
            items.last().map(|p| p.id)
        } else {
            None
        };

        Ok(Page { items, next })
    }
}

#[async_trait]
impl GrantOp for InMemoryDirectoryService {
    async fn add_grant(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
        grant: GrantId,
    ) -> DirectoryResult<()> {
        self.change_grant(directory, principal, grant, true).await
    }

    async fn remove_grant(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
        grant: GrantId,
    ) -> DirectoryResult<()> {
        self.change_grant(directory, principal, grant, false).await
    }
}

#[async_trait]
impl ExclusionOp for InMemoryDirectoryService {
    async fn list_exclusions(&self, directory: DirectoryId) -> DirectoryResult<Vec<Exclusion>> {
        self.gate_read(directory).await?;
        let directories = self.read_state();
        let state = directories
            .get(&directory)
            .ok_or_else(|| DirectoryError::not_found("directory", directory))?;
        Ok(state
            .exclusions
            .iter()
            .map(|(principal, reason)| Exclusion {
                principal: *principal,
                reason: reason.clone(),
            })
            .collect())
    }

    async fn fetch_exclusion(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
    ) -> DirectoryResult<Option<Exclusion>> {
        self.gate_read(directory).await?;
        let directories = self.read_state();
        let state = directories
            .get(&directory)
            .ok_or_else(|| DirectoryError::not_found("directory", directory))?;
        Ok(state.exclusions.get(&principal).map(|reason| Exclusion {
            principal,
            reason: reason.clone(),
        }))
    }

    async fn add_exclusion(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
        reason: &str,
    ) -> DirectoryResult<()> {
        let action = ActionKind::AddExclusion;
        self.mutate(directory, principal, None, action, Some(reason), None, |state| {
            let mut events = Vec::new();
            if state
                .exclusions
                .insert(principal, Some(reason.to_string()))
                .is_none()
            {
                events.push(RawDirectoryEvent::ExclusionAdded {
                    directory,
                    principal,
                    reason: Some(reason.to_string()),
                });
            }
            // An exclusion also removes the member
            if let Some(member) = state.principals.remove(&principal) {
                events.push(RawDirectoryEvent::PrincipalLeft {
                    directory,
                    principal: member,
                });
            }
            Ok(events)
        })
        .await
    }

    async fn remove_exclusion(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
        reason: &str,
    ) -> DirectoryResult<()> {
        let action = ActionKind::RemoveExclusion;
        self.mutate(directory, principal, None, action, Some(reason), None, |state| {
            if state.exclusions.remove(&principal).is_some() {
                Ok(vec![RawDirectoryEvent::ExclusionRemoved {
                    directory,
                    principal,
                }])
            } else {
                Ok(Vec::new())
            }
        })
        .await
    }
}

#[async_trait]
impl ExpulsionOp for InMemoryDirectoryService {
    async fn remove_principal(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
        reason: &str,
    ) -> DirectoryResult<()> {
        self.mutate(
            directory,
            principal,
            None,
            ActionKind::Expel,
            Some(reason),
            None,
            |state| {
                let member = state
                    .principals
                    .remove(&principal)
                    .ok_or_else(|| DirectoryError::not_found("principal", principal))?;
                state.expulsions.push(ExpulsionRecord {
                    target: principal,
                    actor: None,
                    reason: Some(reason.to_string()),
                    recorded_at: Utc::now(),
                });
                Ok(vec![RawDirectoryEvent::PrincipalLeft {
                    directory,
                    principal: member,
                }])
            },
        )
        .await
    }
}

#[async_trait]
impl AuditOp for InMemoryDirectoryService {
    async fn latest_expulsion(
        &self,
        directory: DirectoryId,
    ) -> DirectoryResult<Option<ExpulsionRecord>> {
        self.gate_read(directory).await?;
        Ok(self
            .read_state()
            .get(&directory)
            .and_then(|state| state.expulsions.iter().max_by_key(|r| r.recorded_at))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIR: DirectoryId = DirectoryId::new(1);
    const ALICE: PrincipalId = PrincipalId::new(100);
    const ROLE: GrantId = GrantId::new(10);

    fn service() -> InMemoryDirectoryService {
        InMemoryDirectoryService::new()
            .with_directory(DIR, "main")
            .with_grant(DIR, ROLE, "Tsunami")
            .with_principal(DIR, PrincipalSnapshot::new(ALICE, "alice"))
    }

    #[tokio::test]
    async fn test_grant_round_trip_records_calls() {
        let service = service();

        service.add_grant(DIR, ALICE, ROLE).await.unwrap();
        assert!(service.grants_of(DIR, ALICE).unwrap().contains(&ROLE));

        service.remove_grant(DIR, ALICE, ROLE).await.unwrap();
        assert!(service.grants_of(DIR, ALICE).unwrap().is_empty());

        let calls = service.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].action, ActionKind::AddGrant);
        assert!(calls.iter().all(|c| c.succeeded));
    }

    #[tokio::test]
    async fn test_grant_on_non_member_is_not_found() {
        let service = service();
        let err = service
            .add_grant(DIR, PrincipalId::new(999), ROLE)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!service.calls()[0].succeeded);
    }

    #[tokio::test]
    async fn test_injected_failures_are_bounded() {
        let service = service();
        service.inject_failure(DIR, FailureMode::Unavailable, Some(1), false);

        assert!(service.add_grant(DIR, ALICE, ROLE).await.unwrap_err().is_transient());
        service.add_grant(DIR, ALICE, ROLE).await.unwrap();
        // Reads were never affected
        assert!(service.fetch_principal(DIR, ALICE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_grant_failures_can_be_bounded() {
        let service = service();
        service.inject_grant_failures(DIR, ROLE, FailureMode::RateLimited, Some(1));

        let err = service.add_grant(DIR, ALICE, ROLE).await.unwrap_err();
        assert!(matches!(err, DirectoryError::RateLimited { .. }));
        service.add_grant(DIR, ALICE, ROLE).await.unwrap();

        let calls = service.calls();
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].succeeded);
        assert!(calls[1].succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_never_completes_until_used_up() {
        let service = service();
        service.inject_failure(DIR, FailureMode::Hang, Some(1), true);

        let hung = tokio::time::timeout(
            std::time::Duration::from_secs(60),
            service.fetch_principal(DIR, ALICE),
        )
        .await;
        assert!(hung.is_err());

        // The hang was consumed by the abandoned call
        assert!(service.fetch_principal(DIR, ALICE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pagination_walks_every_member() {
        let mut service = InMemoryDirectoryService::new().with_directory(DIR, "main");
        for i in 0..2_500u64 {
            service = service.with_principal(DIR, PrincipalSnapshot::new(PrincipalId::new(i), ""));
        }

        let first = service
            .list_principals(DIR, PageRequest::first())
            .await
            .unwrap();
        assert_eq!(first.items.len(), PageRequest::MAX_LIMIT);
        assert!(first.next.is_some());

        let all = service.list_all_principals(DIR).await.unwrap();
        assert_eq!(all.len(), 2_500);
    }

    #[tokio::test]
    async fn test_exclusion_removes_member_and_emits_events() {
        let service = service();
        let mut events = service.subscribe();

        service.add_exclusion(DIR, ALICE, "spam").await.unwrap();

        assert!(service.is_excluded(DIR, ALICE));
        assert!(!service.is_member(DIR, ALICE));
        assert!(matches!(
            events.recv().await,
            Some(RawDirectoryEvent::ExclusionAdded { .. })
        ));
        assert!(matches!(
            events.recv().await,
            Some(RawDirectoryEvent::PrincipalLeft { .. })
        ));
    }

    #[tokio::test]
    async fn test_expulsion_is_audited() {
        let service = service();
        service.remove_principal(DIR, ALICE, "kick").await.unwrap();

        let record = service.latest_expulsion(DIR).await.unwrap().unwrap();
        assert_eq!(record.target, ALICE);
        assert!(!service.is_member(DIR, ALICE));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let yaml = r#"
directories:
  - id: "1"
    name: main
    principals:
      - id: "100"
        display_name: alice
        grants: ["10", "11"]
    exclusions:
      - principal: "200"
        reason: spam
"#;
        let snapshot: ServiceSnapshot = serde_yaml::from_str(yaml).unwrap();
        let service = InMemoryDirectoryService::from_snapshot(snapshot);

        assert_eq!(service.grants_of(DIR, ALICE).unwrap().len(), 2);
        assert!(service.is_excluded(DIR, PrincipalId::new(200)));

        let exported = service.snapshot();
        assert_eq!(exported.directories[0].grants.len(), 2);
    }
}
