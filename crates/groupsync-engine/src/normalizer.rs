//! Change event normalization.
//!
//! Turns raw directory notifications into the small event vocabulary the
//! orchestrator consumes. Pure; no directory calls.

use serde::Serialize;
use std::collections::BTreeSet;

use groupsync_directory::feed::RawDirectoryEvent;
use groupsync_directory::ids::{DirectoryId, GrantId, PrincipalId};
use groupsync_directory::types::PrincipalSnapshot;

/// A normalized change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    GrantAdded {
        directory: DirectoryId,
        principal: PrincipalId,
        grants: Vec<GrantId>,
    },
    GrantRemoved {
        directory: DirectoryId,
        principal: PrincipalId,
        grants: Vec<GrantId>,
    },
    ExclusionAdded {
        directory: DirectoryId,
        principal: PrincipalId,
        reason: Option<String>,
    },
    ExclusionRemoved {
        directory: DirectoryId,
        principal: PrincipalId,
    },
    PrincipalJoined {
        directory: DirectoryId,
        principal: PrincipalId,
        grants: Vec<GrantId>,
    },
    PrincipalRemoved {
        directory: DirectoryId,
        principal: PrincipalId,
        grants: Vec<GrantId>,
    },
}

impl ChangeEvent {
    pub fn directory(&self) -> DirectoryId {
        match self {
            Self::GrantAdded { directory, .. }
            | Self::GrantRemoved { directory, .. }
            | Self::ExclusionAdded { directory, .. }
            | Self::ExclusionRemoved { directory, .. }
            | Self::PrincipalJoined { directory, .. }
            | Self::PrincipalRemoved { directory, .. } => *directory,
        }
    }

    pub fn principal(&self) -> PrincipalId {
        match self {
            Self::GrantAdded { principal, .. }
            | Self::GrantRemoved { principal, .. }
            | Self::ExclusionAdded { principal, .. }
            | Self::ExclusionRemoved { principal, .. }
            | Self::PrincipalJoined { principal, .. }
            | Self::PrincipalRemoved { principal, .. } => *principal,
        }
    }

    /// Short name for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GrantAdded { .. } => "grant_added",
            Self::GrantRemoved { .. } => "grant_removed",
            Self::ExclusionAdded { .. } => "exclusion_added",
            Self::ExclusionRemoved { .. } => "exclusion_removed",
            Self::PrincipalJoined { .. } => "principal_joined",
            Self::PrincipalRemoved { .. } => "principal_removed",
        }
    }
}

/// Grants added and removed between two observations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantDelta {
    pub added: BTreeSet<GrantId>,
    pub removed: BTreeSet<GrantId>,
}

impl GrantDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Compute the grant difference between two snapshots.
pub fn diff_grants(before: &PrincipalSnapshot, after: &PrincipalSnapshot) -> GrantDelta {
    GrantDelta {
        added: after.grants.difference(&before.grants).copied().collect(),
        removed: before.grants.difference(&after.grants).copied().collect(),
    }
}

/// Normalize one raw notification.
///
/// Snapshot updates with identical grant sets produce nothing. A swap produces
/// an addition and a removal, in that order.
pub fn normalize(event: &RawDirectoryEvent) -> Vec<ChangeEvent> {
    match event {
        RawDirectoryEvent::PrincipalUpdated {
            directory,
            before,
            after,
        } => {
            let delta = diff_grants(before, after);
            let mut events = Vec::with_capacity(2);
            if !delta.added.is_empty() {
                events.push(ChangeEvent::GrantAdded {
                    directory: *directory,
                    principal: after.id,
                    grants: delta.added.into_iter().collect(),
                });
            }
            if !delta.removed.is_empty() {
                events.push(ChangeEvent::GrantRemoved {
                    directory: *directory,
                    principal: after.id,
                    grants: delta.removed.into_iter().collect(),
                });
            }
            events
        }
        RawDirectoryEvent::PrincipalJoined {
            directory,
            principal,
        } => vec![ChangeEvent::PrincipalJoined {
            directory: *directory,
            principal: principal.id,
            grants: principal.grants.iter().copied().collect(),
        }],
        RawDirectoryEvent::PrincipalLeft {
            directory,
            principal,
        } => vec![ChangeEvent::PrincipalRemoved {
            directory: *directory,
            principal: principal.id,
            grants: principal.grants.iter().copied().collect(),
        }],
        RawDirectoryEvent::ExclusionAdded {
            directory,
            principal,
            reason,
        } => vec![ChangeEvent::ExclusionAdded {
            directory: *directory,
            principal: *principal,
            reason: reason.clone(),
        }],
        RawDirectoryEvent::ExclusionRemoved {
            directory,
            principal,
        } => vec![ChangeEvent::ExclusionRemoved {
            directory: *directory,
            principal: *principal,
        }],
    }
}
