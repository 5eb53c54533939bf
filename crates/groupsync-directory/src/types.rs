//! Directory data types
//!
//! Snapshots and descriptors returned by the directory service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::ids::{DirectoryId, GrantId, PrincipalId};

/// Kind of mutating call issued against a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Assign a grant to a principal.
    AddGrant,
    /// Revoke a grant from a principal.
    RemoveGrant,
    /// Exclude (ban) a principal from a directory.
    AddExclusion,
    /// Lift an exclusion.
    RemoveExclusion,
    /// Expel (kick) a principal from a directory.
    Expel,
}

impl ActionKind {
    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::AddGrant => "add_grant",
            ActionKind::RemoveGrant => "remove_grant",
            ActionKind::AddExclusion => "add_exclusion",
            ActionKind::RemoveExclusion => "remove_exclusion",
            ActionKind::Expel => "expel",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A principal's grant set in one directory at one observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalSnapshot {
    /// The principal.
    pub id: PrincipalId,
    /// Human-readable name, used for logging only.
    #[serde(default)]
    pub display_name: String,
    /// Grants currently held.
    #[serde(default)]
    pub grants: BTreeSet<GrantId>,
}

impl PrincipalSnapshot {
    /// Create a snapshot with no grants.
    #[must_use]
    pub fn new(id: PrincipalId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            grants: BTreeSet::new(),
        }
    }

    /// Builder-style grant assignment.
    #[must_use]
    pub fn with_grant(mut self, grant: GrantId) -> Self {
        self.grants.insert(grant);
        self
    }

    /// Builder-style assignment of several grants.
    #[must_use]
    pub fn with_grants(mut self, grants: impl IntoIterator<Item = GrantId>) -> Self {
        self.grants.extend(grants);
        self
    }

    /// Check whether the grant is held.
    #[must_use]
    pub fn has_grant(&self, grant: GrantId) -> bool {
        self.grants.contains(&grant)
    }
}

/// Directory descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryInfo {
    pub id: DirectoryId,
    pub name: String,
}

/// Grant descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantInfo {
    pub id: GrantId,
    pub name: String,
}

/// An exclusion (ban) held against a principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub principal: PrincipalId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Audit trail entry for an administrative removal of a principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpulsionRecord {
    /// The removed principal.
    pub target: PrincipalId,
    /// The administrator who performed the removal, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<PrincipalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the directory recorded the removal.
    pub recorded_at: DateTime<Utc>,
}

/// Pagination request for principal listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Return principals with an id strictly greater than this one.
    pub after: Option<PrincipalId>,
    /// Maximum number of principals to return.
    pub limit: usize,
}

impl PageRequest {
    /// Largest page the directory service hands out.
    pub const MAX_LIMIT: usize = 1000;

    /// First page with the maximum page size.
    #[must_use]
    pub fn first() -> Self {
        Self {
            after: None,
            limit: Self::MAX_LIMIT,
        }
    }

    /// Page following the given principal.
    #[must_use]
    pub fn after(principal: PrincipalId) -> Self {
        Self {
            after: Some(principal),
            limit: Self::MAX_LIMIT,
        }
    }
}

/// A page of results.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor for the next page, `None` when exhausted.
    pub next: Option<PrincipalId>,
}
