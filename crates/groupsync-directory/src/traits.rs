//! Directory service traits
//!
//! Capability-based trait definitions for the directory service collaborator.
//! One service instance reaches every directory; each call names the directory it
//! targets. Every call may be rate limited or fail transiently, so callers never
//! assume success.

use async_trait::async_trait;

use crate::error::DirectoryResult;
use crate::ids::{DirectoryId, GrantId, PrincipalId};
use crate::types::{
    DirectoryInfo, Exclusion, ExpulsionRecord, GrantInfo, Page, PageRequest, PrincipalSnapshot,
};

/// Read access to directories, principals and grants.
#[async_trait]
pub trait DirectoryReader: Send + Sync {
    /// Fetch a directory descriptor, `None` if the directory is unknown.
    async fn fetch_directory(&self, directory: DirectoryId)
        -> DirectoryResult<Option<DirectoryInfo>>;

    /// Fetch a principal's current snapshot in a directory.
    ///
    /// Returns `None` if the principal is not a member of the directory.
    async fn fetch_principal(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
    ) -> DirectoryResult<Option<PrincipalSnapshot>>;

    /// Fetch a grant descriptor, `None` if the grant does not exist.
    async fn fetch_grant(
        &self,
        directory: DirectoryId,
        grant: GrantId,
    ) -> DirectoryResult<Option<GrantInfo>>;

    /// List members of a directory, one page at a time, ordered by principal id.
    async fn list_principals(
        &self,
        directory: DirectoryId,
        page: PageRequest,
    ) -> DirectoryResult<Page<PrincipalSnapshot>>;

    /// List every member of a directory by walking all pages.
    async fn list_all_principals(
        &self,
        directory: DirectoryId,
    ) -> DirectoryResult<Vec<PrincipalSnapshot>> {
        let mut principals = Vec::new();
        let mut request = PageRequest::first();

        loop {
            let page = self.list_principals(directory, request).await?;
            principals.extend(page.items);
            match page.next {
                Some(cursor) => request = PageRequest::after(cursor),
                None => break,
            }
        }

        Ok(principals)
    }
}

/// Capability for assigning and revoking grants.
///
/// Both calls are idempotent at the service level: adding a held grant or
/// removing an absent one succeeds without effect.
#[async_trait]
pub trait GrantOp: DirectoryReader {
    async fn add_grant(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
        grant: GrantId,
    ) -> DirectoryResult<()>;

    async fn remove_grant(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
        grant: GrantId,
    ) -> DirectoryResult<()>;
}

/// Capability for managing exclusions (bans).
#[async_trait]
pub trait ExclusionOp: DirectoryReader {
    /// List every exclusion in a directory.
    async fn list_exclusions(&self, directory: DirectoryId) -> DirectoryResult<Vec<Exclusion>>;

    /// Fetch the exclusion held against a principal, if any.
    async fn fetch_exclusion(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
    ) -> DirectoryResult<Option<Exclusion>>;

    async fn add_exclusion(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
        reason: &str,
    ) -> DirectoryResult<()>;

    async fn remove_exclusion(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
        reason: &str,
    ) -> DirectoryResult<()>;
}

/// Capability for expelling (kicking) principals.
#[async_trait]
pub trait ExpulsionOp: DirectoryReader {
    /// Remove a principal from a directory without excluding them.
    async fn remove_principal(
        &self,
        directory: DirectoryId,
        principal: PrincipalId,
        reason: &str,
    ) -> DirectoryResult<()>;
}

/// Capability for reading the administrative audit trail.
#[async_trait]
pub trait AuditOp: DirectoryReader {
    /// Most recent administrative removal recorded in a directory.
    async fn latest_expulsion(
        &self,
        directory: DirectoryId,
    ) -> DirectoryResult<Option<ExpulsionRecord>>;
}

/// Marker trait for a directory service supporting every capability the engine needs.
pub trait DirectoryService: GrantOp + ExclusionOp + ExpulsionOp + AuditOp {}

// Blanket implementation for any service that implements all capabilities
impl<T> DirectoryService for T where T: GrantOp + ExclusionOp + ExpulsionOp + AuditOp {}
