//! # Directory Service Abstractions
//!
//! Typed interface to the external directory service that groupsync mirrors
//! membership through.
//!
//! The service is rate limited and eventually consistent: every call may be
//! rejected or fail transiently, and change notifications arrive unordered and
//! in bursts. This crate provides the vocabulary the engine is written against.
//!
//! ## Architecture
//!
//! Capabilities are split into small traits, combined by [`DirectoryService`]:
//!
//! - [`DirectoryReader`] - Directory, principal and grant lookups, paged listings
//! - [`GrantOp`] - Assign and revoke grants
//! - [`ExclusionOp`] - Exclusions (bans)
//! - [`ExpulsionOp`] - Expulsions (kicks)
//! - [`AuditOp`] - Administrative audit trail
//!
//! ## Crate Organization
//!
//! - [`ids`] - Snowflake identifiers (`PrincipalId`, `DirectoryId`, `GrantId`)
//! - [`types`] - Snapshots, descriptors and pagination
//! - [`error`] - Error types with transient/permanent classification
//! - [`traits`] - Capability traits
//! - [`feed`] - Raw change notifications and the subscription feed
//! - [`resilience`] - Retry with exponential backoff, call timeouts
//! - [`memory`] - In-memory service for snapshots and tests

pub mod error;
pub mod feed;
pub mod ids;
pub mod memory;
pub mod resilience;
pub mod traits;
pub mod types;

pub use traits::{AuditOp, DirectoryReader, DirectoryService, ExclusionOp, ExpulsionOp, GrantOp};

/// Prelude module for convenient imports.
///
/// ```
/// use groupsync_directory::prelude::*;
/// ```
pub mod prelude {
    // IDs
    pub use crate::ids::{DirectoryId, GrantId, PrincipalId};

    // Types
    pub use crate::types::{
        ActionKind, DirectoryInfo, Exclusion, ExpulsionRecord, GrantInfo, Page, PageRequest,
        PrincipalSnapshot,
    };

    // Error handling
    pub use crate::error::{DirectoryError, DirectoryResult};

    // Traits
    pub use crate::traits::{
        AuditOp, DirectoryReader, DirectoryService, ExclusionOp, ExpulsionOp, GrantOp,
    };

    // Feed
    pub use crate::feed::{EventFeed, RawDirectoryEvent};

    // Resilience
    pub use crate::resilience::{RetryConfig, RetryExecutor, TimeoutDirectory};

    // In-memory service
    pub use crate::memory::{
        DirectorySnapshot, FailureMode, InMemoryDirectoryService, RecordedCall, ServiceSnapshot,
    };
}

// Re-export async_trait for service implementors
pub use async_trait::async_trait;
