//! # groupsync engine
//!
//! Keeps group membership consistent across a set of directories. One directory
//! is the primary and authoritative source; every other directory is a replica
//! whose managed grants are derived from the principal's primary group grants.
//!
//! ## Architecture
//!
//! ```text
//!   raw feed ──► normalizer ──► debounce coalescer ──► handlers
//!                                                         │
//!              ┌──────────────────┬───────────────────────┤
//!              ▼                  ▼                       ▼
//!        orchestrator     exclusion propagator   exclusivity enforcer
//!              │                  │                       │
//!              └────────► mutation dispatcher ◄───────────┘
//!                     (dedup + retry + dry-run)
//!                                 ▲
//!                       reconciliation sweep
//! ```
//!
//! ## Crate Organization
//!
//! - [`config`] - YAML configuration and environment overrides
//! - [`mapping`] - Primary group grant to replica grant resolution
//! - [`normalizer`] - Raw notifications to discrete change events
//! - [`debounce`] - Per-principal burst coalescing
//! - [`dedup`] - In-flight operation keys
//! - [`dispatch`] - Mutation dispatch through dedup, retry and dry-run
//! - [`orchestrator`] - Per-principal affiliation state machine
//! - [`propagation`] - Exclusion and expulsion mirroring
//! - [`selection`] - Selection sets and exclusivity enforcement
//! - [`reconciliation`] - Periodic full-state sweep
//! - [`engine`] - Runtime loop

pub mod config;
pub mod debounce;
pub mod dedup;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod mapping;
pub mod normalizer;
pub mod orchestrator;
pub mod propagation;
pub mod reconciliation;
pub mod selection;

pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{
        ConfigError, EnvOverrides, GroupMappingEntry, SelectionMode, SelectionOption,
        SelectionSetConfig, SyncConfig,
    };
    pub use crate::dispatch::{DispatchOutcome, Mutation, MutationDispatcher, SharedDirectory};
    pub use crate::engine::SyncEngine;
    pub use crate::error::{SyncError, SyncResult};
    pub use crate::mapping::GroupMapping;
    pub use crate::orchestrator::{Affiliation, FanOutReport};
    pub use crate::propagation::{RemovalKind, RemovalOutcome};
    pub use crate::reconciliation::{SweepReport, SweepStatistics};
    pub use crate::selection::SelectionOutcome;
}
