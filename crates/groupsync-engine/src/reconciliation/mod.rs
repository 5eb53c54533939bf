//! # Reconciliation Sweep
//!
//! Periodic full-state comparison between the primary and every replica.
//!
//! ## Overview
//!
//! The reactive path can miss events: the process may be down, a feed may drop
//! a notification, or a mutation may fail after every retry. The sweep repairs
//! all of it by recomputing the desired state from scratch:
//!
//! 1. Primary pass: correct marker and pending flags of every primary member.
//! 2. Replica pass: diff managed grants against the primary-derived authorization.
//! 3. Exclusion pass: copy primary exclusions to replicas that lack them.
//!
//! Corrections go through the same dispatcher as reactive mutations, so an
//! in-flight reactive write suppresses the duplicate sweep write.
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Primary pass │──►│ Replica pass │──►│ Exclusion    │
//! │ (flags)      │   │ (per replica)│   │ pass         │
//! └──────────────┘   └──────────────┘   └──────────────┘
//!         │                  │                  │
//!         └──────────────────┴──────────────────┘
//!                            ▼
//!                   ┌──────────────────┐
//!                   │ StatisticsTracker│
//!                   └──────────────────┘
//! ```
//!
//! Principals needing corrections are processed in batches with a pause in
//! between to stay under directory rate limits.

mod statistics;
mod sweep;

pub use statistics::{StatisticsTracker, SweepStatistics};
pub use sweep::{ReconciliationSweep, SweepReport};
