//! Synchronization Property Tests
//!
//! End-to-end behavior of the engine against the in-memory directory service:
//! - Idempotent dispatch within the dedup window
//! - Mapping fan-out completeness when one replica fails
//! - Exclusivity restore and newest-wins
//! - Voluntary leave vs expulsion
//! - Reconciliation convergence
//! - Dry-run neutrality

mod common;

use std::collections::BTreeSet;

use groupsync_directory::feed::RawDirectoryEvent;
use groupsync_directory::memory::{FailureMode, InMemoryDirectoryService, ServiceSnapshot};
use groupsync_directory::traits::{ExpulsionOp, GrantOp};
use groupsync_directory::types::ActionKind;
use groupsync_engine::dedup::OperationKey;
use groupsync_engine::dispatch::{DispatchOutcome, Mutation};
use groupsync_engine::reconciliation::SweepStatistics;

use common::*;

// =============================================================================
// Idempotent dispatch
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_identical_mutations_dispatch_once() {
    let (service, engine) = idle_engine(
        directories().with_principal(EU, member(ALICE, &[])),
        config(),
    );
    let mutation = Mutation::add_grant(EU, ALICE, TSUNAMI_EU);

    let first = engine.dispatcher().dispatch(&mutation).await.unwrap();
    let second = engine.dispatcher().dispatch(&mutation).await.unwrap();

    assert_eq!(first, DispatchOutcome::Applied);
    assert_eq!(second, DispatchOutcome::Suppressed);
    assert_eq!(service.calls_of(ActionKind::AddGrant).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_notifications_issues_one_fan_out() {
    let harness = Harness::start(
        directories()
            .with_principal(PRIMARY, member(ALICE, &[]))
            .with_principal(EU, member(ALICE, &[]))
            .with_principal(NA, member(ALICE, &[])),
        config(),
    );

    harness.service.add_grant(PRIMARY, ALICE, TSUNAMI).await.unwrap();
    // The same change delivered twice more
    for _ in 0..2 {
        harness.inject(RawDirectoryEvent::PrincipalUpdated {
            directory: PRIMARY,
            before: member(ALICE, &[]),
            after: member(ALICE, &[TSUNAMI]),
        });
    }
    harness.settle().await;

    let replica_adds: Vec<_> = harness
        .service
        .calls_of(ActionKind::AddGrant)
        .into_iter()
        .filter(|c| c.directory != PRIMARY)
        .collect();
    assert_eq!(replica_adds.len(), 2);
    harness.stop().await.unwrap();
}

// =============================================================================
// Fan-out completeness
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_fan_out_survives_failing_replica() {
    let harness = Harness::start(
        directories()
            .with_principal(PRIMARY, member(ALICE, &[PENDING]))
            .with_principal(EU, member(ALICE, &[]))
            .with_principal(NA, member(ALICE, &[])),
        config(),
    );
    harness
        .service
        .inject_failure(NA, FailureMode::Unavailable, None, false);

    harness.service.add_grant(PRIMARY, ALICE, TSUNAMI).await.unwrap();
    harness.settle().await;

    let service = &harness.service;
    assert_eq!(
        service.grants_of(PRIMARY, ALICE).unwrap(),
        BTreeSet::from([TSUNAMI, MARKER])
    );
    assert!(service.grants_of(EU, ALICE).unwrap().contains(&TSUNAMI_EU));
    assert!(!service.grants_of(NA, ALICE).unwrap().contains(&TSUNAMI_NA));
    // Retried before giving up
    let na_attempts = service
        .calls()
        .into_iter()
        .filter(|c| c.directory == NA && c.grant == Some(TSUNAMI_NA))
        .count();
    assert_eq!(na_attempts, 2);

    // The next sweep repairs the replica once it recovers
    service.clear_failure(NA);
    let report = harness.engine.sweep_now().await.unwrap();
    assert_eq!(report.statistics.grants_added, 1);
    assert!(service.grants_of(NA, ALICE).unwrap().contains(&TSUNAMI_NA));

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_switching_groups_moves_replica_grants() {
    let harness = Harness::start(
        directories()
            .with_principal(PRIMARY, member(ALICE, &[TSUNAMI, MARKER]))
            .with_principal(EU, member(ALICE, &[TSUNAMI_EU]))
            .with_principal(NA, member(ALICE, &[TSUNAMI_NA])),
        config(),
    );

    harness.service.add_grant(PRIMARY, ALICE, HAVEN).await.unwrap();
    harness.settle().await;

    let service = &harness.service;
    assert_eq!(
        service.grants_of(PRIMARY, ALICE).unwrap(),
        BTreeSet::from([HAVEN, MARKER])
    );
    assert_eq!(service.grants_of(EU, ALICE).unwrap(), BTreeSet::from([HAVEN_EU]));
    assert_eq!(service.grants_of(NA, ALICE).unwrap(), BTreeSet::from([HAVEN_NA]));

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_leaving_group_clears_marker_and_replicas() {
    let harness = Harness::start(
        directories()
            .with_principal(PRIMARY, member(ALICE, &[TSUNAMI, MARKER]))
            .with_principal(EU, member(ALICE, &[TSUNAMI_EU]))
            .with_principal(NA, member(ALICE, &[TSUNAMI_NA, UNMANAGED])),
        config(),
    );

    harness
        .service
        .remove_grant(PRIMARY, ALICE, TSUNAMI)
        .await
        .unwrap();
    harness.settle().await;

    let service = &harness.service;
    assert!(service.grants_of(PRIMARY, ALICE).unwrap().is_empty());
    assert!(service.grants_of(EU, ALICE).unwrap().is_empty());
    assert_eq!(service.grants_of(NA, ALICE).unwrap(), BTreeSet::from([UNMANAGED]));

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_replica_grant_is_reverted() {
    let harness = Harness::start(
        directories()
            .with_principal(PRIMARY, member(ALICE, &[TSUNAMI, MARKER]))
            .with_principal(EU, member(ALICE, &[TSUNAMI_EU])),
        config(),
    );

    harness.service.add_grant(EU, ALICE, HAVEN_EU).await.unwrap();
    harness.service.remove_grant(EU, ALICE, TSUNAMI_EU).await.unwrap();
    harness.settle().await;

    assert_eq!(
        harness.service.grants_of(EU, ALICE).unwrap(),
        BTreeSet::from([TSUNAMI_EU])
    );
    harness.stop().await.unwrap();
}

// =============================================================================
// Exclusivity
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_exclusive_selection_is_restored() {
    let harness = Harness::start(
        directories().with_principal(EU, member(ALICE, &[SWORD])),
        config(),
    );

    harness.service.remove_grant(EU, ALICE, SWORD).await.unwrap();
    harness.settle().await;

    assert_eq!(
        harness.service.grants_of(EU, ALICE).unwrap(),
        BTreeSet::from([SWORD])
    );
    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exclusive_selection_newest_wins() {
    let harness = Harness::start(
        directories().with_principal(EU, member(ALICE, &[SWORD, RAIDS])),
        config(),
    );

    harness.service.add_grant(EU, ALICE, BOW).await.unwrap();
    harness.settle().await;

    // Multi-choice sets are left alone
    assert_eq!(
        harness.service.grants_of(EU, ALICE).unwrap(),
        BTreeSet::from([BOW, RAIDS])
    );
    harness.stop().await.unwrap();
}

// =============================================================================
// Departures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_voluntary_leave_strips_managed_grants_only() {
    let harness = Harness::start(
        directories()
            .with_principal(EU, member(ALICE, &[TSUNAMI_EU, SWORD]))
            .with_principal(NA, member(ALICE, &[TSUNAMI_NA, UNMANAGED])),
        config(),
    );

    // Primary membership already gone, no audit record
    harness.inject(RawDirectoryEvent::PrincipalLeft {
        directory: PRIMARY,
        principal: member(ALICE, &[TSUNAMI, MARKER]),
    });
    harness.settle().await;

    let service = &harness.service;
    assert!(service.calls_of(ActionKind::Expel).is_empty());
    assert_eq!(service.grants_of(EU, ALICE).unwrap(), BTreeSet::from([SWORD]));
    assert_eq!(service.grants_of(NA, ALICE).unwrap(), BTreeSet::from([UNMANAGED]));

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_expulsion_is_mirrored() {
    let harness = Harness::start(
        directories()
            .with_principal(PRIMARY, member(BOB, &[HAVEN, MARKER]))
            .with_principal(EU, member(BOB, &[HAVEN_EU]))
            .with_principal(NA, member(BOB, &[HAVEN_NA])),
        config(),
    );

    harness
        .service
        .remove_principal(PRIMARY, BOB, "spamming")
        .await
        .unwrap();
    harness.settle().await;

    let service = &harness.service;
    assert!(!service.is_member(EU, BOB));
    assert!(!service.is_member(NA, BOB));
    let mirrored: Vec<_> = service
        .calls_of(ActionKind::Expel)
        .into_iter()
        .filter(|c| c.directory != PRIMARY)
        .collect();
    assert_eq!(mirrored.len(), 2);
    assert!(mirrored
        .iter()
        .all(|c| c.reason.as_deref() == Some("primary expulsion sync: spamming")));

    harness.stop().await.unwrap();
}

// =============================================================================
// Reconciliation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_sweep_converges_then_goes_quiet() {
    let (service, engine) = idle_engine(
        directories()
            .with_principal(PRIMARY, member(ALICE, &[TSUNAMI, PENDING]))
            .with_principal(PRIMARY, member(BOB, &[MARKER]))
            .with_principal(EU, member(ALICE, &[HAVEN_EU]))
            .with_principal(EU, member(BOB, &[TSUNAMI_EU]))
            .with_principal(NA, member(CAROL, &[HAVEN_NA, UNMANAGED]))
            .with_exclusion(PRIMARY, DAVE, Some("raid")),
        config(),
    );

    let first = engine.sweep_now().await.unwrap();
    assert!(first.statistics.is_clean());
    assert_eq!(first.statistics.flags_corrected, 3);
    assert_eq!(first.statistics.exclusions_synced, 2);

    assert_eq!(
        service.grants_of(PRIMARY, ALICE).unwrap(),
        BTreeSet::from([TSUNAMI, MARKER])
    );
    assert!(service.grants_of(PRIMARY, BOB).unwrap().is_empty());
    assert_eq!(service.grants_of(EU, ALICE).unwrap(), BTreeSet::from([TSUNAMI_EU]));
    assert!(service.grants_of(EU, BOB).unwrap().is_empty());
    assert_eq!(service.grants_of(NA, CAROL).unwrap(), BTreeSet::from([UNMANAGED]));
    assert!(service.is_excluded(EU, DAVE));
    assert!(service.is_excluded(NA, DAVE));

    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    service.clear_calls();
    let second = engine.sweep_now().await.unwrap();
    assert_eq!(second.statistics.corrections(), 0);
    assert!(service.calls().is_empty());
}

// =============================================================================
// Dry-run
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_dry_run_issues_no_mutations() {
    let mut config = config();
    config.dry_run = true;
    let harness = Harness::start(
        directories()
            .with_principal(PRIMARY, member(ALICE, &[]))
            .with_principal(EU, member(ALICE, &[HAVEN_EU]))
            .with_principal(NA, member(ALICE, &[])),
        config,
    );

    harness.service.add_grant(PRIMARY, ALICE, TSUNAMI).await.unwrap();
    harness.settle().await;

    // Only the administrator's own change was applied
    assert_eq!(harness.service.calls().len(), 1);

    let report = harness.engine.sweep_now().await.unwrap();
    assert!(report.dry_run);
    assert!(report.statistics.corrections() > 0);
    assert_eq!(harness.service.calls().len(), 1);
    assert_eq!(
        harness.service.grants_of(EU, ALICE).unwrap(),
        BTreeSet::from([HAVEN_EU])
    );

    harness.stop().await.unwrap();
}

/// Every kind of drift a sweep repairs, in one fixture.
fn drifted() -> InMemoryDirectoryService {
    directories()
        .with_principal(PRIMARY, member(ALICE, &[TSUNAMI]))
        .with_principal(PRIMARY, member(BOB, &[HAVEN, MARKER, PENDING]))
        .with_principal(PRIMARY, member(DAVE, &[MARKER]))
        .with_principal(EU, member(ALICE, &[HAVEN_EU]))
        .with_principal(EU, member(BOB, &[]))
        .with_principal(NA, member(BOB, &[HAVEN_NA, UNMANAGED]))
        .with_principal(NA, member(DAVE, &[TSUNAMI_NA]))
        .with_exclusion(PRIMARY, CAROL, Some("griefing"))
}

fn sorted_keys(keys: impl IntoIterator<Item = OperationKey>) -> Vec<String> {
    let mut keys: Vec<String> = keys.into_iter().map(|k| k.to_string()).collect();
    keys.sort();
    keys
}

async fn sweep_once(dry_run: bool) -> (SweepOutcome, ServiceSnapshot) {
    let mut config = config();
    config.dry_run = dry_run;
    config.sweep.batch_pause_ms = 0;
    config.timing.dedup_window_ms = Some(60_000);
    let (service, engine) = idle_engine(drifted(), config);
    let report = engine.sweep_now().await.unwrap();
    let outcome = SweepOutcome {
        statistics: report.statistics,
        dedup_keys: sorted_keys(engine.dispatcher().dedup().live_keys()),
        issued_keys: sorted_keys(service.calls().into_iter().map(|c| OperationKey {
            principal: c.principal,
            directory: c.directory,
            grant: c.grant,
            action: c.action,
        })),
    };
    (outcome, service.snapshot())
}

struct SweepOutcome {
    statistics: SweepStatistics,
    dedup_keys: Vec<String>,
    issued_keys: Vec<String>,
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_plans_exactly_what_a_live_run_issues() {
    let before = drifted().snapshot();

    let (live, live_after) = sweep_once(false).await;
    let (dry, dry_after) = sweep_once(true).await;

    // The live run changed things and the dry run did not
    assert!(live.statistics.corrections() > 0);
    assert_ne!(live_after, before);
    assert_eq!(dry_after, before);
    assert!(dry.issued_keys.is_empty());

    // Same plan: statistics, dedup records and the calls the live run made
    assert_eq!(dry.statistics, live.statistics);
    assert_eq!(dry.dedup_keys, live.dedup_keys);
    assert_eq!(live.dedup_keys, live.issued_keys);
}
