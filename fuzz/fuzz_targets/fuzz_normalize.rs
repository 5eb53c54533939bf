//! Fuzz target for event normalization.
//!
//! Builds before/after grant sets from the input and checks that the
//! normalized events describe exactly the difference between them.
//!
//! Run with:
//! cargo +nightly fuzz run fuzz_normalize -- -max_total_time=600

#![no_main]

use std::collections::BTreeSet;

use groupsync_directory::feed::RawDirectoryEvent;
use groupsync_directory::ids::{DirectoryId, GrantId, PrincipalId};
use groupsync_directory::types::PrincipalSnapshot;
use groupsync_engine::normalizer::{normalize, ChangeEvent};
use libfuzzer_sys::fuzz_target;

fn grants(bytes: &[u8]) -> BTreeSet<GrantId> {
    bytes.iter().map(|b| GrantId::new(u64::from(*b % 16))).collect()
}

fuzz_target!(|data: &[u8]| {
    let (left, right) = data.split_at(data.len() / 2);
    let before = grants(left);
    let after = grants(right);
    let principal = PrincipalId::new(7);

    let event = RawDirectoryEvent::PrincipalUpdated {
        directory: DirectoryId::new(1),
        before: PrincipalSnapshot::new(principal, "").with_grants(before.iter().copied()),
        after: PrincipalSnapshot::new(principal, "").with_grants(after.iter().copied()),
    };
    let events = normalize(&event);

    if before == after {
        assert!(events.is_empty());
    }

    let mut added = BTreeSet::new();
    let mut removed = BTreeSet::new();
    for change in &events {
        assert_eq!(change.principal(), principal);
        match change {
            ChangeEvent::GrantAdded { grants, .. } => added.extend(grants.iter().copied()),
            ChangeEvent::GrantRemoved { grants, .. } => removed.extend(grants.iter().copied()),
            other => panic!("unexpected event {}", other.kind()),
        }
    }
    assert_eq!(added, after.difference(&before).copied().collect());
    assert_eq!(removed, before.difference(&after).copied().collect());
});
