//! Fuzz target for exclusive-set planning.
//!
//! Applying the plan to the observed grants must leave exactly one member of
//! the set held whenever one was held before or after the change.
//!
//! Run with:
//! cargo +nightly fuzz run fuzz_plan_exclusive -- -max_total_time=600

#![no_main]

use std::collections::BTreeSet;

use groupsync_directory::ids::GrantId;
use groupsync_engine::selection::plan_exclusive;
use libfuzzer_sys::fuzz_target;

fn grants(bytes: &[u8]) -> BTreeSet<GrantId> {
    bytes.iter().map(|b| GrantId::new(u64::from(*b % 12))).collect()
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 3 {
        return;
    }
    let third = data.len() / 3;
    let set = grants(&data[..third]);
    let before = grants(&data[third..2 * third]);
    let after = grants(&data[2 * third..]);

    let plan = plan_exclusive(&set, &before, &after);

    assert!(plan.remove.iter().all(|g| set.contains(g) && after.contains(g)));
    if let Some(restore) = plan.restore {
        assert!(set.contains(&restore) && before.contains(&restore));
    }

    let mut result = after.clone();
    result.extend(plan.restore);
    for grant in &plan.remove {
        result.remove(grant);
    }
    let held = result.intersection(&set).count();

    let held_any = !before.is_disjoint(&set) || !after.is_disjoint(&set);
    if held_any {
        assert_eq!(held, 1);
    } else {
        assert!(plan.is_noop());
    }
});
