//! Fuzz target for configuration parsing.
//!
//! Arbitrary YAML must either be rejected with an error or produce a
//! configuration that passes validation and builds its group mapping.
//!
//! Run with:
//! cargo +nightly fuzz run fuzz_config_parse -- -max_total_time=600

#![no_main]

use groupsync_engine::config::SyncConfig;
use groupsync_engine::mapping::GroupMapping;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(yaml) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = SyncConfig::from_yaml(yaml) else {
        return;
    };

    assert!(config.validate().is_ok());
    let mapping = GroupMapping::new(config.primary, &config.mappings).unwrap();
    for entry in &config.mappings {
        assert!(mapping.is_group_grant(entry.primary_grant));
    }
});
