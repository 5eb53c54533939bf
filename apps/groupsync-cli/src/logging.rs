//! Logging setup using tracing.
//!
//! Logs go to stderr so command output on stdout stays machine-readable.

use tracing_subscriber::EnvFilter;

/// Default filter when neither `GROUPSYNC_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "warn,groupsync_engine=info,groupsync=info";

/// Resolve the log filter: `GROUPSYNC_LOG`, then `RUST_LOG`, then the default.
pub fn resolve_filter() -> EnvFilter {
    EnvFilter::try_from_env("GROUPSYNC_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize the tracing subscriber, human-readable or JSON.
pub fn init_logging(json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(resolve_filter())
        .with_writer(std::io::stderr)
        .with_target(true);

    // A subscriber may already be installed (tests); keep it.
    let result = if json {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.try_init()
    };
    if result.is_ok() {
        tracing::debug!(json, "Logging initialized");
    }
}
