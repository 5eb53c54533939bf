//! Engine configuration.
//!
//! Loaded from a YAML file at startup and immutable for the lifetime of a run.
//! A handful of switches can be overridden from the environment.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

use groupsync_directory::ids::{DirectoryId, GrantId};
use groupsync_directory::resilience::RetryConfig;

use crate::mapping::GroupMapping;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// The authoritative directory.
    pub primary: DirectoryId,

    /// Primary grant meaning "member of some group".
    pub marker_grant: GrantId,

    /// Primary grant meaning "joined, no group yet".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_grant: Option<GrantId>,

    /// Primary group grants and their replica counterparts.
    #[serde(default)]
    pub mappings: Vec<GroupMappingEntry>,

    /// Selection sets exposed to the presentation surface.
    #[serde(default)]
    pub selection_sets: Vec<SelectionSetConfig>,

    /// Log mutations instead of issuing them.
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub sweep: SweepSettings,

    /// Upper bound on concurrently running event handlers.
    #[serde(default = "default_max_concurrent_handlers")]
    pub max_concurrent_handlers: usize,
}

/// One primary group grant and its replica grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMappingEntry {
    pub primary_grant: GrantId,
    /// Display name, used for logging only.
    #[serde(default)]
    pub name: String,
    /// Replica directory -> replica grant.
    #[serde(default)]
    pub replicas: BTreeMap<DirectoryId, GrantId>,
}

/// How many members of a selection set may be held at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// At most one member, enforced continuously.
    #[default]
    Exclusive,
    /// Any subset, only applied on submission.
    Multiple,
}

/// A named collection of grants in one directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionSetConfig {
    pub id: String,
    pub directory: DirectoryId,
    #[serde(default)]
    pub mode: SelectionMode,
    pub options: Vec<SelectionOption>,
}

/// One grant of a selection set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionOption {
    pub grant: GrantId,
    #[serde(default)]
    pub label: String,
}

impl SelectionSetConfig {
    /// Grants of the set.
    pub fn grants(&self) -> BTreeSet<GrantId> {
        self.options.iter().map(|o| o.grant).collect()
    }

    /// Whether the grant belongs to the set.
    pub fn contains(&self, grant: GrantId) -> bool {
        self.options.iter().any(|o| o.grant == grant)
    }

    /// Look up an option by grant.
    pub fn option(&self, grant: GrantId) -> Option<&SelectionOption> {
        self.options.iter().find(|o| o.grant == grant)
    }
}

/// Event timing windows, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Quiet period before a burst of snapshot updates is processed.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Deduplication window. Defaults to the debounce window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_window_ms: Option<u64>,

    /// Maximum age of an audit record attributed to a primary removal.
    #[serde(default = "default_attribution_window_ms")]
    pub attribution_window_ms: u64,

    /// Interval between expired dedup record evictions.
    #[serde(default = "default_eviction_interval_ms")]
    pub eviction_interval_ms: u64,

    /// How long a submitted selection suppresses enforcement on its set.
    /// Never shorter than the debounce window plus the full retry budget.
    #[serde(default = "default_selection_hold_ms")]
    pub selection_hold_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            dedup_window_ms: None,
            attribution_window_ms: default_attribution_window_ms(),
            eviction_interval_ms: default_eviction_interval_ms(),
            selection_hold_ms: default_selection_hold_ms(),
        }
    }
}

impl TimingConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms.unwrap_or(self.debounce_ms))
    }

    pub fn attribution_window(&self) -> Duration {
        Duration::from_millis(self.attribution_window_ms)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms)
    }

    /// Selection hold, raised to cover a submission that is still retrying
    /// when its coalesced update arrives.
    pub fn selection_hold(&self, retry: &RetryConfig) -> Duration {
        Duration::from_millis(self.selection_hold_ms).max(self.debounce_window() + retry.budget())
    }
}

/// Retry settings for mutating calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub jitter: bool,
    /// Limit on a single directory call.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

impl RetrySettings {
    /// Build the executor configuration.
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: 2.0,
            jitter: self.jitter,
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
        }
    }
}

/// Reconciliation sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSettings {
    /// Run a sweep before processing events.
    #[serde(default = "default_true")]
    pub on_startup: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    /// Principals per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            on_startup: true,
            interval_secs: default_sweep_interval_secs(),
            batch_size: default_batch_size(),
            batch_pause_ms: default_batch_pause_ms(),
        }
    }
}

impl SweepSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }
}

fn default_debounce_ms() -> u64 {
    1_000
}

fn default_attribution_window_ms() -> u64 {
    5_000
}

fn default_eviction_interval_ms() -> u64 {
    30_000
}

fn default_selection_hold_ms() -> u64 {
    30_000
}

fn default_attempt_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval_secs() -> u64 {
    3_600
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_pause_ms() -> u64 {
    1_000
}

fn default_max_concurrent_handlers() -> usize {
    16
}

impl SyncConfig {
    /// Minimal configuration with defaults for every optional field.
    pub fn new(primary: DirectoryId, marker_grant: GrantId) -> Self {
        Self {
            primary,
            marker_grant,
            pending_grant: None,
            mappings: Vec::new(),
            selection_sets: Vec::new(),
            dry_run: false,
            timing: TimingConfig::default(),
            retry: RetrySettings::default(),
            sweep: SweepSettings::default(),
            max_concurrent_handlers: default_max_concurrent_handlers(),
        }
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Apply environment overrides.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &EnvOverrides) -> Self {
        if let Some(dry_run) = overrides.dry_run {
            self.dry_run = dry_run;
        }
        self
    }

    /// Check the static invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mapping = GroupMapping::new(self.primary, &self.mappings)?;

        if Some(self.marker_grant) == self.pending_grant {
            return Err(ConfigError::Invalid(
                "marker_grant and pending_grant must differ".into(),
            ));
        }
        for flag in std::iter::once(self.marker_grant).chain(self.pending_grant) {
            if mapping.is_group_grant(flag) {
                return Err(ConfigError::Invalid(format!(
                    "grant {flag} is both a status flag and a group grant"
                )));
            }
        }

        let mut set_ids = HashSet::new();
        for set in &self.selection_sets {
            if !set_ids.insert(set.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate selection set '{}'",
                    set.id
                )));
            }
            if set.options.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "selection set '{}' has no options",
                    set.id
                )));
            }
            if set.grants().len() != set.options.len() {
                return Err(ConfigError::Invalid(format!(
                    "selection set '{}' lists a grant twice",
                    set.id
                )));
            }
        }

        if self.timing.debounce_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "timing.debounce_ms".into(),
                "must be positive".into(),
            ));
        }
        if self.timing.dedup_window_ms == Some(0) {
            return Err(ConfigError::InvalidValue(
                "timing.dedup_window_ms".into(),
                "must be positive".into(),
            ));
        }
        if self.timing.eviction_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "timing.eviction_interval_ms".into(),
                "must be positive".into(),
            ));
        }
        if self.retry.attempt_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "retry.attempt_timeout_ms".into(),
                "must be positive".into(),
            ));
        }
        if self.sweep.interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "sweep.interval_secs".into(),
                "must be positive".into(),
            ));
        }
        if self.sweep.batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "sweep.batch_size".into(),
                "must be positive".into(),
            ));
        }
        if self.max_concurrent_handlers == 0 {
            return Err(ConfigError::InvalidValue(
                "max_concurrent_handlers".into(),
                "must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Every replica directory named by the mappings.
    pub fn replica_directories(&self) -> BTreeSet<DirectoryId> {
        self.mappings
            .iter()
            .flat_map(|m| m.replicas.keys().copied())
            .collect()
    }
}

/// Settings read from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub dry_run: Option<bool>,
}

impl EnvOverrides {
    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Read overrides from a custom variable reader.
    ///
    /// `GROUPSYNC_DRY_RUN` takes precedence over the legacy `DRY_RUN`.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let dry_run = ["GROUPSYNC_DRY_RUN", "DRY_RUN"]
            .into_iter()
            .find_map(|key| reader(key).ok().map(|value| (key, value)))
            .map(|(key, value)| {
                parse_bool(&value)
                    .ok_or_else(|| ConfigError::InvalidValue(key.into(), value.clone()))
            })
            .transpose()?;

        Ok(Self { dry_run })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::env::VarError;
    use std::io::Write;

    const SAMPLE: &str = r#"
primary: "1"
marker_grant: "100"
pending_grant: "101"
mappings:
  - primary_grant: "10"
    name: Tsunami
    replicas:
      "2": "20"
      "3": "30"
  - primary_grant: "11"
    replicas:
      "2": "21"
selection_sets:
  - id: weapons
    directory: "1"
    options:
      - grant: "50"
        label: Sword
      - grant: "51"
        label: Bow
  - id: extras
    directory: "1"
    mode: multiple
    options:
      - grant: "60"
"#;

    /// Create a reader closure from a HashMap (no global env mutation).
    fn make_reader(vars: HashMap<&str, &str>) -> impl Fn(&str) -> Result<String, VarError> {
        let owned: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| owned.get(key).cloned().ok_or(VarError::NotPresent)
    }

    #[test]
    fn test_parse_sample_with_defaults() {
        let config = SyncConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.primary, DirectoryId::new(1));
        assert_eq!(config.mappings.len(), 2);
        assert_eq!(config.selection_sets[0].mode, SelectionMode::Exclusive);
        assert_eq!(config.selection_sets[1].mode, SelectionMode::Multiple);
        assert!(!config.dry_run);

        assert_eq!(config.timing.debounce_window(), Duration::from_secs(1));
        assert_eq!(config.timing.dedup_window(), Duration::from_secs(1));
        assert_eq!(config.timing.attribution_window(), Duration::from_secs(5));
        assert_eq!(config.sweep.interval(), Duration::from_secs(3600));
        assert_eq!(config.sweep.batch_size, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(
            config.retry.to_retry_config().attempt_timeout,
            Duration::from_secs(10)
        );
        assert_eq!(config.max_concurrent_handlers, 16);
        assert_eq!(
            config.replica_directories(),
            BTreeSet::from([DirectoryId::new(2), DirectoryId::new(3)])
        );
    }

    #[test]
    fn test_ambiguous_reverse_mapping_rejected() {
        let yaml = r#"
primary: "1"
marker_grant: "100"
mappings:
  - primary_grant: "10"
    replicas: { "2": "20" }
  - primary_grant: "11"
    replicas: { "2": "20" }
"#;
        let err = SyncConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_marker_cannot_be_group_grant() {
        let yaml = r#"
primary: "1"
marker_grant: "10"
mappings:
  - primary_grant: "10"
    replicas: { "2": "20" }
"#;
        assert!(SyncConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_selection_set_validation() {
        let mut config = SyncConfig::from_yaml(SAMPLE).unwrap();
        config.selection_sets[0].options.push(SelectionOption {
            grant: GrantId::new(50),
            label: "Sword again".into(),
        });
        assert!(config.validate().is_err());

        let mut config = SyncConfig::from_yaml(SAMPLE).unwrap();
        config.selection_sets[1].options.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_windows_rejected() {
        let mut config = SyncConfig::from_yaml(SAMPLE).unwrap();
        config.timing.debounce_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timing.debounce_ms"));

        let mut config = SyncConfig::from_yaml(SAMPLE).unwrap();
        config.sweep.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::from_yaml(SAMPLE).unwrap();
        config.retry.attempt_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.attempt_timeout_ms"));
    }

    #[test]
    fn test_selection_hold_covers_retry_budget() {
        let mut config = SyncConfig::from_yaml(SAMPLE).unwrap();
        let retry = config.retry.to_retry_config();
        assert_eq!(config.timing.selection_hold(&retry), Duration::from_secs(30));

        // 1s debounce + 3 x 10s attempts + 2 x 30s delays
        config.timing.selection_hold_ms = 1_000;
        assert_eq!(config.timing.selection_hold(&retry), Duration::from_secs(91));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = SyncConfig::load(file.path()).unwrap();
        assert_eq!(config.marker_grant, GrantId::new(100));
    }

    #[test]
    fn test_load_missing_file() {
        let err = SyncConfig::load("/nonexistent/groupsync.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let overrides = EnvOverrides::from_reader(make_reader(HashMap::new())).unwrap();
        assert_eq!(overrides.dry_run, None);

        let overrides =
            EnvOverrides::from_reader(make_reader(HashMap::from([("DRY_RUN", "true")]))).unwrap();
        assert_eq!(overrides.dry_run, Some(true));

        let overrides = EnvOverrides::from_reader(make_reader(HashMap::from([
            ("DRY_RUN", "true"),
            ("GROUPSYNC_DRY_RUN", "0"),
        ])))
        .unwrap();
        assert_eq!(overrides.dry_run, Some(false));

        let config = SyncConfig::from_yaml(SAMPLE)
            .unwrap()
            .with_overrides(&EnvOverrides { dry_run: Some(true) });
        assert!(config.dry_run);
    }

    #[test]
    fn test_invalid_env_value() {
        let err = EnvOverrides::from_reader(make_reader(HashMap::from([(
            "GROUPSYNC_DRY_RUN",
            "maybe",
        )])))
        .unwrap_err();
        assert!(err.to_string().contains("GROUPSYNC_DRY_RUN"));
    }
}
