//! Validate command: load a configuration file and summarize it

use std::path::{Path, PathBuf};

use clap::Args;
use serde::Serialize;

use groupsync_directory::ids::{DirectoryId, GrantId};
use groupsync_engine::config::{EnvOverrides, SelectionMode, SyncConfig};

use crate::error::CliResult;

/// Arguments for the validate command
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the engine configuration (YAML)
    #[arg(short, long, env = "GROUPSYNC_CONFIG")]
    pub file: PathBuf,

    /// Output the summary as JSON
    #[arg(long)]
    pub json: bool,
}

/// What the loaded configuration will do.
#[derive(Debug, Serialize)]
pub struct ConfigSummary {
    pub primary: DirectoryId,
    pub marker_grant: GrantId,
    pub pending_grant: Option<GrantId>,
    pub groups: usize,
    pub replica_directories: Vec<DirectoryId>,
    pub exclusive_sets: Vec<String>,
    pub multiple_sets: Vec<String>,
    pub dry_run: bool,
    pub debounce_ms: u64,
    pub sweep_interval_secs: u64,
}

impl ConfigSummary {
    pub fn from_config(config: &SyncConfig) -> Self {
        let sets_of = |mode: SelectionMode| {
            config
                .selection_sets
                .iter()
                .filter(|s| s.mode == mode)
                .map(|s| s.id.clone())
                .collect()
        };

        Self {
            primary: config.primary,
            marker_grant: config.marker_grant,
            pending_grant: config.pending_grant,
            groups: config.mappings.len(),
            replica_directories: config.replica_directories().into_iter().collect(),
            exclusive_sets: sets_of(SelectionMode::Exclusive),
            multiple_sets: sets_of(SelectionMode::Multiple),
            dry_run: config.dry_run,
            debounce_ms: config.timing.debounce_ms,
            sweep_interval_secs: config.sweep.interval_secs,
        }
    }
}

/// Execute the validate command
pub fn execute(args: ValidateArgs) -> CliResult<()> {
    let config = load_config(&args.file)?;
    let summary = ConfigSummary::from_config(&config);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&args.file, &summary);
    }

    Ok(())
}

/// Load a configuration file and apply environment overrides.
pub fn load_config(path: &Path) -> CliResult<SyncConfig> {
    let overrides = EnvOverrides::from_env()?;
    let config = SyncConfig::load(path)?.with_overrides(&overrides);
    tracing::debug!(path = %path.display(), dry_run = config.dry_run, "Configuration loaded");
    Ok(config)
}

fn print_summary(path: &Path, summary: &ConfigSummary) {
    let join = |items: &[String]| {
        if items.is_empty() {
            "-".to_string()
        } else {
            items.join(", ")
        }
    };
    let replicas: Vec<String> = summary
        .replica_directories
        .iter()
        .map(ToString::to_string)
        .collect();

    println!("{} is valid", path.display());
    println!();
    println!("  Primary directory:  {}", summary.primary);
    println!("  Marker grant:       {}", summary.marker_grant);
    if let Some(pending) = summary.pending_grant {
        println!("  Pending grant:      {pending}");
    }
    println!("  Mapped groups:      {}", summary.groups);
    println!("  Replicas:           {}", join(&replicas));
    println!("  Exclusive sets:     {}", join(&summary.exclusive_sets));
    println!("  Multiple sets:      {}", join(&summary.multiple_sets));
    println!("  Debounce:           {} ms", summary.debounce_ms);
    println!("  Sweep interval:     {} s", summary.sweep_interval_secs);
    if summary.dry_run {
        println!();
        println!("  DRY RUN: mutations will be logged, not applied");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CliError;
    use std::io::Write;

    const CONFIG: &str = r#"
primary: "1"
marker_grant: "900"
mappings:
  - primary_grant: "10"
    name: Tsunami
    replicas: { "2": "20", "3": "30" }
selection_sets:
  - id: class
    directory: "2"
    options:
      - { grant: "60", label: Sword }
      - { grant: "61", label: Bow }
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_summary_counts_sets_by_mode() {
        let config = SyncConfig::from_yaml(CONFIG).unwrap();
        let summary = ConfigSummary::from_config(&config);

        assert_eq!(summary.groups, 1);
        assert_eq!(
            summary.replica_directories,
            vec![DirectoryId::new(2), DirectoryId::new(3)]
        );
        assert_eq!(summary.exclusive_sets, vec!["class".to_string()]);
        assert!(summary.multiple_sets.is_empty());
        assert!(summary.pending_grant.is_none());
    }

    #[test]
    fn test_execute_accepts_valid_file() {
        let file = write_config(CONFIG);
        let args = ValidateArgs {
            file: file.path().to_path_buf(),
            json: true,
        };
        execute(args).unwrap();
    }

    #[test]
    fn test_execute_rejects_invalid_file() {
        let file = write_config("primary: \"1\"\nmarker_grant: [oops\n");
        let args = ValidateArgs {
            file: file.path().to_path_buf(),
            json: false,
        };
        let err = execute(args).unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = load_config(Path::new("/nonexistent/groupsync.yaml")).unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }
}
