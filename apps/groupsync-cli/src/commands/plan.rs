//! Plan command: run a sweep against a snapshot and report what it changed
//!
//! The sweep runs live against an in-memory copy of the snapshot, so the
//! reported mutations are exactly what a sweep against the real directories
//! would issue, and the converged state can be written back out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use serde::Serialize;

use groupsync_directory::memory::{InMemoryDirectoryService, RecordedCall, ServiceSnapshot};
use groupsync_engine::config::SyncConfig;
use groupsync_engine::reconciliation::SweepReport;
use groupsync_engine::SyncEngine;

use super::validate::load_config;
use crate::error::{CliError, CliResult};

/// Arguments for the plan command
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Path to the engine configuration (YAML)
    #[arg(short, long, env = "GROUPSYNC_CONFIG")]
    pub file: PathBuf,

    /// Directory snapshot to plan against (YAML or JSON)
    #[arg(short, long)]
    pub snapshot: PathBuf,

    /// Output the plan as JSON
    #[arg(long)]
    pub json: bool,

    /// Write the converged snapshot to this path
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Result of a planned sweep.
#[derive(Debug, Serialize)]
pub struct PlanOutput {
    pub report: SweepReport,
    pub mutations: Vec<RecordedCall>,
    #[serde(skip)]
    pub converged: ServiceSnapshot,
}

/// Execute the plan command
pub async fn execute(args: PlanArgs) -> CliResult<()> {
    let config = load_config(&args.file)?;
    let snapshot = load_snapshot(&args.snapshot)?;

    let plan = build_plan(config, snapshot).await?;

    if let Some(path) = &args.output {
        let yaml = serde_yaml::to_string(&plan.converged)
            .map_err(|e| CliError::Output(e.to_string()))?;
        std::fs::write(path, yaml)?;
        tracing::info!(path = %path.display(), "Converged snapshot written");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print_plan(&plan);
    }

    Ok(())
}

/// Parse a snapshot file. YAML is a superset of JSON, so both are accepted.
pub fn load_snapshot(path: &Path) -> CliResult<ServiceSnapshot> {
    let contents = std::fs::read_to_string(path).map_err(|e| CliError::Snapshot {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    serde_yaml::from_str(&contents).map_err(|e| CliError::Snapshot {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Run one sweep against an in-memory copy of `snapshot`.
pub async fn build_plan(mut config: SyncConfig, snapshot: ServiceSnapshot) -> CliResult<PlanOutput> {
    // The copy is disposable, so mutate it for real and skip batch pauses.
    config.dry_run = false;
    config.sweep.batch_pause_ms = 0;

    let service = Arc::new(InMemoryDirectoryService::from_snapshot(snapshot));
    let engine = SyncEngine::new(service.clone(), config)?;
    engine.preflight().await?;

    let report = engine
        .sweep_now()
        .await
        .ok_or_else(|| CliError::Plan("a sweep is already running".into()))?;

    tracing::info!(
        run_id = %report.run_id,
        corrections = report.statistics.corrections(),
        failures = report.statistics.failures,
        "Plan complete"
    );

    Ok(PlanOutput {
        report,
        mutations: service.calls(),
        converged: service.snapshot(),
    })
}

fn print_plan(plan: &PlanOutput) {
    let stats = &plan.report.statistics;

    if plan.mutations.is_empty() {
        println!("Directories are in sync. No changes planned.");
    } else {
        println!("Planned changes ({}):", plan.mutations.len());
        println!();
        for call in &plan.mutations {
            let grant = call
                .grant
                .map(|g| format!(" grant {g}"))
                .unwrap_or_default();
            let reason = call
                .reason
                .as_deref()
                .map(|r| format!(" ({r})"))
                .unwrap_or_default();
            let status = if call.succeeded { "" } else { " [FAILED]" };
            println!(
                "  directory {:<6} principal {:<8} {}{grant}{reason}{status}",
                call.directory, call.principal, call.action
            );
        }
    }

    println!();
    println!("  Principals scanned: {}", stats.principals_scanned);
    println!("  Flags corrected:    {}", stats.flags_corrected);
    println!("  Grants added:       {}", stats.grants_added);
    println!("  Grants removed:     {}", stats.grants_removed);
    println!("  Exclusions synced:  {}", stats.exclusions_synced);
    if !stats.is_clean() {
        println!(
            "  Failures:           {} ({} directories unreadable)",
            stats.failures, stats.directories_failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groupsync_directory::ids::{DirectoryId, GrantId, PrincipalId};
    use groupsync_directory::types::ActionKind;
    use std::io::Write;

    const CONFIG: &str = r#"
primary: "1"
marker_grant: "900"
mappings:
  - primary_grant: "10"
    name: Tsunami
    replicas: { "2": "20" }
  - primary_grant: "11"
    name: Haven
    replicas: { "2": "21" }
dry_run: true
"#;

    const SNAPSHOT: &str = r#"
directories:
  - id: "1"
    name: hub
    grants:
      - { id: "900", name: Member }
      - { id: "10", name: Tsunami }
      - { id: "11", name: Haven }
    principals:
      - { id: "100", grants: ["10", "900"] }
      - { id: "200", grants: ["11"] }
    exclusions:
      - { principal: "300", reason: cheating }
  - id: "2"
    name: eu
    grants:
      - { id: "20", name: Tsunami }
      - { id: "21", name: Haven }
    principals:
      - { id: "100", grants: ["20"] }
      - { id: "200", grants: ["20"] }
"#;

    fn config() -> SyncConfig {
        SyncConfig::from_yaml(CONFIG).unwrap()
    }

    fn snapshot() -> ServiceSnapshot {
        serde_yaml::from_str(SNAPSHOT).unwrap()
    }

    fn principal(
        snapshot: &ServiceSnapshot,
        directory: u64,
        id: u64,
    ) -> Option<std::collections::BTreeSet<GrantId>> {
        snapshot
            .directories
            .iter()
            .find(|d| d.id == DirectoryId::new(directory))?
            .principals
            .iter()
            .find(|p| p.id == PrincipalId::new(id))
            .map(|p| p.grants.clone())
    }

    #[tokio::test]
    async fn test_plan_converges_snapshot_copy() {
        let plan = build_plan(config(), snapshot()).await.unwrap();

        // Bob: marker added on the primary, replica grant switched to Haven
        assert_eq!(plan.report.statistics.flags_corrected, 1);
        assert_eq!(plan.report.statistics.grants_added, 1);
        assert_eq!(plan.report.statistics.grants_removed, 1);
        assert_eq!(plan.report.statistics.exclusions_synced, 1);
        assert!(plan.report.statistics.is_clean());
        assert!(!plan.report.dry_run);

        let converged = &plan.converged;
        assert!(principal(converged, 1, 200)
            .unwrap()
            .contains(&GrantId::new(900)));
        assert_eq!(
            principal(converged, 2, 200).unwrap(),
            [GrantId::new(21)].into_iter().collect()
        );
        assert!(converged.directories[1]
            .exclusions
            .iter()
            .any(|e| e.principal == PrincipalId::new(300)));

        assert!(plan
            .mutations
            .iter()
            .any(|c| c.action == ActionKind::AddExclusion && c.directory == DirectoryId::new(2)));
    }

    #[tokio::test]
    async fn test_plan_of_converged_state_is_empty() {
        let first = build_plan(config(), snapshot()).await.unwrap();
        let second = build_plan(config(), first.converged).await.unwrap();

        assert!(second.mutations.is_empty());
        assert_eq!(second.report.statistics.corrections(), 0);
    }

    #[tokio::test]
    async fn test_plan_rejects_missing_replica() {
        let mut snapshot = snapshot();
        snapshot.directories.truncate(1);

        let err = build_plan(config(), snapshot).await.unwrap_err();
        assert!(matches!(err, CliError::Sync(_)));
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_execute_writes_converged_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("sync.yaml");
        let snapshot_path = dir.path().join("snapshot.yaml");
        let output_path = dir.path().join("converged.yaml");
        std::fs::File::create(&config_path)
            .unwrap()
            .write_all(CONFIG.as_bytes())
            .unwrap();
        std::fs::File::create(&snapshot_path)
            .unwrap()
            .write_all(SNAPSHOT.as_bytes())
            .unwrap();

        execute(PlanArgs {
            file: config_path,
            snapshot: snapshot_path,
            json: true,
            output: Some(output_path.clone()),
        })
        .await
        .unwrap();

        let written = load_snapshot(&output_path).unwrap();
        assert_eq!(
            principal(&written, 2, 100).unwrap(),
            [GrantId::new(20)].into_iter().collect()
        );
    }

    #[test]
    fn test_malformed_snapshot_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"directories: {not: a list}").unwrap();

        let err = load_snapshot(file.path()).unwrap_err();
        assert!(matches!(err, CliError::Snapshot { .. }));
        assert_eq!(err.exit_code(), 4);
    }
}
