//! Shared fixture for engine integration tests.
//!
//! Three directories: the primary (1) and two replicas (2 and 3), two mapped
//! groups, an exclusive "class" set and a multi-choice "pings" set on replica 2.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use groupsync_directory::feed::RawDirectoryEvent;
use groupsync_directory::ids::{DirectoryId, GrantId, PrincipalId};
use groupsync_directory::memory::InMemoryDirectoryService;
use groupsync_directory::types::PrincipalSnapshot;
use groupsync_engine::config::SyncConfig;
use groupsync_engine::{SyncEngine, SyncResult};

// =============================================================================
// Identifiers
// =============================================================================

pub const PRIMARY: DirectoryId = DirectoryId::new(1);
pub const EU: DirectoryId = DirectoryId::new(2);
pub const NA: DirectoryId = DirectoryId::new(3);

pub const MARKER: GrantId = GrantId::new(900);
pub const PENDING: GrantId = GrantId::new(901);

pub const TSUNAMI: GrantId = GrantId::new(10);
pub const HAVEN: GrantId = GrantId::new(11);
pub const TSUNAMI_EU: GrantId = GrantId::new(20);
pub const HAVEN_EU: GrantId = GrantId::new(21);
pub const TSUNAMI_NA: GrantId = GrantId::new(30);
pub const HAVEN_NA: GrantId = GrantId::new(31);

pub const SWORD: GrantId = GrantId::new(60);
pub const BOW: GrantId = GrantId::new(61);
pub const STAFF: GrantId = GrantId::new(62);
pub const RAIDS: GrantId = GrantId::new(70);
pub const EVENTS: GrantId = GrantId::new(71);

/// A grant on replica 3 the engine does not manage.
pub const UNMANAGED: GrantId = GrantId::new(77);

pub const ALICE: PrincipalId = PrincipalId::new(100);
pub const BOB: PrincipalId = PrincipalId::new(200);
pub const CAROL: PrincipalId = PrincipalId::new(300);
pub const DAVE: PrincipalId = PrincipalId::new(400);

pub const CONFIG: &str = r#"
primary: "1"
marker_grant: "900"
pending_grant: "901"
mappings:
  - primary_grant: "10"
    name: Tsunami
    replicas: { "2": "20", "3": "30" }
  - primary_grant: "11"
    name: Haven
    replicas: { "2": "21", "3": "31" }
selection_sets:
  - id: class
    directory: "2"
    mode: exclusive
    options:
      - { grant: "60", label: Sword }
      - { grant: "61", label: Bow }
      - { grant: "62", label: Staff }
  - id: pings
    directory: "2"
    mode: multiple
    options:
      - { grant: "70", label: Raids }
      - { grant: "71", label: Events }
timing:
  debounce_ms: 500
retry:
  max_attempts: 2
  initial_delay_ms: 10
sweep:
  on_startup: false
  batch_size: 10
  batch_pause_ms: 100
"#;

pub fn config() -> SyncConfig {
    SyncConfig::from_yaml(CONFIG).expect("fixture config is valid")
}

pub fn member(id: PrincipalId, grants: &[GrantId]) -> PrincipalSnapshot {
    PrincipalSnapshot::new(id, format!("user-{id}")).with_grants(grants.iter().copied())
}

/// Directories and grant catalogs, no members.
pub fn directories() -> InMemoryDirectoryService {
    InMemoryDirectoryService::new()
        .with_directory(PRIMARY, "hub")
        .with_grant(PRIMARY, MARKER, "Guild Member")
        .with_grant(PRIMARY, PENDING, "Pending")
        .with_grant(PRIMARY, TSUNAMI, "Tsunami")
        .with_grant(PRIMARY, HAVEN, "Haven")
        .with_directory(EU, "eu")
        .with_grant(EU, TSUNAMI_EU, "Tsunami")
        .with_grant(EU, HAVEN_EU, "Haven")
        .with_grant(EU, SWORD, "Sword")
        .with_grant(EU, BOW, "Bow")
        .with_grant(EU, STAFF, "Staff")
        .with_grant(EU, RAIDS, "Raids")
        .with_grant(EU, EVENTS, "Events")
        .with_directory(NA, "na")
        .with_grant(NA, TSUNAMI_NA, "Tsunami")
        .with_grant(NA, HAVEN_NA, "Haven")
        .with_grant(NA, UNMANAGED, "Veteran")
}

// =============================================================================
// Running engine harness
// =============================================================================

/// An engine running against an in-memory service.
///
/// The feed carries every notification the service emits, plus anything the
/// test injects through [`Harness::inject`].
pub struct Harness {
    pub service: Arc<InMemoryDirectoryService>,
    pub engine: Arc<SyncEngine>,
    injector: mpsc::UnboundedSender<RawDirectoryEvent>,
    task: JoinHandle<SyncResult<()>>,
}

impl Harness {
    pub fn start(service: InMemoryDirectoryService, config: SyncConfig) -> Self {
        let service = Arc::new(service);
        let mut notifications = service.subscribe();
        let (injector, feed) = mpsc::unbounded_channel();

        let forward = injector.clone();
        tokio::spawn(async move {
            while let Some(event) = notifications.recv().await {
                if forward.send(event).is_err() {
                    break;
                }
            }
        });

        let engine = Arc::new(SyncEngine::new(service.clone(), config).expect("engine builds"));
        let task = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run(feed).await }
        });

        Self {
            service,
            engine,
            injector,
            task,
        }
    }

    /// Deliver a notification the service itself would not emit.
    pub fn inject(&self, event: RawDirectoryEvent) {
        self.injector.send(event).expect("engine feed open");
    }

    /// Let every pending burst and cascading reaction play out.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_secs(10)).await;
    }

    pub async fn stop(self) -> SyncResult<()> {
        self.engine.shutdown();
        self.task.await.expect("engine task panicked")
    }
}

/// An engine that is built but not running, for sweep and selection tests.
pub fn idle_engine(
    service: InMemoryDirectoryService,
    config: SyncConfig,
) -> (Arc<InMemoryDirectoryService>, SyncEngine) {
    let service = Arc::new(service);
    let engine = SyncEngine::new(service.clone(), config).expect("engine builds");
    (service, engine)
}
