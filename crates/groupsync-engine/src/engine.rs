//! Engine runtime.
//!
//! Wires every component around one shared deduplicator, validates the
//! configuration against the live directories and runs the event loop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use groupsync_directory::feed::{EventFeed, RawDirectoryEvent};
use groupsync_directory::ids::{DirectoryId, GrantId, PrincipalId};
use groupsync_directory::resilience::{RetryExecutor, TimeoutDirectory};
use groupsync_directory::traits::DirectoryReader;
use groupsync_directory::types::PrincipalSnapshot;

use crate::config::{SelectionOption, SyncConfig};
use crate::debounce::{CoalescedUpdate, DebounceCoalescer};
use crate::dedup::OperationDeduplicator;
use crate::dispatch::{MutationDispatcher, SharedDirectory};
use crate::error::{SyncError, SyncResult};
use crate::mapping::GroupMapping;
use crate::normalizer::{normalize, ChangeEvent};
use crate::orchestrator::{FanOutReport, SyncOrchestrator};
use crate::propagation::ExclusionPropagator;
use crate::reconciliation::{ReconciliationSweep, SweepReport};
use crate::selection::{ExclusivityEnforcer, SelectionOutcome};

/// The synchronization engine.
pub struct SyncEngine {
    config: SyncConfig,
    dispatcher: MutationDispatcher,
    handler: EventHandler,
    sweep: ReconciliationSweep,
    shutdown: Arc<AtomicBool>,
    shutdown_signal: Arc<Notify>,
    sweep_running: Arc<AtomicBool>,
    last_sweep: Arc<Mutex<Option<SweepReport>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("primary", &self.config.primary)
            .field("dry_run", &self.config.dry_run)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Build an engine from a validated configuration.
    pub fn new(service: SharedDirectory, config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let mapping = Arc::new(GroupMapping::new(config.primary, &config.mappings)?);

        let retry = config.retry.to_retry_config();
        let selection_hold = config.timing.selection_hold(&retry);
        // Reads go through the same per-call limit as retried writes
        let service: SharedDirectory = Arc::new(TimeoutDirectory::new(service, retry.attempt_timeout));

        let dedup = Arc::new(OperationDeduplicator::new(config.timing.dedup_window()));
        let dispatcher = MutationDispatcher::new(
            service,
            dedup,
            RetryExecutor::new(retry),
            config.dry_run,
        );

        let orchestrator = SyncOrchestrator::new(
            dispatcher.clone(),
            Arc::clone(&mapping),
            config.marker_grant,
            config.pending_grant,
        );
        let propagator = ExclusionPropagator::new(
            dispatcher.clone(),
            Arc::clone(&mapping),
            config.timing.attribution_window(),
        );
        let enforcer = ExclusivityEnforcer::new(dispatcher.clone(), config.selection_sets.clone())
            .with_hold(selection_hold);
        let sweep = ReconciliationSweep::new(
            orchestrator.clone(),
            propagator.clone(),
            config.sweep.batch_size,
            config.sweep.batch_pause(),
        );

        Ok(Self {
            handler: EventHandler {
                orchestrator,
                propagator,
                enforcer,
            },
            dispatcher,
            sweep,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_signal: Arc::new(Notify::new()),
            sweep_running: Arc::new(AtomicBool::new(false)),
            last_sweep: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &MutationDispatcher {
        &self.dispatcher
    }

    pub fn is_dry_run(&self) -> bool {
        self.dispatcher.is_dry_run()
    }

    /// Validate the configuration against the live directories.
    ///
    /// Every referenced directory and grant must exist. Runs before any mutation;
    /// a failure here is fatal.
    #[instrument(skip(self))]
    pub async fn preflight(&self) -> SyncResult<()> {
        let service = self.dispatcher.service();
        let primary = self.config.primary;
        let mut problems = Vec::new();

        if service.fetch_directory(primary).await?.is_none() {
            return Err(SyncError::DirectoryMissing { directory: primary });
        }

        let replicas = self.config.replica_directories();
        let mut missing = HashSet::new();
        for directory in &replicas {
            if service.fetch_directory(*directory).await?.is_none() {
                problems.push(format!("directory {directory} does not exist"));
                missing.insert(*directory);
            }
        }

        let mut grants: Vec<(DirectoryId, GrantId, &str)> =
            vec![(primary, self.config.marker_grant, "marker grant")];
        if let Some(pending) = self.config.pending_grant {
            grants.push((primary, pending, "pending grant"));
        }
        for entry in &self.config.mappings {
            grants.push((primary, entry.primary_grant, "group grant"));
            grants.extend(
                entry
                    .replicas
                    .iter()
                    .map(|(directory, grant)| (*directory, *grant, "replica grant")),
            );
        }
        for set in &self.config.selection_sets {
            grants.extend(
                set.options
                    .iter()
                    .map(|o| (set.directory, o.grant, "selection grant")),
            );
        }

        for (directory, grant, role) in grants {
            if missing.contains(&directory) {
                continue;
            }
            if service.fetch_grant(directory, grant).await?.is_none() {
                problems.push(format!("{role} {grant} does not exist in directory {directory}"));
            }
        }

        if problems.is_empty() {
            info!(
                replicas = replicas.len(),
                mappings = self.config.mappings.len(),
                "Preflight checks passed"
            );
            Ok(())
        } else {
            error!(problems = ?problems, "Preflight checks failed");
            Err(SyncError::configuration(problems.join("; ")))
        }
    }

    /// Run the engine until the feed closes or shutdown is requested.
    ///
    /// Pending bursts are flushed and in-flight handlers awaited before returning.
    #[instrument(skip(self, feed))]
    pub async fn run<F: EventFeed>(&self, mut feed: F) -> SyncResult<()> {
        self.preflight().await?;

        let max_handlers = self.config.max_concurrent_handlers;
        info!(
            primary = %self.config.primary,
            dry_run = self.is_dry_run(),
            max_handlers,
            "Starting synchronization engine"
        );

        let (coalescer, mut updates) = DebounceCoalescer::new(self.config.timing.debounce_window());
        let semaphore = Arc::new(Semaphore::new(max_handlers));

        let mut sweep_task = if self.config.sweep.on_startup {
            self.spawn_sweep()
        } else {
            None
        };

        let period = self.config.sweep.interval();
        let mut sweep_interval = interval_at(Instant::now() + period, period);
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut eviction_interval = interval(self.config.timing.eviction_interval());
        eviction_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.is_shutdown() {
                info!("Shutdown requested, stopping event loop");
                break;
            }

            tokio::select! {
                () = self.shutdown_signal.notified() => {}
                event = feed.next_event() => {
                    let Some(event) = event else {
                        info!("Event feed closed");
                        break;
                    };
                    self.route(event, &coalescer, &semaphore).await;
                }
                Some(update) = updates.recv() => {
                    self.spawn_update(update, &semaphore).await;
                }
                _ = sweep_interval.tick() => {
                    if let Some(task) = self.spawn_sweep() {
                        sweep_task = Some(task);
                    }
                }
                _ = eviction_interval.tick() => {
                    let evicted = self.dispatcher.dedup().evict_expired();
                    if evicted > 0 {
                        debug!(evicted, "Evicted expired dedup records");
                    }
                    let released = self.handler.enforcer.holds().evict_expired();
                    if released > 0 {
                        debug!(released, "Released expired selection holds");
                    }
                }
            }
        }

        // Timer tasks hold the remaining senders; the channel closes once every
        // pending burst has been delivered.
        drop(coalescer);
        while let Some(update) = updates.recv().await {
            self.spawn_update(update, &semaphore).await;
        }

        info!("Waiting for in-flight handlers to complete");
        let permits = u32::try_from(max_handlers).unwrap_or(u32::MAX);
        let _ = semaphore.acquire_many(permits).await;

        if let Some(task) = sweep_task {
            if let Err(e) = task.await {
                error!(error = %e, "Sweep task failed");
            }
        }

        info!("Synchronization engine stopped");
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_signal.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run a sweep now and wait for it.
    ///
    /// Returns `None` if another sweep is already running.
    pub async fn sweep_now(&self) -> Option<SweepReport> {
        let _guard = self.try_begin_sweep()?;
        let report = self.sweep.run().await;
        *self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        Some(report)
    }

    /// Report of the most recently completed sweep.
    pub fn last_sweep(&self) -> Option<SweepReport> {
        self.last_sweep
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a selection submitted by the presentation surface.
    pub async fn on_selection_submitted(
        &self,
        principal: PrincipalId,
        directory: DirectoryId,
        chosen: &[GrantId],
        set_id: &str,
    ) -> SyncResult<SelectionOutcome> {
        self.handler
            .enforcer
            .submit_selection(principal, directory, chosen, set_id)
            .await
    }

    /// The option of a selection set the principal currently holds.
    pub async fn current_grant(
        &self,
        principal: PrincipalId,
        set_id: &str,
    ) -> SyncResult<Option<SelectionOption>> {
        self.handler.enforcer.current_grant(principal, set_id).await
    }

    fn try_begin_sweep(&self) -> Option<SweepGuard> {
        if self
            .sweep_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Previous sweep still running, skipping");
            return None;
        }
        Some(SweepGuard(Arc::clone(&self.sweep_running)))
    }

    fn spawn_sweep(&self) -> Option<JoinHandle<()>> {
        let guard = self.try_begin_sweep()?;
        let sweep = self.sweep.clone();
        let last_sweep = Arc::clone(&self.last_sweep);

        Some(tokio::spawn(async move {
            let _guard = guard;
            let report = sweep.run().await;
            *last_sweep.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
        }))
    }

    async fn route(
        &self,
        event: RawDirectoryEvent,
        coalescer: &DebounceCoalescer,
        semaphore: &Arc<Semaphore>,
    ) {
        match event {
            RawDirectoryEvent::PrincipalUpdated {
                directory,
                before,
                after,
            } => coalescer.submit(directory, before, after),
            other => {
                for change in normalize(&other) {
                    let Some(permit) = acquire(semaphore).await else {
                        return;
                    };
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        handler.handle_change(change).await;
                    });
                }
            }
        }
    }

    async fn spawn_update(&self, update: CoalescedUpdate, semaphore: &Arc<Semaphore>) {
        let Some(permit) = acquire(semaphore).await else {
            return;
        };
        let handler = self.handler.clone();
        tokio::spawn(async move {
            let _permit = permit;
            handler.handle_update(update).await;
        });
    }
}

async fn acquire(semaphore: &Arc<Semaphore>) -> Option<tokio::sync::OwnedSemaphorePermit> {
    match Arc::clone(semaphore).acquire_owned().await {
        Ok(permit) => Some(permit),
        Err(e) => {
            error!(error = %e, "Handler pool closed, dropping event");
            None
        }
    }
}

/// Clears the running flag when the sweep ends, even on panic.
struct SweepGuard(Arc<AtomicBool>);

impl Drop for SweepGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Per-event dispatch into the components. Errors are logged and dropped.
#[derive(Debug, Clone)]
struct EventHandler {
    orchestrator: SyncOrchestrator,
    propagator: ExclusionPropagator,
    enforcer: ExclusivityEnforcer,
}

impl EventHandler {
    fn primary(&self) -> DirectoryId {
        self.orchestrator.mapping().primary()
    }

    #[instrument(skip(self, update), fields(directory = %update.directory, principal = %update.after.id))]
    async fn handle_update(&self, update: CoalescedUpdate) {
        let CoalescedUpdate {
            directory,
            before,
            after,
        } = update;

        let result = if directory == self.primary() {
            self.orchestrator.on_primary_update(&before, &after).await
        } else {
            self.orchestrator
                .on_replica_update(directory, &before, &after)
                .await
        };
        log_report("grant update", result);

        if self.enforcer.watches(directory) {
            log_report("exclusivity", self.enforcer.enforce(directory, &before).await);
        }
    }

    #[instrument(skip(self, change), fields(kind = change.kind(), directory = %change.directory(), principal = %change.principal()))]
    async fn handle_change(&self, change: ChangeEvent) {
        let from_primary = change.directory() == self.primary();

        match change {
            ChangeEvent::PrincipalJoined {
                directory,
                principal,
                grants,
            } => {
                let snapshot = PrincipalSnapshot::new(principal, "").with_grants(grants);
                log_report(
                    "join",
                    self.orchestrator
                        .on_principal_joined(directory, &snapshot)
                        .await,
                );
            }
            ChangeEvent::PrincipalRemoved { principal, .. } if from_primary => {
                let outcome = self.propagator.on_principal_removed(principal).await;
                info!(kind = ?outcome.kind, applied = outcome.report.applied, "Primary removal propagated");
                log_report("removal", Ok(outcome.report));
            }
            ChangeEvent::ExclusionAdded {
                principal, reason, ..
            } if from_primary => {
                let report = self
                    .propagator
                    .on_exclusion_added(principal, reason.as_deref())
                    .await;
                log_report("exclusion", Ok(report));
            }
            ChangeEvent::ExclusionRemoved { principal, .. } if from_primary => {
                let report = self.propagator.on_exclusion_removed(principal).await;
                log_report("exclusion lift", Ok(report));
            }
            // Grant changes arrive through the coalescer
            ChangeEvent::GrantAdded { .. } | ChangeEvent::GrantRemoved { .. } => {}
            _ => debug!("Replica-side change needs no propagation"),
        }
    }
}

fn log_report(context: &str, result: SyncResult<FanOutReport>) {
    match result {
        Ok(report) if report.is_complete() => {
            if report.attempted > 0 {
                debug!(context, applied = report.applied, suppressed = report.suppressed, "Handled");
            }
        }
        Ok(report) => {
            warn!(context, failed = report.failures.len(), total = report.attempted, "Handled with isolated failures");
        }
        Err(e) => {
            error!(context, error = %e, "Handler failed");
        }
    }
}
