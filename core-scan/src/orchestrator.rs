//! # Queue Orchestrator
//!
//! Top-level state machine composing every pipeline component into one
//! start/stop scan operation.
//!
//! ## State Machine
//!
//! ```text
//! Idle → CheckingDiscovery → Crawling → Scanning → Uploading → Completing → Completed
//!              │                 │          │                      │
//!              └──────────┬──────┴──────────┘                      ├→ Stopped
//!                         ↓                                        ├→ Interrupted
//!                     Completing (on stop)                         └→ Failed
//! ```
//!
//! Any non-terminal state may move to `Failed`. `Crawling` is skipped when
//! existing discovery files are reused, `Scanning` when no document needs a
//! scan, and `Uploading` when nothing is left queued once scanning ends.
//!
//! ## Workflow
//!
//! 1. Acquire the scan lock through the [`SessionRegistry`]
//! 2. Run discovery, or reuse existing discovery files
//! 3. Fold scan records left by an unfinished run into the discovery files,
//!    then compute the scan set with the [`ChangeDetector`]
//! 4. Dispatch batches through the [`WorkerCoordinator`], which queues media
//!    per page and uploads each time the queue fills a batch
//! 5. Upload what is still queued with the [`BatchUploadProcessor`]
//! 6. Finalize with the [`ScanCompletionHandler`]
//! 7. Release the session with a terminal status
//!
//! `stop()` and `interrupt()` cancel the run: no further batches are handed
//! out, in-flight batches finish, and completion still runs with whatever was
//! scanned. The run is registered synchronously by `start()` and `spawn()`,
//! so a stop issued while the lock is still being acquired is not lost.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_scan::{QueueOrchestrator, ScanConfig, ScanOptions};
//!
//! let orchestrator = QueueOrchestrator::new(&core_config, ScanConfig::default(), event_bus)?;
//! let handle = orchestrator.spawn(ScanOptions::default());
//!
//! // later, from a UI action
//! orchestrator.stop().await;
//!
//! let report = handle.await??;
//! println!("Finished in state {}", report.final_state);
//! ```

use crate::change_detector::{ChangeDetector, ChangeStats};
use crate::checkpoint::{CheckpointStore, DiscoveryType};
use crate::completion::{CompletionContext, CompletionSummary, ScanCompletionHandler};
use crate::discovery::{DiscoveryCoordinator, DiscoveryOptions, DiscoveryOutcome, DiscoveryState};
use crate::layout::StorageLayout;
use crate::retry::{RetryExecutor, RetryingRemoteStore};
use crate::session::{Session, SessionId, SessionProgress, SessionRegistry, SessionStatus};
use crate::upload::{BatchUploadProcessor, MediaUploader, RemoteMediaUploader, UploadResult};
use crate::worker::{ScanPhaseResult, TaskWorkerSpawner, WorkerCoordinator, WorkerSettings, WorkerSpawner};
use crate::{Result, ScanConfig, ScanError};
use bridge_traits::storage::RemoteStore;
use core_runtime::config::{CoreConfig, Identity};
use core_runtime::events::{CoreEvent, EventBus, PipelineEvent};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Idle,
    CheckingDiscovery,
    Crawling,
    Scanning,
    Uploading,
    Completing,
    Completed,
    Stopped,
    Interrupted,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::CheckingDiscovery => "checking_discovery",
            PipelineState::Crawling => "crawling",
            PipelineState::Scanning => "scanning",
            PipelineState::Uploading => "uploading",
            PipelineState::Completing => "completing",
            PipelineState::Completed => "completed",
            PipelineState::Stopped => "stopped",
            PipelineState::Interrupted => "interrupted",
            PipelineState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Completed
                | PipelineState::Stopped
                | PipelineState::Interrupted
                | PipelineState::Failed
        )
    }

    fn validate_transition(&self, to: PipelineState) -> Result<()> {
        use PipelineState::*;

        let valid = match (self, to) {
            (from, Failed) => !from.is_terminal(),
            (Idle, CheckingDiscovery) => true,
            (CheckingDiscovery | Crawling, Scanning | Uploading | Completing) => true,
            (CheckingDiscovery, Crawling) => true,
            (Scanning, Uploading | Completing) => true,
            (Uploading, Completing) => true,
            (Completing, Completed | Stopped | Interrupted) => true,
            _ => false,
        };

        if !valid {
            return Err(ScanError::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
                reason: format!("Cannot transition from {} to {}", self.as_str(), to.as_str()),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a run was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Explicit user stop
    User,
    /// The hosting page or process is going away
    Unload,
}

// ============================================================================
// Options & Report
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Run incremental discovery against the last site structure
    pub incremental: bool,
    /// Re-crawl even if discovery files exist
    pub force_full_discovery: bool,
    /// Scan every document regardless of change state
    pub force_rescan: bool,
}

impl ScanOptions {
    fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            discovery_type: if self.incremental {
                DiscoveryType::Incremental
            } else {
                DiscoveryType::Full
            },
            force_full: self.force_full_discovery,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanReport {
    pub session_id: SessionId,
    pub final_state: PipelineState,
    pub discovery: Option<DiscoveryOutcome>,
    pub changes: ChangeStats,
    pub scanning: Option<ScanPhaseResult>,
    pub upload: Option<UploadResult>,
    pub completion: Option<CompletionSummary>,
}

impl ScanReport {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            final_state: PipelineState::Idle,
            discovery: None,
            changes: ChangeStats::default(),
            scanning: None,
            upload: None,
            completion: None,
        }
    }
}

struct ActiveRun {
    session_id: SessionId,
    cancel: CancellationToken,
    stop_reason: Option<StopReason>,
}

type ActiveSlot = Arc<Mutex<Option<ActiveRun>>>;

fn lock_slot(slot: &Mutex<Option<ActiveRun>>) -> MutexGuard<'_, Option<ActiveRun>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Claim on the active-run slot; frees it when the run ends or its future
/// is dropped
struct RunClaim {
    slot: ActiveSlot,
    session: Session,
    cancel: CancellationToken,
}

impl RunClaim {
    /// Free the slot, returning the stop reason recorded for this run
    fn release(&self) -> Option<StopReason> {
        let mut active = lock_slot(&self.slot);
        match active.as_ref() {
            Some(run) if run.session_id == self.session.session_id => {
                active.take().and_then(|run| run.stop_reason)
            }
            _ => None,
        }
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct QueueOrchestrator {
    config: ScanConfig,
    identity: Identity,
    event_bus: EventBus,
    sessions: SessionRegistry,
    checkpoints: CheckpointStore,
    discovery: Arc<DiscoveryCoordinator>,
    workers: Arc<WorkerCoordinator>,
    uploads: Arc<BatchUploadProcessor>,
    completion: Arc<ScanCompletionHandler>,
    state: Arc<RwLock<PipelineState>>,
    active: ActiveSlot,
}

impl QueueOrchestrator {
    /// Build the pipeline with task-based workers and the remote media uploader
    pub fn new(core: &CoreConfig, config: ScanConfig, event_bus: EventBus) -> Result<Self> {
        let layout = StorageLayout::new(&core.context, &config.metadata_folder);
        let retrying: Arc<dyn RemoteStore> = Arc::new(RetryingRemoteStore::new(
            core.remote_store.clone(),
            RetryExecutor::new(config.retry_policy.clone()),
        ));
        let spawner = Arc::new(TaskWorkerSpawner::new(retrying));
        let uploader = Arc::new(RemoteMediaUploader::new(core.remote_store.clone(), layout));
        Self::with_components(core, config, event_bus, spawner, uploader)
    }

    /// Build the pipeline around a custom worker spawner and media uploader
    ///
    /// Sessions, checkpoints and discovery reach the store through a
    /// [`RetryingRemoteStore`]. Completion steps and upload batches retry on
    /// their own and use the store directly, so no call is retried twice.
    pub fn with_components(
        core: &CoreConfig,
        config: ScanConfig,
        event_bus: EventBus,
        spawner: Arc<dyn WorkerSpawner>,
        uploader: Arc<dyn MediaUploader>,
    ) -> Result<Self> {
        core.validate()?;
        config.validate()?;

        let layout = StorageLayout::new(&core.context, &config.metadata_folder);
        let store = core.remote_store.clone();
        let cache = core.local_cache.clone();
        let clock = core.clock.clone();
        let retry = RetryExecutor::new(config.retry_policy.clone());
        let retrying: Arc<dyn RemoteStore> =
            Arc::new(RetryingRemoteStore::new(store.clone(), retry.clone()));
        let checkpoints = CheckpointStore::new(retrying.clone(), layout.clone());

        let sessions = SessionRegistry::new(
            retrying.clone(),
            cache.clone(),
            layout.clone(),
            clock.clone(),
            event_bus.clone(),
            config.stale_session_threshold,
        );
        let discovery = DiscoveryCoordinator::new(
            retrying,
            layout.clone(),
            checkpoints.clone(),
            clock.clone(),
            event_bus.clone(),
            config.document_extension.clone(),
        );
        let uploads = Arc::new(BatchUploadProcessor::new(
            uploader,
            cache.clone(),
            checkpoints.clone(),
            clock.clone(),
            event_bus.clone(),
            retry.clone(),
            config.upload_batch_size,
            config.inter_batch_delay,
        ));
        let workers = WorkerCoordinator::new(
            spawner,
            cache.clone(),
            checkpoints.clone(),
            clock.clone(),
            event_bus.clone(),
            WorkerSettings {
                batch_size: config.scan_batch_size,
                pool_size: config.worker_pool_size,
                init_timeout: config.worker_init_timeout,
                internal_domains: config.internal_domains.clone(),
            },
        )
        .with_uploads(uploads.clone());
        let completion = ScanCompletionHandler::new(
            store,
            cache,
            layout,
            clock,
            retry,
            config.audit_log_max_entries,
        );

        Ok(Self {
            config,
            identity: core.identity.clone(),
            event_bus,
            sessions,
            checkpoints,
            discovery: Arc::new(discovery),
            workers: Arc::new(workers),
            uploads,
            completion: Arc::new(completion),
            state: Arc::new(RwLock::new(PipelineState::Idle)),
            active: Arc::new(Mutex::new(None)),
        })
    }

    pub async fn state(&self) -> PipelineState {
        *self.state.read().await
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Session of the run in progress
    pub async fn active_session(&self) -> Option<SessionId> {
        lock_slot(&self.active).as_ref().map(|run| run.session_id)
    }

    /// Run a scan cycle in a background task
    ///
    /// The run is registered before this returns, so a `stop()` issued right
    /// after it is honored.
    pub fn spawn(&self, options: ScanOptions) -> JoinHandle<Result<ScanReport>> {
        let claim = self.claim_run();
        let orchestrator = self.clone_for_task();
        tokio::spawn(async move { orchestrator.run_claimed(claim?, options).await })
    }

    /// Stop the running cycle; it ends in `Stopped` after completion runs
    ///
    /// Returns `false` when nothing is running.
    pub async fn stop(&self) -> bool {
        self.cancel_run(StopReason::User)
    }

    /// Signal that the host is going away; the cycle ends in `Interrupted`
    pub async fn interrupt(&self) -> bool {
        self.cancel_run(StopReason::Unload)
    }

    fn cancel_run(&self, reason: StopReason) -> bool {
        let mut active = lock_slot(&self.active);
        let Some(run) = active.as_mut() else {
            debug!("No active scan to cancel");
            return false;
        };

        info!(session_id = %run.session_id, reason = ?reason, "Cancelling scan");
        run.stop_reason.get_or_insert(reason);
        run.cancel.cancel();
        true
    }

    /// Take the active-run slot for a new session, without awaiting
    fn claim_run(&self) -> Result<RunClaim> {
        let mut active = lock_slot(&self.active);
        if let Some(run) = active.as_ref() {
            return Err(ScanError::LockConflict {
                holder: run.session_id.to_string(),
            });
        }

        let session = self.sessions.new_session(&self.identity);
        let cancel = CancellationToken::new();
        *active = Some(ActiveRun {
            session_id: session.session_id,
            cancel: cancel.clone(),
            stop_reason: None,
        });
        Ok(RunClaim {
            slot: Arc::clone(&self.active),
            session,
            cancel,
        })
    }

    /// Run one full scan cycle to a terminal state
    ///
    /// # Errors
    ///
    /// - [`ScanError::LockConflict`] if another session holds the scan lock;
    ///   nothing was started and the state stays `Idle`
    /// - [`ScanError::WorkerInitTimeout`] and storage failures end the cycle
    ///   in `Failed`
    #[instrument(skip(self))]
    pub async fn start(&self, options: ScanOptions) -> Result<ScanReport> {
        let claim = self.claim_run()?;
        self.run_claimed(claim, options).await
    }

    async fn run_claimed(&self, claim: RunClaim, options: ScanOptions) -> Result<ScanReport> {
        // Phase 0: lock
        let session_id = claim.session.session_id;
        let cancel = claim.cancel.clone();

        if !self.sessions.acquire(&claim.session).await? {
            let holder = self
                .sessions
                .current_holder()
                .await?
                .map(|s| s.session_id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(ScanError::LockConflict { holder });
        }

        if let Some(primary) = self.sessions.resolve_conflicts().await? {
            if primary != session_id {
                return Err(ScanError::LockConflict {
                    holder: primary.to_string(),
                });
            }
        }

        *self.state.write().await = PipelineState::Idle;
        info!(session_id = %session_id, "Scan lock acquired, starting cycle");

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(session_id, heartbeat_stop.clone());

        let outcome = self.run_cycle(session_id, options, &cancel).await;

        heartbeat_stop.cancel();
        heartbeat.await.ok();

        let stop_reason = claim.release();

        match outcome {
            Ok(mut report) => {
                let (final_state, session_status) = match stop_reason {
                    Some(StopReason::User) => (PipelineState::Stopped, SessionStatus::Completed),
                    Some(StopReason::Unload) => {
                        (PipelineState::Interrupted, SessionStatus::Interrupted)
                    }
                    None => (PipelineState::Completed, SessionStatus::Completed),
                };
                self.transition(session_id, final_state).await?;
                report.final_state = final_state;
                self.sessions.release(&session_id, session_status).await?;

                let scanning = report.scanning.clone().unwrap_or_default();
                info!(
                    session_id = %session_id,
                    final_state = %final_state,
                    scanned = scanning.scanned_pages,
                    failed = scanning.failed_pages,
                    "Scan cycle finished"
                );
                self.event_bus
                    .emit(CoreEvent::Pipeline(PipelineEvent::Completed {
                        session_id: session_id.to_string(),
                        final_state: final_state.as_str().to_string(),
                        scanned_pages: scanning.scanned_pages,
                        failed_pages: scanning.failed_pages,
                        total_media: scanning.total_media,
                    }))
                    .ok();
                Ok(report)
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Scan cycle failed");
                if let Err(transition_err) = self.transition(session_id, PipelineState::Failed).await {
                    warn!(error = %transition_err, "Could not record failed state");
                }
                if let Err(release_err) = self.sessions.release(&session_id, SessionStatus::Failed).await {
                    warn!(error = %release_err, "Could not release failed session");
                }
                self.event_bus
                    .emit(CoreEvent::Pipeline(PipelineEvent::Failed {
                        session_id: session_id.to_string(),
                        message: e.to_string(),
                    }))
                    .ok();
                Err(e)
            }
        }
    }

    async fn run_cycle(
        &self,
        session_id: SessionId,
        options: ScanOptions,
        cancel: &CancellationToken,
    ) -> Result<ScanReport> {
        let mut report = ScanReport::new(session_id);
        let discovery_options = options.discovery_options();

        // Phase 1: discovery
        self.transition(session_id, PipelineState::CheckingDiscovery).await?;
        if self.discovery.needs_crawl(discovery_options).await? {
            self.transition(session_id, PipelineState::Crawling).await?;
        }
        info!("Phase 1: Discovery ({})", discovery_options.discovery_type);
        let discovery = self.discovery.run(discovery_options, cancel).await?;
        let discovery_interrupted = discovery.state == DiscoveryState::Interrupted;
        report.discovery = Some(discovery.clone());

        if discovery_interrupted || cancel.is_cancelled() {
            info!("Cancelled during discovery, finalizing");
            self.finalize(session_id, &discovery, &mut report).await?;
            return Ok(report);
        }

        // Phase 2: change detection
        info!("Phase 2: Computing scan set");
        let store = self.discovery.discovery_store();
        let mut files = store.load_all().await?;
        let before = files.clone();
        let resumed = self.completion.apply_scan_records(&mut files).await?;
        if resumed > 0 {
            info!(resumed, "Applied scan records left by an unfinished run");
        }
        let change_set = ChangeDetector::new(options.force_rescan).evaluate(&mut files);
        for (file, original) in files.iter().zip(before.iter()) {
            if file != original {
                store.save(file).await?;
            }
        }
        report.changes = change_set.stats;
        info!(
            to_scan = change_set.stats.to_scan,
            new = change_set.stats.new,
            changed = change_set.stats.changed,
            unchanged = change_set.stats.unchanged,
            retry = change_set.stats.retry,
            "Scan set computed"
        );

        // Phase 3: scanning, flushing uploads whenever a batch fills
        if change_set.candidates.is_empty() {
            info!("No documents need scanning");
        } else {
            self.transition(session_id, PipelineState::Scanning).await?;
            info!("Phase 3: Scanning {} documents", change_set.candidates.len());
            let scanning = self
                .workers
                .run(&session_id, change_set.candidates, cancel)
                .await?;
            report.scanning = Some(scanning);
        }
        let mid_scan = report.scanning.as_ref().and_then(|s| s.upload.clone());

        // Phase 4: upload the remainder
        let queued = self.uploads.queued().await?.len();
        report.upload = if cancel.is_cancelled() {
            info!(queued, "Cancelled, media left queued for the next run");
            mid_scan
        } else if queued > 0 {
            self.transition(session_id, PipelineState::Uploading).await?;
            info!("Phase 4: Uploading {} queued media", queued);
            let flushed = self.uploads.flush(&session_id).await?;
            Some(match mid_scan {
                Some(earlier) => earlier.merged(flushed),
                None => flushed,
            })
        } else {
            mid_scan
        };

        // Phase 5: completion
        self.finalize(session_id, &discovery, &mut report).await?;
        Ok(report)
    }

    async fn finalize(
        &self,
        session_id: SessionId,
        discovery: &DiscoveryOutcome,
        report: &mut ScanReport,
    ) -> Result<()> {
        self.transition(session_id, PipelineState::Completing).await?;
        info!("Phase 5: Completing");

        let scanning = report.scanning.clone().unwrap_or_default();
        let scanning_duration_ms = self
            .checkpoints
            .load_scanning()
            .await?
            .and_then(|c| c.duration_ms())
            .unwrap_or_default();

        let context = CompletionContext {
            session_id,
            discovery_type: discovery.discovery_type,
            discovery_duration_ms: discovery.duration_ms(),
            scanning_duration_ms: if report.scanning.is_some() {
                scanning_duration_ms
            } else {
                0
            },
            scanned_pages: scanning.scanned_pages,
            failed_pages: scanning.failed_pages,
        };
        report.completion = Some(self.completion.complete(&context).await?);
        Ok(())
    }

    async fn transition(&self, session_id: SessionId, to: PipelineState) -> Result<()> {
        let from = {
            let mut state = self.state.write().await;
            state.validate_transition(to)?;
            let from = *state;
            *state = to;
            from
        };

        debug!(from = %from, to = %to, "Pipeline state change");
        self.event_bus
            .emit(CoreEvent::Pipeline(PipelineEvent::StateChanged {
                session_id: session_id.to_string(),
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            }))
            .ok();
        Ok(())
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.config.stale_session_threshold / 5).max(Duration::from_secs(1))
    }

    /// Refresh the session heartbeat with live progress until `stop` fires
    fn spawn_heartbeat(&self, session_id: SessionId, stop: CancellationToken) -> JoinHandle<()> {
        let sessions = self.sessions.clone();
        let state = Arc::clone(&self.state);
        let progress = self.workers.progress();
        let interval = self.heartbeat_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let stage = state.read().await.as_str();
                        let snapshot: SessionProgress = *progress.borrow();
                        if let Err(e) = sessions.heartbeat(&session_id, stage, snapshot).await {
                            warn!(session_id = %session_id, error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        })
    }

    fn clone_for_task(&self) -> Self {
        Self {
            config: self.config.clone(),
            identity: self.identity.clone(),
            event_bus: self.event_bus.clone(),
            sessions: self.sessions.clone(),
            checkpoints: self.checkpoints.clone(),
            discovery: Arc::clone(&self.discovery),
            workers: Arc::clone(&self.workers),
            uploads: Arc::clone(&self.uploads),
            completion: Arc::clone(&self.completion),
            state: Arc::clone(&self.state),
            active: Arc::clone(&self.active),
        }
    }
}
