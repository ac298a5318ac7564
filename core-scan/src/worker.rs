//! # Worker Coordinator
//!
//! Owns a small pool of scan workers and feeds them batches of documents.
//! Workers are isolated tasks that talk to the coordinator only through
//! typed messages over `tokio::sync::mpsc` channels.
//!
//! ## Protocol
//!
//! ```text
//! coordinator                         worker
//!     │── Init ─────────────────────────▶│
//!     │◀──────────────────── Initialized ─│   (bounded by worker_init_timeout)
//!     │── StartQueueProcessing ─────────▶│
//!     │◀─────────────────── RequestBatch ─│
//!     │── Batch ────────────────────────▶│
//!     │◀──── PageScanned / PageScanError ─│   (one per document)
//!     │◀────────────────── BatchComplete ─│
//!     │◀─────────────────── RequestBatch ─│
//!     │── NoMoreBatches / Stop ─────────▶│
//!     │◀───────── QueueProcessingStopped ─│
//! ```
//!
//! Batches are pulled: a worker asks for the next batch only after the
//! previous one is done, so a slow worker never builds a backlog. A document
//! is recorded as `running` in the local cache at the moment its batch is
//! handed out, never earlier.
//!
//! Workers outlive a phase. After `QueueProcessingStopped` a worker waits for
//! the next `StartQueueProcessing`, so the pool is spawned and initialized
//! once and reused by later phases. Dropping the coordinator ends them.

use crate::change_detector::ScanCandidate;
use crate::checkpoint::{CheckpointStore, ScanningCheckpoint, ScanningCheckpointStatus};
use crate::document::{PageScanRecord, ScanStatus};
use crate::extractor::MediaExtractor;
use crate::media::MediaAsset;
use crate::session::{SessionId, SessionProgress};
use crate::upload::{BatchUploadProcessor, UploadResult};
use crate::{Result, ScanError};
use bridge_traits::storage::{CacheCollection, LocalCache, RemoteStore};
use bridge_traits::time::Clock;
use core_runtime::events::{CoreEvent, EventBus, ScanEvent};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Messages
// ============================================================================

/// Coordinator → worker
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    Init {
        internal_domains: Vec<String>,
    },
    StartQueueProcessing {
        session_id: String,
        documents_to_scan: u64,
        batch_size: usize,
    },
    Batch(Vec<ScanCandidate>),
    NoMoreBatches,
    Stop,
}

/// Worker → coordinator
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Initialized,
    RequestBatch,
    PageScanned {
        page: String,
        source_file: String,
        media_count: u64,
        assets: Vec<MediaAsset>,
    },
    PageScanError {
        page: String,
        source_file: String,
        error: String,
    },
    BatchComplete {
        processed_count: u64,
        total_media: u64,
    },
    QueueProcessingStopped {
        reason: String,
        processed_count: u64,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerEnvelope {
    pub worker_id: usize,
    pub message: WorkerMessage,
}

// ============================================================================
// Spawning
// ============================================================================

/// Creates scan workers
///
/// A worker reports on `messages` and is driven through the returned sender.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, worker_id: usize, messages: mpsc::Sender<WorkerEnvelope>) -> mpsc::Sender<WorkerCommand>;
}

/// Runs each worker as a tokio task reading documents from the remote store
pub struct TaskWorkerSpawner {
    store: Arc<dyn RemoteStore>,
}

impl TaskWorkerSpawner {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }
}

impl WorkerSpawner for TaskWorkerSpawner {
    fn spawn(&self, worker_id: usize, messages: mpsc::Sender<WorkerEnvelope>) -> mpsc::Sender<WorkerCommand> {
        let (commands_tx, commands_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let worker = ScanWorker {
            id: worker_id,
            store: self.store.clone(),
            messages,
        };
        tokio::spawn(worker.run(commands_rx));
        commands_tx
    }
}

struct ScanWorker {
    id: usize,
    store: Arc<dyn RemoteStore>,
    messages: mpsc::Sender<WorkerEnvelope>,
}

impl ScanWorker {
    async fn send(&self, message: WorkerMessage) -> bool {
        self.messages
            .send(WorkerEnvelope {
                worker_id: self.id,
                message,
            })
            .await
            .is_ok()
    }

    async fn run(self, mut commands: mpsc::Receiver<WorkerCommand>) {
        let mut extractor: Option<MediaExtractor> = None;
        let mut processed_count = 0u64;
        let mut total_media = 0u64;

        while let Some(command) = commands.recv().await {
            match command {
                WorkerCommand::Init { internal_domains } => match MediaExtractor::new(internal_domains) {
                    Ok(e) => {
                        extractor = Some(e);
                        if !self.send(WorkerMessage::Initialized).await {
                            return;
                        }
                    }
                    Err(e) => {
                        error!(worker_id = self.id, error = %e, "Worker init failed");
                        return;
                    }
                },
                WorkerCommand::StartQueueProcessing {
                    session_id,
                    documents_to_scan,
                    batch_size,
                } => {
                    processed_count = 0;
                    total_media = 0;
                    debug!(
                        worker_id = self.id,
                        session_id = %session_id,
                        documents_to_scan,
                        batch_size,
                        "Worker starting queue processing"
                    );
                    if !self.send(WorkerMessage::RequestBatch).await {
                        return;
                    }
                }
                WorkerCommand::Batch(batch) => {
                    let Some(extractor) = extractor.as_ref() else {
                        warn!(worker_id = self.id, "Batch received before init");
                        continue;
                    };
                    for candidate in batch {
                        let message = self.scan_page(extractor, &candidate).await;
                        if let WorkerMessage::PageScanned { media_count, .. } = &message {
                            total_media += media_count;
                        }
                        processed_count += 1;
                        if !self.send(message).await {
                            return;
                        }
                    }
                    let sent = self
                        .send(WorkerMessage::BatchComplete {
                            processed_count,
                            total_media,
                        })
                        .await
                        && self.send(WorkerMessage::RequestBatch).await;
                    if !sent {
                        return;
                    }
                }
                WorkerCommand::NoMoreBatches | WorkerCommand::Stop => {
                    let reason = if matches!(command, WorkerCommand::Stop) {
                        "stopped"
                    } else {
                        "completed"
                    };
                    let sent = self
                        .send(WorkerMessage::QueueProcessingStopped {
                            reason: reason.to_string(),
                            processed_count,
                        })
                        .await;
                    if !sent {
                        return;
                    }
                }
            }
        }
    }

    async fn scan_page(&self, extractor: &MediaExtractor, candidate: &ScanCandidate) -> WorkerMessage {
        let page = candidate.document.path.clone();
        let source_file = candidate.source_file.clone();

        match self.store.read_document(&page).await {
            Ok(Some(html)) => {
                let assets = extractor.extract(&page, &html);
                WorkerMessage::PageScanned {
                    page,
                    source_file,
                    media_count: assets.len() as u64,
                    assets,
                }
            }
            Ok(None) => WorkerMessage::PageScanError {
                page: page.clone(),
                source_file,
                error: format!("Document not found: {}", page),
            },
            Err(e) => WorkerMessage::PageScanError {
                page,
                source_file,
                error: e.to_string(),
            },
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub pool_size: usize,
    pub init_timeout: Duration,
    pub internal_domains: Vec<String>,
}

/// Result of one scanning phase
#[derive(Debug, Clone, Default)]
pub struct ScanPhaseResult {
    pub success: bool,
    pub error: Option<String>,
    pub total_pages: u64,
    pub scanned_pages: u64,
    pub failed_pages: u64,
    pub total_media: u64,
    /// Stopped before every batch was handed out
    pub stopped: bool,
    /// Distinct assets found in this phase
    pub media_found: u64,
    /// Uploads flushed while scanning because the queue filled a batch
    pub upload: Option<UploadResult>,
}

impl ScanPhaseResult {
    pub fn processed_pages(&self) -> u64 {
        self.scanned_pages + self.failed_pages
    }

    pub fn pending_pages(&self) -> u64 {
        self.total_pages.saturating_sub(self.processed_pages())
    }

    fn failed(error: &ScanError, total_pages: u64) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            total_pages,
            ..Default::default()
        }
    }
}

/// Initialized workers and the channel they report on
struct WorkerPool {
    workers: Vec<mpsc::Sender<WorkerCommand>>,
    messages: mpsc::Receiver<WorkerEnvelope>,
}

impl WorkerPool {
    fn is_alive(&self) -> bool {
        self.workers.iter().all(|w| !w.is_closed())
    }
}

pub struct WorkerCoordinator {
    spawner: Arc<dyn WorkerSpawner>,
    cache: Arc<dyn LocalCache>,
    checkpoints: CheckpointStore,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    settings: WorkerSettings,
    progress: watch::Sender<SessionProgress>,
    uploads: Option<Arc<BatchUploadProcessor>>,
    /// Spawned on first use and kept across phases. A phase that does not
    /// finish cleanly leaves it empty so the next one respawns.
    pool: AsyncMutex<Option<WorkerPool>>,
}

impl WorkerCoordinator {
    pub fn new(
        spawner: Arc<dyn WorkerSpawner>,
        cache: Arc<dyn LocalCache>,
        checkpoints: CheckpointStore,
        clock: Arc<dyn Clock>,
        event_bus: EventBus,
        settings: WorkerSettings,
    ) -> Self {
        let (progress, _) = watch::channel(SessionProgress::default());
        Self {
            spawner,
            cache,
            checkpoints,
            clock,
            event_bus,
            settings,
            progress,
            uploads: None,
            pool: AsyncMutex::new(None),
        }
    }

    /// Queue extracted media for upload as pages are scanned
    pub fn with_uploads(mut self, uploads: Arc<BatchUploadProcessor>) -> Self {
        self.uploads = Some(uploads);
        self
    }

    /// Live progress of the running phase
    pub fn progress(&self) -> watch::Receiver<SessionProgress> {
        self.progress.subscribe()
    }

    /// Run the scanning phase, reporting init failures in the result
    pub async fn start_scanning_phase(
        &self,
        session_id: &SessionId,
        candidates: Vec<ScanCandidate>,
        cancel: &CancellationToken,
    ) -> ScanPhaseResult {
        let total = candidates.len() as u64;
        match self.run(session_id, candidates, cancel).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Scanning phase aborted");
                ScanPhaseResult::failed(&e, total)
            }
        }
    }

    /// Run the scanning phase
    ///
    /// The scanning checkpoint is saved when the phase starts, after every
    /// completed batch, and when the phase ends.
    ///
    /// # Errors
    ///
    /// [`ScanError::WorkerInitTimeout`] if a worker does not acknowledge
    /// `Init` in time. No document has been touched at that point.
    #[instrument(skip_all, fields(session_id = %session_id, documents = candidates.len()))]
    pub async fn run(
        &self,
        session_id: &SessionId,
        candidates: Vec<ScanCandidate>,
        cancel: &CancellationToken,
    ) -> Result<ScanPhaseResult> {
        let total_pages = candidates.len() as u64;
        let mut result = ScanPhaseResult {
            success: true,
            total_pages,
            ..Default::default()
        };
        self.progress.send_replace(SessionProgress {
            total_pages,
            ..Default::default()
        });

        if candidates.is_empty() {
            info!("Nothing to scan");
            return Ok(result);
        }

        let mut checkpoint =
            ScanningCheckpoint::start(total_pages, self.clock.unix_timestamp_millis());
        self.checkpoints.save_scanning(&checkpoint).await?;

        let outcome = {
            let mut slot = self.pool.lock().await;
            match self.ready_pool(slot.take()).await {
                Ok(mut pool) => {
                    let outcome = self
                        .dispatch(&mut pool, session_id, candidates, cancel, &mut checkpoint, &mut result)
                        .await;
                    if outcome.is_ok() {
                        *slot = Some(pool);
                    }
                    outcome
                }
                Err(e) => Err(e),
            }
        };

        if let Err(e) = outcome {
            checkpoint.finish(
                ScanningCheckpointStatus::Interrupted,
                self.clock.unix_timestamp_millis(),
            );
            if let Err(save_err) = self.checkpoints.save_scanning(&checkpoint).await {
                warn!(error = %save_err, "Could not record interrupted scanning checkpoint");
            }
            return Err(e);
        }

        if cancel.is_cancelled() && result.pending_pages() > 0 {
            result.stopped = true;
        }
        checkpoint.record_progress(result.scanned_pages, result.failed_pages, result.total_media);
        let status = if result.stopped || cancel.is_cancelled() {
            ScanningCheckpointStatus::Interrupted
        } else {
            ScanningCheckpointStatus::Completed
        };
        checkpoint.finish(status, self.clock.unix_timestamp_millis());
        self.checkpoints.save_scanning(&checkpoint).await?;

        info!(
            scanned = result.scanned_pages,
            failed = result.failed_pages,
            pending = result.pending_pages(),
            media = result.total_media,
            stopped = result.stopped,
            "Scanning phase finished"
        );
        Ok(result)
    }

    /// Reuse `existing` when every worker is still alive, otherwise spawn
    /// and initialize a fresh pool
    async fn ready_pool(&self, existing: Option<WorkerPool>) -> Result<WorkerPool> {
        if let Some(pool) = existing {
            if pool.is_alive() {
                debug!(workers = pool.workers.len(), "Reusing worker pool");
                return Ok(pool);
            }
            warn!("Worker pool lost a worker, respawning");
        }

        let pool_size = self.settings.pool_size.max(1);
        let (messages_tx, mut messages) = mpsc::channel(CHANNEL_CAPACITY);
        let workers: Vec<mpsc::Sender<WorkerCommand>> = (0..pool_size)
            .map(|id| self.spawner.spawn(id, messages_tx.clone()))
            .collect();
        drop(messages_tx);

        for worker in &workers {
            worker
                .send(WorkerCommand::Init {
                    internal_domains: self.settings.internal_domains.clone(),
                })
                .await
                .map_err(|_| ScanError::Internal("Worker exited before init".to_string()))?;
        }

        let init = async {
            let mut ready = 0;
            while ready < pool_size {
                match messages.recv().await {
                    Some(WorkerEnvelope {
                        message: WorkerMessage::Initialized,
                        ..
                    }) => ready += 1,
                    Some(other) => debug!(worker_id = other.worker_id, "Ignoring message before init"),
                    None => return false,
                }
            }
            true
        };

        let initialized = timeout(self.settings.init_timeout, init).await;
        match initialized {
            Ok(true) => {
                debug!(workers = pool_size, "Workers initialized");
                Ok(WorkerPool { workers, messages })
            }
            Ok(false) => Err(ScanError::Internal(
                "Workers exited during initialization".to_string(),
            )),
            Err(_) => {
                warn!(
                    timeout_secs = self.settings.init_timeout.as_secs(),
                    "Worker initialization timed out"
                );
                Err(ScanError::WorkerInitTimeout(self.settings.init_timeout.as_secs()))
            }
        }
    }

    /// Hand out batches until every worker reports its queue stopped
    async fn dispatch(
        &self,
        pool: &mut WorkerPool,
        session_id: &SessionId,
        candidates: Vec<ScanCandidate>,
        cancel: &CancellationToken,
        checkpoint: &mut ScanningCheckpoint,
        result: &mut ScanPhaseResult,
    ) -> Result<()> {
        let attempts: HashMap<String, u32> = candidates
            .iter()
            .map(|c| (c.document.path.clone(), c.document.scan_attempts))
            .collect();
        let batch_size = self.settings.batch_size.max(1);
        let mut queue: VecDeque<Vec<ScanCandidate>> = candidates
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();

        for worker in &pool.workers {
            worker
                .send(WorkerCommand::StartQueueProcessing {
                    session_id: session_id.to_string(),
                    documents_to_scan: result.total_pages,
                    batch_size,
                })
                .await
                .ok();
        }

        let mut media_ids: HashSet<String> = HashSet::new();
        let mut stopped_workers = 0;

        while stopped_workers < pool.workers.len() {
            let Some(WorkerEnvelope { worker_id, message }) = pool.messages.recv().await else {
                return Err(ScanError::Internal(
                    "Scan workers exited mid-phase".to_string(),
                ));
            };

            match message {
                WorkerMessage::RequestBatch => {
                    let command = if cancel.is_cancelled() {
                        result.stopped = !queue.is_empty();
                        WorkerCommand::Stop
                    } else {
                        match queue.pop_front() {
                            Some(batch) => {
                                self.mark_running(&batch, &attempts).await?;
                                WorkerCommand::Batch(batch)
                            }
                            None => WorkerCommand::NoMoreBatches,
                        }
                    };
                    let delivered = match pool.workers.get(worker_id) {
                        Some(worker) => worker.send(command).await.is_ok(),
                        None => false,
                    };
                    if !delivered {
                        warn!(worker_id, "Worker channel closed");
                    }
                }
                WorkerMessage::PageScanned {
                    page,
                    source_file,
                    media_count,
                    assets,
                } => {
                    let record = PageScanRecord {
                        path: page.clone(),
                        source_file,
                        status: ScanStatus::Completed,
                        media_count,
                        attempts: attempts.get(&page).copied().unwrap_or(0),
                        error: None,
                        updated_at: self.clock.unix_timestamp_millis(),
                    };
                    self.put_record(&record).await?;
                    self.merge_local_media(&assets).await?;
                    media_ids.extend(assets.iter().map(|a| a.id.clone()));
                    self.queue_for_upload(session_id, &assets, cancel, result).await?;

                    result.scanned_pages += 1;
                    result.total_media += media_count;
                    result.media_found = media_ids.len() as u64;
                    self.publish_progress(result);
                    self.event_bus
                        .emit(CoreEvent::Scan(ScanEvent::PageScanned { page, media_count }))
                        .ok();
                }
                WorkerMessage::PageScanError {
                    page,
                    source_file,
                    error,
                } => {
                    warn!(page = %page, error = %error, "Page scan failed");
                    let record = PageScanRecord {
                        path: page.clone(),
                        source_file,
                        status: ScanStatus::Failed,
                        media_count: 0,
                        attempts: attempts.get(&page).copied().unwrap_or(0) + 1,
                        error: Some(error.clone()),
                        updated_at: self.clock.unix_timestamp_millis(),
                    };
                    self.put_record(&record).await?;

                    result.failed_pages += 1;
                    self.publish_progress(result);
                    self.event_bus
                        .emit(CoreEvent::Scan(ScanEvent::PageFailed {
                            page,
                            message: error,
                        }))
                        .ok();
                }
                WorkerMessage::BatchComplete {
                    processed_count,
                    total_media,
                } => {
                    debug!(worker_id, processed_count, total_media, "Batch complete");
                    checkpoint.record_progress(
                        result.scanned_pages,
                        result.failed_pages,
                        result.total_media,
                    );
                    self.checkpoints.save_scanning(checkpoint).await?;
                    self.event_bus
                        .emit(CoreEvent::Scan(ScanEvent::BatchCompleted {
                            processed_count,
                            total_media,
                        }))
                        .ok();
                }
                WorkerMessage::QueueProcessingStopped {
                    reason,
                    processed_count,
                } => {
                    debug!(worker_id, reason = %reason, processed_count, "Worker stopped");
                    stopped_workers += 1;
                }
                WorkerMessage::Initialized => {}
            }
        }

        Ok(())
    }

    /// Queue `assets` and flush once the queue holds a full upload batch
    ///
    /// Nothing is flushed after cancellation; queued media waits for the
    /// next run.
    async fn queue_for_upload(
        &self,
        session_id: &SessionId,
        assets: &[MediaAsset],
        cancel: &CancellationToken,
        result: &mut ScanPhaseResult,
    ) -> Result<()> {
        let Some(uploads) = &self.uploads else {
            return Ok(());
        };
        if assets.is_empty() {
            return Ok(());
        }

        uploads.enqueue(assets).await?;
        if cancel.is_cancelled() || !uploads.has_full_batch().await? {
            return Ok(());
        }

        debug!("Upload queue holds a full batch, flushing");
        let flushed = uploads.flush(session_id).await?;
        result.upload = Some(match result.upload.take() {
            Some(earlier) => earlier.merged(flushed),
            None => flushed,
        });
        Ok(())
    }

    fn publish_progress(&self, result: &ScanPhaseResult) {
        self.progress.send_replace(SessionProgress {
            total_pages: result.total_pages,
            scanned_pages: result.scanned_pages,
            failed_pages: result.failed_pages,
            media_found: result.media_found,
        });
    }

    async fn mark_running(&self, batch: &[ScanCandidate], attempts: &HashMap<String, u32>) -> Result<()> {
        let now = self.clock.unix_timestamp_millis();
        for candidate in batch {
            let record = PageScanRecord {
                path: candidate.document.path.clone(),
                source_file: candidate.source_file.clone(),
                status: ScanStatus::Running,
                media_count: 0,
                attempts: attempts.get(&candidate.document.path).copied().unwrap_or(0),
                error: None,
                updated_at: now,
            };
            self.put_record(&record).await?;
        }
        Ok(())
    }

    async fn put_record(&self, record: &PageScanRecord) -> Result<()> {
        self.cache
            .put(
                CacheCollection::ScanStatus,
                &record.path,
                &serde_json::to_value(record)?,
            )
            .await?;
        Ok(())
    }

    /// Merge assets into the local media collection, keyed by asset id
    async fn merge_local_media(&self, assets: &[MediaAsset]) -> Result<()> {
        for asset in assets {
            let merged = match self.cache.get(CacheCollection::Media, &asset.id).await? {
                Some(value) => match serde_json::from_value::<MediaAsset>(value) {
                    Ok(mut existing) => {
                        existing.merge(asset.clone());
                        existing
                    }
                    Err(e) => {
                        warn!(id = %asset.id, error = %e, "Replacing malformed cached asset");
                        asset.clone()
                    }
                },
                None => asset.clone(),
            };
            self.cache
                .put(CacheCollection::Media, &asset.id, &serde_json::to_value(&merged)?)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_detector::ScanReason;
    use crate::document::Document;
    use crate::layout::StorageLayout;
    use crate::retry::RetryExecutor;
    use crate::upload::{MediaUploader, UploadBatch};
    use async_trait::async_trait;
    use bridge_desktop::{MemoryRemoteStore, SqliteLocalCache};
    use bridge_traits::time::ManualClock;
    use core_runtime::config::ContentContext;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Spawner whose workers never answer
    #[derive(Default)]
    struct SilentSpawner {
        held: Arc<AsyncMutex<Vec<mpsc::Receiver<WorkerCommand>>>>,
    }

    impl WorkerSpawner for SilentSpawner {
        fn spawn(&self, _worker_id: usize, _messages: mpsc::Sender<WorkerEnvelope>) -> mpsc::Sender<WorkerCommand> {
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            if let Ok(mut held) = self.held.try_lock() {
                held.push(rx);
            }
            tx
        }
    }

    /// Real workers, counting how many were spawned
    struct CountingSpawner {
        inner: TaskWorkerSpawner,
        spawned: AtomicUsize,
    }

    impl WorkerSpawner for CountingSpawner {
        fn spawn(&self, worker_id: usize, messages: mpsc::Sender<WorkerEnvelope>) -> mpsc::Sender<WorkerCommand> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            self.inner.spawn(worker_id, messages)
        }
    }

    /// Workers that finish their first batch and then go quiet
    struct OneBatchSpawner;

    impl WorkerSpawner for OneBatchSpawner {
        fn spawn(&self, worker_id: usize, messages: mpsc::Sender<WorkerEnvelope>) -> mpsc::Sender<WorkerCommand> {
            let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
            tokio::spawn(async move {
                let mut batches = 0;
                while let Some(command) = rx.recv().await {
                    let replies = match command {
                        WorkerCommand::Init { .. } => vec![WorkerMessage::Initialized],
                        WorkerCommand::StartQueueProcessing { .. } => vec![WorkerMessage::RequestBatch],
                        WorkerCommand::Batch(batch) if batches == 0 => {
                            batches += 1;
                            let mut replies: Vec<WorkerMessage> = batch
                                .iter()
                                .map(|c| WorkerMessage::PageScanned {
                                    page: c.document.path.clone(),
                                    source_file: c.source_file.clone(),
                                    media_count: 0,
                                    assets: Vec::new(),
                                })
                                .collect();
                            replies.push(WorkerMessage::BatchComplete {
                                processed_count: batch.len() as u64,
                                total_media: 0,
                            });
                            replies.push(WorkerMessage::RequestBatch);
                            replies
                        }
                        _ => Vec::new(),
                    };
                    for message in replies {
                        if messages.send(WorkerEnvelope { worker_id, message }).await.is_err() {
                            return;
                        }
                    }
                }
            });
            tx
        }
    }

    /// Records how many pages were already scanned when each batch arrived
    struct RecordingUploader {
        cache: Arc<SqliteLocalCache>,
        scanned_at_upload: StdMutex<Vec<usize>>,
    }

    #[async_trait]
    impl MediaUploader for RecordingUploader {
        async fn upload(&self, _batch: &UploadBatch) -> Result<()> {
            let scanned = self
                .cache
                .get_all(CacheCollection::ScanStatus)
                .await?
                .into_iter()
                .filter_map(|(_, value)| serde_json::from_value::<PageScanRecord>(value).ok())
                .filter(|record| record.status == ScanStatus::Completed)
                .count();
            if let Ok(mut seen) = self.scanned_at_upload.lock() {
                seen.push(scanned);
            }
            Ok(())
        }
    }

    fn candidate(path: &str) -> ScanCandidate {
        ScanCandidate {
            document: Document::new(path, 1),
            source_file: "root".to_string(),
            reason: ScanReason::New,
        }
    }

    fn settings(batch_size: usize) -> WorkerSettings {
        WorkerSettings {
            batch_size,
            pool_size: 1,
            init_timeout: Duration::from_secs(10),
            internal_domains: vec![],
        }
    }

    fn checkpoints() -> CheckpointStore {
        CheckpointStore::new(
            Arc::new(MemoryRemoteStore::new()),
            StorageLayout::new(&ContentContext::new("acme", "website"), ".media-index"),
        )
    }

    fn build(
        spawner: Arc<dyn WorkerSpawner>,
        cache: Arc<SqliteLocalCache>,
        checkpoints: CheckpointStore,
        settings: WorkerSettings,
    ) -> WorkerCoordinator {
        WorkerCoordinator::new(
            spawner,
            cache,
            checkpoints,
            Arc::new(ManualClock::new(500)),
            EventBus::default(),
            settings,
        )
    }

    async fn coordinator(
        spawner: Arc<dyn WorkerSpawner>,
        batch_size: usize,
    ) -> (WorkerCoordinator, Arc<SqliteLocalCache>) {
        let cache = Arc::new(SqliteLocalCache::in_memory().await.unwrap());
        let coordinator = build(spawner, cache.clone(), checkpoints(), settings(batch_size));
        (coordinator, cache)
    }

    async fn seeded_store() -> Arc<MemoryRemoteStore> {
        let store = Arc::new(MemoryRemoteStore::new());
        store
            .put_document("/acme/website/a.html", "<img src=\"/m/x.png\"><img src=\"/m/y.png\">", 1)
            .await;
        store
            .put_document("/acme/website/b.html", "<img src=\"/m/x.png\">", 1)
            .await;
        store
    }

    #[tokio::test]
    async fn test_scans_all_pages_and_records_status() {
        let store = seeded_store().await;
        let (coordinator, cache) = coordinator(Arc::new(TaskWorkerSpawner::new(store)), 1).await;

        let result = coordinator
            .run(
                &SessionId::new(),
                vec![candidate("/acme/website/a.html"), candidate("/acme/website/b.html")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.scanned_pages, 2);
        assert_eq!(result.total_media, 3);
        assert_eq!(result.media_found, 2);
        assert!(result.upload.is_none());

        let record = cache
            .get(CacheCollection::ScanStatus, "/acme/website/a.html")
            .await
            .unwrap()
            .unwrap();
        let record: PageScanRecord = serde_json::from_value(record).unwrap();
        assert_eq!(record.status, ScanStatus::Completed);
        assert_eq!(record.media_count, 2);

        let media: Vec<MediaAsset> = cache
            .get_all(CacheCollection::Media)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, value)| serde_json::from_value(value).unwrap())
            .collect();
        assert_eq!(media.len(), 2);
        let shared = media.iter().find(|m| m.src == "/m/x.png").unwrap();
        assert_eq!(shared.used_in.len(), 2);
        assert_eq!(coordinator.progress().borrow().scanned_pages, 2);
    }

    #[tokio::test]
    async fn test_missing_page_is_recorded_failed() {
        let store = seeded_store().await;
        let (coordinator, cache) = coordinator(Arc::new(TaskWorkerSpawner::new(store)), 10).await;

        let result = coordinator
            .run(
                &SessionId::new(),
                vec![candidate("/acme/website/a.html"), candidate("/acme/website/gone.html")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.scanned_pages, 1);
        assert_eq!(result.failed_pages, 1);

        let record: PageScanRecord = serde_json::from_value(
            cache
                .get(CacheCollection::ScanStatus, "/acme/website/gone.html")
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(record.status, ScanStatus::Failed);
        assert_eq!(record.attempts, 1);
        assert!(record.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_init_timeout_marks_nothing_running() {
        let cache = Arc::new(SqliteLocalCache::in_memory().await.unwrap());
        let checkpoints = checkpoints();
        let coordinator = build(
            Arc::new(SilentSpawner::default()),
            cache.clone(),
            checkpoints.clone(),
            WorkerSettings {
                init_timeout: Duration::from_millis(50),
                ..settings(10)
            },
        );

        let result = coordinator
            .start_scanning_phase(
                &SessionId::new(),
                vec![candidate("/acme/website/a.html")],
                &CancellationToken::new(),
            )
            .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("timeout"));
        assert!(cache.get_all(CacheCollection::ScanStatus).await.unwrap().is_empty());

        let checkpoint = checkpoints.load_scanning().await.unwrap().unwrap();
        assert_eq!(checkpoint.status, ScanningCheckpointStatus::Interrupted);
        assert_eq!(checkpoint.pending_pages, 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_dispatches_nothing() {
        let store = seeded_store().await;
        let (coordinator, cache) = coordinator(Arc::new(TaskWorkerSpawner::new(store)), 1).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = coordinator
            .run(
                &SessionId::new(),
                vec![candidate("/acme/website/a.html"), candidate("/acme/website/b.html")],
                &cancel,
            )
            .await
            .unwrap();

        assert!(result.stopped);
        assert_eq!(result.processed_pages(), 0);
        assert_eq!(result.pending_pages(), 2);
        assert!(cache.get_all(CacheCollection::ScanStatus).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_scan_set_skips_workers() {
        let (coordinator, _) = coordinator(Arc::new(SilentSpawner::default()), 10).await;

        let result = coordinator
            .run(&SessionId::new(), Vec::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.total_pages, 0);
    }

    #[tokio::test]
    async fn test_checkpoint_saved_after_each_batch() {
        let cache = Arc::new(SqliteLocalCache::in_memory().await.unwrap());
        let checkpoints = checkpoints();
        let coordinator = build(Arc::new(OneBatchSpawner), cache, checkpoints.clone(), settings(2));
        let candidates: Vec<ScanCandidate> = (0..5)
            .map(|i| candidate(&format!("/acme/website/p{}.html", i)))
            .collect();

        // The second batch never completes; the phase is abandoned mid-way
        let session = SessionId::new();
        let cancel = CancellationToken::new();
        let run = coordinator.run(&session, candidates, &cancel);
        assert!(timeout(Duration::from_millis(300), run).await.is_err());

        let checkpoint = checkpoints.load_scanning().await.unwrap().unwrap();
        assert_eq!(checkpoint.status, ScanningCheckpointStatus::Running);
        assert_eq!(checkpoint.scanned_pages, 2);
        assert_eq!(checkpoint.pending_pages, 3);
    }

    #[tokio::test]
    async fn test_worker_pool_is_reused_across_phases() {
        let store = seeded_store().await;
        let spawner = Arc::new(CountingSpawner {
            inner: TaskWorkerSpawner::new(store),
            spawned: AtomicUsize::new(0),
        });
        let cache = Arc::new(SqliteLocalCache::in_memory().await.unwrap());
        let coordinator = build(
            spawner.clone(),
            cache,
            checkpoints(),
            WorkerSettings {
                pool_size: 2,
                ..settings(1)
            },
        );
        let pages = || vec![candidate("/acme/website/a.html"), candidate("/acme/website/b.html")];

        let first = coordinator
            .run(&SessionId::new(), pages(), &CancellationToken::new())
            .await
            .unwrap();
        let second = coordinator
            .run(&SessionId::new(), pages(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(first.scanned_pages, 2);
        assert_eq!(second.scanned_pages, 2);
        assert_eq!(second.total_media, 3);
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_full_upload_batch_is_flushed_mid_scan() {
        let store = Arc::new(MemoryRemoteStore::new());
        for i in 0..6 {
            store
                .put_document(
                    &format!("/acme/website/p{}.html", i),
                    &format!("<img src=\"/m/{}.png\">", i),
                    1,
                )
                .await;
        }
        let cache = Arc::new(SqliteLocalCache::in_memory().await.unwrap());
        let checkpoints = checkpoints();
        let uploader = Arc::new(RecordingUploader {
            cache: cache.clone(),
            scanned_at_upload: StdMutex::new(Vec::new()),
        });
        let uploads = Arc::new(BatchUploadProcessor::new(
            uploader.clone(),
            cache.clone(),
            checkpoints.clone(),
            Arc::new(ManualClock::new(500)),
            EventBus::default(),
            RetryExecutor::default(),
            2,
            Duration::ZERO,
        ));
        let coordinator = build(
            Arc::new(TaskWorkerSpawner::new(store)),
            cache.clone(),
            checkpoints,
            settings(1),
        )
        .with_uploads(uploads.clone());
        let candidates: Vec<ScanCandidate> = (0..6)
            .map(|i| candidate(&format!("/acme/website/p{}.html", i)))
            .collect();

        let result = coordinator
            .run(&SessionId::new(), candidates, &CancellationToken::new())
            .await
            .unwrap();

        let upload = result.upload.unwrap();
        assert!(upload.success);
        assert_eq!(upload.uploaded_batches, 3);
        assert_eq!(upload.total_media, 6);
        assert!(uploads.queued().await.unwrap().is_empty());

        let seen = uploader.scanned_at_upload.lock().unwrap().clone();
        assert_eq!(seen, vec![2, 4, 6]);
    }
}
