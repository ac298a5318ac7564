//! # Batch Upload Processor
//!
//! Media found while scanning is queued per session in the local
//! `processing_queue` collection. Flushing slices the queue into fixed-size
//! [`UploadBatch`]es and uploads them concurrently. Starts are staggered by the
//! inter-batch delay, and each batch retries on its own.
//!
//! A batch that exhausts its attempts is marked `failed`; its media stays
//! queued for the next run. Sibling batches are unaffected.

use crate::checkpoint::{CheckpointStore, UploadCheckpoint, UploadCheckpointStatus};
use crate::layout::StorageLayout;
use crate::media::{MediaAsset, MediaIndex};
use crate::records::{read_record, write_record};
use crate::retry::RetryExecutor;
use crate::session::SessionId;
use crate::{Result, ScanError};
use async_trait::async_trait;
use bridge_traits::storage::{CacheCollection, LocalCache, RemoteStore};
use bridge_traits::time::Clock;
use core_runtime::events::{CoreEvent, EventBus, UploadEvent};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

// ============================================================================
// Batch Model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadBatchStatus {
    Pending,
    Completed,
    Failed,
}

impl UploadBatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadBatchStatus::Pending => "pending",
            UploadBatchStatus::Completed => "completed",
            UploadBatchStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadBatch {
    pub id: String,
    pub session_id: String,
    /// 1-based position within the flush
    pub batch_number: u64,
    pub media: Vec<MediaAsset>,
    pub status: UploadBatchStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl UploadBatch {
    pub fn new(session_id: &SessionId, batch_number: u64, media: Vec<MediaAsset>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            batch_number,
            media,
            status: UploadBatchStatus::Pending,
            attempts: 0,
            last_attempt: None,
            error: None,
        }
    }
}

/// One line of upload history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadHistoryEntry {
    pub batch_id: String,
    pub session_id: String,
    pub batch_number: u64,
    pub status: UploadBatchStatus,
    pub media_count: u64,
    pub attempts: u32,
    pub recorded_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub success: bool,
    pub total_batches: u64,
    pub processed_batches: u64,
    pub uploaded_batches: u64,
    pub failed_batches: u64,
    pub total_media: u64,
}

impl UploadResult {
    /// Totals of two flushes of the same run
    pub fn merged(self, other: UploadResult) -> UploadResult {
        UploadResult {
            success: self.success && other.success,
            total_batches: self.total_batches + other.total_batches,
            processed_batches: self.processed_batches + other.processed_batches,
            uploaded_batches: self.uploaded_batches + other.uploaded_batches,
            failed_batches: self.failed_batches + other.failed_batches,
            total_media: self.total_media + other.total_media,
        }
    }
}

// ============================================================================
// Uploader
// ============================================================================

/// Destination of media batches
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(&self, batch: &UploadBatch) -> Result<()>;
}

/// Merges batches into the remote `media.json` index
///
/// Concurrent batches are serialized on an in-process lock so the
/// read-merge-write of the index never loses a sibling's assets.
pub struct RemoteMediaUploader {
    store: Arc<dyn RemoteStore>,
    layout: StorageLayout,
    lock: AsyncMutex<()>,
}

impl RemoteMediaUploader {
    pub fn new(store: Arc<dyn RemoteStore>, layout: StorageLayout) -> Self {
        Self {
            store,
            layout,
            lock: AsyncMutex::new(()),
        }
    }
}

#[async_trait]
impl MediaUploader for RemoteMediaUploader {
    async fn upload(&self, batch: &UploadBatch) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.layout.media_index();

        let existing: Vec<MediaAsset> = read_record(self.store.as_ref(), &path)
            .await?
            .unwrap_or_default();
        let mut index = MediaIndex::from_assets(existing);
        for asset in &batch.media {
            index.upsert(asset.clone());
        }

        write_record(self.store.as_ref(), &path, index.assets()).await
    }
}

// ============================================================================
// Processor
// ============================================================================

pub struct BatchUploadProcessor {
    uploader: Arc<dyn MediaUploader>,
    cache: Arc<dyn LocalCache>,
    checkpoints: CheckpointStore,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    retry: RetryExecutor,
    batch_size: usize,
    inter_batch_delay: Duration,
}

impl BatchUploadProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uploader: Arc<dyn MediaUploader>,
        cache: Arc<dyn LocalCache>,
        checkpoints: CheckpointStore,
        clock: Arc<dyn Clock>,
        event_bus: EventBus,
        retry: RetryExecutor,
        batch_size: usize,
        inter_batch_delay: Duration,
    ) -> Self {
        Self {
            uploader,
            cache,
            checkpoints,
            clock,
            event_bus,
            retry,
            batch_size: batch_size.max(1),
            inter_batch_delay,
        }
    }

    /// Add assets to the upload queue, merging with already queued ones
    ///
    /// Returns the queue length.
    pub async fn enqueue(&self, assets: &[MediaAsset]) -> Result<usize> {
        for asset in assets {
            let merged = match self.cache.get(CacheCollection::ProcessingQueue, &asset.id).await? {
                Some(value) => match serde_json::from_value::<MediaAsset>(value) {
                    Ok(mut queued) => {
                        queued.merge(asset.clone());
                        queued
                    }
                    Err(_) => asset.clone(),
                },
                None => asset.clone(),
            };
            self.cache
                .put(
                    CacheCollection::ProcessingQueue,
                    &asset.id,
                    &serde_json::to_value(&merged)?,
                )
                .await?;
        }
        Ok(self.queued().await?.len())
    }

    /// Queued assets, ordered by source URL
    pub async fn queued(&self) -> Result<Vec<MediaAsset>> {
        let mut assets: Vec<MediaAsset> = self
            .cache
            .get_all(CacheCollection::ProcessingQueue)
            .await?
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_value(value) {
                Ok(asset) => Some(asset),
                Err(e) => {
                    warn!(key = %key, error = %e, "Dropping malformed queued asset");
                    None
                }
            })
            .collect();
        assets.sort_by(|a: &MediaAsset, b| a.src.cmp(&b.src));
        Ok(assets)
    }

    /// Whether the queue holds at least one full batch
    pub async fn has_full_batch(&self) -> Result<bool> {
        Ok(self.queued().await?.len() >= self.batch_size)
    }

    /// Upload everything queued; uploaded media leaves the queue
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn flush(&self, session_id: &SessionId) -> Result<UploadResult> {
        let queued = self.queued().await?;
        let (result, batches) = self.upload_all(session_id, queued).await?;

        for batch in batches
            .iter()
            .filter(|b| b.status == UploadBatchStatus::Completed)
        {
            for asset in &batch.media {
                self.cache
                    .delete(CacheCollection::ProcessingQueue, &asset.id)
                    .await?;
            }
        }
        Ok(result)
    }

    /// Slice `media` into batches and upload them
    pub async fn process_batches(
        &self,
        session_id: &SessionId,
        media: Vec<MediaAsset>,
    ) -> Result<UploadResult> {
        Ok(self.upload_all(session_id, media).await?.0)
    }

    async fn upload_all(
        &self,
        session_id: &SessionId,
        media: Vec<MediaAsset>,
    ) -> Result<(UploadResult, Vec<UploadBatch>)> {
        let total_media = media.len() as u64;
        let batches: Vec<UploadBatch> = media
            .chunks(self.batch_size)
            .enumerate()
            .map(|(i, chunk)| UploadBatch::new(session_id, i as u64 + 1, chunk.to_vec()))
            .collect();
        let total_batches = batches.len() as u64;

        if batches.is_empty() {
            debug!("Upload queue empty");
            return Ok((
                UploadResult {
                    success: true,
                    ..Default::default()
                },
                batches,
            ));
        }

        info!(batches = total_batches, media = total_media, "Uploading media batches");
        for batch in &batches {
            self.save_batch(batch).await?;
        }

        let mut checkpoint = UploadCheckpoint {
            session_id: session_id.to_string(),
            total_batches,
            uploaded_batches: 0,
            failed_batches: 0,
            total_media,
            status: UploadCheckpointStatus::Running,
        };
        self.checkpoints.save_upload(&checkpoint).await?;

        let uploads = batches
            .into_iter()
            .enumerate()
            .map(|(index, batch)| self.upload_one(index as u32, batch));
        let finished: Vec<UploadBatch> = join_all(uploads).await;

        let mut result = UploadResult {
            success: false,
            total_batches,
            processed_batches: 0,
            uploaded_batches: 0,
            failed_batches: 0,
            total_media,
        };
        for batch in &finished {
            result.processed_batches += 1;
            match batch.status {
                UploadBatchStatus::Completed => result.uploaded_batches += 1,
                _ => result.failed_batches += 1,
            }
            self.save_batch(batch).await?;
            self.append_history(batch).await?;
        }
        result.success = result.failed_batches == 0;

        checkpoint.uploaded_batches = result.uploaded_batches;
        checkpoint.failed_batches = result.failed_batches;
        checkpoint.status = if result.success {
            UploadCheckpointStatus::Completed
        } else {
            UploadCheckpointStatus::Failed
        };
        self.checkpoints.save_upload(&checkpoint).await?;

        info!(
            uploaded = result.uploaded_batches,
            failed = result.failed_batches,
            "Upload finished"
        );
        Ok((result, finished))
    }

    async fn upload_one(&self, index: u32, mut batch: UploadBatch) -> UploadBatch {
        if index > 0 {
            tokio::time::sleep(self.inter_batch_delay.saturating_mul(index)).await;
        }

        let name = format!("upload batch {}", batch.batch_number);
        let outcome = self
            .retry
            .run(&name, |_| self.uploader.upload(&batch))
            .await;

        batch.attempts = outcome.attempts;
        batch.last_attempt = Some(self.clock.unix_timestamp_millis());

        match outcome.result {
            Ok(()) => {
                batch.status = UploadBatchStatus::Completed;
                batch.error = None;
                debug!(batch_number = batch.batch_number, attempts = batch.attempts, "Batch uploaded");
                self.event_bus
                    .emit(CoreEvent::Upload(UploadEvent::BatchUploaded {
                        batch_id: batch.id.clone(),
                        batch_number: batch.batch_number,
                        media_count: batch.media.len() as u64,
                        attempts: batch.attempts,
                    }))
                    .ok();
            }
            Err(e) => {
                let failure = ScanError::BatchUploadFailure {
                    batch_number: batch.batch_number,
                    attempts: batch.attempts,
                    message: e.to_string(),
                };
                warn!(error = %failure, "Batch upload failed");
                batch.status = UploadBatchStatus::Failed;
                batch.error = Some(e.to_string());
                self.event_bus
                    .emit(CoreEvent::Upload(UploadEvent::BatchFailed {
                        batch_id: batch.id.clone(),
                        batch_number: batch.batch_number,
                        attempts: batch.attempts,
                        message: e.to_string(),
                    }))
                    .ok();
            }
        }

        batch
    }

    async fn save_batch(&self, batch: &UploadBatch) -> Result<()> {
        self.cache
            .put(
                CacheCollection::UploadBatches,
                &batch.id,
                &serde_json::to_value(batch)?,
            )
            .await?;
        Ok(())
    }

    async fn append_history(&self, batch: &UploadBatch) -> Result<()> {
        let entry = UploadHistoryEntry {
            batch_id: batch.id.clone(),
            session_id: batch.session_id.clone(),
            batch_number: batch.batch_number,
            status: batch.status,
            media_count: batch.media.len() as u64,
            attempts: batch.attempts,
            recorded_at: batch.last_attempt.unwrap_or_default(),
        };
        self.cache
            .put(
                CacheCollection::UploadHistory,
                &format!("{}:{}", batch.id, entry.recorded_at),
                &serde_json::to_value(&entry)?,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaType, Occurrence};
    use bridge_desktop::{MemoryRemoteStore, SqliteLocalCache};
    use bridge_traits::http::RetryPolicy;
    use bridge_traits::time::ManualClock;
    use core_runtime::config::ContentContext;

    fn layout() -> StorageLayout {
        StorageLayout::new(&ContentContext::new("acme", "website"), ".media-index")
    }

    fn asset(n: usize, page: &str) -> MediaAsset {
        let mut asset = MediaAsset::new(format!("/media/{:02}.png", n), MediaType::Image, false);
        asset.add_occurrence(Occurrence {
            id: format!("{}-{}", page, n),
            page: page.to_string(),
            has_alt_text: false,
            has_title: false,
            context: String::new(),
        });
        asset
    }

    async fn processor(
        uploader: Arc<dyn MediaUploader>,
        store: Arc<MemoryRemoteStore>,
        batch_size: usize,
    ) -> (BatchUploadProcessor, Arc<SqliteLocalCache>) {
        let cache = Arc::new(SqliteLocalCache::in_memory().await.unwrap());
        let processor = BatchUploadProcessor::new(
            uploader,
            cache.clone(),
            CheckpointStore::new(store, layout()),
            Arc::new(ManualClock::new(0)),
            EventBus::default(),
            RetryExecutor::new(RetryPolicy::default().with_base_delay(Duration::from_millis(1))),
            batch_size,
            Duration::from_millis(1),
        );
        (processor, cache)
    }

    #[tokio::test]
    async fn test_remote_uploader_merges_into_media_index() {
        let store = Arc::new(MemoryRemoteStore::new());
        let uploader = Arc::new(RemoteMediaUploader::new(store.clone(), layout()));
        let (processor, _) = processor(uploader, store.clone(), 2).await;
        let session = SessionId::new();

        let result = processor
            .process_batches(&session, vec![asset(1, "/a"), asset(2, "/a"), asset(3, "/a")])
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.total_batches, 2);

        processor
            .process_batches(&session, vec![asset(1, "/b")])
            .await
            .unwrap();

        let index: Vec<MediaAsset> = read_record(store.as_ref(), &layout().media_index())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(index.len(), 3);
        let first = index.iter().find(|a| a.src == "/media/01.png").unwrap();
        assert_eq!(first.used_in, vec!["/a", "/b"]);
    }

    #[tokio::test]
    async fn test_flush_keeps_failed_media_queued() {
        struct RejectSecond;

        #[async_trait]
        impl MediaUploader for RejectSecond {
            async fn upload(&self, batch: &UploadBatch) -> Result<()> {
                if batch.batch_number == 2 {
                    return Err(ScanError::Internal("rejected".to_string()));
                }
                Ok(())
            }
        }

        let store = Arc::new(MemoryRemoteStore::new());
        let (processor, cache) = processor(Arc::new(RejectSecond), store.clone(), 2).await;

        let queued = processor
            .enqueue(&[asset(1, "/a"), asset(2, "/a"), asset(3, "/a"), asset(1, "/b")])
            .await
            .unwrap();
        assert_eq!(queued, 3);
        assert!(processor.has_full_batch().await.unwrap());

        let result = processor.flush(&SessionId::new()).await.unwrap();
        assert_eq!(result.uploaded_batches, 1);
        assert_eq!(result.failed_batches, 1);

        let remaining = processor.queued().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].src, "/media/03.png");

        assert_eq!(cache.get_all(CacheCollection::UploadHistory).await.unwrap().len(), 2);
        let checkpoint = processor.checkpoints.load_upload().await.unwrap().unwrap();
        assert_eq!(checkpoint.status, UploadCheckpointStatus::Failed);
    }

    #[tokio::test]
    async fn test_empty_media_is_a_successful_noop() {
        let store = Arc::new(MemoryRemoteStore::new());
        let uploader = Arc::new(RemoteMediaUploader::new(store.clone(), layout()));
        let (processor, _) = processor(uploader, store, 50).await;

        let result = processor
            .process_batches(&SessionId::new(), Vec::new())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.total_batches, 0);
    }
}
