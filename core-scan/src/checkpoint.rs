//! # Checkpoint Store
//!
//! Single-record progress snapshots for the discovery, scanning and upload
//! phases. Each checkpoint is overwritten in place; the latest write is the
//! only valid state. A checkpoint that fails to parse is treated as absent,
//! which makes the next run start that phase from scratch.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let store = CheckpointStore::new(remote_store, layout);
//!
//! let mut checkpoint = DiscoveryCheckpoint::start(DiscoveryType::Full, 4, now);
//! checkpoint.record_folder("blog");
//! store.save_discovery(&checkpoint).await?;
//!
//! if let Some(previous) = store.load_discovery().await? {
//!     println!("{}/{} folders", previous.completed_folders, previous.total_folders);
//! }
//! ```

use crate::layout::{CheckpointKind, StorageLayout};
use crate::records::{read_record, write_record};
use crate::{Result, ScanError};
use bridge_traits::storage::RemoteStore;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// Discovery Checkpoint
// ============================================================================

/// Kind of discovery run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryType {
    Full,
    Incremental,
}

impl DiscoveryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryType::Full => "full",
            DiscoveryType::Incremental => "incremental",
        }
    }
}

impl FromStr for DiscoveryType {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "full" => Ok(DiscoveryType::Full),
            "incremental" => Ok(DiscoveryType::Incremental),
            _ => Err(ScanError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for DiscoveryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryCheckpointStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryCheckpoint {
    pub total_folders: u64,
    pub completed_folders: u64,
    /// Folder names already written, used to resume by name
    #[serde(default)]
    pub processed_folders: Vec<String>,
    pub status: DiscoveryCheckpointStatus,
    pub discovery_type: DiscoveryType,
    pub start_time: i64,
    #[serde(default)]
    pub end_time: Option<i64>,
}

impl DiscoveryCheckpoint {
    pub fn start(discovery_type: DiscoveryType, total_folders: u64, now: i64) -> Self {
        Self {
            total_folders,
            completed_folders: 0,
            processed_folders: Vec::new(),
            status: DiscoveryCheckpointStatus::Running,
            discovery_type,
            start_time: now,
            end_time: None,
        }
    }

    pub fn record_folder(&mut self, folder: &str) {
        if !self.is_processed(folder) {
            self.processed_folders.push(folder.to_string());
        }
        self.completed_folders = self.processed_folders.len() as u64;
    }

    pub fn is_processed(&self, folder: &str) -> bool {
        self.processed_folders.iter().any(|f| f == folder)
    }

    pub fn finish(&mut self, status: DiscoveryCheckpointStatus, now: i64) {
        self.status = status;
        self.end_time = Some(now);
    }

    /// Discovery stopped before every folder was written
    pub fn is_resumable(&self) -> bool {
        matches!(
            self.status,
            DiscoveryCheckpointStatus::Running | DiscoveryCheckpointStatus::Interrupted
        ) && self.completed_folders < self.total_folders
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time.map(|end| end - self.start_time)
    }
}

// ============================================================================
// Scanning Checkpoint
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanningCheckpointStatus {
    Running,
    Completed,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanningCheckpoint {
    pub total_pages: u64,
    pub scanned_pages: u64,
    pub pending_pages: u64,
    pub failed_pages: u64,
    pub total_media: u64,
    pub status: ScanningCheckpointStatus,
    pub start_time: i64,
    #[serde(default)]
    pub end_time: Option<i64>,
}

impl ScanningCheckpoint {
    pub fn start(total_pages: u64, now: i64) -> Self {
        Self {
            total_pages,
            scanned_pages: 0,
            pending_pages: total_pages,
            failed_pages: 0,
            total_media: 0,
            status: ScanningCheckpointStatus::Running,
            start_time: now,
            end_time: None,
        }
    }

    pub fn record_progress(&mut self, scanned: u64, failed: u64, total_media: u64) {
        self.scanned_pages = scanned;
        self.failed_pages = failed;
        self.total_media = total_media;
        self.pending_pages = self.total_pages.saturating_sub(scanned + failed);
    }

    /// Close the checkpoint; `pending` absorbs pages never dispatched
    pub fn finish(&mut self, status: ScanningCheckpointStatus, now: i64) {
        self.pending_pages = self
            .total_pages
            .saturating_sub(self.scanned_pages + self.failed_pages);
        self.status = status;
        self.end_time = Some(now);
    }

    /// `scanned + pending + failed == total` must hold once completed
    pub fn is_consistent(&self) -> bool {
        self.status != ScanningCheckpointStatus::Completed
            || self.scanned_pages + self.pending_pages + self.failed_pages == self.total_pages
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time.map(|end| end - self.start_time)
    }
}

// ============================================================================
// Upload Checkpoint
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadCheckpointStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCheckpoint {
    pub session_id: String,
    pub total_batches: u64,
    pub uploaded_batches: u64,
    pub failed_batches: u64,
    pub total_media: u64,
    pub status: UploadCheckpointStatus,
}

// ============================================================================
// Store
// ============================================================================

/// Persists checkpoints as blobs under `checkpoints/`
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn RemoteStore>,
    layout: StorageLayout,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn RemoteStore>, layout: StorageLayout) -> Self {
        Self { store, layout }
    }

    pub async fn load_discovery(&self) -> Result<Option<DiscoveryCheckpoint>> {
        read_record(self.store.as_ref(), &self.layout.checkpoint(CheckpointKind::Discovery)).await
    }

    pub async fn save_discovery(&self, checkpoint: &DiscoveryCheckpoint) -> Result<()> {
        debug!(
            completed = checkpoint.completed_folders,
            total = checkpoint.total_folders,
            "Saving discovery checkpoint"
        );
        write_record(
            self.store.as_ref(),
            &self.layout.checkpoint(CheckpointKind::Discovery),
            checkpoint,
        )
        .await
    }

    pub async fn load_scanning(&self) -> Result<Option<ScanningCheckpoint>> {
        read_record(self.store.as_ref(), &self.layout.checkpoint(CheckpointKind::Scanning)).await
    }

    pub async fn save_scanning(&self, checkpoint: &ScanningCheckpoint) -> Result<()> {
        if !checkpoint.is_consistent() {
            return Err(ScanError::Internal(format!(
                "Scanning checkpoint counts do not add up: {} + {} + {} != {}",
                checkpoint.scanned_pages,
                checkpoint.pending_pages,
                checkpoint.failed_pages,
                checkpoint.total_pages
            )));
        }
        write_record(
            self.store.as_ref(),
            &self.layout.checkpoint(CheckpointKind::Scanning),
            checkpoint,
        )
        .await
    }

    pub async fn load_upload(&self) -> Result<Option<UploadCheckpoint>> {
        read_record(self.store.as_ref(), &self.layout.checkpoint(CheckpointKind::Upload)).await
    }

    pub async fn save_upload(&self, checkpoint: &UploadCheckpoint) -> Result<()> {
        write_record(
            self.store.as_ref(),
            &self.layout.checkpoint(CheckpointKind::Upload),
            checkpoint,
        )
        .await
    }

    pub async fn clear(&self, kind: CheckpointKind) -> Result<()> {
        self.store.delete(&self.layout.checkpoint(kind)).await?;
        Ok(())
    }
}
