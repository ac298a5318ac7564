//! # Scan Pipeline
//!
//! Discovers the documents of a content repository, scans them for media
//! references, and uploads the resulting media index.
//!
//! ## Overview
//!
//! A scan cycle runs as a single-writer pipeline coordinated through files
//! stored next to the content (`.da/` by default):
//! - Discovery files list every document per top-level folder
//! - Checkpoints record discovery, scanning and upload progress so an
//!   interrupted cycle resumes instead of restarting
//! - Session records implement a heartbeat-based scan lock
//! - `site-structure.json` snapshots the tree for incremental discovery
//! - `media.json` holds the merged media index
//!
//! ## Components
//!
//! - **Checkpoint Store** (`checkpoint`): Discovery, scanning and upload progress records
//! - **Session Registry** (`session`): Scan lock, heartbeats and conflict resolution
//! - **Change Detector** (`change_detector`): Decides which documents need scanning
//! - **Delta Processor** (`delta`): Diffs two site structures for incremental discovery
//! - **Discovery Coordinator** (`discovery`): Full and incremental crawls
//! - **Worker Coordinator** (`worker`): Pull-based batch dispatch to scan workers
//! - **Batch Upload Processor** (`upload`): Retried, paced media uploads
//! - **Scan Completion Handler** (`completion`): Reconciliation and audit log
//! - **Queue Orchestrator** (`orchestrator`): The top-level state machine

pub mod change_detector;
pub mod checkpoint;
pub mod completion;
pub mod config;
pub mod delta;
pub mod discovery;
pub mod document;
pub mod error;
pub mod extractor;
pub mod layout;
pub mod media;
pub mod orchestrator;
mod records;
pub mod retry;
pub mod session;
pub mod structure;
pub mod upload;
pub mod worker;

pub use change_detector::{ChangeDetector, ChangeSet, ChangeStats, ScanCandidate, ScanReason};
pub use checkpoint::{
    CheckpointStore, DiscoveryCheckpoint, DiscoveryType, ScanningCheckpoint, UploadCheckpoint,
};
pub use completion::{AuditEntry, CompletionContext, CompletionSummary, ScanCompletionHandler};
pub use config::ScanConfig;
pub use delta::{DeltaProcessor, DeltaResult, FolderDelta};
pub use discovery::{
    DiscoveryCoordinator, DiscoveryOptions, DiscoveryOutcome, DiscoveryState, DiscoveryStore,
};
pub use document::{DiscoveryFile, Document, EntryStatus, PageScanRecord, ScanStatus};
pub use error::{Result, ScanError};
pub use extractor::MediaExtractor;
pub use layout::{CheckpointKind, StorageLayout};
pub use media::{MediaAsset, MediaIndex, MediaType, Occurrence};
pub use orchestrator::{PipelineState, QueueOrchestrator, ScanOptions, ScanReport, StopReason};
pub use retry::{RetryExecutor, RetryOutcome, Retryable, RetryingRemoteStore};
pub use session::{Session, SessionId, SessionProgress, SessionRegistry, SessionStatus};
pub use structure::{FileNode, FolderNode, SiteStructure};
pub use upload::{
    BatchUploadProcessor, MediaUploader, RemoteMediaUploader, UploadBatch, UploadResult,
};
pub use worker::{
    ScanPhaseResult, TaskWorkerSpawner, WorkerCommand, WorkerCoordinator, WorkerEnvelope,
    WorkerMessage, WorkerSettings, WorkerSpawner,
};
