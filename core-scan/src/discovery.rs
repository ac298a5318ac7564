//! # Discovery Coordinator
//!
//! Crawls the content tree and writes one discovery file per top-level
//! folder (documents sitting directly under the root go to `root`).
//!
//! ## State Machine
//!
//! ```text
//! Idle → Crawling → Complete
//!           ↓   ↘
//!      Interrupted  Failed
//! ```
//!
//! ## Workflow
//!
//! ### Full Discovery
//! 1. Skip straight to `Complete` if discovery files exist and no full run was forced
//! 2. List top-level folders, sorted by name
//! 3. Walk each folder breadth-first, collecting documents
//! 4. Write the folder's discovery file, then checkpoint the folder name
//! 5. On restart, folders already in the checkpoint are not crawled again
//!
//! ### Incremental Discovery
//! 1. Load the baseline snapshot from the persisted site structure
//! 2. Crawl a fresh listing and diff it per folder (see [`crate::delta`])
//! 3. Rewrite only discovery files of folders with added, removed or modified documents
//!
//! Removed documents are kept with `entryStatus = deleted` so completion can
//! purge their media references before dropping them.

use crate::checkpoint::{
    CheckpointStore, DiscoveryCheckpoint, DiscoveryCheckpointStatus, DiscoveryType,
};
use crate::delta::{DeltaProcessor, DeltaResult, FolderListing};
use crate::document::{DiscoveryFile, Document};
use crate::layout::{StorageLayout, ROOT_DISCOVERY_NAME};
use crate::records::{read_record, write_record};
use crate::structure::SiteStructure;
use crate::{Result, ScanError};
use bridge_traits::storage::{RemoteEntry, RemoteStore};
use bridge_traits::time::Clock;
use core_runtime::events::{CoreEvent, DiscoveryEvent, EventBus};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Crawling,
    Complete,
    Interrupted,
    Failed,
}

impl DiscoveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryState::Idle => "idle",
            DiscoveryState::Crawling => "crawling",
            DiscoveryState::Complete => "complete",
            DiscoveryState::Interrupted => "interrupted",
            DiscoveryState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DiscoveryState::Complete | DiscoveryState::Interrupted | DiscoveryState::Failed
        )
    }

    fn validate_transition(&self, to: DiscoveryState) -> Result<()> {
        let valid = match (self, to) {
            (DiscoveryState::Idle, DiscoveryState::Crawling) => true,
            (DiscoveryState::Idle, DiscoveryState::Complete) => true,
            (DiscoveryState::Crawling, DiscoveryState::Complete) => true,
            (DiscoveryState::Crawling, DiscoveryState::Interrupted) => true,
            (DiscoveryState::Crawling, DiscoveryState::Failed) => true,
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

// ============================================================================
// Options & Outcome
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOptions {
    pub discovery_type: DiscoveryType,
    /// Re-crawl even when discovery files already exist
    pub force_full: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            discovery_type: DiscoveryType::Full,
            force_full: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    pub state: DiscoveryState,
    pub discovery_type: DiscoveryType,
    pub total_folders: u64,
    pub completed_folders: u64,
    pub total_documents: u64,
    /// Existing discovery files were reused without crawling
    pub skipped: bool,
    /// Folders whose discovery file was (re)written in this run
    pub changed_folders: Vec<String>,
    pub start_time: i64,
    pub end_time: i64,
}

impl DiscoveryOutcome {
    pub fn duration_ms(&self) -> i64 {
        self.end_time - self.start_time
    }
}

// ============================================================================
// Discovery File Store
// ============================================================================

/// Reads and writes discovery files under `discovery/`
#[derive(Clone)]
pub struct DiscoveryStore {
    store: Arc<dyn RemoteStore>,
    layout: StorageLayout,
}

impl DiscoveryStore {
    pub fn new(store: Arc<dyn RemoteStore>, layout: StorageLayout) -> Self {
        Self { store, layout }
    }

    /// Names of existing discovery files, sorted
    pub async fn file_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .store
            .list(&self.layout.discovery_dir())
            .await?
            .into_iter()
            .filter(|e| e.ext.as_deref() == Some("json"))
            .map(|e| e.name)
            .collect();
        names.sort();
        Ok(names)
    }

    pub async fn load(&self, name: &str) -> Result<Option<DiscoveryFile>> {
        let documents: Option<Vec<Document>> =
            read_record(self.store.as_ref(), &self.layout.discovery_file(name)).await?;
        Ok(documents.map(|docs| DiscoveryFile::new(name, docs)))
    }

    /// Every readable discovery file; malformed ones are skipped
    pub async fn load_all(&self) -> Result<Vec<DiscoveryFile>> {
        let mut files = Vec::new();
        for name in self.file_names().await? {
            if let Some(file) = self.load(&name).await? {
                files.push(file);
            }
        }
        Ok(files)
    }

    pub async fn save(&self, file: &DiscoveryFile) -> Result<()> {
        write_record(
            self.store.as_ref(),
            &self.layout.discovery_file(&file.name),
            &file.documents,
        )
        .await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.store.delete(&self.layout.discovery_file(name)).await?;
        Ok(())
    }
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct DiscoveryCoordinator {
    store: Arc<dyn RemoteStore>,
    layout: StorageLayout,
    discovery_store: DiscoveryStore,
    checkpoints: CheckpointStore,
    delta: DeltaProcessor,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    document_extension: String,
    state: Arc<RwLock<DiscoveryState>>,
}

impl DiscoveryCoordinator {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        layout: StorageLayout,
        checkpoints: CheckpointStore,
        clock: Arc<dyn Clock>,
        event_bus: EventBus,
        document_extension: impl Into<String>,
    ) -> Self {
        Self {
            discovery_store: DiscoveryStore::new(store.clone(), layout.clone()),
            delta: DeltaProcessor::new(layout.clone()),
            store,
            layout,
            checkpoints,
            clock,
            event_bus,
            document_extension: document_extension.into(),
            state: Arc::new(RwLock::new(DiscoveryState::Idle)),
        }
    }

    pub fn discovery_store(&self) -> &DiscoveryStore {
        &self.discovery_store
    }

    pub async fn state(&self) -> DiscoveryState {
        *self.state.read().await
    }

    async fn transition(&self, to: DiscoveryState) -> Result<()> {
        let mut state = self.state.write().await;
        state.validate_transition(to)?;
        debug!(from = state.as_str(), to = to.as_str(), "Discovery state change");
        *state = to;
        Ok(())
    }

    fn now(&self) -> i64 {
        self.clock.unix_timestamp_millis()
    }

    fn is_document(&self, entry: &RemoteEntry) -> bool {
        !entry.is_hidden()
            && entry
                .ext
                .as_deref()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.document_extension))
    }

    /// Whether [`run`](Self::run) with `options` will crawl instead of reusing existing files
    pub async fn needs_crawl(&self, options: DiscoveryOptions) -> Result<bool> {
        if options.discovery_type == DiscoveryType::Incremental || options.force_full {
            return Ok(true);
        }
        if self.discovery_store.file_names().await?.is_empty() {
            return Ok(true);
        }
        Ok(self
            .checkpoints
            .load_discovery()
            .await?
            .is_some_and(|c| c.is_resumable() && c.discovery_type == DiscoveryType::Full))
    }

    /// Run discovery to a terminal state
    #[instrument(skip(self, cancel), fields(discovery_type = %options.discovery_type, force_full = options.force_full))]
    pub async fn run(
        &self,
        options: DiscoveryOptions,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryOutcome> {
        *self.state.write().await = DiscoveryState::Idle;
        let start_time = self.now();

        let existing = self.discovery_store.file_names().await?;
        let previous = self.checkpoints.load_discovery().await?;
        let resumable = previous
            .as_ref()
            .filter(|c| c.is_resumable() && c.discovery_type == options.discovery_type)
            .cloned();

        if options.discovery_type == DiscoveryType::Full
            && !options.force_full
            && !existing.is_empty()
            && resumable.is_none()
        {
            return self.skip_with_existing(options.discovery_type, start_time).await;
        }

        self.transition(DiscoveryState::Crawling).await?;

        let result = match options.discovery_type {
            DiscoveryType::Full => self.run_full(resumable, start_time, cancel).await,
            DiscoveryType::Incremental => self.run_incremental(start_time, cancel).await,
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(error = %e, "Discovery failed");
                self.transition(DiscoveryState::Failed).await?;
                if let Ok(Some(mut checkpoint)) = self.checkpoints.load_discovery().await {
                    checkpoint.finish(DiscoveryCheckpointStatus::Failed, self.now());
                    self.checkpoints.save_discovery(&checkpoint).await.ok();
                }
                Err(e)
            }
        }
    }

    async fn skip_with_existing(
        &self,
        discovery_type: DiscoveryType,
        start_time: i64,
    ) -> Result<DiscoveryOutcome> {
        let files = self.discovery_store.load_all().await?;
        let total_documents: u64 = files
            .iter()
            .map(|f| f.active_documents().count() as u64)
            .sum();

        info!(
            files = files.len(),
            documents = total_documents,
            "Discovery files exist, skipping crawl"
        );
        self.transition(DiscoveryState::Complete).await?;
        self.event_bus
            .emit(CoreEvent::Discovery(DiscoveryEvent::Completed {
                discovery_type: discovery_type.to_string(),
                total_documents,
                skipped: true,
            }))
            .ok();

        Ok(DiscoveryOutcome {
            state: DiscoveryState::Complete,
            discovery_type,
            total_folders: files.len() as u64,
            completed_folders: files.len() as u64,
            total_documents,
            skipped: true,
            changed_folders: Vec::new(),
            start_time,
            end_time: self.now(),
        })
    }

    /// Top-level groups: `root` (if it has documents) plus every visible folder
    async fn top_level_groups(&self) -> Result<Vec<(String, Option<String>)>> {
        let entries = self.store.list(self.layout.root()).await?;
        let has_root_documents = entries.iter().any(|e| self.is_document(e));

        let mut groups: Vec<(String, Option<String>)> = entries
            .into_iter()
            .filter(|e| e.is_folder() && !e.is_hidden())
            .map(|e| (e.name, Some(e.path)))
            .collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));

        if has_root_documents {
            groups.insert(0, (ROOT_DISCOVERY_NAME.to_string(), None));
        }
        Ok(groups)
    }

    /// Breadth-first listing of one group; `None` lists only root documents
    async fn crawl_group(&self, folder_path: Option<&str>) -> Result<FolderListing> {
        let mut listing = FolderListing::new();

        let Some(folder_path) = folder_path else {
            for entry in self.store.list(self.layout.root()).await? {
                if self.is_document(&entry) {
                    listing.insert(entry.path, entry.last_modified.unwrap_or(0));
                }
            }
            return Ok(listing);
        };

        let mut queue = VecDeque::from([folder_path.to_string()]);
        while let Some(path) = queue.pop_front() {
            for entry in self.store.list(&path).await? {
                if entry.is_folder() {
                    if !entry.is_hidden() {
                        queue.push_back(entry.path);
                    }
                } else if self.is_document(&entry) {
                    listing.insert(entry.path, entry.last_modified.unwrap_or(0));
                }
            }
        }

        Ok(listing)
    }

    /// Merge a fresh listing into the previous discovery file of the same folder
    ///
    /// Scan state of unchanged paths is preserved; modified paths only get a
    /// new `lastModified`, which the change detector then picks up.
    fn merge_listing(name: &str, listing: &FolderListing, previous: Option<DiscoveryFile>) -> DiscoveryFile {
        let mut previous: BTreeMap<String, Document> = previous
            .map(|f| f.documents.into_iter().map(|d| (d.path.clone(), d)).collect())
            .unwrap_or_default();

        let documents = listing
            .iter()
            .map(|(path, last_modified)| match previous.remove(path) {
                Some(mut doc) if !doc.is_deleted() => {
                    doc.last_modified = *last_modified;
                    doc
                }
                _ => Document::new(path.clone(), *last_modified),
            })
            .collect();

        DiscoveryFile::new(name, documents)
    }

    async fn run_full(
        &self,
        resumable: Option<DiscoveryCheckpoint>,
        start_time: i64,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryOutcome> {
        info!("Phase 1: Listing top-level folders");
        let groups = self.top_level_groups().await?;

        let mut checkpoint = match resumable {
            Some(mut checkpoint) => {
                info!(
                    completed = checkpoint.completed_folders,
                    total = checkpoint.total_folders,
                    "Resuming discovery"
                );
                checkpoint.status = DiscoveryCheckpointStatus::Running;
                checkpoint.total_folders = groups.len() as u64;
                checkpoint
            }
            None => DiscoveryCheckpoint::start(DiscoveryType::Full, groups.len() as u64, start_time),
        };
        self.checkpoints.save_discovery(&checkpoint).await?;

        self.event_bus
            .emit(CoreEvent::Discovery(DiscoveryEvent::Started {
                discovery_type: DiscoveryType::Full.to_string(),
                total_folders: groups.len() as u64,
            }))
            .ok();

        info!("Phase 2: Crawling {} folders", groups.len());
        let mut changed_folders = Vec::new();

        for (name, path) in &groups {
            if checkpoint.is_processed(name) {
                debug!(folder = %name, "Folder already discovered");
                continue;
            }

            if cancel.is_cancelled() {
                return self
                    .interrupt(checkpoint, DiscoveryType::Full, changed_folders, start_time)
                    .await;
            }

            let listing = self.crawl_group(path.as_deref()).await?;
            let previous = self.discovery_store.load(name).await?;
            let file = Self::merge_listing(name, &listing, previous);
            self.discovery_store.save(&file).await?;

            checkpoint.record_folder(name);
            self.checkpoints.save_discovery(&checkpoint).await?;
            changed_folders.push(name.clone());

            debug!(folder = %name, documents = file.documents.len(), "Folder discovered");
            self.event_bus
                .emit(CoreEvent::Discovery(DiscoveryEvent::FolderCompleted {
                    folder: name.clone(),
                    documents: file.documents.len() as u64,
                    completed_folders: checkpoint.completed_folders,
                    total_folders: checkpoint.total_folders,
                }))
                .ok();
        }

        // Folders that vanished from the tree
        for stale in self.discovery_store.file_names().await? {
            if !groups.iter().any(|(name, _)| *name == stale) {
                info!(folder = %stale, "Removing discovery file of vanished folder");
                self.discovery_store.delete(&stale).await?;
            }
        }

        self.finish(checkpoint, DiscoveryType::Full, changed_folders, start_time)
            .await
    }

    async fn run_incremental(
        &self,
        start_time: i64,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryOutcome> {
        let baseline: Option<SiteStructure> =
            read_record(self.store.as_ref(), &self.layout.site_structure()).await?;

        let Some(baseline) = baseline else {
            info!("No baseline site structure, falling back to full discovery");
            let previous = self.checkpoints.load_discovery().await?;
            let resumable = previous.filter(|c| c.is_resumable() && c.discovery_type == DiscoveryType::Full);
            return self.run_full(resumable, start_time, cancel).await;
        };

        info!("Phase 1: Listing current tree");
        let groups = self.top_level_groups().await?;
        let mut current = BTreeMap::new();
        for (name, path) in &groups {
            if cancel.is_cancelled() {
                let checkpoint =
                    DiscoveryCheckpoint::start(DiscoveryType::Incremental, groups.len() as u64, start_time);
                return self
                    .interrupt(checkpoint, DiscoveryType::Incremental, Vec::new(), start_time)
                    .await;
            }
            current.insert(name.clone(), self.crawl_group(path.as_deref()).await?);
        }

        info!("Phase 2: Diffing against baseline");
        let baseline_grouped = self.delta.group_by_folder(&baseline.snapshot());
        let delta: DeltaResult = self.delta.diff(&baseline_grouped, &current);
        info!(
            added = delta.added_count(),
            removed = delta.removed_count(),
            modified = delta.modified_count(),
            unchanged_folders = delta.unchanged_folders.len(),
            "Computed discovery delta"
        );

        let mut checkpoint = DiscoveryCheckpoint::start(
            DiscoveryType::Incremental,
            delta.folders.len() as u64,
            start_time,
        );
        self.checkpoints.save_discovery(&checkpoint).await?;
        self.event_bus
            .emit(CoreEvent::Discovery(DiscoveryEvent::Started {
                discovery_type: DiscoveryType::Incremental.to_string(),
                total_folders: delta.folders.len() as u64,
            }))
            .ok();

        info!("Phase 3: Rewriting {} changed folders", delta.folders.len());
        let mut changed_folders = Vec::new();
        for (name, folder_delta) in &delta.folders {
            if cancel.is_cancelled() {
                return self
                    .interrupt(checkpoint, DiscoveryType::Incremental, changed_folders, start_time)
                    .await;
            }

            let mut file = self
                .discovery_store
                .load(name)
                .await?
                .unwrap_or_else(|| DiscoveryFile::new(name.clone(), Vec::new()));
            let listing = current.get(name).cloned().unwrap_or_default();

            for path in folder_delta.added.iter().chain(folder_delta.modified.iter()) {
                let last_modified = listing.get(path).copied().unwrap_or(0);
                match file.find_mut(path) {
                    Some(doc) => {
                        doc.last_modified = last_modified;
                        if doc.is_deleted() {
                            *doc = Document::new(path.clone(), last_modified);
                        }
                    }
                    None => file.documents.push(Document::new(path.clone(), last_modified)),
                }
            }
            for path in &folder_delta.removed {
                if let Some(doc) = file.find_mut(path) {
                    doc.mark_deleted();
                }
            }

            let file = DiscoveryFile::new(file.name, file.documents);
            self.discovery_store.save(&file).await?;
            checkpoint.record_folder(name);
            self.checkpoints.save_discovery(&checkpoint).await?;
            changed_folders.push(name.clone());

            self.event_bus
                .emit(CoreEvent::Discovery(DiscoveryEvent::FolderCompleted {
                    folder: name.clone(),
                    documents: file.documents.len() as u64,
                    completed_folders: checkpoint.completed_folders,
                    total_folders: checkpoint.total_folders,
                }))
                .ok();
        }

        self.finish(checkpoint, DiscoveryType::Incremental, changed_folders, start_time)
            .await
    }

    async fn interrupt(
        &self,
        mut checkpoint: DiscoveryCheckpoint,
        discovery_type: DiscoveryType,
        changed_folders: Vec<String>,
        start_time: i64,
    ) -> Result<DiscoveryOutcome> {
        warn!(
            completed = checkpoint.completed_folders,
            total = checkpoint.total_folders,
            "Discovery interrupted"
        );
        let now = self.now();
        checkpoint.finish(DiscoveryCheckpointStatus::Interrupted, now);
        self.checkpoints.save_discovery(&checkpoint).await?;
        self.transition(DiscoveryState::Interrupted).await?;

        Ok(DiscoveryOutcome {
            state: DiscoveryState::Interrupted,
            discovery_type,
            total_folders: checkpoint.total_folders,
            completed_folders: checkpoint.completed_folders,
            total_documents: 0,
            skipped: false,
            changed_folders,
            start_time,
            end_time: now,
        })
    }

    async fn finish(
        &self,
        mut checkpoint: DiscoveryCheckpoint,
        discovery_type: DiscoveryType,
        changed_folders: Vec<String>,
        start_time: i64,
    ) -> Result<DiscoveryOutcome> {
        let now = self.now();
        checkpoint.finish(DiscoveryCheckpointStatus::Completed, now);
        self.checkpoints.save_discovery(&checkpoint).await?;

        let total_documents: u64 = self
            .discovery_store
            .load_all()
            .await?
            .iter()
            .map(|f| f.active_documents().count() as u64)
            .sum();

        self.transition(DiscoveryState::Complete).await?;
        info!(
            folders = checkpoint.completed_folders,
            documents = total_documents,
            "Discovery complete"
        );
        self.event_bus
            .emit(CoreEvent::Discovery(DiscoveryEvent::Completed {
                discovery_type: discovery_type.to_string(),
                total_documents,
                skipped: false,
            }))
            .ok();

        Ok(DiscoveryOutcome {
            state: DiscoveryState::Complete,
            discovery_type,
            total_folders: checkpoint.total_folders,
            completed_folders: checkpoint.completed_folders,
            total_documents,
            skipped: false,
            changed_folders,
            start_time,
            end_time: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_desktop::MemoryRemoteStore;
    use bridge_traits::time::ManualClock;
    use core_runtime::config::ContentContext;

    struct Fixture {
        remote: Arc<MemoryRemoteStore>,
        coordinator: DiscoveryCoordinator,
    }

    fn fixture(remote: Arc<MemoryRemoteStore>) -> Fixture {
        let layout = StorageLayout::new(&ContentContext::new("acme", "website"), ".media-index");
        let checkpoints = CheckpointStore::new(remote.clone(), layout.clone());
        let coordinator = DiscoveryCoordinator::new(
            remote.clone(),
            layout,
            checkpoints,
            Arc::new(ManualClock::new(1_000)),
            EventBus::default(),
            "html",
        );
        Fixture {
            remote,
            coordinator,
        }
    }

    async fn seeded() -> Arc<MemoryRemoteStore> {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.put_document("/acme/website/index.html", "", 1).await;
        remote.put_document("/acme/website/blog/a.html", "", 1).await;
        remote.put_document("/acme/website/blog/2024/b.html", "", 1).await;
        remote.put_document("/acme/website/docs/c.html", "", 1).await;
        remote.put_document("/acme/website/docs/notes.txt", "", 1).await;
        remote.put_document("/acme/website/.drafts/x.html", "", 1).await;
        remote
    }

    #[tokio::test]
    async fn test_full_discovery_writes_one_file_per_folder() {
        let f = fixture(seeded().await);
        let outcome = f
            .coordinator
            .run(DiscoveryOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.state, DiscoveryState::Complete);
        assert_eq!(outcome.total_folders, 3);
        assert_eq!(outcome.total_documents, 4);
        assert!(!outcome.skipped);

        let store = f.coordinator.discovery_store();
        assert_eq!(store.file_names().await.unwrap(), vec!["blog", "docs", "root"]);
        let blog = store.load("blog").await.unwrap().unwrap();
        assert_eq!(blog.documents.len(), 2);
        assert_eq!(blog.documents[0].path, "/acme/website/blog/2024/b.html");
    }

    #[tokio::test]
    async fn test_existing_files_skip_crawl() {
        let f = fixture(seeded().await);
        let cancel = CancellationToken::new();
        f.coordinator.run(DiscoveryOptions::default(), &cancel).await.unwrap();

        let outcome = f.coordinator.run(DiscoveryOptions::default(), &cancel).await.unwrap();
        assert!(outcome.skipped);
        assert_eq!(outcome.total_documents, 4);
        assert_eq!(f.coordinator.state().await, DiscoveryState::Complete);
    }

    #[tokio::test]
    async fn test_cancelled_discovery_is_interrupted_and_resumable() {
        let f = fixture(seeded().await);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = f.coordinator.run(DiscoveryOptions::default(), &cancel).await.unwrap();
        assert_eq!(outcome.state, DiscoveryState::Interrupted);

        let checkpoint = f
            .coordinator
            .checkpoints
            .load_discovery()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.status, DiscoveryCheckpointStatus::Interrupted);
        assert!(checkpoint.is_resumable());
    }

    #[tokio::test]
    async fn test_resume_skips_processed_folders() {
        let f = fixture(seeded().await);
        let mut checkpoint = DiscoveryCheckpoint::start(DiscoveryType::Full, 3, 0);
        checkpoint.record_folder("blog");
        f.coordinator.checkpoints.save_discovery(&checkpoint).await.unwrap();
        // Pretend blog was written by the interrupted run
        f.coordinator
            .discovery_store()
            .save(&DiscoveryFile::new("blog", vec![Document::new("/acme/website/blog/a.html", 1)]))
            .await
            .unwrap();

        let outcome = f
            .coordinator
            .run(DiscoveryOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.changed_folders, vec!["docs", "root"]);
        assert_eq!(outcome.completed_folders, 3);
        let blog = f.coordinator.discovery_store().load("blog").await.unwrap().unwrap();
        assert_eq!(blog.documents.len(), 1);
    }

    #[tokio::test]
    async fn test_forced_full_discovery_preserves_scan_state() {
        let f = fixture(seeded().await);
        let cancel = CancellationToken::new();
        f.coordinator.run(DiscoveryOptions::default(), &cancel).await.unwrap();

        let store = f.coordinator.discovery_store();
        let mut docs = store.load("docs").await.unwrap().unwrap();
        docs.documents[0].mark_scanned(2, 5);
        store.save(&docs).await.unwrap();

        f.remote.put_document("/acme/website/docs/c.html", "", 9).await;
        let options = DiscoveryOptions {
            force_full: true,
            ..Default::default()
        };
        f.coordinator.run(options, &cancel).await.unwrap();

        let docs = store.load("docs").await.unwrap().unwrap();
        assert_eq!(docs.documents[0].media_count, 2);
        assert_eq!(docs.documents[0].last_modified, 9);
        assert_eq!(docs.documents[0].last_scanned_at, Some(5));
    }

    #[tokio::test]
    async fn test_vanished_folder_file_is_removed() {
        let f = fixture(seeded().await);
        let cancel = CancellationToken::new();
        f.coordinator.run(DiscoveryOptions::default(), &cancel).await.unwrap();

        f.remote.remove("/acme/website/docs/c.html").await;
        f.remote.remove("/acme/website/docs/notes.txt").await;
        let options = DiscoveryOptions {
            force_full: true,
            ..Default::default()
        };
        f.coordinator.run(options, &cancel).await.unwrap();

        assert_eq!(
            f.coordinator.discovery_store().file_names().await.unwrap(),
            vec!["blog", "root"]
        );
    }

    #[test]
    fn test_state_transitions() {
        assert!(DiscoveryState::Idle
            .validate_transition(DiscoveryState::Crawling)
            .is_ok());
        assert!(DiscoveryState::Complete
            .validate_transition(DiscoveryState::Crawling)
            .is_err());
        assert!(DiscoveryState::Idle
            .validate_transition(DiscoveryState::Interrupted)
            .is_err());
    }
}
