//! # Scan Completion Handler
//!
//! Finalizes a scan cycle, however it ended (finished, stopped or
//! interrupted):
//!
//! 1. Reconcile discovery records with the local per-page scan records
//! 2. Purge deleted documents from cached and uploaded media
//! 3. Write the reconciled discovery records back, dropping deleted documents
//! 4. Rebuild `site-structure.json` from the reconciled records
//! 5. Append one [`AuditEntry`] (once per session)
//!
//! Each remote step goes through the shared [`RetryExecutor`]. Reconciled
//! scan records are cleared once written back, so running completion again
//! reproduces the same aggregate.

use crate::checkpoint::DiscoveryType;
use crate::discovery::DiscoveryStore;
use crate::document::{DiscoveryFile, PageScanRecord, ScanStatus};
use crate::layout::StorageLayout;
use crate::media::{MediaAsset, MediaIndex};
use crate::records::{read_record, write_record};
use crate::retry::RetryExecutor;
use crate::session::SessionId;
use crate::structure::SiteStructure;
use crate::Result;
use bridge_traits::storage::{CacheCollection, LocalCache, RemoteStore};
use bridge_traits::time::Clock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Summary of one completed scan cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub session_id: String,
    pub discovery_type: DiscoveryType,
    pub discovery_duration_ms: i64,
    pub scanning_duration_ms: i64,
    pub total_documents: u64,
    pub scanned_pages: u64,
    pub failed_pages: u64,
    pub total_media: u64,
    pub completed_at: i64,
}

/// What the cycle did, as seen by the orchestrator
#[derive(Debug, Clone)]
pub struct CompletionContext {
    pub session_id: SessionId,
    pub discovery_type: DiscoveryType,
    pub discovery_duration_ms: i64,
    pub scanning_duration_ms: i64,
    pub scanned_pages: u64,
    pub failed_pages: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionSummary {
    pub reconciled_records: u64,
    pub total_documents: u64,
    pub completed_documents: u64,
    pub failed_documents: u64,
    pub total_media: u64,
    pub purged_pages: u64,
    pub removed_media: u64,
    pub audit_appended: bool,
}

pub struct ScanCompletionHandler {
    store: Arc<dyn RemoteStore>,
    cache: Arc<dyn LocalCache>,
    layout: StorageLayout,
    discovery_store: DiscoveryStore,
    clock: Arc<dyn Clock>,
    retry: RetryExecutor,
    audit_log_max_entries: usize,
}

impl ScanCompletionHandler {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cache: Arc<dyn LocalCache>,
        layout: StorageLayout,
        clock: Arc<dyn Clock>,
        retry: RetryExecutor,
        audit_log_max_entries: usize,
    ) -> Self {
        Self {
            discovery_store: DiscoveryStore::new(store.clone(), layout.clone()),
            store,
            cache,
            layout,
            clock,
            retry,
            audit_log_max_entries: audit_log_max_entries.max(1),
        }
    }

    #[instrument(skip_all, fields(session_id = %context.session_id))]
    pub async fn complete(&self, context: &CompletionContext) -> Result<CompletionSummary> {
        let mut summary = CompletionSummary::default();

        info!("Phase 1: Reconciling scan records");
        let mut files = self
            .retry
            .run("load discovery files", |_| self.discovery_store.load_all())
            .await
            .result?;
        let records = self.scan_records().await?;
        summary.reconciled_records = apply_records(&mut files, &records);

        info!("Phase 2: Purging deleted documents");
        let deleted: Vec<String> = files
            .iter()
            .flat_map(|f| f.documents.iter())
            .filter(|d| d.is_deleted())
            .map(|d| d.path.clone())
            .collect();
        summary.purged_pages = deleted.len() as u64;
        if !deleted.is_empty() {
            summary.removed_media = self.purge_local_media(&deleted).await?;
            self.retry
                .run("purge media index", |_| self.purge_remote_media(&deleted))
                .await
                .result?;
        }

        info!("Phase 3: Writing back {} discovery files", files.len());
        let files: Vec<DiscoveryFile> = files
            .into_iter()
            .map(|f| {
                let documents = f.documents.into_iter().filter(|d| !d.is_deleted()).collect();
                DiscoveryFile::new(f.name, documents)
            })
            .collect();
        for file in &files {
            if file.documents.is_empty() {
                debug!(file = %file.name, "Removing empty discovery file");
                self.retry
                    .run("delete discovery file", |_| self.discovery_store.delete(&file.name))
                    .await
                    .result?;
            } else {
                self.retry
                    .run("write discovery file", |_| self.discovery_store.save(file))
                    .await
                    .result?;
            }
        }
        for path in records.keys() {
            self.cache.delete(CacheCollection::ScanStatus, path).await?;
        }

        info!("Phase 4: Rebuilding site structure");
        let now = self.clock.unix_timestamp_millis();
        let structure = SiteStructure::build(&files, &self.layout, now);
        let structure_path = self.layout.site_structure();
        self.retry
            .run("write site structure", |_| {
                write_record(self.store.as_ref(), &structure_path, &structure)
            })
            .await
            .result?;

        summary.total_documents = structure.total_documents;
        summary.total_media = structure.total_media;
        for document in files.iter().flat_map(|f| f.documents.iter()) {
            match document.scan_status {
                Some(ScanStatus::Completed) => summary.completed_documents += 1,
                Some(ScanStatus::Failed) => summary.failed_documents += 1,
                _ => {}
            }
        }

        info!("Phase 5: Appending audit entry");
        let entry = AuditEntry {
            session_id: context.session_id.to_string(),
            discovery_type: context.discovery_type,
            discovery_duration_ms: context.discovery_duration_ms,
            scanning_duration_ms: context.scanning_duration_ms,
            total_documents: summary.total_documents,
            scanned_pages: context.scanned_pages,
            failed_pages: context.failed_pages,
            total_media: summary.total_media,
            completed_at: now,
        };
        summary.audit_appended = self
            .retry
            .run("append audit entry", |_| self.append_audit(&entry))
            .await
            .result?;

        info!(
            documents = summary.total_documents,
            media = summary.total_media,
            reconciled = summary.reconciled_records,
            purged = summary.purged_pages,
            "Completion finished"
        );
        Ok(summary)
    }

    /// Fold the cached per-page scan records into `files`
    ///
    /// Records stay cached until completion writes them back, so a run that
    /// died before completing still counts its scanned pages on resume.
    /// Returns the number of documents updated.
    pub async fn apply_scan_records(&self, files: &mut [DiscoveryFile]) -> Result<u64> {
        let records = self.scan_records().await?;
        Ok(apply_records(files, &records))
    }

    /// Audit log, oldest first
    pub async fn audit_log(&self) -> Result<Vec<AuditEntry>> {
        Ok(read_record(self.store.as_ref(), &self.layout.audit_log())
            .await?
            .unwrap_or_default())
    }

    async fn scan_records(&self) -> Result<HashMap<String, PageScanRecord>> {
        let mut records = HashMap::new();
        for (key, value) in self.cache.get_all(CacheCollection::ScanStatus).await? {
            match serde_json::from_value::<PageScanRecord>(value) {
                Ok(record) => {
                    records.insert(record.path.clone(), record);
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping malformed scan record"),
            }
        }
        Ok(records)
    }

    async fn purge_local_media(&self, pages: &[String]) -> Result<u64> {
        let mut removed = 0;
        for (key, value) in self.cache.get_all(CacheCollection::Media).await? {
            let Ok(mut asset) = serde_json::from_value::<MediaAsset>(value) else {
                continue;
            };
            if !pages.iter().any(|p| asset.used_in.contains(p)) {
                continue;
            }
            for page in pages {
                asset.remove_page(page);
            }
            if asset.is_orphaned() {
                self.cache.delete(CacheCollection::Media, &key).await?;
                removed += 1;
            } else {
                self.cache
                    .put(CacheCollection::Media, &key, &serde_json::to_value(&asset)?)
                    .await?;
            }
        }
        Ok(removed)
    }

    async fn purge_remote_media(&self, pages: &[String]) -> Result<()> {
        let path = self.layout.media_index();
        let Some(assets) = read_record::<Vec<MediaAsset>>(self.store.as_ref(), &path).await? else {
            return Ok(());
        };
        let mut index = MediaIndex::from_assets(assets);
        let removed = index.purge_pages(pages);
        debug!(removed, "Purged remote media index");
        write_record(self.store.as_ref(), &path, index.assets()).await
    }

    /// Append `entry` unless its session is already logged
    async fn append_audit(&self, entry: &AuditEntry) -> Result<bool> {
        let mut log = self.audit_log().await?;
        if log.iter().any(|e| e.session_id == entry.session_id) {
            debug!("Audit entry already present");
            return Ok(false);
        }

        log.push(entry.clone());
        if log.len() > self.audit_log_max_entries {
            let excess = log.len() - self.audit_log_max_entries;
            log.drain(..excess);
        }
        write_record(self.store.as_ref(), &self.layout.audit_log(), &log).await?;
        Ok(true)
    }
}

fn apply_records(files: &mut [DiscoveryFile], records: &HashMap<String, PageScanRecord>) -> u64 {
    let mut applied = 0;
    for document in files.iter_mut().flat_map(|f| f.documents.iter_mut()) {
        if let Some(record) = records.get(&document.path) {
            document.apply_record(record);
            applied += 1;
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::media::{MediaType, Occurrence};
    use bridge_desktop::{MemoryRemoteStore, SqliteLocalCache};
    use bridge_traits::http::RetryPolicy;
    use bridge_traits::time::ManualClock;
    use core_runtime::config::ContentContext;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryRemoteStore>,
        cache: Arc<SqliteLocalCache>,
        handler: ScanCompletionHandler,
    }

    async fn fixture(audit_max: usize) -> Fixture {
        let store = Arc::new(MemoryRemoteStore::new());
        let cache = Arc::new(SqliteLocalCache::in_memory().await.unwrap());
        let layout = StorageLayout::new(&ContentContext::new("acme", "website"), ".media-index");
        let handler = ScanCompletionHandler::new(
            store.clone(),
            cache.clone(),
            layout,
            Arc::new(ManualClock::new(9_000)),
            RetryExecutor::new(RetryPolicy::default().with_base_delay(Duration::from_millis(1))),
            audit_max,
        );
        Fixture {
            store,
            cache,
            handler,
        }
    }

    fn context(session_id: SessionId) -> CompletionContext {
        CompletionContext {
            session_id,
            discovery_type: DiscoveryType::Full,
            discovery_duration_ms: 10,
            scanning_duration_ms: 20,
            scanned_pages: 1,
            failed_pages: 0,
        }
    }

    async fn put_record(cache: &SqliteLocalCache, path: &str, status: ScanStatus, media_count: u64) {
        let record = PageScanRecord {
            path: path.to_string(),
            source_file: "blog".to_string(),
            status,
            media_count,
            attempts: 0,
            error: None,
            updated_at: 5_000,
        };
        cache
            .put(CacheCollection::ScanStatus, path, &serde_json::to_value(&record).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconciles_records_and_builds_structure() {
        let f = fixture(100).await;
        let discovery = f.handler.discovery_store.clone();
        discovery
            .save(&DiscoveryFile::new(
                "blog",
                vec![
                    Document::new("/acme/website/blog/a.html", 1),
                    Document::new("/acme/website/blog/b.html", 1),
                ],
            ))
            .await
            .unwrap();
        put_record(&f.cache, "/acme/website/blog/a.html", ScanStatus::Completed, 3).await;

        let summary = f.handler.complete(&context(SessionId::new())).await.unwrap();

        assert_eq!(summary.reconciled_records, 1);
        assert_eq!(summary.total_documents, 2);
        assert_eq!(summary.completed_documents, 1);
        assert_eq!(summary.total_media, 3);
        assert!(summary.audit_appended);

        let blog = discovery.load("blog").await.unwrap().unwrap();
        assert_eq!(blog.documents[0].last_scanned_at, Some(5_000));
        assert!(blog.documents[0].scan_complete);

        let structure: SiteStructure = read_record(f.store.as_ref(), &f.handler.layout.site_structure())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(structure.root.subfolders["blog"].media_count, 3);
        assert!(f.cache.get_all(CacheCollection::ScanStatus).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completion_is_idempotent() {
        let f = fixture(100).await;
        f.handler
            .discovery_store
            .save(&DiscoveryFile::new("root", vec![Document::new("/acme/website/a.html", 1)]))
            .await
            .unwrap();
        put_record(&f.cache, "/acme/website/a.html", ScanStatus::Completed, 2).await;
        let session = SessionId::new();

        let first = f.handler.complete(&context(session)).await.unwrap();
        let files_after_first = f.handler.discovery_store.load_all().await.unwrap();
        let second = f.handler.complete(&context(session)).await.unwrap();

        assert_eq!(f.handler.discovery_store.load_all().await.unwrap(), files_after_first);
        assert_eq!(first.total_media, second.total_media);
        assert!(!second.audit_appended);
        assert_eq!(f.handler.audit_log().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_scan_records_keeps_records_cached() {
        let f = fixture(100).await;
        let mut files = vec![DiscoveryFile::new(
            "blog",
            vec![
                Document::new("/acme/website/blog/a.html", 1),
                Document::new("/acme/website/blog/b.html", 1),
            ],
        )];
        put_record(&f.cache, "/acme/website/blog/a.html", ScanStatus::Completed, 4).await;

        let applied = f.handler.apply_scan_records(&mut files).await.unwrap();

        assert_eq!(applied, 1);
        assert_eq!(files[0].documents[0].scan_status, Some(ScanStatus::Completed));
        assert_eq!(files[0].documents[0].media_count, 4);
        assert_eq!(files[0].documents[1].scan_status, Some(ScanStatus::Pending));
        assert_eq!(f.cache.get_all(CacheCollection::ScanStatus).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_documents_are_purged() {
        let f = fixture(100).await;
        let mut gone = Document::new("/acme/website/blog/old.html", 1);
        gone.mark_deleted();
        f.handler
            .discovery_store
            .save(&DiscoveryFile::new(
                "blog",
                vec![gone, Document::new("/acme/website/blog/new.html", 1)],
            ))
            .await
            .unwrap();

        let mut shared = MediaAsset::new("/m/shared.png", MediaType::Image, false);
        let mut only_old = MediaAsset::new("/m/old.png", MediaType::Image, false);
        for (asset, pages) in [
            (&mut shared, vec!["/acme/website/blog/old.html", "/acme/website/blog/new.html"]),
            (&mut only_old, vec!["/acme/website/blog/old.html"]),
        ] {
            for (i, page) in pages.into_iter().enumerate() {
                asset.add_occurrence(Occurrence {
                    id: format!("{}", i),
                    page: page.to_string(),
                    has_alt_text: false,
                    has_title: false,
                    context: String::new(),
                });
            }
        }
        for asset in [&shared, &only_old] {
            f.cache
                .put(CacheCollection::Media, &asset.id, &serde_json::to_value(asset).unwrap())
                .await
                .unwrap();
        }

        let summary = f.handler.complete(&context(SessionId::new())).await.unwrap();

        assert_eq!(summary.purged_pages, 1);
        assert_eq!(summary.removed_media, 1);
        let media = f.cache.get_all(CacheCollection::Media).await.unwrap();
        assert_eq!(media.len(), 1);
        let kept: MediaAsset = serde_json::from_value(media[0].1.clone()).unwrap();
        assert_eq!(kept.used_in, vec!["/acme/website/blog/new.html"]);

        let blog = f.handler.discovery_store.load("blog").await.unwrap().unwrap();
        assert_eq!(blog.documents.len(), 1);
    }

    #[tokio::test]
    async fn test_audit_log_is_capped() {
        let f = fixture(2).await;
        for _ in 0..3 {
            f.handler.complete(&context(SessionId::new())).await.unwrap();
        }

        assert_eq!(f.handler.audit_log().await.unwrap().len(), 2);
    }
}
