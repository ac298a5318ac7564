//! # Discovery Records
//!
//! A [`Document`] is one content page found by discovery. Documents are
//! grouped into [`DiscoveryFile`]s, one per top-level folder, and persisted
//! as JSON arrays. The worker records each scan outcome in the local cache
//! as a [`PageScanRecord`], which completion folds back into the documents.
//!
//! ## Status Lifecycle
//!
//! ```text
//! pending → running → completed
//!              ↓
//!           failed → running (next run)
//! ```

use crate::{Result, ScanError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Most recent errors kept per document
pub const MAX_SCAN_ERRORS: usize = 5;

// ============================================================================
// Status Types
// ============================================================================

/// Scan status of a single document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }
}

impl FromStr for ScanStatus {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ScanStatus::Pending),
            "running" => Ok(ScanStatus::Running),
            "completed" => Ok(ScanStatus::Completed),
            "failed" => Ok(ScanStatus::Failed),
            _ => Err(ScanError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of the discovery entry itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    Deleted,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
            EntryStatus::Deleted => "deleted",
        }
    }
}

// ============================================================================
// Document
// ============================================================================

/// One content page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Unique key across all discovery files
    pub path: String,
    /// Source modification time (Unix millis)
    #[serde(default)]
    pub last_modified: i64,
    /// Absent on documents written by older discovery runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_status: Option<ScanStatus>,
    #[serde(default)]
    pub scan_complete: bool,
    #[serde(default)]
    pub needs_rescan: bool,
    #[serde(default)]
    pub media_count: u64,
    #[serde(default)]
    pub scan_attempts: u32,
    #[serde(default)]
    pub scan_errors: Vec<String>,
    /// Time of the last successful scan (Unix millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scanned_at: Option<i64>,
    #[serde(default)]
    pub entry_status: EntryStatus,
}

impl Document {
    /// A freshly discovered, never scanned document
    pub fn new(path: impl Into<String>, last_modified: i64) -> Self {
        Self {
            path: path.into(),
            last_modified,
            scan_status: Some(ScanStatus::Pending),
            scan_complete: false,
            needs_rescan: false,
            media_count: 0,
            scan_attempts: 0,
            scan_errors: Vec::new(),
            last_scanned_at: None,
            entry_status: EntryStatus::Pending,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.entry_status == EntryStatus::Deleted
    }

    pub fn mark_running(&mut self) {
        self.scan_status = Some(ScanStatus::Running);
    }

    /// Record a successful scan
    pub fn mark_scanned(&mut self, media_count: u64, scanned_at: i64) {
        self.scan_status = Some(ScanStatus::Completed);
        self.scan_complete = true;
        self.needs_rescan = false;
        self.media_count = media_count;
        self.last_scanned_at = Some(scanned_at);
        self.entry_status = EntryStatus::Completed;
    }

    /// Record a failed scan; the next run retries it
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.scan_status = Some(ScanStatus::Failed);
        self.scan_attempts += 1;
        self.needs_rescan = true;
        self.entry_status = EntryStatus::Failed;
        self.scan_errors.push(error.into());
        if self.scan_errors.len() > MAX_SCAN_ERRORS {
            let excess = self.scan_errors.len() - MAX_SCAN_ERRORS;
            self.scan_errors.drain(..excess);
        }
    }

    pub fn mark_deleted(&mut self) {
        self.entry_status = EntryStatus::Deleted;
    }

    /// Fold a locally cached scan outcome into this document
    pub fn apply_record(&mut self, record: &PageScanRecord) {
        match record.status {
            ScanStatus::Completed => {
                self.mark_scanned(record.media_count, record.updated_at);
            }
            ScanStatus::Failed => {
                self.scan_status = Some(ScanStatus::Failed);
                self.scan_attempts = self.scan_attempts.max(record.attempts);
                self.needs_rescan = true;
                self.entry_status = EntryStatus::Failed;
                if let Some(error) = &record.error {
                    if self.scan_errors.last() != Some(error) {
                        self.scan_errors.push(error.clone());
                    }
                }
                if self.scan_errors.len() > MAX_SCAN_ERRORS {
                    let excess = self.scan_errors.len() - MAX_SCAN_ERRORS;
                    self.scan_errors.drain(..excess);
                }
            }
            ScanStatus::Running | ScanStatus::Pending => {
                self.scan_status = Some(record.status);
            }
        }
    }
}

// ============================================================================
// Discovery File
// ============================================================================

/// Documents of one top-level folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFile {
    /// Folder name (`root` for top-level documents)
    pub name: String,
    pub documents: Vec<Document>,
}

impl DiscoveryFile {
    pub fn new(name: impl Into<String>, mut documents: Vec<Document>) -> Self {
        documents.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            name: name.into(),
            documents,
        }
    }

    pub fn active_documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.iter().filter(|doc| !doc.is_deleted())
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut Document> {
        self.documents.iter_mut().find(|doc| doc.path == path)
    }

    pub fn media_count(&self) -> u64 {
        self.active_documents().map(|doc| doc.media_count).sum()
    }
}

// ============================================================================
// Local Scan Record
// ============================================================================

/// Per-page scan outcome stored in the local cache during a run
///
/// Keyed by document path in the `scan_status` collection. This record is
/// authoritative for "did this page complete" until completion reconciles
/// it into the discovery files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageScanRecord {
    pub path: String,
    pub source_file: String,
    pub status: ScanStatus,
    #[serde(default)]
    pub media_count: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_json_is_camel_case() {
        let doc = Document::new("/acme/website/a.html", 10);
        let value = serde_json::to_value(&doc).unwrap();

        assert_eq!(value["lastModified"], 10);
        assert_eq!(value["scanStatus"], "pending");
        assert_eq!(value["entryStatus"], "pending");
        assert!(value.get("lastScannedAt").is_none());
    }

    #[test]
    fn test_legacy_document_without_status() {
        let doc: Document =
            serde_json::from_str(r#"{"path":"/acme/website/a.html","lastModified":5}"#).unwrap();

        assert_eq!(doc.scan_status, None);
        assert!(!doc.scan_complete);
        assert_eq!(doc.entry_status, EntryStatus::Pending);
    }

    #[test]
    fn test_mark_failed_then_scanned() {
        let mut doc = Document::new("/acme/website/a.html", 10);
        doc.mark_running();
        doc.mark_failed("timeout");

        assert_eq!(doc.scan_status, Some(ScanStatus::Failed));
        assert_eq!(doc.scan_attempts, 1);
        assert!(doc.needs_rescan);
        assert_eq!(doc.scan_errors, vec!["timeout"]);

        doc.mark_scanned(3, 20);
        assert_eq!(doc.scan_status, Some(ScanStatus::Completed));
        assert!(doc.scan_complete);
        assert!(!doc.needs_rescan);
        assert_eq!(doc.media_count, 3);
        assert_eq!(doc.last_scanned_at, Some(20));
        assert_eq!(doc.scan_attempts, 1);
    }

    #[test]
    fn test_scan_errors_are_capped() {
        let mut doc = Document::new("/acme/website/a.html", 10);
        for i in 0..(MAX_SCAN_ERRORS + 2) {
            doc.mark_failed(format!("error {}", i));
        }

        assert_eq!(doc.scan_errors.len(), MAX_SCAN_ERRORS);
        assert_eq!(doc.scan_errors[0], "error 2");
    }

    #[test]
    fn test_discovery_file_sorts_and_skips_deleted() {
        let mut deleted = Document::new("/acme/website/blog/a.html", 1);
        deleted.mark_deleted();
        deleted.media_count = 4;
        let mut kept = Document::new("/acme/website/blog/b.html", 1);
        kept.media_count = 2;

        let file = DiscoveryFile::new("blog", vec![kept, deleted]);

        assert_eq!(file.documents[0].path, "/acme/website/blog/a.html");
        assert_eq!(file.active_documents().count(), 1);
        assert_eq!(file.media_count(), 2);
    }

    #[test]
    fn test_apply_failed_record_keeps_max_attempts() {
        let mut doc = Document::new("/acme/website/a.html", 10);
        let record = PageScanRecord {
            path: doc.path.clone(),
            source_file: "root".to_string(),
            status: ScanStatus::Failed,
            media_count: 0,
            attempts: 2,
            error: Some("boom".to_string()),
            updated_at: 30,
        };

        doc.apply_record(&record);
        doc.apply_record(&record);

        assert_eq!(doc.scan_attempts, 2);
        assert_eq!(doc.scan_errors, vec!["boom"]);
        assert!(doc.needs_rescan);
    }

    #[test]
    fn test_scan_status_from_str() {
        assert_eq!("FAILED".parse::<ScanStatus>().unwrap(), ScanStatus::Failed);
        assert!("bogus".parse::<ScanStatus>().is_err());
    }
}
