//! # Document Change Detector
//!
//! Decides, per document, whether it needs (re)scanning. One decision table
//! applies to every document:
//!
//! | Condition | Scan | Reason |
//! |---|---|---|
//! | entry deleted | no | `deleted` |
//! | force rescan | yes | `force` |
//! | status `pending` | yes | `new` (never attempted) or `retry` |
//! | status `running` | yes | `retry` (interrupted attempt) |
//! | status `failed` | yes | `retry` |
//! | status absent, not complete | yes | `new` or `incomplete` |
//! | status absent, needs rescan | yes | `changed` |
//! | never successfully scanned | yes | `new` |
//! | `lastModified > lastScannedAt` | yes | `changed` (sets `needsRescan`) |
//! | otherwise | no | `unchanged` |

use crate::document::{DiscoveryFile, Document, ScanStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanReason {
    Force,
    New,
    Retry,
    Incomplete,
    Changed,
    Unchanged,
    Deleted,
}

impl ScanReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanReason::Force => "force",
            ScanReason::New => "new",
            ScanReason::Retry => "retry",
            ScanReason::Incomplete => "incomplete",
            ScanReason::Changed => "changed",
            ScanReason::Unchanged => "unchanged",
            ScanReason::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanDecision {
    pub needs_scan: bool,
    pub reason: ScanReason,
}

impl ScanDecision {
    fn scan(reason: ScanReason) -> Self {
        Self {
            needs_scan: true,
            reason,
        }
    }

    fn skip(reason: ScanReason) -> Self {
        Self {
            needs_scan: false,
            reason,
        }
    }
}

/// Apply the decision table to a single document
pub fn decide(document: &Document, force_rescan: bool) -> ScanDecision {
    if document.is_deleted() {
        return ScanDecision::skip(ScanReason::Deleted);
    }

    if force_rescan {
        return ScanDecision::scan(ScanReason::Force);
    }

    match document.scan_status {
        Some(ScanStatus::Pending) => {
            if document.scan_attempts == 0 && document.last_scanned_at.is_none() {
                return ScanDecision::scan(ScanReason::New);
            }
            return ScanDecision::scan(ScanReason::Retry);
        }
        Some(ScanStatus::Running) | Some(ScanStatus::Failed) => {
            return ScanDecision::scan(ScanReason::Retry);
        }
        None if !document.scan_complete => {
            let reason = if document.last_scanned_at.is_none() {
                ScanReason::New
            } else {
                ScanReason::Incomplete
            };
            return ScanDecision::scan(reason);
        }
        None if document.needs_rescan => {
            return ScanDecision::scan(ScanReason::Changed);
        }
        None | Some(ScanStatus::Completed) => {}
    }

    match document.last_scanned_at {
        None => ScanDecision::scan(ScanReason::New),
        Some(scanned_at) if document.last_modified > scanned_at => {
            ScanDecision::scan(ScanReason::Changed)
        }
        Some(_) => ScanDecision::skip(ScanReason::Unchanged),
    }
}

/// A document selected for scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCandidate {
    pub document: Document,
    /// Name of the discovery file the document lives in
    pub source_file: String,
    pub reason: ScanReason,
}

/// Counts reported for a detection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeStats {
    pub new: u64,
    pub changed: u64,
    pub unchanged: u64,
    pub retry: u64,
    pub forced: u64,
    pub to_scan: u64,
    pub skipped: u64,
}

impl ChangeStats {
    fn record(&mut self, decision: &ScanDecision) {
        match decision.reason {
            ScanReason::New | ScanReason::Incomplete => self.new += 1,
            ScanReason::Changed => self.changed += 1,
            ScanReason::Retry => self.retry += 1,
            ScanReason::Force => self.forced += 1,
            ScanReason::Unchanged => self.unchanged += 1,
            ScanReason::Deleted => {}
        }
        if decision.needs_scan {
            self.to_scan += 1;
        } else {
            self.skipped += 1;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub candidates: Vec<ScanCandidate>,
    pub stats: ChangeStats,
}

/// Computes the scan set across all discovery files
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector {
    force_rescan: bool,
}

impl ChangeDetector {
    pub fn new(force_rescan: bool) -> Self {
        Self { force_rescan }
    }

    /// Evaluate every document, flagging changed ones with `needsRescan`
    ///
    /// Candidates keep discovery-file order so batches follow the tree.
    pub fn evaluate(&self, files: &mut [DiscoveryFile]) -> ChangeSet {
        let mut set = ChangeSet::default();

        for file in files.iter_mut() {
            for document in file.documents.iter_mut() {
                let decision = decide(document, self.force_rescan);
                set.stats.record(&decision);

                if decision.reason == ScanReason::Changed {
                    document.needs_rescan = true;
                }

                if decision.needs_scan {
                    set.candidates.push(ScanCandidate {
                        document: document.clone(),
                        source_file: file.name.clone(),
                        reason: decision.reason,
                    });
                }
            }
        }

        set
    }
}
