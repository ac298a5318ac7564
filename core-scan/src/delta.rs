//! # Delta Processor
//!
//! Diffs the baseline snapshot (file nodes of the last persisted site
//! structure) against a fresh crawl. Each top-level folder is compared by a
//! sha256 hash of its sorted `(path, lastModified)` listing first, so
//! untouched folders cost one hash and no per-document comparison.

use crate::layout::StorageLayout;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// `path → lastModified` of every document in one folder
pub type FolderListing = BTreeMap<String, i64>;

/// Hash of a folder listing; equal listings hash equally regardless of order
pub fn compute_listing_hash(listing: &FolderListing) -> String {
    let mut hasher = Sha256::new();
    // BTreeMap iterates in key order
    for (path, last_modified) in listing {
        hasher.update(path.as_bytes());
        hasher.update(b":");
        hasher.update(last_modified.to_string().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Changes of one folder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl FolderDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaResult {
    /// Only folders with at least one change
    pub folders: BTreeMap<String, FolderDelta>,
    pub unchanged_folders: BTreeSet<String>,
}

impl DeltaResult {
    pub fn has_changes(&self) -> bool {
        !self.folders.is_empty()
    }

    pub fn added_count(&self) -> usize {
        self.folders.values().map(|d| d.added.len()).sum()
    }

    pub fn removed_count(&self) -> usize {
        self.folders.values().map(|d| d.removed.len()).sum()
    }

    pub fn modified_count(&self) -> usize {
        self.folders.values().map(|d| d.modified.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct DeltaProcessor {
    layout: StorageLayout,
}

impl DeltaProcessor {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Group a flat `path → lastModified` snapshot by top-level folder
    pub fn group_by_folder(&self, snapshot: &BTreeMap<String, i64>) -> BTreeMap<String, FolderListing> {
        let mut grouped: BTreeMap<String, FolderListing> = BTreeMap::new();
        for (path, last_modified) in snapshot {
            grouped
                .entry(self.layout.folder_of(path))
                .or_default()
                .insert(path.clone(), *last_modified);
        }
        grouped
    }

    /// Diff `baseline` against `current`, both grouped by folder
    pub fn diff(
        &self,
        baseline: &BTreeMap<String, FolderListing>,
        current: &BTreeMap<String, FolderListing>,
    ) -> DeltaResult {
        let empty = FolderListing::new();
        let folders: BTreeSet<&String> = baseline.keys().chain(current.keys()).collect();
        let mut result = DeltaResult::default();

        for folder in folders {
            let before = baseline.get(folder).unwrap_or(&empty);
            let after = current.get(folder).unwrap_or(&empty);

            if compute_listing_hash(before) == compute_listing_hash(after) {
                result.unchanged_folders.insert(folder.clone());
                continue;
            }

            let mut delta = FolderDelta::default();
            for (path, modified) in after {
                match before.get(path) {
                    None => delta.added.push(path.clone()),
                    Some(previous) if previous != modified => delta.modified.push(path.clone()),
                    Some(_) => {}
                }
            }
            delta.removed = before
                .keys()
                .filter(|path| !after.contains_key(*path))
                .cloned()
                .collect();

            if delta.is_empty() {
                result.unchanged_folders.insert(folder.clone());
            } else {
                result.folders.insert(folder.clone(), delta);
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_runtime::config::ContentContext;

    fn processor() -> DeltaProcessor {
        DeltaProcessor::new(StorageLayout::new(
            &ContentContext::new("acme", "website"),
            ".media-index",
        ))
    }

    fn snapshot(entries: &[(&str, i64)]) -> BTreeMap<String, i64> {
        entries.iter().map(|(p, t)| (p.to_string(), *t)).collect()
    }

    #[test]
    fn test_listing_hash_is_order_independent() {
        let a: FolderListing = snapshot(&[("/x/a.html", 1), ("/x/b.html", 2)]);
        let mut b = FolderListing::new();
        b.insert("/x/b.html".to_string(), 2);
        b.insert("/x/a.html".to_string(), 1);

        assert_eq!(compute_listing_hash(&a), compute_listing_hash(&b));

        b.insert("/x/b.html".to_string(), 3);
        assert_ne!(compute_listing_hash(&a), compute_listing_hash(&b));
    }

    #[test]
    fn test_diff_reports_only_changed_folders() {
        let p = processor();
        let baseline = p.group_by_folder(&snapshot(&[
            ("/acme/website/blog/a.html", 1),
            ("/acme/website/blog/b.html", 1),
            ("/acme/website/docs/c.html", 1),
            ("/acme/website/index.html", 1),
        ]));
        let current = p.group_by_folder(&snapshot(&[
            ("/acme/website/blog/a.html", 5),
            ("/acme/website/blog/new.html", 5),
            ("/acme/website/docs/c.html", 1),
            ("/acme/website/index.html", 1),
        ]));

        let delta = p.diff(&baseline, &current);

        assert_eq!(delta.folders.len(), 1);
        let blog = &delta.folders["blog"];
        assert_eq!(blog.added, vec!["/acme/website/blog/new.html"]);
        assert_eq!(blog.modified, vec!["/acme/website/blog/a.html"]);
        assert_eq!(blog.removed, vec!["/acme/website/blog/b.html"]);
        assert!(delta.unchanged_folders.contains("docs"));
        assert!(delta.unchanged_folders.contains("root"));
    }

    #[test]
    fn test_new_and_vanished_folders() {
        let p = processor();
        let baseline = p.group_by_folder(&snapshot(&[("/acme/website/old/a.html", 1)]));
        let current = p.group_by_folder(&snapshot(&[("/acme/website/fresh/b.html", 1)]));

        let delta = p.diff(&baseline, &current);

        assert_eq!(delta.folders["old"].removed.len(), 1);
        assert_eq!(delta.folders["fresh"].added.len(), 1);
        assert_eq!(delta.added_count(), 1);
        assert_eq!(delta.removed_count(), 1);
        assert_eq!(delta.modified_count(), 0);
    }

    #[test]
    fn test_identical_snapshots_have_no_changes() {
        let p = processor();
        let grouped = p.group_by_folder(&snapshot(&[("/acme/website/a.html", 1)]));
        assert!(!p.diff(&grouped, &grouped).has_changes());
    }
}
