//! # Site Structure
//!
//! Aggregated folder → subfolder → file tree with per-node media counts,
//! rebuilt wholesale from discovery records on every completion. The file
//! nodes double as the baseline snapshot for incremental discovery.

use crate::document::DiscoveryFile;
use crate::layout::StorageLayout;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub name: String,
    pub path: String,
    pub last_modified: i64,
    pub media_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderNode {
    #[serde(default)]
    pub files: Vec<FileNode>,
    #[serde(default)]
    pub subfolders: BTreeMap<String, FolderNode>,
    #[serde(default)]
    pub media_count: u64,
}

impl FolderNode {
    fn insert(&mut self, segments: &[&str], file: FileNode) {
        self.media_count += file.media_count;
        match segments {
            [] | [_] => self.files.push(file),
            [folder, rest @ ..] => self
                .subfolders
                .entry((*folder).to_string())
                .or_default()
                .insert(rest, file),
        }
    }

    fn sort(&mut self) {
        self.files.sort_by(|a, b| a.path.cmp(&b.path));
        for child in self.subfolders.values_mut() {
            child.sort();
        }
    }

    fn collect_files<'a>(&'a self, out: &mut Vec<&'a FileNode>) {
        out.extend(self.files.iter());
        for child in self.subfolders.values() {
            child.collect_files(out);
        }
    }

    pub fn file_count(&self) -> u64 {
        self.files.len() as u64
            + self
                .subfolders
                .values()
                .map(FolderNode::file_count)
                .sum::<u64>()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteStructure {
    pub root: FolderNode,
    #[serde(default)]
    pub total_documents: u64,
    #[serde(default)]
    pub total_media: u64,
    #[serde(default)]
    pub generated_at: i64,
}

impl SiteStructure {
    /// Build the tree from discovery records; deleted documents are left out
    pub fn build(files: &[DiscoveryFile], layout: &StorageLayout, generated_at: i64) -> Self {
        let mut root = FolderNode::default();

        for file in files {
            for document in file.active_documents() {
                let relative = layout.relative(&document.path);
                let segments: Vec<&str> = relative.split('/').filter(|s| !s.is_empty()).collect();
                let name = segments.last().copied().unwrap_or(relative).to_string();

                root.insert(
                    &segments,
                    FileNode {
                        name,
                        path: document.path.clone(),
                        last_modified: document.last_modified,
                        media_count: document.media_count,
                    },
                );
            }
        }

        root.sort();

        Self {
            total_documents: root.file_count(),
            total_media: root.media_count,
            root,
            generated_at,
        }
    }

    /// Every file node, depth-first
    pub fn files(&self) -> Vec<&FileNode> {
        let mut out = Vec::new();
        self.root.collect_files(&mut out);
        out
    }

    /// `path → lastModified` for every file, used as a delta baseline
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.files()
            .into_iter()
            .map(|f| (f.path.clone(), f.last_modified))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use core_runtime::config::ContentContext;

    fn layout() -> StorageLayout {
        StorageLayout::new(&ContentContext::new("acme", "website"), ".media-index")
    }

    fn doc(path: &str, media: u64) -> Document {
        let mut d = Document::new(path, 7);
        d.mark_scanned(media, 8);
        d
    }

    #[test]
    fn test_build_nests_folders_with_counts() {
        let files = vec![
            DiscoveryFile::new(
                "blog",
                vec![
                    doc("/acme/website/blog/a.html", 2),
                    doc("/acme/website/blog/2024/b.html", 3),
                ],
            ),
            DiscoveryFile::new("root", vec![doc("/acme/website/index.html", 1)]),
        ];

        let structure = SiteStructure::build(&files, &layout(), 99);

        assert_eq!(structure.total_documents, 3);
        assert_eq!(structure.total_media, 6);
        assert_eq!(structure.root.files.len(), 1);
        assert_eq!(structure.root.files[0].name, "index.html");

        let blog = &structure.root.subfolders["blog"];
        assert_eq!(blog.media_count, 5);
        assert_eq!(blog.subfolders["2024"].files[0].media_count, 3);
    }

    #[test]
    fn test_deleted_documents_are_excluded() {
        let mut gone = doc("/acme/website/old.html", 4);
        gone.mark_deleted();
        let files = vec![DiscoveryFile::new("root", vec![gone, doc("/acme/website/new.html", 1)])];

        let structure = SiteStructure::build(&files, &layout(), 0);

        assert_eq!(structure.total_documents, 1);
        assert_eq!(structure.total_media, 1);
        assert!(!structure.snapshot().contains_key("/acme/website/old.html"));
    }

    #[test]
    fn test_build_is_deterministic_and_serializes_camel_case() {
        let files = vec![DiscoveryFile::new(
            "docs",
            vec![doc("/acme/website/docs/z.html", 0), doc("/acme/website/docs/a.html", 0)],
        )];

        let first = SiteStructure::build(&files, &layout(), 1);
        let second = SiteStructure::build(&files, &layout(), 1);
        assert_eq!(first, second);

        let value = serde_json::to_value(&first).unwrap();
        assert_eq!(value["root"]["subfolders"]["docs"]["files"][0]["path"], "/acme/website/docs/a.html");
        assert_eq!(value["totalDocuments"], 2);
    }
}
