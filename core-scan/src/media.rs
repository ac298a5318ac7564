//! # Media Assets
//!
//! Deduplicated media references. An asset's id is the sha256 of its `src`,
//! so the same URL found on many pages (or across rescans) always lands on
//! one [`MediaAsset`] whose `usedIn` lists every referencing page once.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "svg", "avif", "bmp", "ico", "tif", "tiff",
];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "m4v", "ogv", "avi", "mkv"];
const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "csv", "txt", "zip",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Document,
}

impl MediaType {
    /// Classify by file extension, ignoring query string and fragment
    pub fn from_src(src: &str) -> Option<Self> {
        let ext = extension_of(src)?;
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaType::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaType::Video)
        } else if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaType::Document)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Document => "document",
        }
    }
}

fn strip_query(src: &str) -> &str {
    let end = src.find(['?', '#']).unwrap_or(src.len());
    &src[..end]
}

fn extension_of(src: &str) -> Option<String> {
    let file = file_name_of(src);
    file.rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty())
}

fn file_name_of(src: &str) -> &str {
    let path = strip_query(src);
    path.rsplit('/').next().unwrap_or(path)
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stable asset id derived from the source URL
pub fn media_id(src: &str) -> String {
    sha256_hex(src)
}

/// Id of the `index`-th reference to `src` on `page`
pub fn occurrence_id(page: &str, src: &str, index: usize) -> String {
    sha256_hex(&format!("{}|{}|{}", page, src, index))
}

/// One reference to an asset on one page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Occurrence {
    pub id: String,
    pub page: String,
    pub has_alt_text: bool,
    pub has_title: bool,
    #[serde(default)]
    pub context: String,
}

/// A deduplicated media reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAsset {
    pub id: String,
    pub src: String,
    pub name: String,
    #[serde(default)]
    pub alt: Option<String>,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    pub is_external: bool,
    #[serde(default)]
    pub used_in: Vec<String>,
    #[serde(default)]
    pub occurrences: Vec<Occurrence>,
}

impl MediaAsset {
    pub fn new(src: impl Into<String>, media_type: MediaType, is_external: bool) -> Self {
        let src = src.into();
        Self {
            id: media_id(&src),
            name: file_name_of(&src).to_string(),
            src,
            alt: None,
            media_type,
            is_external,
            used_in: Vec::new(),
            occurrences: Vec::new(),
        }
    }

    /// Record a reference from `page`, keeping `usedIn` duplicate-free
    pub fn add_occurrence(&mut self, occurrence: Occurrence) {
        if !self.used_in.contains(&occurrence.page) {
            self.used_in.push(occurrence.page.clone());
        }
        if !self.occurrences.iter().any(|o| o.id == occurrence.id) {
            self.occurrences.push(occurrence);
        }
    }

    /// Fold another record of the same asset into this one
    pub fn merge(&mut self, other: MediaAsset) {
        if self.alt.is_none() {
            self.alt = other.alt;
        }
        for page in other.used_in {
            if !self.used_in.contains(&page) {
                self.used_in.push(page);
            }
        }
        for occurrence in other.occurrences {
            self.add_occurrence(occurrence);
        }
    }

    /// Drop every reference from `page`
    pub fn remove_page(&mut self, page: &str) {
        self.used_in.retain(|p| p != page);
        self.occurrences.retain(|o| o.page != page);
    }

    pub fn is_orphaned(&self) -> bool {
        self.used_in.is_empty()
    }
}

/// Ordered, id-keyed set of assets
///
/// Insertion order is kept so the persisted index stays stable between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaIndex {
    assets: Vec<MediaAsset>,
    positions: HashMap<String, usize>,
}

impl MediaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_assets(assets: Vec<MediaAsset>) -> Self {
        let mut index = Self::new();
        for asset in assets {
            index.upsert(asset);
        }
        index
    }

    /// Insert a new asset or merge it into the existing one with the same id
    pub fn upsert(&mut self, asset: MediaAsset) {
        match self.positions.get(&asset.id) {
            Some(&pos) => self.assets[pos].merge(asset),
            None => {
                self.positions.insert(asset.id.clone(), self.assets.len());
                self.assets.push(asset);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&MediaAsset> {
        self.positions.get(id).map(|&pos| &self.assets[pos])
    }

    /// Remove references from deleted pages; orphaned assets are dropped
    pub fn purge_pages(&mut self, pages: &[String]) -> usize {
        if pages.is_empty() {
            return 0;
        }
        for asset in &mut self.assets {
            for page in pages {
                asset.remove_page(page);
            }
        }
        let before = self.assets.len();
        let kept: Vec<MediaAsset> = std::mem::take(&mut self.assets)
            .into_iter()
            .filter(|asset| !asset.is_orphaned())
            .collect();
        *self = Self::from_assets(kept);
        before - self.assets.len()
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn assets(&self) -> &[MediaAsset] {
        &self.assets
    }

    pub fn into_assets(self) -> Vec<MediaAsset> {
        self.assets
    }
}
