//! Storage Abstractions
//!
//! Provides the two persistence contracts the scan pipeline depends on:
//! a remote key-path JSON blob store holding the content tree and its
//! metadata, and a local embedded key-value cache that survives restarts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// One entry returned by a remote folder listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    /// Entry name without extension
    pub name: String,
    /// File extension (lowercase, without dot); `None` for folders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
    /// Full path of the entry, including extension
    pub path: String,
    /// Source modification timestamp (Unix millis)
    #[serde(default)]
    pub last_modified: Option<i64>,
}

impl RemoteEntry {
    pub fn is_folder(&self) -> bool {
        self.ext.is_none()
    }

    /// Hidden entries (names starting with a dot) are never crawled
    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('.')
    }
}

/// Remote content and metadata store
///
/// Paths are absolute within the store (e.g. `/org/repo/blog/post.html`).
/// Implementations must absorb HTTP 429 responses with bounded backoff;
/// rate limiting is never surfaced to callers as a distinct outcome.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::RemoteStore;
///
/// async fn count_documents(store: &dyn RemoteStore) -> Result<usize> {
///     let entries = store.list("/org/repo").await?;
///     Ok(entries.iter().filter(|e| !e.is_folder()).count())
/// }
/// ```
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List the immediate children of a folder
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// Read a JSON blob
    ///
    /// # Returns
    ///
    /// Returns `Ok(None)` when the blob does not exist (404).
    async fn read_blob(&self, path: &str) -> Result<Option<Value>>;

    /// Create or overwrite a JSON blob
    async fn write_blob(&self, path: &str, value: &Value) -> Result<()>;

    /// Delete a blob; deleting a missing blob is not an error
    async fn delete(&self, path: &str) -> Result<()>;

    /// Fetch the raw source of a content document
    ///
    /// Returns `Ok(None)` when the document does not exist.
    async fn read_document(&self, path: &str) -> Result<Option<String>>;
}

/// Keyed record collections held by the local cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCollection {
    /// Deduplicated media assets keyed by media id
    Media,
    /// Per-page scan status keyed by document path
    ScanStatus,
    /// Session records keyed by session id
    Sessions,
    /// Media queued for upload, keyed by session id
    ProcessingQueue,
    /// Upload batch records keyed by batch id
    UploadBatches,
    /// Upload outcomes keyed by batch id
    UploadHistory,
}

impl CacheCollection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCollection::Media => "media",
            CacheCollection::ScanStatus => "scan_status",
            CacheCollection::Sessions => "sessions",
            CacheCollection::ProcessingQueue => "processing_queue",
            CacheCollection::UploadBatches => "upload_batches",
            CacheCollection::UploadHistory => "upload_history",
        }
    }

    pub fn all() -> [CacheCollection; 6] {
        [
            CacheCollection::Media,
            CacheCollection::ScanStatus,
            CacheCollection::Sessions,
            CacheCollection::ProcessingQueue,
            CacheCollection::UploadBatches,
            CacheCollection::UploadHistory,
        ]
    }
}

impl std::fmt::Display for CacheCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Local embedded key-value cache
///
/// The authoritative source for per-page scan status during an active run.
/// Records are JSON values; typed access is layered on top by the core.
#[async_trait]
pub trait LocalCache: Send + Sync {
    /// Retrieve one record
    async fn get(&self, collection: CacheCollection, key: &str) -> Result<Option<Value>>;

    /// Insert or replace one record
    async fn put(&self, collection: CacheCollection, key: &str, value: &Value) -> Result<()>;

    /// Retrieve every record of a collection, ordered by key
    async fn get_all(&self, collection: CacheCollection) -> Result<Vec<(String, Value)>>;

    /// Remove one record
    async fn delete(&self, collection: CacheCollection, key: &str) -> Result<()>;

    /// Remove every record of a collection
    async fn clear(&self, collection: CacheCollection) -> Result<()>;
}
