//! In-process Remote Store
//!
//! Keeps the content tree and its metadata blobs in memory. Used for
//! offline runs, dry runs against a captured tree, and tests.

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    storage::{RemoteEntry, RemoteStore},
};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
enum Node {
    Blob(Value),
    Document { source: String, last_modified: i64 },
}

/// Memory-backed [`RemoteStore`]
///
/// Folders are implicit: any path prefix of a stored entry lists as a folder.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    nodes: RwLock<BTreeMap<String, Node>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a content document
    pub async fn put_document(&self, path: &str, source: &str, last_modified: i64) {
        self.nodes.write().await.insert(
            normalize(path),
            Node::Document {
                source: source.to_string(),
                last_modified,
            },
        );
    }

    /// Remove any entry at `path`
    pub async fn remove(&self, path: &str) {
        self.nodes.write().await.remove(&normalize(path));
    }

    /// Paths of every stored blob under `prefix`, sorted
    pub async fn blob_paths(&self, prefix: &str) -> Vec<String> {
        let prefix = normalize(prefix);
        self.nodes
            .read()
            .await
            .iter()
            .filter(|(path, node)| path.starts_with(&prefix) && matches!(node, Node::Blob(_)))
            .map(|(path, _)| path.clone())
            .collect()
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn split_name(file_name: &str) -> (String, Option<String>) {
    match file_name.rsplit_once('.') {
        Some((name, ext)) if !name.is_empty() => (name.to_string(), Some(ext.to_lowercase())),
        _ => (file_name.to_string(), Some(String::new())),
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let prefix = format!("{}/", normalize(path));
        let nodes = self.nodes.read().await;
        let mut children: BTreeMap<String, RemoteEntry> = BTreeMap::new();

        for (key, node) in nodes.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };

            match rest.split_once('/') {
                Some((folder, _)) => {
                    let child_path = format!("{}{}", prefix, folder);
                    children.entry(child_path.clone()).or_insert(RemoteEntry {
                        name: folder.to_string(),
                        ext: None,
                        path: child_path,
                        last_modified: None,
                    });
                }
                None => {
                    let (name, ext) = split_name(rest);
                    let last_modified = match node {
                        Node::Document { last_modified, .. } => Some(*last_modified),
                        Node::Blob(_) => None,
                    };
                    children.insert(
                        key.clone(),
                        RemoteEntry {
                            name,
                            ext,
                            path: key.clone(),
                            last_modified,
                        },
                    );
                }
            }
        }

        Ok(children.into_values().collect())
    }

    async fn read_blob(&self, path: &str) -> Result<Option<Value>> {
        Ok(match self.nodes.read().await.get(&normalize(path)) {
            Some(Node::Blob(value)) => Some(value.clone()),
            Some(Node::Document { source, .. }) => Some(Value::String(source.clone())),
            None => None,
        })
    }

    async fn write_blob(&self, path: &str, value: &Value) -> Result<()> {
        self.nodes
            .write()
            .await
            .insert(normalize(path), Node::Blob(value.clone()));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.nodes.write().await.remove(&normalize(path));
        Ok(())
    }

    async fn read_document(&self, path: &str) -> Result<Option<String>> {
        Ok(match self.nodes.read().await.get(&normalize(path)) {
            Some(Node::Document { source, .. }) => Some(source.clone()),
            Some(Node::Blob(value)) => Some(value.to_string()),
            None => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_list_synthesizes_folders() {
        let store = MemoryRemoteStore::new();
        store.put_document("/org/repo/index.html", "<p/>", 10).await;
        store.put_document("/org/repo/blog/a.html", "<p/>", 11).await;
        store.put_document("/org/repo/blog/2024/b.html", "<p/>", 12).await;

        let root = store.list("/org/repo").await.unwrap();
        assert_eq!(root.len(), 2);
        assert_eq!(root[0].name, "blog");
        assert!(root[0].is_folder());
        assert_eq!(root[1].ext.as_deref(), Some("html"));
        assert_eq!(root[1].last_modified, Some(10));

        let blog = store.list("/org/repo/blog/").await.unwrap();
        assert_eq!(blog.len(), 2);
    }

    #[tokio::test]
    async fn test_list_does_not_match_sibling_prefixes() {
        let store = MemoryRemoteStore::new();
        store.put_document("/org/repo/blog/a.html", "", 1).await;
        store.put_document("/org/repo/blogroll/b.html", "", 1).await;

        let blog = store.list("/org/repo/blog").await.unwrap();
        assert_eq!(blog.len(), 1);
        assert_eq!(blog[0].path, "/org/repo/blog/a.html");
    }

    #[tokio::test]
    async fn test_blob_round_trip_and_delete() {
        let store = MemoryRemoteStore::new();
        store.write_blob("org/repo/x.json", &json!({"a": 1})).await.unwrap();

        assert_eq!(
            store.read_blob("/org/repo/x.json").await.unwrap(),
            Some(json!({"a": 1}))
        );
        assert_eq!(store.blob_paths("/org/repo").await, vec!["/org/repo/x.json"]);

        store.delete("/org/repo/x.json").await.unwrap();
        assert!(store.read_blob("/org/repo/x.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_document() {
        let store = MemoryRemoteStore::new();
        store.put_document("/org/repo/a.html", "<img src=\"a.png\">", 1).await;

        assert_eq!(
            store.read_document("/org/repo/a.html").await.unwrap().as_deref(),
            Some("<img src=\"a.png\">")
        );
        assert!(store.read_document("/org/repo/missing.html").await.unwrap().is_none());
    }
}
