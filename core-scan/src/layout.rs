//! Remote paths of every metadata blob for one content tree.

use core_runtime::config::ContentContext;

/// Discovery file name used for documents sitting directly under the root
pub const ROOT_DISCOVERY_NAME: &str = "root";

/// Checkpoint kinds, one blob each
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    Discovery,
    Scanning,
    Upload,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::Discovery => "discovery",
            CheckpointKind::Scanning => "scanning",
            CheckpointKind::Upload => "upload",
        }
    }
}

/// Path builder rooted at `/{org}/{repo}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: String,
    metadata_folder: String,
}

impl StorageLayout {
    pub fn new(context: &ContentContext, metadata_folder: &str) -> Self {
        Self {
            root: context.root_path(),
            metadata_folder: metadata_folder.to_string(),
        }
    }

    /// Content tree root, e.g. `/acme/website`
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn metadata_root(&self) -> String {
        format!("{}/{}", self.root, self.metadata_folder)
    }

    pub fn discovery_dir(&self) -> String {
        format!("{}/discovery", self.metadata_root())
    }

    pub fn discovery_file(&self, folder: &str) -> String {
        format!("{}/{}.json", self.discovery_dir(), folder)
    }

    pub fn checkpoint(&self, kind: CheckpointKind) -> String {
        format!("{}/checkpoints/{}.json", self.metadata_root(), kind.as_str())
    }

    pub fn site_structure(&self) -> String {
        format!("{}/site-structure.json", self.metadata_root())
    }

    pub fn audit_log(&self) -> String {
        format!("{}/audit-log.json", self.metadata_root())
    }

    pub fn sessions_dir(&self) -> String {
        format!("{}/sessions", self.metadata_root())
    }

    pub fn session(&self, session_id: &str) -> String {
        format!("{}/{}.json", self.sessions_dir(), session_id)
    }

    pub fn media_index(&self) -> String {
        format!("{}/media.json", self.metadata_root())
    }

    /// Top-level folder a document belongs to, or [`ROOT_DISCOVERY_NAME`]
    ///
    /// `/acme/website/blog/2024/a.html` belongs to `blog`.
    pub fn folder_of(&self, document_path: &str) -> String {
        let relative = document_path
            .strip_prefix(&self.root)
            .unwrap_or(document_path)
            .trim_start_matches('/');

        match relative.split_once('/') {
            Some((folder, _)) => folder.to_string(),
            None => ROOT_DISCOVERY_NAME.to_string(),
        }
    }

    /// Path relative to the content root, without the leading slash
    pub fn relative<'a>(&self, document_path: &'a str) -> &'a str {
        document_path
            .strip_prefix(&self.root)
            .unwrap_or(document_path)
            .trim_start_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> StorageLayout {
        StorageLayout::new(&ContentContext::new("acme", "website"), ".media-index")
    }

    #[test]
    fn test_metadata_paths() {
        let layout = layout();

        assert_eq!(layout.root(), "/acme/website");
        assert_eq!(
            layout.discovery_file("blog"),
            "/acme/website/.media-index/discovery/blog.json"
        );
        assert_eq!(
            layout.checkpoint(CheckpointKind::Scanning),
            "/acme/website/.media-index/checkpoints/scanning.json"
        );
        assert_eq!(
            layout.session("abc"),
            "/acme/website/.media-index/sessions/abc.json"
        );
        assert_eq!(layout.media_index(), "/acme/website/.media-index/media.json");
    }

    #[test]
    fn test_folder_of() {
        let layout = layout();

        assert_eq!(layout.folder_of("/acme/website/blog/2024/a.html"), "blog");
        assert_eq!(layout.folder_of("/acme/website/index.html"), ROOT_DISCOVERY_NAME);
        assert_eq!(layout.relative("/acme/website/blog/a.html"), "blog/a.html");
    }
}
