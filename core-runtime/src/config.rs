//! # Core Configuration Module
//!
//! Provides configuration management for the media index pipeline.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds all host capabilities and context the pipeline needs.
//! It enforces fail-fast validation so a scan never starts against a missing
//! store or an empty organization/repository context.
//!
//! ## Required Dependencies
//!
//! - Content context (`org`, `repo`) - Locates the content tree
//! - `RemoteStore` - Content tree and metadata blobs
//! - `LocalCache` - Per-page scan status, sessions, upload batches
//!
//! ## Optional Dependencies (with defaults)
//!
//! - `Clock` - Defaults to `SystemClock`
//! - Identity - Defaults to an anonymous user with a generated browser id
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use bridge_desktop::{MemoryRemoteStore, SqliteLocalCache};
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .content_context("acme", "website")
//!     .remote_store(Arc::new(MemoryRemoteStore::new()))
//!     .local_cache(Arc::new(SqliteLocalCache::in_memory().await?))
//!     .identity("editor-1", "browser-7")
//!     .build()?;
//!
//! assert_eq!(config.context.root_path(), "/acme/website");
//! ```
//!
//! ## Error Handling
//!
//! The builder reports which capability is missing:
//!
//! ```
//! use core_runtime::config::CoreConfig;
//! use core_runtime::Error;
//!
//! let result = CoreConfig::builder().content_context("acme", "website").build();
//! assert!(matches!(result, Err(Error::CapabilityMissing { .. })));
//! ```

use crate::error::{Error, Result};
use bridge_traits::{Clock, LocalCache, RemoteStore, SystemClock};
use std::fmt;
use std::sync::Arc;

/// Organization/repository pair that locates one content tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentContext {
    pub org: String,
    pub repo: String,
}

impl ContentContext {
    pub fn new(org: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            repo: repo.into(),
        }
    }

    /// Remote path of the content tree root, e.g. `/acme/website`.
    pub fn root_path(&self) -> String {
        format!("/{}/{}", self.org, self.repo)
    }

    fn validate(&self) -> Result<()> {
        if self.org.trim().is_empty() {
            return Err(Error::Config("Organization cannot be empty".to_string()));
        }
        if self.repo.trim().is_empty() {
            return Err(Error::Config("Repository cannot be empty".to_string()));
        }
        if self.org.contains('/') || self.repo.contains('/') {
            return Err(Error::Config(format!(
                "Organization and repository must be single path segments: {}/{}",
                self.org, self.repo
            )));
        }
        Ok(())
    }
}

/// Who is running the scan. Recorded on sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub browser_id: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, browser_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            browser_id: browser_id.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            user_id: "anonymous".to_string(),
            browser_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::anonymous()
    }
}

/// Core configuration for the media index pipeline.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Content tree location
    pub context: ContentContext,

    /// Remote content and metadata store (required)
    pub remote_store: Arc<dyn RemoteStore>,

    /// Local embedded cache (required)
    pub local_cache: Arc<dyn LocalCache>,

    /// Time source for heartbeats, checkpoints and audit entries
    pub clock: Arc<dyn Clock>,

    /// Identity recorded on sessions
    pub identity: Identity,
}

impl fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreConfig")
            .field("context", &self.context)
            .field("remote_store", &"RemoteStore { ... }")
            .field("local_cache", &"LocalCache { ... }")
            .field("clock", &"Clock { ... }")
            .field("identity", &self.identity)
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        self.context.validate()?;

        if self.identity.user_id.trim().is_empty() {
            return Err(Error::Config("User id cannot be empty".to_string()));
        }

        Ok(())
    }
}

fn context_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "ContentContext".to_string(),
        message: "Organization and repository are required to locate the content tree. \
                 Call content_context(org, repo) with the values supplied by the host."
            .to_string(),
    }
}

fn remote_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "RemoteStore".to_string(),
        message: "RemoteStore implementation is required for content listing and metadata blobs. \
                 Desktop: use HttpRemoteStore over ReqwestHttpClient. \
                 Offline runs and tests: use MemoryRemoteStore."
            .to_string(),
    }
}

fn local_cache_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "LocalCache".to_string(),
        message: "LocalCache implementation is required for per-page scan status and sessions. \
                 Desktop: use SqliteLocalCache."
            .to_string(),
    }
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    context: Option<ContentContext>,
    remote_store: Option<Arc<dyn RemoteStore>>,
    local_cache: Option<Arc<dyn LocalCache>>,
    clock: Option<Arc<dyn Clock>>,
    identity: Option<Identity>,
}

impl CoreConfigBuilder {
    /// Sets the organization and repository of the content tree.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder().content_context("acme", "website");
    /// ```
    pub fn content_context(mut self, org: impl Into<String>, repo: impl Into<String>) -> Self {
        self.context = Some(ContentContext::new(org, repo));
        self
    }

    /// Sets the remote store implementation (required).
    pub fn remote_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.remote_store = Some(store);
        self
    }

    /// Sets the local cache implementation (required).
    pub fn local_cache(mut self, cache: Arc<dyn LocalCache>) -> Self {
        self.local_cache = Some(cache);
        self
    }

    /// Sets the clock. Tests inject a `ManualClock` here.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the user and browser identity recorded on sessions.
    pub fn identity(mut self, user_id: impl Into<String>, browser_id: impl Into<String>) -> Self {
        self.identity = Some(Identity::new(user_id, browser_id));
        self
    }

    /// Builds the `CoreConfig`, validating all required dependencies.
    ///
    /// # Errors
    ///
    /// Returns `Error::CapabilityMissing` when the content context, remote
    /// store or local cache were not provided, and `Error::Config` when the
    /// provided values are invalid.
    pub fn build(self) -> Result<CoreConfig> {
        let context = self.context.ok_or_else(context_missing_error)?;
        let remote_store = self.remote_store.ok_or_else(remote_store_missing_error)?;
        let local_cache = self.local_cache.ok_or_else(local_cache_missing_error)?;

        let config = CoreConfig {
            context,
            remote_store,
            local_cache,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            identity: self.identity.unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }
}
