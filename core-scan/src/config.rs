//! # Scan Pipeline Configuration
//!
//! Tuning knobs for discovery, scanning and uploading. Every value has a
//! default that matches production behavior; tests shorten the delays.
//!
//! ```rust,ignore
//! use core_scan::ScanConfig;
//! use std::time::Duration;
//!
//! let config = ScanConfig::default()
//!     .with_scan_batch_size(25)
//!     .with_inter_batch_delay(Duration::ZERO)
//!     .with_internal_domains(vec!["cdn.acme.com".to_string()]);
//! config.validate()?;
//! ```

use crate::{Result, ScanError};
use bridge_traits::http::RetryPolicy;
use std::time::Duration;

/// Scan pipeline configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Documents handed to a worker per `requestBatch`
    pub scan_batch_size: usize,

    /// Media items per upload batch
    pub upload_batch_size: usize,

    /// Stagger between upload batch starts
    pub inter_batch_delay: Duration,

    /// Backoff for batch uploads and completion steps
    pub retry_policy: RetryPolicy,

    /// Worker must acknowledge `init` within this window
    pub worker_init_timeout: Duration,

    /// Number of scan workers
    pub worker_pool_size: usize,

    /// Sessions whose heartbeat is older than this are stale
    pub stale_session_threshold: Duration,

    /// Audit log keeps at most this many entries
    pub audit_log_max_entries: usize,

    /// Hostnames treated as internal when classifying media
    pub internal_domains: Vec<String>,

    /// Hidden folder holding all metadata blobs
    pub metadata_folder: String,

    /// Extension of content documents (without dot)
    pub document_extension: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_batch_size: 10,
            upload_batch_size: 50,
            inter_batch_delay: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
            worker_init_timeout: Duration::from_secs(10),
            worker_pool_size: 1,
            stale_session_threshold: Duration::from_secs(5 * 60),
            audit_log_max_entries: 100,
            internal_domains: Vec::new(),
            metadata_folder: ".media-index".to_string(),
            document_extension: "html".to_string(),
        }
    }
}

impl ScanConfig {
    pub fn with_scan_batch_size(mut self, size: usize) -> Self {
        self.scan_batch_size = size;
        self
    }

    pub fn with_upload_batch_size(mut self, size: usize) -> Self {
        self.upload_batch_size = size;
        self
    }

    pub fn with_inter_batch_delay(mut self, delay: Duration) -> Self {
        self.inter_batch_delay = delay;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_worker_init_timeout(mut self, timeout: Duration) -> Self {
        self.worker_init_timeout = timeout;
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn with_stale_session_threshold(mut self, threshold: Duration) -> Self {
        self.stale_session_threshold = threshold;
        self
    }

    pub fn with_audit_log_max_entries(mut self, max: usize) -> Self {
        self.audit_log_max_entries = max;
        self
    }

    pub fn with_internal_domains(mut self, domains: Vec<String>) -> Self {
        self.internal_domains = domains;
        self
    }

    pub fn with_metadata_folder(mut self, folder: impl Into<String>) -> Self {
        self.metadata_folder = folder.into();
        self
    }

    pub fn with_document_extension(mut self, ext: impl Into<String>) -> Self {
        self.document_extension = ext.into();
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.scan_batch_size == 0 {
            return Err(ScanError::Config(
                "Scan batch size must be greater than 0".to_string(),
            ));
        }

        if self.upload_batch_size == 0 {
            return Err(ScanError::Config(
                "Upload batch size must be greater than 0".to_string(),
            ));
        }

        if self.worker_pool_size == 0 {
            return Err(ScanError::Config(
                "Worker pool size must be greater than 0".to_string(),
            ));
        }

        if self.worker_init_timeout.is_zero() {
            return Err(ScanError::Config(
                "Worker init timeout must be greater than 0".to_string(),
            ));
        }

        if self.stale_session_threshold.is_zero() {
            return Err(ScanError::Config(
                "Stale session threshold must be greater than 0".to_string(),
            ));
        }

        if self.audit_log_max_entries == 0 {
            return Err(ScanError::Config(
                "Audit log must keep at least one entry".to_string(),
            ));
        }

        if !self.metadata_folder.starts_with('.') || self.metadata_folder.contains('/') {
            return Err(ScanError::Config(format!(
                "Metadata folder must be a single hidden segment, got '{}'",
                self.metadata_folder
            )));
        }

        if self.document_extension.is_empty() || self.document_extension.starts_with('.') {
            return Err(ScanError::Config(
                "Document extension must be non-empty and given without a dot".to_string(),
            ));
        }

        Ok(())
    }
}
