use bridge_traits::error::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Scan lock held by session {holder}")]
    LockConflict { holder: String },

    #[error("Scan worker initialization timeout after {0} seconds")]
    WorkerInitTimeout(u64),

    #[error("Failed to scan page {page}: {message}")]
    PageScanFailure { page: String, message: String },

    #[error("Upload batch {batch_number} failed after {attempts} attempts: {message}")]
    BatchUploadFailure {
        batch_number: u64,
        attempts: u32,
        message: String,
    },

    #[error("Malformed record at {path}: {message}")]
    MalformedRecord { path: String, message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] BridgeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Scan cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Invalid session ID: {0}")]
    InvalidSessionId(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<core_runtime::Error> for ScanError {
    fn from(err: core_runtime::Error) -> Self {
        ScanError::Config(err.to_string())
    }
}

impl ScanError {
    /// Failures that end the scan attempt instead of being absorbed into status fields
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScanError::WorkerInitTimeout(_) | ScanError::Config(_) | ScanError::Internal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
