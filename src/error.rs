//! Error types for the synchronization engine.

use std::time::Duration;
use thiserror::Error;

/// Main error type for tier, queue and backend operations.
///
/// The coordinator absorbs every variant; adapters and backends surface them
/// so callers composing their own pipelines can react.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Snapshot has no session id")]
    MissingSessionId,

    #[error("Remote store error: {0}")]
    Remote(String),

    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cache directory is locked by another process")]
    Locked,

    #[error("Cache directory not initialized")]
    NotInitialized,
}

impl SyncError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Remote(_) | SyncError::Timeout(_) | SyncError::Io(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;
