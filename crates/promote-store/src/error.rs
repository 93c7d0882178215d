//! Error types for promote-store

use thiserror::Error;

use crate::traits::{ArtifactKey, RunId};

/// Errors that can occur in the artifact persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// No artifact under this key in this run
    #[error("artifact not found: {key} (run {run_id})")]
    NotFound { run_id: RunId, key: ArtifactKey },

    /// A key was written twice with different content
    #[error("artifact {key} already written in run {run_id} with digest {existing}")]
    Immutable {
        run_id: RunId,
        key: ArtifactKey,
        existing: String,
    },

    /// Key segment is empty or not a plain path component
    #[error("invalid artifact key: {0}")]
    InvalidKey(String),

    /// Digest string is not 64 hex characters
    #[error("invalid digest hex: {0}")]
    InvalidDigest(String),

    /// Stored bytes no longer hash to the recorded digest
    #[error("corrupt blob: expected {expected}, got {actual}")]
    Corrupt { expected: String, actual: String },

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for artifact store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;
