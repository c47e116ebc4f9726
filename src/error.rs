//! Error types for the versioning engine.

use crate::types::{ContentHash, StateId};
use thiserror::Error;

/// Main error type for repository, state and content store operations.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Caller is not the repository that owns this state")]
    UnauthorizedCaller,

    #[error("State already committed: {0}")]
    AlreadyCommitted(StateId),

    #[error("Commit message must not be empty")]
    EmptyCommitMessage,

    #[error("Malformed diff: {0}")]
    MalformedDiff(String),

    #[error("State not found: {0}")]
    StateNotFound(StateId),

    #[error("Unsupported scope {0:?}, expected one of any, added, modified, intact")]
    UnsupportedScope(String),

    #[error("Nothing to commit")]
    NothingToCommit,

    #[error("Blob not found: {0}")]
    BlobNotFound(ContentHash),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Hash mismatch: expected {expected}, got {got}")]
    HashMismatch {
        expected: ContentHash,
        got: ContentHash,
    },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Repository is locked by another process")]
    Locked,

    #[error("Repository not initialized")]
    NotInitialized,

    #[error("Invalid repository format: {0}")]
    InvalidFormat(String),
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for VaultError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for VaultError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        VaultError::Deserialization(e.to_string())
    }
}

/// Result type for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;
