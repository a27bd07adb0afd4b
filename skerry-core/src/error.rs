//! Error types for Skerry
//!
//! Provides a unified error type for all renter-side operations.

use thiserror::Error;

/// Result type alias for Skerry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for Skerry
#[derive(Error, Debug)]
pub enum Error {
    // ===== Network and authorization =====
    #[error("network error: {0}")]
    Network(String),

    #[error("authorization failed: {0}")]
    Auth(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    // ===== Directory lookups =====
    #[error("not found: {0}")]
    NotFound(String),

    #[error("not permitted: {0}")]
    NotPermitted(String),

    // ===== Storage placement =====
    #[error("insufficient storage: cannot find {blobs} blobs of {blob_size} bytes")]
    InsufficientStorage { blobs: usize, blob_size: u64 },

    // ===== Block retrieval =====
    #[error("insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("corrupt block {block_id}: {reason}")]
    CorruptBlock { block_id: String, reason: String },

    #[error("failed to download {name}: {source}")]
    ChildDownload {
        name: String,
        #[source]
        source: Box<Error>,
    },

    // ===== Coding and crypto =====
    #[error("codec error: {0}")]
    Codec(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    // ===== Local environment =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<reed_solomon_erasure::Error> for Error {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
