//! Skerry Core Library
//!
//! Shared building blocks for the Skerry storage network client.
//! This crate provides:
//! - RSA key wrapping and signatures, streaming AES-CFB, SHA-256 hashing
//! - Streaming Reed-Solomon erasure coding over (k data + m parity) shards
//! - The directory data model (files, versions, blocks, contracts)
//! - Common error handling

pub mod crypto;
pub mod erasure;
pub mod error;
pub mod types;

pub use erasure::{ErasureCoder, ErasureConfig};
pub use error::{Error, Result};
pub use types::{
    Block, BlockLocation, Contract, File, Permission, ProviderInfo, RenterInfo, Version,
};

/// Default erasure coding configuration
/// - 8 data blocks: minimum required to reconstruct
/// - 4 parity blocks: can tolerate 4 unreachable providers
pub const DEFAULT_DATA_BLOCKS: usize = 8;
pub const DEFAULT_PARITY_BLOCKS: usize = 4;

/// Chunk size used by the streaming codec and hash helpers.
/// Transforms never buffer more than one chunk per shard.
pub const STREAM_CHUNK: usize = 64 * 1024;
