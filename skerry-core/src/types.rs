//! Directory data model
//!
//! Records exchanged with the metaserver. Field names follow the wire
//! format (camelCase JSON). Byte-valued fields (wrapped keys, hashes,
//! signatures) are carried as padded URL-safe base64 strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored file (or folder) in a renter's virtual namespace.
///
/// The AES key and IV are RSA-OAEP wrapped under the owner's public key;
/// every access-list entry carries the same key wrapped under that
/// party's key instead. Folder records have no versions and empty keys.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub is_dir: bool,
    pub access_list: Vec<Permission>,
    pub aes_key: String,
    pub aes_iv: String,
    pub versions: Vec<Version>,
}

impl File {
    /// The latest version, if any.
    pub fn latest_version(&self) -> Option<&Version> {
        self.versions.last()
    }

    /// Look up a version by number.
    pub fn find_version(&self, num: u32) -> Option<&Version> {
        self.versions.iter().find(|v| v.num == num)
    }
}

/// A grant of read access to one non-owner renter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub renter_id: String,
    pub aes_key: String,
    pub aes_iv: String,
}

/// One immutable upload of a file's content.
///
/// Blocks are kept in coding order: `num_data_blocks` data shards first,
/// then `num_parity_blocks` parity shards, all of equal size. The last
/// data shard carries `padding_bytes` of zero fill at its tail.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub num: u32,
    /// Plaintext size of the uploaded file in bytes.
    pub size: u64,
    pub upload_time: Option<DateTime<Utc>>,
    pub num_data_blocks: usize,
    pub num_parity_blocks: usize,
    pub padding_bytes: u64,
    pub blocks: Vec<Block>,
}

/// One erasure-coded shard placed with a provider.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: String,
    pub location: BlockLocation,
    /// Bytes on the wire.
    pub size: u64,
    /// Padded URL-safe base64 of the SHA-256 over the on-wire bytes.
    pub sha256_hash: String,
}

/// Where a block lives.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BlockLocation {
    pub provider_id: String,
    pub addr: String,
}

/// A renter-provider storage agreement.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub id: String,
    pub renter_id: String,
    pub provider_id: String,
    /// Total bytes reserved under this contract.
    pub storage_space: u64,
    pub renter_signature: String,
    pub provider_signature: String,
}

/// Directory record for a storage provider.
///
/// The id is the lowercase-hex SHA-256 fingerprint of the PEM-encoded
/// public key.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub id: String,
    pub public_key: String,
    pub addr: String,
    pub space_avail: u64,
}

/// Directory record for a renter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RenterInfo {
    pub id: String,
    pub alias: String,
    pub public_key: String,
}
