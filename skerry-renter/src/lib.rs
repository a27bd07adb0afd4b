//! Skerry Renter Engine
//!
//! The client-side pipeline that turns a local file into encrypted,
//! compressed, erasure-coded blocks scattered across storage providers,
//! and recovers files from any sufficient subset of those blocks.
//!
//! The engine is wired from three seams:
//! - [`MetaClient`]: the metaserver directory (files, versions,
//!   permissions, contracts)
//! - [`skerry_provider::BlockStore`]: the provider block services
//! - [`storage::FreelistSource`]: the renter's view of free storage
//!
//! Production wiring uses the HTTP clients; tests swap in in-memory
//! fakes.

pub mod download;
mod remote;
pub mod storage;
pub mod upload;

pub use download::{BlockDownloadInfo, DownloadInfo, FileDownloadInfo};
pub use storage::{
    Clock, FreelistSource, Reservation, StorageBlob, StorageManager, SystemClock, MIN_BLOB_SIZE,
};
pub use upload::{BlockUploadInfo, UploadInfo};

use async_trait::async_trait;
use rsa::{RsaPrivateKey, RsaPublicKey};
use skerry_core::crypto::{b64_decode, b64_encode, parse_public_key, rsa_unwrap, rsa_wrap};
use skerry_core::error::{Error, Result};
use skerry_core::types::{Contract, File, Permission, ProviderInfo, RenterInfo, Version};
use skerry_core::{DEFAULT_DATA_BLOCKS, DEFAULT_PARITY_BLOCKS};
use skerry_provider::BlockStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;
use uuid::Uuid;

/// The slice of the metaserver directory the engine depends on.
#[async_trait]
pub trait MetaClient: Send + Sync {
    async fn get_file(&self, renter_id: &str, file_id: &str) -> Result<File>;
    async fn get_files(&self, renter_id: &str) -> Result<Vec<File>>;
    async fn post_file(&self, renter_id: &str, file: &File) -> Result<()>;
    async fn delete_file(&self, renter_id: &str, file_id: &str) -> Result<()>;
    async fn post_version(&self, renter_id: &str, file_id: &str, version: &Version)
        -> Result<()>;
    async fn delete_version(&self, renter_id: &str, file_id: &str, num: u32) -> Result<()>;
    async fn get_renter(&self, renter_id: &str) -> Result<RenterInfo>;
    async fn post_permission(
        &self,
        renter_id: &str,
        file_id: &str,
        permission: &Permission,
    ) -> Result<()>;
    async fn delete_permission(
        &self,
        renter_id: &str,
        file_id: &str,
        user_id: &str,
    ) -> Result<()>;
    async fn get_shared_files(&self, renter_id: &str) -> Result<Vec<File>>;
    async fn get_shared_file(&self, renter_id: &str, file_id: &str) -> Result<File>;
    async fn get_contracts(&self, renter_id: &str) -> Result<Vec<Contract>>;
    async fn get_providers(&self) -> Result<Vec<ProviderInfo>>;
}

/// Per-renter settings.
#[derive(Debug, Clone)]
pub struct RenterConfig {
    pub renter_id: String,
    pub alias: String,
    /// Data shards per uploaded version (k).
    pub data_blocks: usize,
    /// Parity shards per uploaded version (m).
    pub parity_blocks: usize,
}

impl RenterConfig {
    pub fn new(renter_id: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            renter_id: renter_id.into(),
            alias: alias.into(),
            data_blocks: DEFAULT_DATA_BLOCKS,
            parity_blocks: DEFAULT_PARITY_BLOCKS,
        }
    }
}

/// A renter session: keys, directory access, block transport, and the
/// storage cache, tied together by the upload and download pipelines.
pub struct Renter {
    pub(crate) config: RenterConfig,
    pub(crate) private_key: RsaPrivateKey,
    pub(crate) public_key: RsaPublicKey,
    pub(crate) meta: Arc<dyn MetaClient>,
    pub(crate) blocks: Arc<dyn BlockStore>,
    pub(crate) storage: Arc<StorageManager>,
}

impl Renter {
    pub fn new(
        config: RenterConfig,
        private_key: RsaPrivateKey,
        meta: Arc<dyn MetaClient>,
        blocks: Arc<dyn BlockStore>,
        storage: Arc<StorageManager>,
    ) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        Self {
            config,
            private_key,
            public_key,
            meta,
            blocks,
            storage,
        }
    }

    pub fn config(&self) -> &RenterConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    /// Files owned by this renter.
    pub async fn list_files(&self) -> Result<Vec<File>> {
        self.meta.get_files(&self.config.renter_id).await
    }

    /// Files other renters have shared with this one.
    pub async fn list_shared_files(&self) -> Result<Vec<File>> {
        self.meta.get_shared_files(&self.config.renter_id).await
    }

    /// Create a folder record in the renter's namespace.
    #[instrument(skip(self))]
    pub async fn create_dir(&self, name: &str) -> Result<File> {
        let file = File {
            id: Uuid::new_v4().to_string(),
            owner_id: self.config.renter_id.clone(),
            name: name.to_string(),
            is_dir: true,
            ..Default::default()
        };
        self.meta.post_file(&self.config.renter_id, &file).await?;
        Ok(file)
    }

    /// Grant another renter read access: the file's symmetric key is
    /// unwrapped with our private key and rewrapped under the grantee's
    /// public key.
    #[instrument(skip(self))]
    pub async fn share(&self, file_id: &str, grantee_id: &str) -> Result<()> {
        let file = self.meta.get_file(&self.config.renter_id, file_id).await?;
        if file.owner_id != self.config.renter_id {
            return Err(Error::NotPermitted(
                "only the owner can share a file".to_string(),
            ));
        }
        let grantee = self.meta.get_renter(grantee_id).await?;
        let grantee_key = parse_public_key(&grantee.public_key)?;
        let (aes_key, aes_iv) = self.decrypt_file_keys(&file)?;
        let permission = Permission {
            renter_id: grantee.id.clone(),
            aes_key: b64_encode(&rsa_wrap(&grantee_key, &aes_key)?),
            aes_iv: b64_encode(&rsa_wrap(&grantee_key, &aes_iv)?),
        };
        self.meta
            .post_permission(&self.config.renter_id, file_id, &permission)
            .await
    }

    /// Revoke a previously granted permission.
    pub async fn unshare(&self, file_id: &str, user_id: &str) -> Result<()> {
        self.meta
            .delete_permission(&self.config.renter_id, file_id, user_id)
            .await
    }

    /// Remove the directory record for a file. Provider-side blocks are
    /// not reclaimed here.
    pub async fn remove_file(&self, file_id: &str) -> Result<()> {
        self.meta.delete_file(&self.config.renter_id, file_id).await
    }

    /// Delete one version from a file's history.
    pub async fn remove_version(&self, file_id: &str, num: u32) -> Result<()> {
        self.meta
            .delete_version(&self.config.renter_id, file_id, num)
            .await
    }

    /// Total free storage across this renter's contracts.
    pub async fn available_storage(&self) -> u64 {
        self.storage.available_storage().await
    }

    /// Fetch a file record by id, falling back to the shared view for
    /// files this renter does not own.
    pub(crate) async fn lookup_file(&self, file_id: &str) -> Result<File> {
        match self.meta.get_file(&self.config.renter_id, file_id).await {
            Ok(file) => Ok(file),
            Err(Error::NotFound(_)) => {
                self.meta
                    .get_shared_file(&self.config.renter_id, file_id)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) async fn find_file_by_name(&self, name: &str) -> Result<Option<File>> {
        Ok(self
            .meta
            .get_files(&self.config.renter_id)
            .await?
            .into_iter()
            .find(|f| f.name == name))
    }

    /// Recover the file's AES key and IV for this renter.
    ///
    /// The owner unwraps the file-level key directly; anyone else must
    /// hold an access-list entry carrying the key wrapped for them.
    pub(crate) fn decrypt_file_keys(&self, file: &File) -> Result<(Vec<u8>, Vec<u8>)> {
        let (wrapped_key, wrapped_iv) = if file.owner_id == self.config.renter_id {
            (&file.aes_key, &file.aes_iv)
        } else {
            file.access_list
                .iter()
                .find(|p| p.renter_id == self.config.renter_id)
                .map(|p| (&p.aes_key, &p.aes_iv))
                .ok_or_else(|| {
                    Error::NotPermitted(format!("no access to file {}", file.id))
                })?
        };
        if wrapped_key.is_empty() || wrapped_iv.is_empty() {
            return Err(Error::NotPermitted(format!(
                "file {} carries no usable key",
                file.id
            )));
        }
        let aes_key = rsa_unwrap(&self.private_key, &b64_decode(wrapped_key)?)?;
        let aes_iv = rsa_unwrap(&self.private_key, &b64_decode(wrapped_iv)?)?;
        Ok((aes_key, aes_iv))
    }
}

/// Derives the renter's freelist from its contracts: each contract's
/// reserved space minus the bytes this renter already has placed with
/// that contract's provider.
pub struct ContractFreelist {
    meta: Arc<dyn MetaClient>,
    renter_id: String,
}

impl ContractFreelist {
    pub fn new(meta: Arc<dyn MetaClient>, renter_id: impl Into<String>) -> Self {
        Self {
            meta,
            renter_id: renter_id.into(),
        }
    }
}

#[async_trait]
impl FreelistSource for ContractFreelist {
    async fn fetch(&self) -> Result<Vec<StorageBlob>> {
        let contracts = self.meta.get_contracts(&self.renter_id).await?;
        let files = self.meta.get_files(&self.renter_id).await?;
        let providers = self.meta.get_providers().await?;

        let addrs: HashMap<String, String> = providers
            .into_iter()
            .map(|p| (p.id, p.addr))
            .collect();
        let mut used: HashMap<String, u64> = HashMap::new();
        for file in &files {
            for version in &file.versions {
                for block in &version.blocks {
                    *used.entry(block.location.provider_id.clone()).or_default() += block.size;
                }
            }
        }

        Ok(contracts
            .into_iter()
            .filter_map(|contract| {
                let addr = addrs.get(&contract.provider_id)?.clone();
                let consumed = used.get(&contract.provider_id).copied().unwrap_or(0);
                let amount = contract.storage_space.saturating_sub(consumed);
                (amount > 0).then_some(StorageBlob {
                    provider_id: contract.provider_id,
                    addr,
                    amount,
                    contract_id: contract.id,
                })
            })
            .collect())
    }
}

pub(crate) fn elapsed_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}

pub(crate) fn join_err(err: tokio::task::JoinError) -> Error {
    Error::Internal(format!("blocking task failed: {err}"))
}
