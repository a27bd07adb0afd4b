//! Upload pipeline
//!
//! Turns a local file into `k + m` equal-sized blocks scattered across
//! providers: zlib compress, AES-CFB encrypt, zero-pad to a shard
//! boundary, split into `k` data shards, Reed-Solomon encode `m` parity
//! shards, then place every shard with a provider chosen by the storage
//! manager. The version record lands on the metaserver only after all
//! shards are stored; any failure undoes the placements.
//!
//! All local transforms stream through temp files, so memory use does
//! not grow with file size. Temp files are guard-scoped and removed on
//! every exit path.

use crate::storage::StorageBlob;
use crate::{elapsed_ms, join_err, Renter};
use chrono::Utc;
use flate2::read::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use skerry_core::crypto::{
    b64_encode, generate_aes_iv, generate_aes_key, rsa_wrap, sha256_stream, CfbEncryptReader,
};
use skerry_core::erasure::{ErasureCoder, ErasureConfig};
use skerry_core::error::{Error, Result};
use skerry_core::types::{Block, BlockLocation, File, Version};
use std::fs::File as StdFile;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::{NamedTempFile, TempPath};
use tokio::task;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// How long a provider that failed a shard upload is kept out of
/// placement decisions.
const OFFLINE_PENALTY: Duration = Duration::from_secs(300);

/// Outcome of placing one block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockUploadInfo {
    pub block_id: String,
    pub provider_id: String,
    pub location: String,
    pub size: u64,
    pub total_time_ms: i64,
}

/// Outcome of uploading one file (or recording one folder).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInfo {
    pub file_id: String,
    pub name: String,
    pub is_dir: bool,
    pub version_num: u32,
    pub total_time_ms: i64,
    pub blocks: Vec<BlockUploadInfo>,
}

/// One shard staged on disk, ready for placement.
struct PreparedShard {
    path: TempPath,
    sha256: String,
}

struct PreparedBlocks {
    shards: Vec<PreparedShard>,
    shard_size: u64,
    padding: u64,
}

impl Renter {
    /// Upload a local file or directory tree into the renter's
    /// namespace under `name` (default: the source's file name).
    pub async fn upload(&self, src: &Path, name: Option<&str>) -> Result<Vec<UploadInfo>> {
        let meta = tokio::fs::metadata(src)
            .await
            .map_err(|e| Error::Io(io::Error::new(e.kind(), format!("{}: {e}", src.display()))))?;
        let name = match name {
            Some(name) => name.trim_matches('/').to_string(),
            None => src
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    Error::Configuration(format!("cannot derive a name from {}", src.display()))
                })?,
        };
        if meta.is_dir() {
            self.upload_dir(src, &name).await
        } else {
            Ok(vec![self.upload_file(src, &name).await?])
        }
    }

    /// Upload a directory tree: folder records for every directory,
    /// then each regular file under `name/<relative path>`.
    async fn upload_dir(&self, src: &Path, name: &str) -> Result<Vec<UploadInfo>> {
        let start = Instant::now();
        let (dirs, files) = collect_entries(src).await?;

        let mut results = Vec::new();
        let root = self.create_dir(name).await?;
        results.push(folder_info(&root, elapsed_ms(start)));
        for dir in dirs {
            let t0 = Instant::now();
            let record = self
                .create_dir(&format!("{name}/{}", relative_name(src, &dir)))
                .await?;
            results.push(folder_info(&record, elapsed_ms(t0)));
        }
        for file in files {
            let dest = format!("{name}/{}", relative_name(src, &file));
            results.push(self.upload_file(&file, &dest).await?);
        }
        info!(count = results.len(), name, "uploaded directory tree");
        Ok(results)
    }

    /// Upload a single file as a new version. A new file gets a fresh
    /// AES key wrapped under the owner's public key; an existing file
    /// reuses its key so every access-list entry stays valid.
    #[instrument(skip(self, src), fields(src = %src.as_ref().display()))]
    pub async fn upload_file(&self, src: impl AsRef<Path>, name: &str) -> Result<UploadInfo> {
        let src = src.as_ref();
        let start = Instant::now();
        let plain_size = tokio::fs::metadata(src).await?.len();

        let existing = self.find_file_by_name(name).await?;
        if existing.as_ref().is_some_and(|f| f.is_dir) {
            return Err(Error::Configuration(format!("{name} is a folder")));
        }
        let (aes_key, aes_iv) = match &existing {
            Some(file) => self.decrypt_file_keys(file)?,
            None => (generate_aes_key().to_vec(), generate_aes_iv().to_vec()),
        };

        let k = self.config.data_blocks;
        let m = self.config.parity_blocks;
        let prepared = {
            let src = src.to_path_buf();
            let key = aes_key.clone();
            let iv = aes_iv.clone();
            task::spawn_blocking(move || prepare_blocks(&src, &key, &iv, k, m))
                .await
                .map_err(join_err)??
        };

        let reservation = self.storage.find_storage(k + m, prepared.shard_size).await?;
        let (blocks, infos) = self
            .place_blocks(&prepared, reservation.blobs())
            .await?;

        let version_num = existing
            .as_ref()
            .and_then(|f| f.latest_version())
            .map(|v| v.num + 1)
            .unwrap_or(1);
        let version = Version {
            num: version_num,
            size: plain_size,
            upload_time: Some(Utc::now()),
            num_data_blocks: k,
            num_parity_blocks: m,
            padding_bytes: prepared.padding,
            blocks,
        };

        let file_id = match &existing {
            Some(file) => {
                if let Err(err) = self
                    .meta
                    .post_version(&self.config.renter_id, &file.id, &version)
                    .await
                {
                    self.undo_blocks(&version.blocks).await;
                    return Err(err);
                }
                file.id.clone()
            }
            None => {
                let file = File {
                    id: Uuid::new_v4().to_string(),
                    owner_id: self.config.renter_id.clone(),
                    name: name.to_string(),
                    is_dir: false,
                    access_list: Vec::new(),
                    aes_key: b64_encode(&rsa_wrap(&self.public_key, &aes_key)?),
                    aes_iv: b64_encode(&rsa_wrap(&self.public_key, &aes_iv)?),
                    versions: vec![version.clone()],
                };
                if let Err(err) = self.meta.post_file(&self.config.renter_id, &file).await {
                    self.undo_blocks(&version.blocks).await;
                    return Err(err);
                }
                file.id
            }
        };
        reservation.commit();

        info!(
            file = %file_id,
            version = version_num,
            blocks = k + m,
            "uploaded file"
        );
        Ok(UploadInfo {
            file_id,
            name: name.to_string(),
            is_dir: false,
            version_num,
            total_time_ms: elapsed_ms(start),
            blocks: infos,
        })
    }

    /// Store every prepared shard with its reserved provider, all
    /// transfers in flight at once. On any failure the placements that
    /// landed are deleted and the failing providers penalized.
    async fn place_blocks(
        &self,
        prepared: &PreparedBlocks,
        blobs: &[StorageBlob],
    ) -> Result<(Vec<Block>, Vec<BlockUploadInfo>)> {
        let shard_size = prepared.shard_size;
        let uploads = prepared.shards.iter().zip(blobs).map(|(shard, blob)| {
            let block_id = Uuid::new_v4().to_string();
            async move {
                let t0 = Instant::now();
                let file = tokio::fs::File::open(&shard.path).await?;
                self.blocks
                    .put_block(&blob.addr, &self.config.renter_id, &block_id, shard_size, file)
                    .await?;
                Ok::<_, Error>((
                    Block {
                        id: block_id.clone(),
                        location: BlockLocation {
                            provider_id: blob.provider_id.clone(),
                            addr: blob.addr.clone(),
                        },
                        size: shard_size,
                        sha256_hash: shard.sha256.clone(),
                    },
                    BlockUploadInfo {
                        block_id,
                        provider_id: blob.provider_id.clone(),
                        location: blob.addr.clone(),
                        size: shard_size,
                        total_time_ms: elapsed_ms(t0),
                    },
                ))
            }
        });
        let results = futures::future::join_all(uploads).await;

        let mut blocks = Vec::new();
        let mut infos = Vec::new();
        let mut failed_providers = Vec::new();
        let mut first_err = None;
        for (result, blob) in results.into_iter().zip(blobs) {
            match result {
                Ok((block, info)) => {
                    blocks.push(block);
                    infos.push(info);
                }
                Err(err) => {
                    warn!(provider = %blob.provider_id, error = %err, "shard upload failed");
                    failed_providers.push(blob.provider_id.clone());
                    first_err.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_err {
            self.storage
                .mark_offline(&failed_providers, Instant::now() + OFFLINE_PENALTY);
            self.undo_blocks(&blocks).await;
            return Err(err);
        }
        Ok((blocks, infos))
    }

    /// Best-effort removal of blocks from a placement that will not be
    /// recorded. A failure here leaves an orphan on the provider.
    async fn undo_blocks(&self, blocks: &[Block]) {
        for block in blocks {
            if let Err(err) = self
                .blocks
                .delete_block(&block.location.addr, &self.config.renter_id, &block.id)
                .await
            {
                warn!(block = %block.id, error = %err, "orphaned block left on provider");
            }
        }
    }
}

/// Stage a file for placement: compress and encrypt into one temp
/// stream, pad to `k` equal shards, split, and derive parity shards.
fn prepare_blocks(
    src: &Path,
    aes_key: &[u8],
    aes_iv: &[u8],
    data_blocks: usize,
    parity_blocks: usize,
) -> Result<PreparedBlocks> {
    let coder = ErasureCoder::new(ErasureConfig::new(data_blocks, parity_blocks)?)?;

    // Compress and encrypt in one streamed pass.
    let source = StdFile::open(src)?;
    let compressor = ZlibEncoder::new(BufReader::new(source), Compression::default());
    let mut encryptor = CfbEncryptReader::new(aes_key, aes_iv, compressor)?;
    let mut staged = NamedTempFile::new()?;
    let len = io::copy(&mut encryptor, staged.as_file_mut())?;

    // Zero-extend so the stream splits into k equal shards.
    let shard_size = len.div_ceil(data_blocks as u64);
    let padding = shard_size * data_blocks as u64 - len;
    staged.as_file_mut().set_len(shard_size * data_blocks as u64)?;
    staged.as_file_mut().seek(SeekFrom::Start(0))?;

    let mut data_files = Vec::with_capacity(data_blocks);
    for _ in 0..data_blocks {
        let mut shard = NamedTempFile::new()?;
        let mut piece = staged.as_file_mut().take(shard_size);
        io::copy(&mut piece, shard.as_file_mut())?;
        data_files.push(shard);
    }

    let mut parity_files = (0..parity_blocks)
        .map(|_| NamedTempFile::new())
        .collect::<io::Result<Vec<_>>>()?;
    {
        let mut readers = data_files
            .iter()
            .map(|f| f.reopen())
            .collect::<io::Result<Vec<_>>>()?;
        let mut writers: Vec<&mut StdFile> =
            parity_files.iter_mut().map(|f| f.as_file_mut()).collect();
        coder.encode(&mut readers, &mut writers)?;
    }

    let mut shards = Vec::with_capacity(data_blocks + parity_blocks);
    for file in data_files.into_iter().chain(parity_files) {
        let mut reader = file.reopen()?;
        let digest = sha256_stream(&mut reader)?;
        shards.push(PreparedShard {
            path: file.into_temp_path(),
            sha256: b64_encode(&digest),
        });
    }
    Ok(PreparedBlocks {
        shards,
        shard_size,
        padding,
    })
}

/// Walk a directory tree, returning (directories, regular files), both
/// sorted so parents precede children.
async fn collect_entries(root: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                dirs.push(path.clone());
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    dirs.sort();
    files.sort();
    Ok((dirs, files))
}

fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn folder_info(record: &File, total_time_ms: i64) -> UploadInfo {
    UploadInfo {
        file_id: record.id.clone(),
        name: record.name.clone(),
        is_dir: true,
        version_num: 0,
        total_time_ms,
        blocks: Vec::new(),
    }
}
