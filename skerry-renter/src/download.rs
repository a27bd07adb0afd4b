//! Download pipeline
//!
//! Recovers a file from its scattered blocks: fetch shards in stored
//! order until `k` arrive intact, rebuild any missing data shards from
//! parity, strip the padding, then stream the concatenation through
//! AES-CFB decryption and zlib decompression into the destination.
//!
//! Individual block failures (unreachable provider, wrong size, hash
//! mismatch) are recorded per block and absorbed as long as at most
//! `m` shards are lost; everything else aborts the download.

use crate::{elapsed_ms, join_err, Renter};
use flate2::read::ZlibDecoder;
use serde::{Deserialize, Serialize};
use skerry_core::crypto::{b64_encode, sha256_stream, CfbDecryptReader};
use skerry_core::erasure::{ErasureCoder, ErasureConfig};
use skerry_core::error::{Error, Result};
use skerry_core::types::{Block, File, Version};
use std::fs::File as StdFile;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::NamedTempFile;
use tokio::task;
use tracing::{info, instrument, warn};

/// Outcome of fetching one block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDownloadInfo {
    pub block_id: String,
    pub provider_id: String,
    pub location: String,
    pub total_time_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of downloading one file or creating one folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDownloadInfo {
    pub file_id: String,
    pub name: String,
    pub is_dir: bool,
    pub version_num: u32,
    pub dest_path: String,
    pub total_time_ms: i64,
    pub blocks: Vec<BlockDownloadInfo>,
}

/// Aggregate outcome of a download request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadInfo {
    pub total_time_ms: i64,
    pub files: Vec<FileDownloadInfo>,
}

impl Renter {
    /// Download a file (or folder tree) by id. Defaults: the newest
    /// version, and a destination under the user's home directory.
    #[instrument(skip(self, dest))]
    pub async fn download(
        &self,
        file_id: &str,
        dest: Option<PathBuf>,
        version_num: Option<u32>,
    ) -> Result<DownloadInfo> {
        let file = self.lookup_file(file_id).await?;
        if file.is_dir && version_num.is_some() {
            return Err(Error::Configuration(
                "cannot give a version with a folder download".to_string(),
            ));
        }
        let dest = match dest {
            Some(dest) => dest,
            None => default_download_location(&file)?,
        };
        if file.is_dir {
            return self.download_dir(&file, &dest).await;
        }

        let version = match version_num {
            Some(num) => file.find_version(num).ok_or_else(|| {
                Error::NotFound(format!("version {num} of {}", file.name))
            })?,
            None => file
                .latest_version()
                .ok_or_else(|| Error::NotFound(format!("{} has no versions", file.name)))?,
        };

        let start = Instant::now();
        let blocks = self.perform_file_download(&file, version, &dest).await?;
        let elapsed = elapsed_ms(start);
        info!(file = %file.id, version = version.num, dest = %dest.display(), "downloaded file");
        Ok(DownloadInfo {
            total_time_ms: elapsed,
            files: vec![FileDownloadInfo {
                file_id: file.id.clone(),
                name: file.name.clone(),
                is_dir: false,
                version_num: version.num,
                dest_path: dest.display().to_string(),
                total_time_ms: elapsed,
                blocks,
            }],
        })
    }

    /// Download a folder tree: the folder itself plus every descendant
    /// record. Children already written stay on disk if a later child
    /// fails; the failure names the child.
    async fn download_dir(&self, dir: &File, dest: &Path) -> Result<DownloadInfo> {
        let start = Instant::now();
        let mut files = vec![make_dir(dir, dest).await?];

        let mut children = self.find_children(dir).await?;
        children.sort_by(|a, b| a.name.cmp(&b.name));
        for child in children {
            let prefix = format!("{}/", dir.name);
            let rel = child
                .name
                .strip_prefix(&prefix)
                .unwrap_or(&child.name)
                .to_string();
            let full = dest.join(&rel);
            if child.is_dir {
                files.push(make_dir(&child, &full).await?);
                continue;
            }
            let child_err = |err: Error| Error::ChildDownload {
                name: child.name.clone(),
                source: Box::new(err),
            };
            let version = child
                .latest_version()
                .ok_or_else(|| child_err(Error::NotFound("no versions".to_string())))?;
            let t0 = Instant::now();
            let blocks = self
                .perform_file_download(&child, version, &full)
                .await
                .map_err(child_err)?;
            files.push(FileDownloadInfo {
                file_id: child.id.clone(),
                name: child.name.clone(),
                is_dir: false,
                version_num: version.num,
                dest_path: full.display().to_string(),
                total_time_ms: elapsed_ms(t0),
                blocks,
            });
        }
        Ok(DownloadInfo {
            total_time_ms: elapsed_ms(start),
            files,
        })
    }

    /// Descendants of a folder: every owned file whose name sits under
    /// the folder's name plus a separator.
    pub(crate) async fn find_children(&self, dir: &File) -> Result<Vec<File>> {
        let prefix = format!("{}/", dir.name);
        Ok(self
            .meta
            .get_files(&self.config.renter_id)
            .await?
            .into_iter()
            .filter(|f| f.id != dir.id && f.name.starts_with(&prefix))
            .collect())
    }

    /// Fetch blocks for one version and assemble the plaintext at
    /// `dest`, tolerating up to `m` lost shards.
    pub(crate) async fn perform_file_download(
        &self,
        file: &File,
        version: &Version,
        dest: &Path,
    ) -> Result<Vec<BlockDownloadInfo>> {
        let k = version.num_data_blocks;
        let m = version.num_parity_blocks;
        if version.blocks.len() != k + m {
            return Err(Error::Codec(format!(
                "version lists {} blocks, expected {}",
                version.blocks.len(),
                k + m
            )));
        }
        // Resolve the key up front so a renter without access fails
        // before any transfer starts.
        let (aes_key, aes_iv) = self.decrypt_file_keys(file)?;

        let mut reports = Vec::new();
        let mut block_files: Vec<Option<NamedTempFile>> = Vec::new();
        let mut successes = 0usize;
        let mut failures = 0usize;
        let mut index = 0usize;
        while successes < k && failures <= m {
            let block = &version.blocks[index];
            let t0 = Instant::now();
            let mut report = BlockDownloadInfo {
                block_id: block.id.clone(),
                provider_id: block.location.provider_id.clone(),
                location: block.location.addr.clone(),
                total_time_ms: 0,
                error: None,
            };
            match self.fetch_block(&file.owner_id, block).await {
                Ok(temp) => {
                    successes += 1;
                    block_files.push(Some(temp));
                }
                Err(err) => {
                    warn!(
                        block = %block.id,
                        provider = %block.location.provider_id,
                        error = %err,
                        "block fetch failed"
                    );
                    failures += 1;
                    block_files.push(None);
                    report.error = Some(err.to_string());
                }
            }
            report.total_time_ms = elapsed_ms(t0);
            reports.push(report);
            index += 1;
        }
        if successes < k {
            return Err(Error::InsufficientShards {
                available: successes,
                required: k,
            });
        }

        let needs_reconstruction = failures > 0;
        let version = version.clone();
        let dest = dest.to_path_buf();
        task::spawn_blocking(move || {
            finish_download(
                &version,
                &aes_key,
                &aes_iv,
                &dest,
                block_files,
                needs_reconstruction,
            )
        })
        .await
        .map_err(join_err)??;
        Ok(reports)
    }

    /// Fetch one block into a temp file, gating on the recorded size
    /// and SHA-256. A complete-but-wrong delivery is a corrupt block;
    /// transport failures keep their own classification.
    async fn fetch_block(&self, owner_id: &str, block: &Block) -> Result<NamedTempFile> {
        let temp = NamedTempFile::new()?;
        let mut dest = tokio::fs::OpenOptions::new()
            .write(true)
            .open(temp.path())
            .await?;
        let received = self
            .blocks
            .get_block(&block.location.addr, owner_id, &block.id, &mut dest)
            .await?;
        drop(dest);

        if received != block.size {
            return Err(Error::CorruptBlock {
                block_id: block.id.clone(),
                reason: format!("expected {} bytes, got {received}", block.size),
            });
        }
        let path = temp.path().to_path_buf();
        let digest = task::spawn_blocking(move || -> Result<[u8; 32]> {
            let mut reader = StdFile::open(&path)?;
            Ok(sha256_stream(&mut reader)?)
        })
        .await
        .map_err(join_err)??;
        if b64_encode(&digest) != block.sha256_hash {
            return Err(Error::CorruptBlock {
                block_id: block.id.clone(),
                reason: "hash mismatch".to_string(),
            });
        }
        Ok(temp)
    }
}

/// Rebuild missing data shards if needed, strip the padding, and stream
/// the shard concatenation through decryption and decompression.
fn finish_download(
    version: &Version,
    aes_key: &[u8],
    aes_iv: &[u8],
    dest: &Path,
    mut block_files: Vec<Option<NamedTempFile>>,
    needs_reconstruction: bool,
) -> Result<()> {
    let k = version.num_data_blocks;
    let total = k + version.num_parity_blocks;
    block_files.resize_with(total, || None);

    if needs_reconstruction {
        let mut slots = block_files
            .iter()
            .map(|slot| slot.as_ref().map(|t| t.reopen()).transpose())
            .collect::<io::Result<Vec<Option<StdFile>>>>()?;
        let mut fill_temps: Vec<Option<NamedTempFile>> = Vec::with_capacity(total);
        for (i, slot) in slots.iter().enumerate() {
            fill_temps.push(if slot.is_none() && i < k {
                Some(NamedTempFile::new()?)
            } else {
                None
            });
        }
        let mut fill_writers = fill_temps
            .iter()
            .map(|slot| slot.as_ref().map(|t| t.reopen()).transpose())
            .collect::<io::Result<Vec<Option<StdFile>>>>()?;

        let coder = ErasureCoder::new(ErasureConfig::new(k, version.num_parity_blocks)?)?;
        coder.reconstruct(&mut slots, &mut fill_writers)?;

        for i in 0..k {
            if block_files[i].is_none() {
                block_files[i] = fill_temps[i].take();
            }
        }
    }

    let data_files = block_files
        .into_iter()
        .take(k)
        .map(|slot| {
            slot.ok_or_else(|| Error::Internal("data shard missing after reconstruction".into()))
        })
        .collect::<Result<Vec<NamedTempFile>>>()?;

    // The zero fill only ever lives at the tail of the last data shard.
    if version.padding_bytes > 0 {
        let last = data_files
            .last()
            .ok_or_else(|| Error::Codec("version has no data shards".to_string()))?;
        let len = last.as_file().metadata()?.len();
        if version.padding_bytes >= len {
            return Err(Error::Codec(format!(
                "padding {} exceeds shard size {len}",
                version.padding_bytes
            )));
        }
        last.as_file().set_len(len - version.padding_bytes)?;
    }

    let mut multi: Box<dyn Read> = Box::new(io::empty());
    for shard in &data_files {
        multi = Box::new(multi.chain(shard.reopen()?));
    }
    let decryptor = CfbDecryptReader::new(aes_key, aes_iv, multi)?;
    let mut decompressor = ZlibDecoder::new(decryptor);

    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut out = StdFile::create(dest)?;
    io::copy(&mut decompressor, &mut out)?;
    Ok(())
}

async fn make_dir(dir: &File, dest: &Path) -> Result<FileDownloadInfo> {
    tokio::fs::create_dir_all(dest).await?;
    Ok(FileDownloadInfo {
        file_id: dir.id.clone(),
        name: dir.name.clone(),
        is_dir: true,
        version_num: 0,
        dest_path: dest.display().to_string(),
        total_time_ms: 0,
        blocks: Vec::new(),
    })
}

/// With no destination given, download into the home directory under
/// the file's base name, suffixing " (n)" while the name is taken.
fn default_download_location(file: &File) -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Configuration("cannot determine home directory".to_string()))?;
    let base = Path::new(&file.name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let mut dest = home.join(&base);
    let mut suffix = 1u32;
    while dest.exists() {
        dest = home.join(format!("{base} ({suffix})"));
        suffix += 1;
    }
    Ok(dest)
}
