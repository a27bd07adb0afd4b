//! End-to-end pipeline tests
//!
//! Drive the real upload and download pipelines against in-memory
//! directory and block-store fakes, covering loss tolerance, tamper
//! detection, access control, and placement rollback.
//!
//! Run with: cargo test --test pipeline

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use skerry_core::crypto::{fingerprint_key, generate_keypair};
use skerry_core::error::{Error, Result};
use skerry_core::types::{Contract, File, Permission, ProviderInfo, RenterInfo, Version};
use skerry_provider::BlockStore;
use skerry_renter::{
    FreelistSource, MetaClient, Renter, RenterConfig, StorageBlob, StorageManager, SystemClock,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// In-memory provider pool with per-provider failure injection.
#[derive(Default)]
struct MemoryBlockStore {
    blocks: Mutex<HashMap<(String, String), Vec<u8>>>,
    down: Mutex<HashSet<String>>,
}

impl MemoryBlockStore {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set_down(&self, addr: &str) {
        self.down.lock().unwrap().insert(addr.to_string());
    }

    fn tamper(&self, addr: &str, block_id: &str) {
        let mut blocks = self.blocks.lock().unwrap();
        let data = blocks
            .get_mut(&(addr.to_string(), block_id.to_string()))
            .expect("no such block to tamper with");
        data[0] ^= 0xff;
    }

    fn block_count(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn get_block(
        &self,
        addr: &str,
        _renter_id: &str,
        block_id: &str,
        dest: &mut tokio::fs::File,
    ) -> Result<u64> {
        if self.down.lock().unwrap().contains(addr) {
            return Err(Error::Network(format!("provider {addr} unreachable")));
        }
        let data = self
            .blocks
            .lock()
            .unwrap()
            .get(&(addr.to_string(), block_id.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("block {block_id}")))?;
        dest.write_all(&data).await?;
        dest.flush().await?;
        Ok(data.len() as u64)
    }

    async fn put_block(
        &self,
        addr: &str,
        _renter_id: &str,
        block_id: &str,
        _size: u64,
        mut src: tokio::fs::File,
    ) -> Result<()> {
        if self.down.lock().unwrap().contains(addr) {
            return Err(Error::Network(format!("provider {addr} unreachable")));
        }
        let mut data = Vec::new();
        src.read_to_end(&mut data).await?;
        self.blocks
            .lock()
            .unwrap()
            .insert((addr.to_string(), block_id.to_string()), data);
        Ok(())
    }

    async fn delete_block(&self, addr: &str, _renter_id: &str, block_id: &str) -> Result<()> {
        self.blocks
            .lock()
            .unwrap()
            .remove(&(addr.to_string(), block_id.to_string()));
        Ok(())
    }
}

/// In-memory metaserver directory.
#[derive(Default)]
struct MemoryMeta {
    files: Mutex<HashMap<String, File>>,
    renters: Mutex<HashMap<String, RenterInfo>>,
}

impl MemoryMeta {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn add_renter(&self, info: RenterInfo) {
        self.renters.lock().unwrap().insert(info.id.clone(), info);
    }

    fn file(&self, file_id: &str) -> File {
        self.files.lock().unwrap().get(file_id).cloned().unwrap()
    }
}

#[async_trait]
impl MetaClient for MemoryMeta {
    async fn get_file(&self, _renter_id: &str, file_id: &str) -> Result<File> {
        self.files
            .lock()
            .unwrap()
            .get(file_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("file {file_id}")))
    }

    async fn get_files(&self, renter_id: &str) -> Result<Vec<File>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .values()
            .filter(|f| f.owner_id == renter_id)
            .cloned()
            .collect())
    }

    async fn post_file(&self, _renter_id: &str, file: &File) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(file.id.clone(), file.clone());
        Ok(())
    }

    async fn delete_file(&self, _renter_id: &str, file_id: &str) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .remove(file_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("file {file_id}")))
    }

    async fn post_version(
        &self,
        _renter_id: &str,
        file_id: &str,
        version: &Version,
    ) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let file = files
            .get_mut(file_id)
            .ok_or_else(|| Error::NotFound(format!("file {file_id}")))?;
        file.versions.push(version.clone());
        Ok(())
    }

    async fn delete_version(&self, _renter_id: &str, file_id: &str, num: u32) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let file = files
            .get_mut(file_id)
            .ok_or_else(|| Error::NotFound(format!("file {file_id}")))?;
        file.versions.retain(|v| v.num != num);
        Ok(())
    }

    async fn get_renter(&self, renter_id: &str) -> Result<RenterInfo> {
        self.renters
            .lock()
            .unwrap()
            .get(renter_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("renter {renter_id}")))
    }

    async fn post_permission(
        &self,
        _renter_id: &str,
        file_id: &str,
        permission: &Permission,
    ) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let file = files
            .get_mut(file_id)
            .ok_or_else(|| Error::NotFound(format!("file {file_id}")))?;
        file.access_list.push(permission.clone());
        Ok(())
    }

    async fn delete_permission(
        &self,
        _renter_id: &str,
        file_id: &str,
        user_id: &str,
    ) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let file = files
            .get_mut(file_id)
            .ok_or_else(|| Error::NotFound(format!("file {file_id}")))?;
        file.access_list.retain(|p| p.renter_id != user_id);
        Ok(())
    }

    async fn get_shared_files(&self, renter_id: &str) -> Result<Vec<File>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .values()
            .filter(|f| f.access_list.iter().any(|p| p.renter_id == renter_id))
            .cloned()
            .collect())
    }

    async fn get_shared_file(&self, renter_id: &str, file_id: &str) -> Result<File> {
        self.get_shared_files(renter_id)
            .await?
            .into_iter()
            .find(|f| f.id == file_id)
            .ok_or_else(|| Error::NotFound(format!("file {file_id}")))
    }

    async fn get_contracts(&self, _renter_id: &str) -> Result<Vec<Contract>> {
        Ok(Vec::new())
    }

    async fn get_providers(&self) -> Result<Vec<ProviderInfo>> {
        Ok(Vec::new())
    }
}

/// Placement tests seed the freelist directly; a failing source keeps
/// the seeded view in place across refreshes.
struct UnreachableSource;

#[async_trait]
impl FreelistSource for UnreachableSource {
    async fn fetch(&self) -> Result<Vec<StorageBlob>> {
        Err(Error::Network("metaserver unreachable".to_string()))
    }
}

/// RSA keygen dominates test time; share a small pool of distinct keys.
fn test_key(index: usize) -> RsaPrivateKey {
    static KEYS: OnceLock<Vec<RsaPrivateKey>> = OnceLock::new();
    KEYS.get_or_init(|| (0..3).map(|_| generate_keypair().unwrap().0).collect())[index].clone()
}

fn provider_blobs(count: usize) -> Vec<StorageBlob> {
    (0..count)
        .map(|i| StorageBlob {
            provider_id: format!("p{i}"),
            addr: format!("p{i}.test:8003"),
            amount: 10 * 1024 * 1024,
            contract_id: format!("c{i}"),
        })
        .collect()
}

fn make_renter(
    meta: &Arc<MemoryMeta>,
    store: &Arc<MemoryBlockStore>,
    key_index: usize,
    alias: &str,
    data_blocks: usize,
    parity_blocks: usize,
    providers: usize,
) -> Renter {
    let private_key = test_key(key_index);
    let public_key = RsaPublicKey::from(&private_key);
    let renter_id = fingerprint_key(&public_key).unwrap();
    meta.add_renter(RenterInfo {
        id: renter_id.clone(),
        alias: alias.to_string(),
        public_key: public_key.to_public_key_pem(LineEnding::LF).unwrap(),
    });

    let storage = Arc::new(StorageManager::new(
        provider_blobs(providers),
        Arc::new(UnreachableSource),
        Duration::from_secs(3600),
        Arc::new(SystemClock),
        StdRng::seed_from_u64(17),
    ));

    let mut config = RenterConfig::new(renter_id, alias);
    config.data_blocks = data_blocks;
    config.parity_blocks = parity_blocks;
    Renter::new(config, private_key, meta.clone(), store.clone(), storage)
}

fn write_source(dir: &TempDir, name: &str, contents: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn uploads_and_downloads_a_tiny_file() {
    let meta = MemoryMeta::new();
    let store = MemoryBlockStore::new();
    let renter = make_renter(&meta, &store, 0, "alice", 3, 2, 5);
    let work = TempDir::new().unwrap();
    let src = write_source(&work, "x.txt", b"x");

    let results = renter.upload(&src, Some("x.txt")).await.unwrap();
    assert_eq!(results.len(), 1);
    let info = &results[0];
    assert_eq!(info.version_num, 1);

    let file = meta.file(&info.file_id);
    let version = &file.versions[0];
    assert_eq!(version.num_data_blocks, 3);
    assert_eq!(version.num_parity_blocks, 2);
    assert_eq!(version.size, 1);
    assert_eq!(version.blocks.len(), 5);
    assert_eq!(store.block_count(), 5);

    // Every block is shard-sized and the padding never eats a shard.
    let shard_size = version.blocks[0].size;
    assert!(version.blocks.iter().all(|b| b.size == shard_size));
    assert!(version.padding_bytes < shard_size);
    // The padded stream splits exactly into the data shards.
    assert!(version.padding_bytes < shard_size * version.num_data_blocks as u64);

    let dest = work.path().join("x.out");
    let info = renter
        .download(&file.id, Some(dest.clone()), None)
        .await
        .unwrap();
    assert_eq!(read(&dest), b"x");
    assert!(info.files[0].blocks.iter().all(|b| b.error.is_none()));
}

#[tokio::test]
async fn appending_versions_reuses_the_file_key() {
    let meta = MemoryMeta::new();
    let store = MemoryBlockStore::new();
    let renter = make_renter(&meta, &store, 0, "alice", 3, 2, 5);
    let work = TempDir::new().unwrap();

    let first = write_source(&work, "v1.txt", b"first contents");
    let second = write_source(&work, "v2.txt", b"second contents, a little longer");
    let uploaded = renter.upload_file(&first, "notes.txt").await.unwrap();
    let key_before = meta.file(&uploaded.file_id).aes_key.clone();
    let again = renter.upload_file(&second, "notes.txt").await.unwrap();

    assert_eq!(uploaded.file_id, again.file_id);
    assert_eq!(again.version_num, 2);
    let file = meta.file(&uploaded.file_id);
    assert_eq!(file.versions.len(), 2);
    assert_eq!(file.aes_key, key_before);

    let latest = work.path().join("latest.out");
    renter
        .download(&file.id, Some(latest.clone()), None)
        .await
        .unwrap();
    assert_eq!(read(&latest), b"second contents, a little longer");

    let old = work.path().join("old.out");
    renter
        .download(&file.id, Some(old.clone()), Some(1))
        .await
        .unwrap();
    assert_eq!(read(&old), b"first contents");
}

#[tokio::test]
async fn survives_single_provider_loss() {
    let meta = MemoryMeta::new();
    let store = MemoryBlockStore::new();
    let renter = make_renter(&meta, &store, 0, "alice", 3, 2, 5);
    let work = TempDir::new().unwrap();
    let contents = patterned(1024 * 1024);
    let src = write_source(&work, "big.bin", &contents);

    let info = renter.upload_file(&src, "big.bin").await.unwrap();
    let file = meta.file(&info.file_id);
    let lost = file.versions[0].blocks[1].clone();
    store.set_down(&lost.location.addr);

    let dest = work.path().join("big.out");
    let report = renter
        .download(&file.id, Some(dest.clone()), None)
        .await
        .unwrap();

    assert_eq!(sha256(&read(&dest)), sha256(&contents));
    let block_report = report.files[0]
        .blocks
        .iter()
        .find(|b| b.block_id == lost.id)
        .unwrap();
    assert!(block_report.error.is_some());
}

#[tokio::test]
async fn tolerates_losses_up_to_parity() {
    let meta = MemoryMeta::new();
    let store = MemoryBlockStore::new();
    let renter = make_renter(&meta, &store, 0, "alice", 4, 2, 6);
    let work = TempDir::new().unwrap();
    let contents = patterned(300_000);
    let src = write_source(&work, "data.bin", &contents);

    let info = renter.upload_file(&src, "data.bin").await.unwrap();
    let file = meta.file(&info.file_id);
    let blocks = &file.versions[0].blocks;

    store.set_down(&blocks[0].location.addr);
    store.set_down(&blocks[1].location.addr);
    let dest = work.path().join("data.out");
    renter
        .download(&file.id, Some(dest.clone()), None)
        .await
        .unwrap();
    assert_eq!(read(&dest), contents);

    // A third loss crosses the parity budget.
    store.set_down(&blocks[2].location.addr);
    let err = renter
        .download(&file.id, Some(work.path().join("data2.out")), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientShards { .. }));
}

#[tokio::test]
async fn detects_tampered_blocks() {
    let meta = MemoryMeta::new();
    let store = MemoryBlockStore::new();
    let renter = make_renter(&meta, &store, 0, "alice", 3, 2, 5);
    let work = TempDir::new().unwrap();
    let contents = patterned(50_000);
    let src = write_source(&work, "t.bin", &contents);

    let info = renter.upload_file(&src, "t.bin").await.unwrap();
    let file = meta.file(&info.file_id);
    let victim = file.versions[0].blocks[0].clone();
    store.tamper(&victim.location.addr, &victim.id);

    let dest = work.path().join("t.out");
    let report = renter
        .download(&file.id, Some(dest.clone()), None)
        .await
        .unwrap();

    // The flipped bit is caught by the hash gate and routed around.
    assert_eq!(read(&dest), contents);
    let block_report = report.files[0]
        .blocks
        .iter()
        .find(|b| b.block_id == victim.id)
        .unwrap();
    let error = block_report.error.as_ref().unwrap();
    assert!(error.contains("corrupt block"), "got: {error}");
}

#[tokio::test]
async fn shared_files_follow_the_access_list() {
    let meta = MemoryMeta::new();
    let store = MemoryBlockStore::new();
    let alice = make_renter(&meta, &store, 0, "alice", 3, 2, 5);
    let bob = make_renter(&meta, &store, 1, "bob", 3, 2, 5);
    let carol = make_renter(&meta, &store, 2, "carol", 3, 2, 5);
    let work = TempDir::new().unwrap();
    let src = write_source(&work, "s.txt", b"between alice and bob");

    let info = alice.upload_file(&src, "s.txt").await.unwrap();
    alice
        .share(&info.file_id, &bob.config().renter_id)
        .await
        .unwrap();

    let bob_dest = work.path().join("bob.out");
    bob.download(&info.file_id, Some(bob_dest.clone()), None)
        .await
        .unwrap();
    assert_eq!(read(&bob_dest), b"between alice and bob");

    let err = carol
        .download(&info.file_id, Some(work.path().join("carol.out")), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotPermitted(_)));

    // Revocation closes the door again.
    alice
        .unshare(&info.file_id, &bob.config().renter_id)
        .await
        .unwrap();
    let err = bob
        .download(&info.file_id, Some(work.path().join("bob2.out")), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotPermitted(_)));
}

#[tokio::test]
async fn failed_placement_rolls_back_and_removes_blocks() {
    let meta = MemoryMeta::new();
    let store = MemoryBlockStore::new();
    let renter = make_renter(&meta, &store, 0, "alice", 3, 2, 5);
    let work = TempDir::new().unwrap();
    let src = write_source(&work, "f.bin", &patterned(10_000));

    // One of the five reserved providers refuses the shard.
    store.set_down("p2.test:8003");
    let err = renter.upload_file(&src, "f.bin").await.unwrap_err();
    assert!(matches!(err, Error::Network(_)));

    // The placements that landed were deleted, no record was written,
    // and the carved blobs flowed back into the freelist.
    assert_eq!(store.block_count(), 0);
    assert!(meta.files.lock().unwrap().is_empty());
    assert_eq!(
        renter.storage().available_storage().await,
        5 * 10 * 1024 * 1024
    );
}

#[tokio::test]
async fn directory_round_trip_expands_by_name_prefix() {
    let meta = MemoryMeta::new();
    let store = MemoryBlockStore::new();
    let renter = make_renter(&meta, &store, 0, "alice", 2, 1, 3);
    let work = TempDir::new().unwrap();

    let root = renter.create_dir("docs").await.unwrap();
    renter.create_dir("docs/sub").await.unwrap();
    let a = write_source(&work, "a.txt", b"top-level child");
    let b = write_source(&work, "b.txt", b"nested child");
    renter.upload_file(&a, "docs/a.txt").await.unwrap();
    renter.upload_file(&b, "docs/sub/b.txt").await.unwrap();
    // Similar names outside the folder must not be swept in.
    let stray = write_source(&work, "stray.txt", b"not a child");
    renter.upload_file(&stray, "docs-old.txt").await.unwrap();

    let dest = work.path().join("out");
    let info = renter
        .download(&root.id, Some(dest.clone()), None)
        .await
        .unwrap();

    assert_eq!(read(&dest.join("a.txt")), b"top-level child");
    assert_eq!(read(&dest.join("sub/b.txt")), b"nested child");
    assert!(!dest.join("../docs-old.txt").exists());
    // Folder, subfolder, and two children reported.
    assert_eq!(info.files.len(), 4);
}

#[tokio::test]
async fn directory_download_names_the_failing_child() {
    let meta = MemoryMeta::new();
    let store = MemoryBlockStore::new();
    let renter = make_renter(&meta, &store, 2, "erin", 2, 1, 3);
    let work = TempDir::new().unwrap();

    let root = renter.create_dir("backup").await.unwrap();
    let a = write_source(&work, "a.txt", b"will be lost");
    renter.upload_file(&a, "backup/a.txt").await.unwrap();
    for blob in provider_blobs(3) {
        store.set_down(&blob.addr);
    }

    let err = renter
        .download(&root.id, Some(work.path().join("out")), None)
        .await
        .unwrap_err();
    match err {
        Error::ChildDownload { name, .. } => assert_eq!(name, "backup/a.txt"),
        other => panic!("expected a child failure, got {other}"),
    }
}

#[tokio::test]
async fn round_trips_across_shard_boundaries() {
    let meta = MemoryMeta::new();
    let store = MemoryBlockStore::new();
    let renter = make_renter(&meta, &store, 0, "alice", 3, 2, 5);
    let work = TempDir::new().unwrap();

    for (i, size) in [1usize, 10, 4096, 3 * 64 * 1024 + 5].into_iter().enumerate() {
        let contents = patterned(size);
        let src = write_source(&work, &format!("in{i}"), &contents);
        let name = format!("file-{size}");
        let info = renter.upload_file(&src, &name).await.unwrap();

        let version = meta.file(&info.file_id).versions[0].clone();
        assert!(version.padding_bytes < version.blocks[0].size);

        let dest = work.path().join(format!("out{i}"));
        renter
            .download(&info.file_id, Some(dest.clone()), None)
            .await
            .unwrap();
        assert_eq!(read(&dest), contents, "size {size} round trip");
    }
}
