//! Storage manager
//!
//! Tracks the storage available for use by the renter, serving as a
//! local (possibly inconsistent) cache of the freelist held by the
//! metaserver. Each of the renter's storage contracts has at most one
//! blob in the freelist at any time.
//!
//! The cache is refreshed from a [`FreelistSource`]; the refresh
//! replaces the freelist wholesale, so an in-flight placement can be
//! temporarily over- or under-counted. The metaserver remains the
//! source of truth, which bounds the damage to the next refresh.
//!
//! Safe for use from multiple tasks.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use skerry_core::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Freelist entries smaller than this are dropped after a successful
/// placement; remnants below it are not worth tracking.
pub const MIN_BLOB_SIZE: u64 = 1 << 20;

/// A slice of unused storage under one contract, as believed locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageBlob {
    pub provider_id: String,
    pub addr: String,
    /// Unused bytes under the contract.
    pub amount: u64,
    pub contract_id: String,
}

/// Time source for offline bookkeeping and refresh scheduling.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The real clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Produces a fresh view of the renter's free storage.
#[async_trait]
pub trait FreelistSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<StorageBlob>>;
}

struct State {
    freelist: Vec<StorageBlob>,
    /// Providers not to be handed out until their release time.
    offline: HashMap<String, Instant>,
    last_refresh: Option<Instant>,
    rng: StdRng,
}

/// Thread-safe cache of free storage blobs across the renter's
/// contracts, with a directory of currently offline providers.
pub struct StorageManager {
    state: Mutex<State>,
    source: Arc<dyn FreelistSource>,
    refresh_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl StorageManager {
    pub fn new(
        blobs: Vec<StorageBlob>,
        source: Arc<dyn FreelistSource>,
        refresh_interval: Duration,
        clock: Arc<dyn Clock>,
        rng: StdRng,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                freelist: blobs,
                offline: HashMap::new(),
                last_refresh: None,
                rng,
            }),
            source,
            refresh_interval,
            clock,
        }
    }

    /// Total storage available to the renter, including storage behind
    /// currently offline providers. Always refreshes the cache first.
    pub async fn available_storage(&self) -> u64 {
        self.refresh().await;
        let state = self.state.lock().unwrap();
        state.freelist.iter().map(|b| b.amount).sum()
    }

    /// Return a blob to the freelist, merging with the entry for the
    /// same contract if one exists.
    pub fn add_blob(&self, blob: StorageBlob) {
        let mut state = self.state.lock().unwrap();
        state.add_blob(blob);
    }

    pub fn add_blobs(&self, blobs: Vec<StorageBlob>) {
        let mut state = self.state.lock().unwrap();
        for blob in blobs {
            state.add_blob(blob);
        }
    }

    /// Mark providers as offline until the given release time. Blobs on
    /// offline providers are not handed out by [`find_storage`].
    ///
    /// [`find_storage`]: StorageManager::find_storage
    pub fn mark_offline(&self, provider_ids: &[String], until: Instant) {
        let mut state = self.state.lock().unwrap();
        for id in provider_ids {
            let release = state.offline.entry(id.clone()).or_insert(until);
            if *release < until {
                *release = until;
            }
        }
    }

    /// Carve `nblobs` blobs of exactly `blob_size` bytes out of the
    /// freelist for an upload. On success the returned [`Reservation`]
    /// owns the blobs; dropping it uncommitted returns them.
    pub async fn find_storage(
        self: &Arc<Self>,
        nblobs: usize,
        blob_size: u64,
    ) -> Result<Reservation> {
        self.maybe_refresh().await;
        let mut state = self.state.lock().unwrap();
        let now = self.clock.now();
        state.offline.retain(|_, release| *release >= now);
        let blobs = state.find_storage(nblobs, blob_size)?;
        debug!(count = blobs.len(), blob_size, "reserved storage blobs");
        Ok(Reservation {
            manager: Arc::clone(self),
            blobs,
            committed: false,
        })
    }

    async fn maybe_refresh(&self) {
        let stale = {
            let state = self.state.lock().unwrap();
            // An empty freelist always warrants a fresh look.
            state.freelist.is_empty()
                || match state.last_refresh {
                    None => true,
                    Some(at) => self.clock.now().duration_since(at) > self.refresh_interval,
                }
        };
        if stale {
            self.refresh().await;
        }
    }

    async fn refresh(&self) {
        match self.source.fetch().await {
            Ok(mut blobs) => {
                let now = self.clock.now();
                let mut state = self.state.lock().unwrap();
                // Catalog order biases placement toward the first
                // providers listed; shuffle before installing.
                blobs.shuffle(&mut state.rng);
                state.freelist = blobs;
                state.last_refresh = Some(now);
            }
            Err(err) => {
                warn!(error = %err, "freelist refresh failed; keeping cached view");
            }
        }
    }
}

impl State {
    fn add_blob(&mut self, blob: StorageBlob) {
        for existing in &mut self.freelist {
            if existing.contract_id == blob.contract_id {
                existing.amount += blob.amount;
                return;
            }
        }
        self.freelist.push(blob);
    }

    /// Freelist indices usable for blobs of `blob_size`, scanned from a
    /// random rotation so the front of the list is not hot-spotted.
    fn find_candidates(&mut self, blob_size: u64) -> Vec<usize> {
        if self.freelist.is_empty() {
            return Vec::new();
        }
        let start = self.rng.gen_range(0..self.freelist.len());
        (0..self.freelist.len())
            .filter_map(|offset| {
                let idx = (start + offset) % self.freelist.len();
                let blob = &self.freelist[idx];
                (blob.amount >= blob_size && !self.offline.contains_key(&blob.provider_id))
                    .then_some(idx)
            })
            .collect()
    }

    fn find_storage(&mut self, nblobs: usize, blob_size: u64) -> Result<Vec<StorageBlob>> {
        let mut candidates = self.find_candidates(blob_size);
        let mut blobs: Vec<StorageBlob> = Vec::new();

        // Walk the candidates cyclically, carving one blob per step, so
        // the placement spreads across distinct contracts when it can.
        let mut i = 0;
        while blobs.len() < nblobs && !candidates.is_empty() {
            let idx = candidates[i];
            let source = &mut self.freelist[idx];
            blobs.push(StorageBlob {
                provider_id: source.provider_id.clone(),
                addr: source.addr.clone(),
                amount: blob_size,
                contract_id: source.contract_id.clone(),
            });
            source.amount -= blob_size;
            if source.amount < blob_size {
                candidates.remove(i);
            }
            if candidates.is_empty() {
                break;
            }
            i = (i + 1) % candidates.len();
        }

        if blobs.len() < nblobs {
            // Roll the partial carve back before failing.
            for blob in blobs {
                self.add_blob(blob);
            }
            return Err(Error::InsufficientStorage {
                blobs: nblobs,
                blob_size,
            });
        }

        self.freelist.retain(|blob| blob.amount >= MIN_BLOB_SIZE);
        Ok(blobs)
    }
}

/// Blobs carved out of the freelist for one upload. Dropped without
/// [`commit`], the blobs flow back into the freelist, so a failed or
/// cancelled pipeline cannot leak capacity.
///
/// [`commit`]: Reservation::commit
pub struct Reservation {
    manager: Arc<StorageManager>,
    blobs: Vec<StorageBlob>,
    committed: bool,
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("blobs", &self.blobs)
            .field("committed", &self.committed)
            .finish()
    }
}

impl Reservation {
    pub fn blobs(&self) -> &[StorageBlob] {
        &self.blobs
    }

    /// Consume the reservation; the blobs are now in use by stored
    /// blocks and must not return to the freelist.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed && !self.blobs.is_empty() {
            self.manager.add_blobs(std::mem::take(&mut self.blobs));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            }
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }
    }

    struct StaticSource(Vec<StorageBlob>);

    #[async_trait]
    impl FreelistSource for StaticSource {
        async fn fetch(&self) -> Result<Vec<StorageBlob>> {
            Ok(self.0.clone())
        }
    }

    /// Source for tests that seed the freelist directly: the fetch
    /// failure makes every refresh keep the cached view.
    struct UnreachableSource;

    #[async_trait]
    impl FreelistSource for UnreachableSource {
        async fn fetch(&self) -> Result<Vec<StorageBlob>> {
            Err(Error::Network("metaserver unreachable".to_string()))
        }
    }

    fn blob(contract: &str, provider: &str, amount: u64) -> StorageBlob {
        StorageBlob {
            provider_id: provider.to_string(),
            addr: format!("{provider}.example:8003"),
            amount,
            contract_id: contract.to_string(),
        }
    }

    fn manager_with(blobs: Vec<StorageBlob>, clock: Arc<dyn Clock>) -> Arc<StorageManager> {
        Arc::new(StorageManager::new(
            blobs,
            Arc::new(UnreachableSource),
            Duration::from_secs(300),
            clock,
            StdRng::seed_from_u64(7),
        ))
    }

    #[tokio::test]
    async fn test_spreads_across_distinct_contracts() {
        let sm = manager_with(
            (0..5).map(|i| blob(&format!("c{i}"), &format!("p{i}"), MIN_BLOB_SIZE)).collect(),
            Arc::new(SystemClock),
        );
        let reservation = sm.find_storage(5, MIN_BLOB_SIZE).await.unwrap();
        let mut providers: Vec<_> = reservation
            .blobs()
            .iter()
            .map(|b| b.provider_id.clone())
            .collect();
        providers.sort();
        providers.dedup();
        assert_eq!(providers.len(), 5);
        reservation.commit();
    }

    #[tokio::test]
    async fn test_round_robins_back_across_large_entries() {
        let sm = manager_with(
            vec![
                blob("c0", "p0", 3 * MIN_BLOB_SIZE),
                blob("c1", "p1", 3 * MIN_BLOB_SIZE),
            ],
            Arc::new(SystemClock),
        );
        let reservation = sm.find_storage(6, MIN_BLOB_SIZE).await.unwrap();
        let from_p0 = reservation
            .blobs()
            .iter()
            .filter(|b| b.provider_id == "p0")
            .count();
        assert_eq!(from_p0, 3);
        assert_eq!(reservation.blobs().len(), 6);
        reservation.commit();
    }

    #[tokio::test]
    async fn test_rollback_preserves_freelist_total() {
        let sm = manager_with(
            vec![blob("c0", "p0", 2 * MIN_BLOB_SIZE), blob("c1", "p1", 2 * MIN_BLOB_SIZE)],
            Arc::new(SystemClock),
        );
        let err = sm.find_storage(5, MIN_BLOB_SIZE).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientStorage { blobs: 5, .. }));
        assert_eq!(sm.available_storage().await, 4 * MIN_BLOB_SIZE);
    }

    #[tokio::test]
    async fn test_offline_providers_are_skipped_until_release() {
        let clock = Arc::new(ManualClock::new());
        let sm = manager_with(
            vec![blob("c0", "p0", 4 * MIN_BLOB_SIZE), blob("c1", "p1", 4 * MIN_BLOB_SIZE)],
            clock.clone(),
        );
        sm.mark_offline(
            &["p0".to_string()],
            clock.now() + Duration::from_secs(60),
        );

        let reservation = sm.find_storage(2, MIN_BLOB_SIZE).await.unwrap();
        assert!(reservation.blobs().iter().all(|b| b.provider_id == "p1"));
        reservation.commit();

        // After the release time passes, p0 is usable again.
        clock.advance(Duration::from_secs(61));
        let reservation = sm.find_storage(4, MIN_BLOB_SIZE).await.unwrap();
        assert!(reservation.blobs().iter().any(|b| b.provider_id == "p0"));
        reservation.commit();
    }

    #[tokio::test]
    async fn test_mark_offline_keeps_latest_release_time() {
        let clock = Arc::new(ManualClock::new());
        let sm = manager_with(vec![blob("c0", "p0", 4 * MIN_BLOB_SIZE)], clock.clone());
        let far = clock.now() + Duration::from_secs(120);
        sm.mark_offline(&["p0".to_string()], far);
        // An earlier release must not shorten the penalty.
        sm.mark_offline(&["p0".to_string()], clock.now() + Duration::from_secs(10));

        clock.advance(Duration::from_secs(30));
        let err = sm.find_storage(1, MIN_BLOB_SIZE).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientStorage { .. }));
    }

    #[tokio::test]
    async fn test_small_remnants_are_pruned_after_success() {
        let sm = manager_with(
            vec![blob("c0", "p0", MIN_BLOB_SIZE + MIN_BLOB_SIZE / 2)],
            Arc::new(SystemClock),
        );
        let reservation = sm.find_storage(1, MIN_BLOB_SIZE).await.unwrap();
        reservation.commit();
        // The half-size remnant is below the tracking threshold.
        assert_eq!(sm.available_storage().await, 0);
    }

    #[tokio::test]
    async fn test_add_blob_merges_by_contract() {
        let sm = manager_with(vec![blob("c0", "p0", 2 * MIN_BLOB_SIZE)], Arc::new(SystemClock));
        sm.add_blob(blob("c0", "p0", MIN_BLOB_SIZE));
        sm.add_blob(blob("c1", "p1", MIN_BLOB_SIZE));
        assert_eq!(sm.available_storage().await, 4 * MIN_BLOB_SIZE);
        let state = sm.state.lock().unwrap();
        assert_eq!(state.freelist.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_freelist_refreshes_unconditionally() {
        let sm = Arc::new(StorageManager::new(
            Vec::new(),
            Arc::new(StaticSource(vec![blob("c0", "p0", 4 * MIN_BLOB_SIZE)])),
            Duration::from_secs(300),
            Arc::new(SystemClock),
            StdRng::seed_from_u64(7),
        ));
        let reservation = sm.find_storage(2, MIN_BLOB_SIZE).await.unwrap();
        assert_eq!(reservation.blobs().len(), 2);
        reservation.commit();
    }

    #[tokio::test]
    async fn test_dropped_reservation_returns_blobs() {
        let sm = manager_with(vec![blob("c0", "p0", 4 * MIN_BLOB_SIZE)], Arc::new(SystemClock));
        {
            let reservation = sm.find_storage(2, MIN_BLOB_SIZE).await.unwrap();
            assert_eq!(reservation.blobs().len(), 2);
            // Dropped uncommitted: a cancelled upload.
        }
        assert_eq!(sm.available_storage().await, 4 * MIN_BLOB_SIZE);
    }
}
