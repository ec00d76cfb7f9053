//! File cache facade
//!
//! Wires the registry, coordinator, transfer engine and eviction manager
//! together behind the get/put/delete interface the transport calls into.

use crate::coordinator::{ByteStream, FetchCoordinator, Origin};
use crate::error::{CacheError, Result};
use crate::eviction::{EvictionManager, SweepReport};
use crate::registry::{EvictionLimits, Lease, Progress, Registry};
use crate::store::{BackingStore, FsStore, StoreId};
use crate::transfer::{ByteRange, ChunkStream, TransferEngine};
use crate::types::{CacheConfig, CacheKey, CacheStats, EntryInfo, EntryState, Manifest};
use byte_range_parser::{RangeSpec, ResolvedRange};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How the entry looked when the request attached to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetStatus {
    /// Entry was Ready
    Found,
    /// Entry was still being populated; the body follows the population
    NotFoundYet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    Deleted,
    NotFound,
}

/// Result of a GET
pub struct GetResponse {
    pub status: GetStatus,
    /// Metadata of the generation being served. `size` is `None` while an
    /// unranged read follows a population still in progress.
    pub info: EntryInfo,
    /// Resolved range for partial responses
    pub range: Option<ResolvedRange>,
    pub body: ChunkStream,
}

/// Streaming file cache
pub struct FileCache {
    config: CacheConfig,
    store: Arc<dyn BackingStore>,
    registry: Arc<Registry>,
    coordinator: FetchCoordinator,
    engine: TransferEngine,
    eviction: Arc<EvictionManager>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FileCache {
    pub fn new(config: CacheConfig, store: Arc<dyn BackingStore>) -> Self {
        let registry = Registry::new();
        let limits = EvictionLimits::from(&config);
        Self {
            coordinator: FetchCoordinator::new(
                registry.clone(),
                store.clone(),
                config.chunk_size,
                limits,
            ),
            engine: TransferEngine::new(store.clone(), config.chunk_size),
            eviction: Arc::new(EvictionManager::new(registry.clone(), store.clone(), limits)),
            registry,
            store,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache backed by the filesystem under `config.root_dir`
    pub fn filesystem(config: CacheConfig) -> Self {
        let store = Arc::new(FsStore::new(config.root_dir.clone()));
        Self::new(config, store)
    }

    /// Populate GET misses from `origin`
    pub fn with_origin(mut self, origin: Arc<dyn Origin>) -> Self {
        self.coordinator.set_origin(origin);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Prepare the store and re-register committed objects from a previous
    /// run. Call once before serving requests.
    ///
    /// Per key the newest generation whose object matches its manifest is
    /// kept; everything else in the store is deleted.
    pub async fn init(&self) -> Result<()> {
        self.store.init().await?;
        let listing = self.store.list().await?;

        let mut stale: HashSet<StoreId> = HashSet::new();
        let mut latest: HashMap<CacheKey, (StoreId, Manifest)> = HashMap::new();

        for (id, manifest) in listing.manifests {
            let Some(key) = CacheKey::from_hex(&manifest.key) else {
                warn!(object = %id.object_name(), "Manifest has an undecodable key");
                stale.insert(id);
                continue;
            };
            if StoreId::new(&key, manifest.generation) != id {
                warn!(object = %id.object_name(), "Manifest does not match its object");
                stale.insert(id);
                continue;
            }
            let length = self.store.durable_length(&id).await?;
            if length != manifest.size {
                warn!(
                    key = %key,
                    expected = manifest.size,
                    found = length,
                    "Object length differs from manifest"
                );
                stale.insert(id);
                continue;
            }

            match latest.get(&key) {
                Some((_, current)) if current.generation >= manifest.generation => {
                    stale.insert(id);
                }
                _ => {
                    if let Some((older, _)) = latest.insert(key, (id, manifest)) {
                        stale.insert(older);
                    }
                }
            }
        }

        let kept: HashSet<&StoreId> = latest.values().map(|(id, _)| id).collect();
        for id in listing.objects {
            if !kept.contains(&id) {
                stale.insert(id);
            }
        }
        drop(kept);

        for id in &stale {
            if let Err(e) = self.store.delete(id).await {
                warn!(object = %id.object_name(), error = %e, "Failed to remove stale object");
            }
        }

        // Oldest first, so recovered entries keep their relative LRU order
        let mut restored: Vec<(CacheKey, Manifest)> = latest
            .into_iter()
            .map(|(key, (_, manifest))| (key, manifest))
            .collect();
        restored.sort_by_key(|(_, manifest)| manifest.modified_at);
        for (key, manifest) in &restored {
            self.registry.restore(key.clone(), manifest);
        }

        info!(
            restored = restored.len(),
            removed = stale.len(),
            occupied = self.registry.occupied(),
            "Cache initialized"
        );
        Ok(())
    }

    /// Serve `key`, optionally restricted to `range`.
    ///
    /// A miss triggers population through the origin when one is configured;
    /// concurrent misses share that population. Without a range the body
    /// follows the population as bytes land. A bounded range is served once
    /// its bytes are durable; other ranges wait for the final size so they
    /// can be resolved.
    pub async fn handle_get(&self, key: &CacheKey, range: Option<RangeSpec>) -> Result<GetResponse> {
        let (lease, created) = match self.coordinator.acquire(key) {
            Ok(acquired) => acquired,
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let status = match lease.progress() {
            Progress::Complete { .. } => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                GetStatus::Found
            }
            Progress::Failed(err) => return Err(err),
            Progress::Writing { .. } => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                GetStatus::NotFoundYet
            }
        };
        debug!(key = %key, generation = lease.generation(), created, ?status, "GET");

        match range {
            Some(spec) => {
                if let Some(resolved) = durable_range(&lease, spec).await? {
                    let info = lease.info().ok_or(CacheError::NotFound)?;
                    return Ok(GetResponse {
                        status,
                        info,
                        range: Some(resolved),
                        body: self
                            .engine
                            .stream(lease, ByteRange::new(resolved.start, resolved.end)),
                    });
                }
                let size = lease.settled().await?;
                self.ranged(lease, status, spec, size)
            }
            None => {
                first_bytes(&lease).await?;
                let info = lease.info().ok_or(CacheError::NotFound)?;
                Ok(GetResponse {
                    status,
                    info,
                    range: None,
                    body: self.engine.stream(lease, ByteRange::full()),
                })
            }
        }
    }

    fn ranged(&self, lease: Lease, status: GetStatus, spec: RangeSpec, size: u64) -> Result<GetResponse> {
        let info = lease.info().ok_or(CacheError::NotFound)?;

        // Any range of empty content is served as the whole (empty) body
        if size == 0 {
            return Ok(GetResponse {
                status,
                info,
                range: None,
                body: self.engine.stream(lease, ByteRange::full()),
            });
        }

        let resolved = spec.resolve(size).ok_or_else(|| CacheError::RangeNotSatisfiable {
            start: spec.offsets().map_or(size, |(start, _)| start),
            size,
        })?;

        Ok(GetResponse {
            status,
            info,
            range: Some(resolved),
            body: self
                .engine
                .stream(lease, ByteRange::new(resolved.start, resolved.end)),
        })
    }

    /// Metadata of a Ready entry; never triggers population
    pub fn head(&self, key: &CacheKey) -> Result<EntryInfo> {
        match self.registry.info(key) {
            Some(info) if info.state == EntryState::Ready => Ok(info),
            _ => Err(CacheError::NotFound),
        }
    }

    /// Store `body` as the new content of `key`.
    ///
    /// Resolves once the new generation is Ready. Reads that already hold
    /// the previous generation keep streaming it.
    pub async fn handle_put(
        &self,
        key: &CacheKey,
        content_type: Option<String>,
        body: ByteStream,
    ) -> Result<EntryInfo> {
        let lease = self.coordinator.replace(key, content_type, body).await?;
        let info = lease.info().ok_or(CacheError::NotFound)?;
        drop(lease);

        // The replaced generation may already be free to reclaim
        if self.registry.exceeds(self.eviction.limits()) {
            self.eviction.sweep().await;
        } else {
            self.eviction.reclaim().await;
        }
        Ok(info)
    }

    /// Make `key` absent. Transfers already running finish normally and its
    /// storage is reclaimed after the last of them.
    pub async fn handle_delete(&self, key: &CacheKey) -> DeleteStatus {
        if !self.registry.mark_deleting(key) {
            return DeleteStatus::NotFound;
        }
        self.eviction.reclaim().await;
        info!(key = %key, "Deleted entry");
        DeleteStatus::Deleted
    }

    /// Run one eviction sweep now
    pub async fn sweep(&self) -> SweepReport {
        self.eviction.sweep().await
    }

    /// Start the background sweeper on the configured interval
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        Arc::clone(&self.eviction).spawn(self.config.sweep_interval)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.registry.len(),
            total_size: self.registry.occupied(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            populations: self.coordinator.populations(),
            evictions: self.eviction.evictions(),
        }
    }
}

/// Wait until the population has made some bytes durable or settled, so
/// a failure before the first byte is reported as an error instead of a
/// truncated body.
async fn first_bytes(lease: &Lease) -> Result<()> {
    let mut rx = lease.subscribe();
    let progress = rx
        .wait_for(|p| match p {
            Progress::Writing { durable } => *durable > 0,
            _ => true,
        })
        .await
        .map_err(|_| CacheError::Cancelled)?
        .clone();
    match progress {
        Progress::Failed(err) => Err(err),
        _ => Ok(()),
    }
}

/// For a bounded range, wait until either every requested byte is durable
/// or the population settles. Returns the range in the first case; `None`
/// means the caller should resolve against the final size.
async fn durable_range(lease: &Lease, spec: RangeSpec) -> Result<Option<ResolvedRange>> {
    let RangeSpec::Bounded { first, last } = spec else {
        return Ok(None);
    };
    let end = last.saturating_add(1);
    let mut rx = lease.subscribe();
    let progress = rx
        .wait_for(|p| match p {
            Progress::Writing { durable } => *durable >= end,
            _ => true,
        })
        .await
        .map_err(|_| CacheError::Cancelled)?
        .clone();
    match progress {
        Progress::Writing { .. } => Ok(Some(ResolvedRange { start: first, end })),
        Progress::Failed(err) => Err(err),
        Progress::Complete { .. } => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Upstream;
    use crate::store::{MemoryStore, StoreListing};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream::{self, StreamExt};
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn config(capacity_bytes: u64) -> CacheConfig {
        CacheConfig {
            capacity_bytes,
            chunk_size: 4096,
            ..CacheConfig::default()
        }
    }

    fn content(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
    }

    fn body(data: &[u8]) -> ByteStream {
        let chunks: Vec<io::Result<Bytes>> = data
            .chunks(7000)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks).boxed()
    }

    async fn read_all(response: GetResponse) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    /// Serves fixed content after a delay and counts fetches
    struct SlowOrigin {
        calls: AtomicUsize,
        data: Bytes,
        delay: Duration,
        missing: bool,
    }

    impl SlowOrigin {
        fn new(data: &[u8], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                data: Bytes::copy_from_slice(data),
                delay,
                missing: false,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Origin for SlowOrigin {
        async fn fetch(&self, _key: &CacheKey) -> Result<Option<Upstream>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.missing {
                return Ok(None);
            }
            let data = self.data.clone();
            let delay = self.delay;
            Ok(Some(Upstream {
                content_type: Some("application/octet-stream".to_string()),
                body: stream::once(async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, io::Error>(data)
                })
                .boxed(),
            }))
        }
    }

    /// Sends `head` at once and `tail` only after `release` is notified
    struct GatedOrigin {
        head: Bytes,
        tail: Bytes,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Origin for GatedOrigin {
        async fn fetch(&self, _key: &CacheKey) -> Result<Option<Upstream>> {
            let head = self.head.clone();
            let tail = self.tail.clone();
            let release = self.release.clone();
            let rest = stream::once(async move {
                release.notified().await;
                Ok::<_, io::Error>(tail)
            });
            Ok(Some(Upstream {
                content_type: None,
                body: stream::once(async move { Ok::<_, io::Error>(head) })
                    .chain(rest)
                    .boxed(),
            }))
        }
    }

    /// Memory store whose writes can be made to fail
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl BackingStore for FlakyStore {
        async fn write(&self, id: &StoreId, offset: u64, data: &[u8]) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(io::Error::other("simulated device error").into());
            }
            self.inner.write(id, offset, data).await
        }

        async fn read(&self, id: &StoreId, offset: u64, len: usize) -> Result<Bytes> {
            self.inner.read(id, offset, len).await
        }

        async fn delete(&self, id: &StoreId) -> Result<()> {
            self.inner.delete(id).await
        }

        async fn durable_length(&self, id: &StoreId) -> Result<u64> {
            self.inner.durable_length(id).await
        }

        async fn commit(&self, id: &StoreId, manifest: &Manifest) -> Result<()> {
            self.inner.commit(id, manifest).await
        }

        async fn list(&self) -> Result<StoreListing> {
            self.inner.list().await
        }
    }

    fn memory_cache(capacity_bytes: u64) -> (FileCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (FileCache::new(config(capacity_bytes), store.clone()), store)
    }

    #[tokio::test]
    async fn test_concurrent_ranged_reads_after_put() {
        let (cache, _) = memory_cache(u64::MAX);
        let cache = Arc::new(cache);
        let key = CacheKey::from("a");
        let data = content(200_000, 0);

        let info = cache.handle_put(&key, None, body(&data)).await.unwrap();
        assert_eq!(info.size, Some(200_000));
        assert_eq!(info.state, EntryState::Ready);

        let ranges = [(0u64, 99_999u64), (100_000, 199_999)];
        let handles: Vec<_> = ranges
            .into_iter()
            .map(|(first, last)| {
                let cache = cache.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    let response = cache
                        .handle_get(&key, Some(RangeSpec::Bounded { first, last }))
                        .await
                        .unwrap();
                    assert_eq!(response.range, Some(ResolvedRange { start: first, end: last + 1 }));
                    read_all(response).await.unwrap()
                })
            })
            .collect();

        let mut joined = Vec::new();
        for handle in handles {
            joined.extend(handle.await.unwrap());
        }
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_population() {
        let data = content(10_000, 1);
        let origin = SlowOrigin::new(&data, Duration::from_millis(50));
        let (cache, _) = memory_cache(u64::MAX);
        let cache = Arc::new(cache.with_origin(origin.clone()));
        let key = CacheKey::from("b");

        let first = {
            let (cache, key) = (cache.clone(), key.clone());
            tokio::spawn(async move { read_all(cache.handle_get(&key, None).await?).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        let second = cache.handle_get(&key, None).await.unwrap();
        assert_eq!(second.status, GetStatus::NotFoundYet);

        assert_eq!(read_all(second).await.unwrap(), data);
        assert_eq!(first.await.unwrap().unwrap(), data);
        assert_eq!(origin.calls(), 1);
        assert_eq!(cache.stats().populations, 1);

        let again = cache.handle_get(&key, None).await.unwrap();
        assert_eq!(again.status, GetStatus::Found);
        assert_eq!(again.info.size, Some(10_000));
        assert!(again.info.etag.is_some());
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_failed_population_reaches_every_waiter() {
        let store = Arc::new(FlakyStore::default());
        store.fail_writes.store(true, Ordering::SeqCst);
        let origin = SlowOrigin::new(b"upstream", Duration::from_millis(20));
        let cache = Arc::new(FileCache::new(config(u64::MAX), store.clone()).with_origin(origin.clone()));
        let key = CacheKey::from("c");

        let initiator = {
            let (cache, key) = (cache.clone(), key.clone());
            tokio::spawn(async move { cache.handle_get(&key, None).await.map(|_| ()) })
        };
        let waiter = cache.handle_get(&key, Some(RangeSpec::From(0))).await;

        assert!(matches!(waiter, Err(CacheError::PopulationFailed(_))));
        assert!(matches!(initiator.await.unwrap(), Err(CacheError::PopulationFailed(_))));

        // Failure is sticky until the content is replaced
        let later = cache.handle_get(&key, None).await;
        assert!(matches!(later, Err(CacheError::PopulationFailed(_))));
        assert_eq!(origin.calls(), 1);

        // A sweep without capacity pressure does not clear it either
        let report = cache.sweep().await;
        assert_eq!(report.evicted, 0);
        let after_sweep = cache.handle_get(&key, None).await;
        assert!(matches!(after_sweep, Err(CacheError::PopulationFailed(_))));
        assert_eq!(origin.calls(), 1);

        store.fail_writes.store(false, Ordering::SeqCst);
        let info = cache
            .handle_put(&key, Some("text/plain".into()), body(b"fresh content"))
            .await
            .unwrap();
        assert_eq!(info.state, EntryState::Ready);

        let response = cache.handle_get(&key, None).await.unwrap();
        assert_eq!(response.info.content_type.as_deref(), Some("text/plain"));
        assert_eq!(read_all(response).await.unwrap(), b"fresh content");
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let (cache, _) = memory_cache(200);
        let a = CacheKey::from("a");
        let b = CacheKey::from("b");
        let c = CacheKey::from("c");

        cache.handle_put(&a, None, body(&content(100, 1))).await.unwrap();
        cache.handle_put(&b, None, body(&content(100, 2))).await.unwrap();
        read_all(cache.handle_get(&a, None).await.unwrap()).await.unwrap();
        cache.handle_put(&c, None, body(&content(100, 3))).await.unwrap();

        assert!(cache.head(&a).is_ok());
        assert!(cache.head(&b).is_err());
        assert!(cache.head(&c).is_ok());
        assert!(cache.stats().total_size <= 200);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_open_reader_blocks_eviction() {
        let (cache, _) = memory_cache(100);
        let a = CacheKey::from("a");
        let data = content(100, 4);
        cache.handle_put(&a, None, body(&data)).await.unwrap();

        let reader = cache.handle_get(&a, None).await.unwrap();
        let b = CacheKey::from("b");
        cache.handle_put(&b, None, body(&content(100, 5))).await.unwrap();

        // "a" is older but pinned, so the only evictable entry goes
        assert!(cache.head(&a).is_ok());
        assert!(cache.head(&b).is_err());
        assert_eq!(read_all(reader).await.unwrap(), data);
        assert!(cache.stats().total_size <= 100);
    }

    #[tokio::test]
    async fn test_delete_lets_running_reads_finish() {
        let (cache, store) = memory_cache(u64::MAX);
        let key = CacheKey::from("a");
        let data = content(20_000, 6);
        let info = cache.handle_put(&key, None, body(&data)).await.unwrap();
        let id = StoreId::new(&key, info.generation);

        let reader = cache.handle_get(&key, None).await.unwrap();
        assert_eq!(cache.handle_delete(&key).await, DeleteStatus::Deleted);
        assert_eq!(cache.handle_delete(&key).await, DeleteStatus::NotFound);
        assert!(cache.head(&key).is_err());
        assert!(matches!(cache.handle_get(&key, None).await, Err(CacheError::NotFound)));

        assert_eq!(read_all(reader).await.unwrap(), data);
        cache.sweep().await;
        assert_eq!(store.durable_length(&id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_put_keeps_old_generation_for_running_reads() {
        let (cache, _) = memory_cache(u64::MAX);
        let key = CacheKey::from("a");
        let old = content(30_000, 7);
        let new = content(12_000, 8);

        cache.handle_put(&key, None, body(&old)).await.unwrap();
        let old_reader = cache.handle_get(&key, None).await.unwrap();

        let info = cache.handle_put(&key, None, body(&new)).await.unwrap();
        assert!(info.generation > old_reader.info.generation);

        assert_eq!(read_all(old_reader).await.unwrap(), old);
        let current = cache.handle_get(&key, None).await.unwrap();
        assert_eq!(read_all(current).await.unwrap(), new);
    }

    #[tokio::test]
    async fn test_range_past_end_is_not_satisfiable() {
        let (cache, _) = memory_cache(u64::MAX);
        let key = CacheKey::from("a");
        cache.handle_put(&key, None, body(b"0123456789")).await.unwrap();

        let err = cache
            .handle_get(&key, Some(RangeSpec::From(10)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CacheError::RangeNotSatisfiable { start: 10, size: 10 }));

        let tail = cache.handle_get(&key, Some(RangeSpec::Suffix(3))).await.unwrap();
        assert_eq!(tail.range, Some(ResolvedRange { start: 7, end: 10 }));
        assert_eq!(read_all(tail).await.unwrap(), b"789");
    }

    #[tokio::test]
    async fn test_bounded_range_served_before_population_completes() {
        let data = content(12_288, 10);
        let release = Arc::new(Notify::new());
        let origin = Arc::new(GatedOrigin {
            head: Bytes::copy_from_slice(&data[..8_192]),
            tail: Bytes::copy_from_slice(&data[8_192..]),
            release: release.clone(),
        });
        let (cache, _) = memory_cache(u64::MAX);
        let cache = cache.with_origin(origin);
        let key = CacheKey::from("progressive");

        let response = tokio::time::timeout(
            Duration::from_secs(5),
            cache.handle_get(&key, Some(RangeSpec::Bounded { first: 100, last: 4_195 })),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(response.status, GetStatus::NotFoundYet);
        assert_eq!(response.info.size, None);
        assert_eq!(response.range, Some(ResolvedRange { start: 100, end: 4_196 }));
        assert_eq!(read_all(response).await.unwrap(), &data[100..4_196]);
        assert_eq!(cache.registry().info(&key).unwrap().state, EntryState::Pending);

        release.notify_one();
        let tail = cache
            .handle_get(&key, Some(RangeSpec::From(8_000)))
            .await
            .unwrap();
        assert_eq!(tail.info.size, Some(12_288));
        assert_eq!(read_all(tail).await.unwrap(), &data[8_000..]);
    }

    #[tokio::test]
    async fn test_miss_without_origin_creates_nothing() {
        let (cache, _) = memory_cache(u64::MAX);
        let err = cache.handle_get(&CacheKey::from("nope"), None).await.err().unwrap();
        assert!(err.is_not_found());
        assert!(cache.registry().is_empty());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_origin_miss_leaves_key_absent() {
        let origin = Arc::new(SlowOrigin {
            calls: AtomicUsize::new(0),
            data: Bytes::new(),
            delay: Duration::ZERO,
            missing: true,
        });
        let (cache, _) = memory_cache(u64::MAX);
        let cache = cache.with_origin(origin.clone());
        let key = CacheKey::from("gone");

        assert!(cache.handle_get(&key, None).await.err().unwrap().is_not_found());
        assert!(cache.registry().info(&key).is_none());

        // A later request asks the origin again
        assert!(cache.handle_get(&key, None).await.is_err());
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test]
    async fn test_population_outlives_abandoned_request() {
        let data = content(5_000, 9);
        let origin = SlowOrigin::new(&data, Duration::from_millis(20));
        let (cache, _) = memory_cache(u64::MAX);
        let cache = cache.with_origin(origin.clone());
        let key = CacheKey::from("walkaway");

        let abandoned = tokio::time::timeout(Duration::from_millis(1), cache.handle_get(&key, None)).await;
        assert!(abandoned.is_err());

        let response = cache.handle_get(&key, Some(RangeSpec::From(0))).await.unwrap();
        assert_eq!(read_all(response).await.unwrap(), data);
        assert_eq!(origin.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_content_round_trip() {
        let (cache, _) = memory_cache(u64::MAX);
        let key = CacheKey::from("empty");
        let info = cache.handle_put(&key, None, body(b"")).await.unwrap();
        assert_eq!(info.size, Some(0));

        let response = cache.handle_get(&key, Some(RangeSpec::From(0))).await.unwrap();
        assert!(response.range.is_none());
        assert!(read_all(response).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recovers_committed_entries_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            root_dir: dir.path().to_path_buf(),
            ..config(u64::MAX)
        };
        let a = CacheKey::from("a");
        let b = CacheKey::from("b");

        {
            let cache = FileCache::filesystem(config.clone());
            cache.init().await.unwrap();
            cache.handle_put(&a, None, body(b"first")).await.unwrap();
            cache.handle_put(&b, Some("text/plain".into()), body(b"bee")).await.unwrap();
            cache.handle_put(&a, None, body(b"second")).await.unwrap();
        }
        // Leftover of a population that never committed
        tokio::fs::write(dir.path().join(StoreId::new(&CacheKey::from("x"), 99).object_name()), b"partial")
            .await
            .unwrap();

        let cache = FileCache::filesystem(config);
        cache.init().await.unwrap();

        assert_eq!(cache.stats().entries, 2);
        let response = cache.handle_get(&a, None).await.unwrap();
        assert_eq!(response.status, GetStatus::Found);
        assert_eq!(read_all(response).await.unwrap(), b"second");
        assert_eq!(cache.head(&b).unwrap().content_type.as_deref(), Some("text/plain"));

        // New generations never collide with recovered ones
        let info = cache.handle_put(&b, None, body(b"again")).await.unwrap();
        assert!(info.generation > 3);

        let mut files = 0;
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while entries.next_entry().await.unwrap().is_some() {
            files += 1;
        }
        // One object and one manifest for each key
        assert_eq!(files, 4);
    }

    #[tokio::test]
    async fn test_recovered_entries_keep_their_age() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            root_dir: dir.path().to_path_buf(),
            ..config(u64::MAX)
        };
        let old = CacheKey::from("old");

        {
            let cache = FileCache::filesystem(config.clone());
            cache.init().await.unwrap();
            cache.handle_put(&old, None, body(b"stale bytes")).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let cache = FileCache::filesystem(CacheConfig {
            max_age: Some(Duration::from_millis(100)),
            ..config
        });
        cache.init().await.unwrap();
        assert!(cache.head(&old).is_ok());

        let report = cache.sweep().await;
        assert_eq!(report.evicted, 1);
        assert!(cache.head(&old).is_err());
        assert_eq!(cache.stats().entries, 0);
    }
}
