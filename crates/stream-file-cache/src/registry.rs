//! Entry registry
//!
//! Single source of truth for which entries exist and what state they are in.
//! Every mutation happens under one `std::sync::Mutex`, held only for
//! bookkeeping and never across an await. Population progress is published
//! through a per-entry `watch` channel so readers can follow a write as it
//! lands without polling.
//!
//! Each population attempt gets a fresh generation number that also serves
//! as the entry's identity. The key index points at the current generation.
//! Replaced or deleted generations move to `Deleting` and linger until their
//! last [`Lease`] is dropped, after which their storage is queued for
//! reclamation.

use crate::error::CacheError;
use crate::store::StoreId;
use crate::types::{CacheKey, EntryInfo, EntryState, Manifest};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::debug;

/// How far a population has got, as seen by readers
#[derive(Debug, Clone)]
pub enum Progress {
    /// Bytes `[0, durable)` are in the store and may be read
    Writing { durable: u64 },
    Complete { size: u64 },
    Failed(CacheError),
}

impl Progress {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Progress::Writing { .. })
    }
}

/// Limits applied by an eviction sweep
#[derive(Debug, Clone, Copy)]
pub struct EvictionLimits {
    pub capacity_bytes: u64,
    pub max_age: Option<Duration>,
    pub max_entries: Option<usize>,
}

struct Record {
    key: CacheKey,
    state: EntryState,
    size: Option<u64>,
    /// Bytes this generation occupies in the store
    stored: u64,
    content_type: Option<String>,
    etag: Option<String>,
    /// Wall clock, so ages survive a restart
    modified_at: DateTime<Utc>,
    /// Registry-wide access sequence number, larger is more recent
    last_access: u64,
    ref_count: usize,
    progress: watch::Sender<Progress>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<u64, Record>,
    index: HashMap<CacheKey, u64>,
    last_generation: u64,
    access_clock: u64,
    occupied: u64,
    doomed: VecDeque<StoreId>,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.access_clock += 1;
        self.access_clock
    }

    fn insert_pending(&mut self, key: &CacheKey) -> (u64, watch::Receiver<Progress>) {
        self.last_generation += 1;
        let generation = self.last_generation;
        let (tx, rx) = watch::channel(Progress::Writing { durable: 0 });
        let last_access = self.tick();

        self.records.insert(
            generation,
            Record {
                key: key.clone(),
                state: EntryState::Pending,
                size: None,
                stored: 0,
                content_type: None,
                etag: None,
                modified_at: Utc::now(),
                last_access,
                ref_count: 1,
                progress: tx,
            },
        );
        self.index.insert(key.clone(), generation);
        (generation, rx)
    }

    /// Take `generation` out of the index and drop it once unreferenced.
    fn retire(&mut self, generation: u64) {
        let Some(record) = self.records.get_mut(&generation) else {
            return;
        };
        if self.index.get(&record.key) == Some(&generation) {
            self.index.remove(&record.key);
        }
        record.state = EntryState::Deleting;
        if record.ref_count == 0 {
            self.discard(generation);
        }
    }

    fn discard(&mut self, generation: u64) {
        if let Some(record) = self.records.remove(&generation) {
            self.occupied = self.occupied.saturating_sub(record.stored);
            self.doomed.push_back(StoreId::new(&record.key, generation));
            debug!(key = %record.key, generation, "Entry discarded");
        }
    }

    fn info(&self, generation: u64) -> Option<EntryInfo> {
        self.records.get(&generation).map(|r| EntryInfo {
            key: r.key.clone(),
            generation,
            state: r.state,
            size: r.size,
            content_type: r.content_type.clone(),
            etag: r.etag.clone(),
            modified_at: r.modified_at,
            ref_count: r.ref_count,
        })
    }
}

/// In-memory mapping from key to entry metadata
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
    sweep_needed: Notify,
    reclaim_ready: Notify,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lease(
        self: &Arc<Self>,
        key: CacheKey,
        generation: u64,
        progress: watch::Receiver<Progress>,
    ) -> Lease {
        Lease {
            registry: Arc::clone(self),
            key,
            generation,
            progress,
        }
    }

    /// Lease on the current entry for `key`, without creating one
    pub fn lookup(self: &Arc<Self>, key: &CacheKey) -> Option<Lease> {
        let mut inner = self.lock();
        let generation = *inner.index.get(key)?;
        let record = inner.records.get_mut(&generation)?;
        record.ref_count += 1;
        let rx = record.progress.subscribe();
        drop(inner);
        Some(self.lease(key.clone(), generation, rx))
    }

    /// Return the current entry or atomically insert a new Pending one.
    ///
    /// The boolean is true when this call created the entry, which makes the
    /// caller responsible for populating it.
    pub fn lookup_or_create(self: &Arc<Self>, key: &CacheKey) -> (Lease, bool) {
        let mut inner = self.lock();
        if let Some(&generation) = inner.index.get(key) {
            if let Some(record) = inner.records.get_mut(&generation) {
                record.ref_count += 1;
                let rx = record.progress.subscribe();
                drop(inner);
                return (self.lease(key.clone(), generation, rx), false);
            }
        }

        let (generation, rx) = inner.insert_pending(key);
        drop(inner);
        debug!(key = %key, generation, "Created pending entry");
        (self.lease(key.clone(), generation, rx), true)
    }

    /// Start a new generation for `key`, replacing whatever is current.
    ///
    /// If a population is already in flight the caller gets its progress
    /// receiver back and should wait for it to settle before retrying.
    pub fn begin_replace(
        self: &Arc<Self>,
        key: &CacheKey,
    ) -> std::result::Result<Lease, watch::Receiver<Progress>> {
        let mut inner = self.lock();
        if let Some(&current) = inner.index.get(key) {
            if let Some(record) = inner.records.get(&current) {
                if record.state == EntryState::Pending {
                    return Err(record.progress.subscribe());
                }
            }
            inner.retire(current);
        }

        let (generation, rx) = inner.insert_pending(key);
        let reclaim = !inner.doomed.is_empty();
        drop(inner);
        if reclaim {
            self.reclaim_ready.notify_one();
        }
        debug!(key = %key, generation, "Started replacement generation");
        Ok(self.lease(key.clone(), generation, rx))
    }

    /// Reinstate a committed object found in the store at startup
    pub fn restore(&self, key: CacheKey, manifest: &Manifest) {
        let mut inner = self.lock();
        let (tx, _) = watch::channel(Progress::Complete {
            size: manifest.size,
        });
        let last_access = inner.tick();
        inner.last_generation = inner.last_generation.max(manifest.generation);
        inner.occupied += manifest.size;
        inner.index.insert(key.clone(), manifest.generation);
        inner.records.insert(
            manifest.generation,
            Record {
                key,
                state: EntryState::Ready,
                size: Some(manifest.size),
                stored: manifest.size,
                content_type: manifest.content_type.clone(),
                etag: manifest.etag.clone(),
                modified_at: manifest.modified_at,
                last_access,
                ref_count: 0,
                progress: tx,
            },
        );
    }

    /// Publish that bytes `[0, durable)` of a pending generation are stored
    pub fn advance(&self, generation: u64, durable: u64) {
        let mut inner = self.lock();
        let Some(record) = inner.records.get_mut(&generation) else {
            return;
        };
        let grown = durable.saturating_sub(record.stored);
        record.stored = record.stored.max(durable);
        record.progress.send_replace(Progress::Writing { durable });
        inner.occupied += grown;
    }

    /// Pending → Ready with the final size and metadata
    pub fn mark_ready(
        &self,
        generation: u64,
        size: u64,
        content_type: Option<String>,
        etag: Option<String>,
    ) {
        let mut inner = self.lock();
        let Some(record) = inner.records.get_mut(&generation) else {
            return;
        };
        // A generation deleted mid-population stays Deleting
        if record.state == EntryState::Pending {
            record.state = EntryState::Ready;
        }
        let grown = size.saturating_sub(record.stored);
        record.stored = record.stored.max(size);
        record.size = Some(size);
        record.content_type = content_type;
        record.etag = etag;
        record.modified_at = Utc::now();
        record.progress.send_replace(Progress::Complete { size });
        inner.occupied += grown;
    }

    /// Pending → Invalid; every waiter sees `err`
    pub fn mark_invalid(&self, generation: u64, err: CacheError) {
        let mut inner = self.lock();
        let Some(record) = inner.records.get_mut(&generation) else {
            return;
        };
        if record.state == EntryState::Pending {
            record.state = EntryState::Invalid;
        }
        record.progress.send_replace(Progress::Failed(err));
    }

    /// Fail the generation and make the key absent again
    pub fn abandon(&self, generation: u64, err: CacheError) {
        self.mark_invalid(generation, err);
        let mut inner = self.lock();
        inner.retire(generation);
        let reclaim = !inner.doomed.is_empty();
        drop(inner);
        if reclaim {
            self.reclaim_ready.notify_one();
        }
    }

    /// Record a read; feeds LRU ordering
    pub fn touch(&self, generation: u64) {
        let mut inner = self.lock();
        let now = inner.tick();
        if let Some(record) = inner.records.get_mut(&generation) {
            record.last_access = now;
        }
    }

    /// Make `key` absent for new requests. Existing leases keep reading.
    pub fn mark_deleting(&self, key: &CacheKey) -> bool {
        let mut inner = self.lock();
        let Some(&generation) = inner.index.get(key) else {
            return false;
        };
        inner.retire(generation);
        drop(inner);
        self.reclaim_ready.notify_one();
        true
    }

    fn retain(&self, generation: u64) {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get_mut(&generation) {
            record.ref_count += 1;
        }
    }

    /// Drop one reference; a Deleting entry with none left is discarded
    fn release(&self, generation: u64) {
        let mut inner = self.lock();
        let Some(record) = inner.records.get_mut(&generation) else {
            return;
        };
        debug_assert!(record.ref_count > 0, "ref_count underflow");
        record.ref_count = record.ref_count.saturating_sub(1);
        if record.ref_count == 0 && record.state == EntryState::Deleting {
            inner.discard(generation);
            drop(inner);
            self.reclaim_ready.notify_one();
        }
    }

    /// Select and remove victims in one critical section.
    ///
    /// Ready entries past `max_age` always go. Then Ready and Invalid
    /// entries leave in least-recently-used order while the limits are
    /// exceeded. Entries with live references are never touched.
    pub fn evict(&self, limits: &EvictionLimits) -> Vec<CacheKey> {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut expired = Vec::new();
        let mut candidates = Vec::new();

        for &generation in inner.index.values() {
            let Some(record) = inner.records.get(&generation) else {
                continue;
            };
            if record.ref_count > 0 {
                continue;
            }
            let too_old = limits.max_age.is_some_and(|age| {
                (now - record.modified_at)
                    .to_std()
                    .is_ok_and(|elapsed| elapsed > age)
            });
            match record.state {
                EntryState::Ready if too_old => expired.push(generation),
                EntryState::Ready | EntryState::Invalid => {
                    candidates.push((record.last_access, generation))
                }
                _ => {}
            }
        }

        let mut evicted = Vec::new();
        for generation in expired {
            if let Some(record) = inner.records.get(&generation) {
                debug!(key = %record.key, generation, "Evicting expired entry");
                evicted.push(record.key.clone());
            }
            inner.retire(generation);
        }

        candidates.sort_unstable();
        for (_, generation) in candidates {
            let over_capacity = inner.occupied > limits.capacity_bytes;
            let over_count = limits
                .max_entries
                .is_some_and(|max| inner.index.len() > max);
            if !over_capacity && !over_count {
                break;
            }
            if let Some(record) = inner.records.get(&generation) {
                debug!(
                    key = %record.key,
                    generation,
                    state = ?record.state,
                    "Evicting least recently used entry"
                );
                evicted.push(record.key.clone());
            }
            inner.retire(generation);
        }

        let reclaim = !inner.doomed.is_empty();
        drop(inner);
        if reclaim {
            self.reclaim_ready.notify_one();
        }
        evicted
    }

    /// Whether occupancy or entry count is above the limits
    pub fn exceeds(&self, limits: &EvictionLimits) -> bool {
        let inner = self.lock();
        inner.occupied > limits.capacity_bytes
            || limits
                .max_entries
                .is_some_and(|max| inner.index.len() > max)
    }

    /// Next discarded object whose storage should be deleted
    pub fn pop_doomed(&self) -> Option<StoreId> {
        self.lock().doomed.pop_front()
    }

    /// Ask the background sweeper to run now
    pub fn request_sweep(&self) {
        self.sweep_needed.notify_one();
    }

    pub async fn sweep_requested(&self) {
        self.sweep_needed.notified().await
    }

    pub async fn reclaim_requested(&self) {
        self.reclaim_ready.notified().await
    }

    /// Snapshot of the current entry for `key`
    pub fn info(&self, key: &CacheKey) -> Option<EntryInfo> {
        let inner = self.lock();
        let generation = *inner.index.get(key)?;
        inner.info(generation)
    }

    /// Number of keys currently present
    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate bytes held by all live generations
    pub fn occupied(&self) -> u64 {
        self.lock().occupied
    }

    /// Records still alive, including retired generations with readers
    pub fn live_generations(&self) -> usize {
        self.lock().records.len()
    }
}

/// A counted reference to one generation of an entry.
///
/// While any lease exists the generation's storage is never deleted.
/// Dropping the lease releases the reference.
pub struct Lease {
    registry: Arc<Registry>,
    key: CacheKey,
    generation: u64,
    progress: watch::Receiver<Progress>,
}

impl Lease {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn store_id(&self) -> StoreId {
        StoreId::new(&self.key, self.generation)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Latest published progress
    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    /// Fresh receiver following this generation's progress
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    pub fn info(&self) -> Option<EntryInfo> {
        self.registry.lock().info(self.generation)
    }

    pub fn touch(&self) {
        self.registry.touch(self.generation);
    }

    /// Wait until the population finishes; resolves to the final size
    pub async fn settled(&self) -> crate::error::Result<u64> {
        let mut rx = self.progress.clone();
        let progress = rx
            .wait_for(Progress::is_settled)
            .await
            .map_err(|_| CacheError::Cancelled)?
            .clone();
        match progress {
            Progress::Complete { size } => Ok(size),
            Progress::Failed(err) => Err(err),
            Progress::Writing { .. } => Err(CacheError::Cancelled),
        }
    }
}

impl Clone for Lease {
    fn clone(&self) -> Self {
        self.registry.retain(self.generation);
        Self {
            registry: Arc::clone(&self.registry),
            key: self.key.clone(),
            generation: self.generation,
            progress: self.progress.clone(),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.registry.release(self.generation);
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}
