//! Eviction manager
//!
//! A sweep picks victims and removes them from the registry in one step, then
//! deletes the storage of every discarded generation outside the lock.
//! Generations that still have readers are only marked `Deleting`; their
//! storage is reclaimed once the last lease goes away.

use crate::registry::{EvictionLimits, Registry};
use crate::store::BackingStore;
use crate::types::CacheConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries removed from the registry
    pub evicted: usize,
    /// Objects deleted from the backing store
    pub reclaimed: usize,
}

/// Enforces capacity, count and age limits
pub struct EvictionManager {
    registry: Arc<Registry>,
    store: Arc<dyn BackingStore>,
    limits: EvictionLimits,
    evictions: AtomicU64,
}

impl EvictionManager {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn BackingStore>, limits: EvictionLimits) -> Self {
        Self {
            registry,
            store,
            limits,
            evictions: AtomicU64::new(0),
        }
    }

    pub fn limits(&self) -> &EvictionLimits {
        &self.limits
    }

    /// Entries evicted so far
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Run one eviction sweep.
    ///
    /// Cancelling it between steps leaves the registry consistent: victims
    /// are removed atomically and leftover storage is picked up next time.
    pub async fn sweep(&self) -> SweepReport {
        let evicted = self.registry.evict(&self.limits);
        if !evicted.is_empty() {
            self.evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            debug!(count = evicted.len(), "Evicted entries");
        }

        SweepReport {
            evicted: evicted.len(),
            reclaimed: self.reclaim().await,
        }
    }

    /// Delete storage of every discarded generation
    pub async fn reclaim(&self) -> usize {
        let mut reclaimed = 0;
        while let Some(id) = self.registry.pop_doomed() {
            match self.store.delete(&id).await {
                Ok(()) => reclaimed += 1,
                Err(e) => warn!(object = %id.object_name(), error = %e, "Failed to delete object"),
            }
        }
        reclaimed
    }

    /// Sweep every `period`, and whenever a population overshoots the limits.
    /// Storage released by the last reader is reclaimed as soon as it is free.
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        info!(?period, capacity = self.limits.capacity_bytes, "Starting eviction sweeper");
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    _ = self.registry.sweep_requested() => {
                        self.sweep().await;
                    }
                    _ = self.registry.reclaim_requested() => {
                        self.reclaim().await;
                    }
                }
            }
        })
    }
}

impl From<&CacheConfig> for EvictionLimits {
    fn from(config: &CacheConfig) -> Self {
        Self {
            capacity_bytes: config.capacity_bytes,
            max_age: config.max_age,
            max_entries: config.max_entries,
        }
    }
}
