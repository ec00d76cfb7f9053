//! Fetch coordinator
//!
//! Makes sure exactly one population runs per key and generation. The caller
//! that creates a Pending entry spawns the population task; everyone else
//! attaches to the same entry and follows its progress.
//!
//! Populations run on their own task holding their own lease, so a requester
//! going away never cancels the write for the others.

use crate::error::{CacheError, Result};
use crate::registry::{EvictionLimits, Lease, Registry};
use crate::store::{BackingStore, StoreId};
use crate::types::{CacheKey, Manifest};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Incoming content, chunked however the producer likes
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Content fetched from upstream for a missing key
pub struct Upstream {
    pub content_type: Option<String>,
    pub body: ByteStream,
}

/// Where GET misses are populated from
#[async_trait]
pub trait Origin: Send + Sync {
    /// `Ok(None)` when upstream has no such object
    async fn fetch(&self, key: &CacheKey) -> Result<Option<Upstream>>;
}

enum Source {
    Origin(Arc<dyn Origin>),
    Upload(Upstream),
}

/// Deduplicates populations and drives them into the backing store
pub struct FetchCoordinator {
    registry: Arc<Registry>,
    store: Arc<dyn BackingStore>,
    origin: Option<Arc<dyn Origin>>,
    chunk_size: usize,
    limits: EvictionLimits,
    populations: Arc<AtomicU64>,
}

impl FetchCoordinator {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn BackingStore>,
        chunk_size: usize,
        limits: EvictionLimits,
    ) -> Self {
        Self {
            registry,
            store,
            origin: None,
            chunk_size: chunk_size.max(1),
            limits,
            populations: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_origin(&mut self, origin: Arc<dyn Origin>) {
        self.origin = Some(origin);
    }

    pub fn has_origin(&self) -> bool {
        self.origin.is_some()
    }

    /// Populations started so far
    pub fn populations(&self) -> u64 {
        self.populations.load(Ordering::Relaxed)
    }

    /// Lease on the current entry for `key`.
    ///
    /// On a miss with an origin configured, the first caller creates the
    /// entry and starts the single population; the flag reports that. Without
    /// an origin a miss is `NotFound` and nothing is created.
    pub fn acquire(&self, key: &CacheKey) -> Result<(Lease, bool)> {
        let Some(origin) = &self.origin else {
            return self
                .registry
                .lookup(key)
                .map(|lease| (lease, false))
                .ok_or(CacheError::NotFound);
        };

        let (lease, created) = self.registry.lookup_or_create(key);
        if created {
            self.spawn(lease.clone(), Source::Origin(Arc::clone(origin)));
        }
        Ok((lease, created))
    }

    /// Replace the content of `key` with `body` as a new generation.
    ///
    /// Waits out any population already in flight for the key, then resolves
    /// once the new generation is Ready or has failed.
    pub async fn replace(
        &self,
        key: &CacheKey,
        content_type: Option<String>,
        body: ByteStream,
    ) -> Result<Lease> {
        let lease = loop {
            match self.registry.begin_replace(key) {
                Ok(lease) => break lease,
                Err(mut in_flight) => {
                    debug!(key = %key, "Waiting for in-flight population before replacing");
                    // A closed channel means that generation is gone; just retry
                    let _ = in_flight.wait_for(|p| p.is_settled()).await;
                }
            }
        };

        self.spawn(
            lease.clone(),
            Source::Upload(Upstream {
                content_type,
                body,
            }),
        );
        lease.settled().await?;
        Ok(lease)
    }

    fn spawn(&self, lease: Lease, source: Source) {
        self.populations.fetch_add(1, Ordering::Relaxed);
        let population = Population {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            chunk_size: self.chunk_size,
            limits: self.limits,
        };
        tokio::spawn(async move { population.run(lease, source).await });
    }
}

struct Population {
    store: Arc<dyn BackingStore>,
    registry: Arc<Registry>,
    chunk_size: usize,
    limits: EvictionLimits,
}

impl Population {
    async fn run(self, lease: Lease, source: Source) {
        let generation = lease.generation();

        let upstream = match source {
            Source::Upload(upstream) => upstream,
            Source::Origin(origin) => match origin.fetch(lease.key()).await {
                Ok(Some(upstream)) => upstream,
                Ok(None) => {
                    debug!(key = %lease.key(), "Origin has no such object");
                    self.registry.abandon(generation, CacheError::NotFound);
                    return;
                }
                Err(e) => {
                    warn!(key = %lease.key(), error = %e, "Origin fetch failed");
                    self.registry.mark_invalid(generation, e.into_population());
                    return;
                }
            },
        };

        let content_type = upstream.content_type;
        match self.write_all(&lease, upstream.body, &content_type).await {
            Ok((size, etag)) => {
                self.registry.mark_ready(generation, size, content_type, Some(etag));
                info!(key = %lease.key(), generation, size, "Population complete");
                if self.registry.exceeds(&self.limits) {
                    self.registry.request_sweep();
                }
            }
            Err(e) => {
                warn!(key = %lease.key(), generation, error = %e, "Population failed");
                self.registry.mark_invalid(generation, e.into_population());
            }
        }
    }

    /// Stream `body` into the store in order, publishing progress per chunk
    async fn write_all(
        &self,
        lease: &Lease,
        mut body: ByteStream,
        content_type: &Option<String>,
    ) -> Result<(u64, String)> {
        let id = lease.store_id();
        let mut hasher = Sha256::new();
        let mut buffer = BytesMut::with_capacity(self.chunk_size);
        let mut offset = 0u64;

        self.store.write(&id, 0, &[]).await?;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(CacheError::population)?;
            buffer.extend_from_slice(&chunk);
            while buffer.len() >= self.chunk_size {
                let block = buffer.split_to(self.chunk_size);
                offset = self.write_block(lease, &id, offset, &block, &mut hasher).await?;
            }
        }
        if !buffer.is_empty() {
            offset = self.write_block(lease, &id, offset, &buffer, &mut hasher).await?;
        }

        let digest = hasher.finalize();
        let etag = format!("\"{}\"", hex::encode(&digest[..16]));

        let manifest = Manifest {
            key: lease.key().to_hex(),
            generation: lease.generation(),
            size: offset,
            content_type: content_type.clone(),
            etag: Some(etag.clone()),
            modified_at: Utc::now(),
        };
        self.store.commit(&id, &manifest).await?;

        Ok((offset, etag))
    }

    async fn write_block(
        &self,
        lease: &Lease,
        id: &StoreId,
        offset: u64,
        block: &[u8],
        hasher: &mut Sha256,
    ) -> Result<u64> {
        self.store.write(id, offset, block).await?;
        hasher.update(block);
        let durable = offset + block.len() as u64;
        self.registry.advance(lease.generation(), durable);
        Ok(durable)
    }
}
