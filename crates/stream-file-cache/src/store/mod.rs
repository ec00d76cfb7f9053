//! Backing store adapters
//!
//! Objects are addressed by [`StoreId`], the key digest plus the generation
//! that wrote them, so a replacement never touches bytes an older reader is
//! still streaming.

mod fs;
mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

use crate::error::Result;
use crate::types::{CacheKey, Manifest};
use async_trait::async_trait;
use bytes::Bytes;

const MANIFEST_SUFFIX: &str = ".meta.json";

/// Address of one generation of one key in the backing store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreId {
    digest: String,
    generation: u64,
}

impl StoreId {
    pub fn new(key: &CacheKey, generation: u64) -> Self {
        Self {
            digest: key.digest(),
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn object_name(&self) -> String {
        format!("{}.{}", self.digest, self.generation)
    }

    pub fn manifest_name(&self) -> String {
        format!("{}{}", self.object_name(), MANIFEST_SUFFIX)
    }

    /// Parse a name produced by [`StoreId::object_name`]
    pub fn parse_object_name(name: &str) -> Option<Self> {
        let (digest, generation) = name.split_once('.')?;
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self {
            digest: digest.to_string(),
            generation: generation.parse().ok()?,
        })
    }

    /// Parse a name produced by [`StoreId::manifest_name`]
    pub fn parse_manifest_name(name: &str) -> Option<Self> {
        Self::parse_object_name(name.strip_suffix(MANIFEST_SUFFIX)?)
    }
}

/// Everything a store holds, as found at startup
#[derive(Debug, Default)]
pub struct StoreListing {
    pub manifests: Vec<(StoreId, Manifest)>,
    pub objects: Vec<StoreId>,
}

/// Asynchronous byte-range storage.
///
/// Operations on different ids may run concurrently. Callers serialize writes
/// to one id and never read past its durable length. Errors are returned as
/// they happen and never retried here.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Prepare the store for use (create directories and so on)
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Write `data` at `offset`; an empty write creates the object
    async fn write(&self, id: &StoreId, offset: u64, data: &[u8]) -> Result<()>;

    /// Read up to `len` bytes starting at `offset`
    async fn read(&self, id: &StoreId, offset: u64, len: usize) -> Result<Bytes>;

    /// Remove the object and its manifest; missing objects are not an error
    async fn delete(&self, id: &StoreId) -> Result<()>;

    /// Bytes durably written for the object, zero if it does not exist
    async fn durable_length(&self, id: &StoreId) -> Result<u64>;

    /// Record the sidecar manifest of a fully written object
    async fn commit(&self, id: &StoreId, manifest: &Manifest) -> Result<()>;

    /// List committed manifests and all stored objects
    async fn list(&self) -> Result<StoreListing>;
}
