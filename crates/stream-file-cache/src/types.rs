//! Cache types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default size of a single transfer chunk
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Opaque identifier of a cached object; equality is byte-exact
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<[u8]>);

impl CacheKey {
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        Self(Arc::from(bytes.as_ref()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Deterministic storage name derived from the key bytes
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.0);
        hex::encode(hasher.finalize())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().map(Self::new)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes())
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s.into_bytes())
    }
}

impl From<Vec<u8>> for CacheKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Lifecycle state of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Pending,
    Ready,
    Invalid,
    Deleting,
}

/// Point-in-time view of an entry's metadata
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    #[serde(skip)]
    pub key: CacheKey,
    pub generation: u64,
    pub state: EntryState,
    /// Final size; `None` while still streaming in
    pub size: Option<u64>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub modified_at: DateTime<Utc>,
    pub ref_count: usize,
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
    pub populations: u64,
    pub evictions: u64,
}

/// Sidecar record committed next to a fully written object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Hex-encoded key bytes
    pub key: String,
    pub generation: u64,
    pub size: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub modified_at: DateTime<Utc>,
}

/// Configuration consumed by the cache core
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root_dir: PathBuf,
    /// Upper bound on occupied bytes before the sweep evicts
    pub capacity_bytes: u64,
    pub max_age: Option<Duration>,
    pub chunk_size: usize,
    pub max_entries: Option<usize>,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./_cache"),
            capacity_bytes: 1024 * 1024 * 1024, // 1GB
            max_age: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_entries: None,
            sweep_interval: Duration::from_secs(60),
        }
    }
}
