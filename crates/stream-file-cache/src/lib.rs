//! Streaming file cache
//!
//! Byte content addressed by key, persisted through an asynchronous backing
//! store and served back in bounded chunks, with at most one population per
//! key in flight and reads that can follow a population as it lands.
//!
//! # Example
//!
//! ```no_run
//! use stream_file_cache::{CacheConfig, CacheKey, FileCache};
//!
//! # async fn example() -> stream_file_cache::Result<()> {
//! let cache = FileCache::filesystem(CacheConfig::default());
//! cache.init().await?;
//! let _sweeper = cache.spawn_sweeper();
//!
//! let response = cache.handle_get(&CacheKey::from("photos/1.jpg"), None).await?;
//! println!("serving {:?} bytes", response.info.size);
//! # Ok(())
//! # }
//! ```

mod cache;
mod coordinator;
mod error;
mod eviction;
mod registry;
pub mod store;
mod transfer;
mod types;

pub use cache::{DeleteStatus, FileCache, GetResponse, GetStatus};
pub use coordinator::{ByteStream, FetchCoordinator, Origin, Upstream};
pub use error::{CacheError, Result};
pub use eviction::{EvictionManager, SweepReport};
pub use registry::{EvictionLimits, Lease, Progress, Registry};
pub use transfer::{ByteRange, ChunkReader, ChunkStream, TransferEngine};
pub use types::{
    CacheConfig, CacheKey, CacheStats, EntryInfo, EntryState, Manifest, DEFAULT_CHUNK_SIZE,
};

pub use byte_range_parser::{RangeSpec, ResolvedRange};
