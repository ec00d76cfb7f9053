//! Streaming transfer engine
//!
//! Copies an entry from the backing store to a consumer one bounded chunk at
//! a time. The next chunk is only read once the previous one was taken, so a
//! slow consumer holds at most one chunk in memory. Reads against a Pending
//! entry follow the durable length and suspend until more bytes land.

use crate::error::{CacheError, Result};
use crate::registry::{Lease, Progress};
use crate::store::{BackingStore, StoreId};
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{Sink, SinkExt, StreamExt};
use std::io;
use std::sync::Arc;
use tokio::sync::watch;

/// Requested bytes `[start, end)`; `end: None` reads to the end of content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn full() -> Self {
        Self {
            start: 0,
            end: None,
        }
    }

    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn starting_at(start: u64) -> Self {
        Self { start, end: None }
    }
}

/// Outgoing chunks of one transfer
pub type ChunkStream = BoxStream<'static, Result<Bytes>>;

/// Reads entries out of the backing store
#[derive(Clone)]
pub struct TransferEngine {
    store: Arc<dyn BackingStore>,
    chunk_size: usize,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn BackingStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Reader over `range` of the generation held by `lease`
    pub fn reader(&self, lease: Lease, range: ByteRange) -> ChunkReader {
        ChunkReader {
            store: Arc::clone(&self.store),
            id: lease.store_id(),
            progress: lease.subscribe(),
            lease,
            pos: range.start,
            end: range.end,
            chunk_size: self.chunk_size,
        }
    }

    /// Copy `range` into `sink`, returning the bytes the sink accepted.
    ///
    /// Each chunk is sent and flushed before the next one is read. Bytes
    /// already delivered stay delivered if the transfer fails later.
    pub async fn transfer<S>(&self, lease: Lease, range: ByteRange, sink: &mut S) -> Result<u64>
    where
        S: Sink<Bytes> + Unpin,
    {
        let mut reader = self.reader(lease, range);
        let mut written = 0u64;

        while let Some(chunk) = reader.next_chunk().await {
            let chunk = chunk?;
            let len = chunk.len() as u64;
            sink.send(chunk).await.map_err(|_| CacheError::Cancelled)?;
            written += len;
            reader.lease.touch();
            tokio::task::yield_now().await;
        }

        Ok(written)
    }

    /// Pull-based stream over `range`; ends after the first error
    pub fn stream(&self, lease: Lease, range: ByteRange) -> ChunkStream {
        let reader = self.reader(lease, range);
        stream::unfold(Some(reader), |state| async move {
            let mut reader = state?;
            match reader.next_chunk().await? {
                Ok(chunk) => {
                    reader.lease.touch();
                    Some((Ok(chunk), Some(reader)))
                }
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed()
    }
}

/// Cursor over one generation of one entry
pub struct ChunkReader {
    store: Arc<dyn BackingStore>,
    id: StoreId,
    lease: Lease,
    progress: watch::Receiver<Progress>,
    pos: u64,
    end: Option<u64>,
    chunk_size: usize,
}

impl ChunkReader {
    /// Next offset to be read
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Read the next chunk, waiting for a pending population if needed.
    ///
    /// `None` once the range is exhausted.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        let limit = loop {
            let progress = self.progress.borrow_and_update().clone();
            match progress {
                Progress::Failed(err) => return Some(Err(err)),
                Progress::Complete { size } => {
                    if self.pos > size {
                        return Some(Err(CacheError::RangeNotSatisfiable {
                            start: self.pos,
                            size,
                        }));
                    }
                    let end = self.end.map_or(size, |end| end.min(size));
                    if self.pos >= end {
                        return None;
                    }
                    break end;
                }
                Progress::Writing { durable } => {
                    if self.end.is_some_and(|end| self.pos >= end) {
                        return None;
                    }
                    let available = self.end.map_or(durable, |end| end.min(durable));
                    if self.pos < available {
                        break available;
                    }
                    // Population holds a lease, so the sender outlives us
                    if self.progress.changed().await.is_err() {
                        return Some(Err(CacheError::Cancelled));
                    }
                }
            }
        };

        let len = (limit - self.pos).min(self.chunk_size as u64) as usize;
        match self.store.read(&self.id, self.pos, len).await {
            Ok(chunk) if chunk.is_empty() => Some(Err(CacheError::from(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("object ended at {} before durable length", self.pos),
            )))),
            Ok(chunk) => {
                self.pos += chunk.len() as u64;
                Some(Ok(chunk))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
