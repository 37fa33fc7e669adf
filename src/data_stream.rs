//! # Streaming Transaction-Data Assembler
//!
//! Produces a transaction's payload as an ordered byte stream by pulling its
//! chunks one at a time from a chunk source fronted by a read-through cache.
//!
//! ```text
//! get_tx_data(tx_id)
//!    ├─ ChainSource: data_root  ┐ fetched concurrently
//!    └─ ChainSource: (offset, size) ┘
//!                 │
//!                 ▼
//! TxDataStream: chunk N+1 is requested only after chunk N was yielded
//!                 │
//!                 ▼
//! CachingChunkSource — keyed (data_root, relative_offset)
//!                 │ miss
//!                 ▼
//!          underlying ChunkSource
//! ```
//!
//! The cache key is content-addressed: `(data_root, relative_offset)`
//! identifies the same bytes no matter which transaction instance asked,
//! while `absolute_offset` is instance-specific and MUST NOT key the cache.
//!
//! The stream ends exactly at `size` bytes; any chunk fetch failure ends it
//! with that error and no further chunks are requested.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

// =============================================================================
// External Collaborator Traits
// =============================================================================

/// The transaction metadata the assembler needs from the chain.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// The transaction's merkle data root.
    async fn get_tx_data_root(&self, tx_id: &str) -> Result<String>;

    /// The transaction's weave placement: absolute offset of its LAST payload
    /// byte, and its payload size.
    async fn get_tx_offset(&self, tx_id: &str) -> Result<(u64, u64)>;
}

/// A source of payload chunks addressable by absolute or relative offset.
///
/// Only the interface is consumed here; the network protocol behind it is an
/// external concern.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn get_chunk_data(
        &self,
        tx_size: u64,
        absolute_offset: u64,
        data_root: &str,
        relative_offset: u64,
    ) -> Result<Vec<u8>>;
}

#[async_trait]
impl<T: ChunkSource + ?Sized> ChunkSource for Arc<T> {
    async fn get_chunk_data(
        &self,
        tx_size: u64,
        absolute_offset: u64,
        data_root: &str,
        relative_offset: u64,
    ) -> Result<Vec<u8>> {
        (**self)
            .get_chunk_data(tx_size, absolute_offset, data_root, relative_offset)
            .await
    }
}

// =============================================================================
// Read-Through Chunk Cache
// =============================================================================

/// Default number of chunks held by the read-through cache.
pub const DEFAULT_CHUNK_CACHE_CAPACITY: usize = 1024;

/// A read-through cache over a [`ChunkSource`].
///
/// Hits return the cached bytes; misses fetch through the underlying source
/// and write back before returning.
pub struct CachingChunkSource<S> {
    inner: S,
    cache: Mutex<LruCache<(String, u64), Vec<u8>>>,
}

impl<S: ChunkSource> CachingChunkSource<S> {
    pub fn new(inner: S) -> Self {
        Self::with_capacity(inner, DEFAULT_CHUNK_CACHE_CAPACITY)
    }

    pub fn with_capacity(inner: S, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero cache capacity");
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl<S: ChunkSource> ChunkSource for CachingChunkSource<S> {
    async fn get_chunk_data(
        &self,
        tx_size: u64,
        absolute_offset: u64,
        data_root: &str,
        relative_offset: u64,
    ) -> Result<Vec<u8>> {
        let key = (data_root.to_string(), relative_offset);
        if let Some(chunk) = self.cache.lock().await.get(&key) {
            return Ok(chunk.clone());
        }

        let chunk = self
            .inner
            .get_chunk_data(tx_size, absolute_offset, data_root, relative_offset)
            .await?;

        self.cache.lock().await.put(key, chunk.clone());
        Ok(chunk)
    }
}

// =============================================================================
// Transaction Data Stream
// =============================================================================

/// A transaction's payload stream plus its total size.
pub struct TxData {
    pub stream: TxDataStream,
    pub size: u64,
}

/// Pull-based byte stream over a transaction's chunks.
///
/// Strictly ordered: each call to [`TxDataStream::next_chunk`] fetches the
/// chunk at the current position and advances by the bytes returned. After a
/// failure the stream is dead and yields nothing further.
pub struct TxDataStream {
    chunks: Arc<dyn ChunkSource>,
    data_root: String,
    tx_size: u64,
    start_offset: u64,
    bytes_emitted: u64,
    failed: bool,
}

impl TxDataStream {
    /// The next chunk, clipped to the transaction size, or `None` when the
    /// stream has delivered all `tx_size` bytes.
    pub async fn next_chunk(&mut self) -> Option<Result<Vec<u8>>> {
        if self.failed || self.bytes_emitted >= self.tx_size {
            return None;
        }

        let relative_offset = self.bytes_emitted;
        let absolute_offset = self.start_offset + relative_offset;
        let result = self
            .chunks
            .get_chunk_data(self.tx_size, absolute_offset, &self.data_root, relative_offset)
            .await;

        match result {
            Ok(mut chunk) => {
                if chunk.is_empty() {
                    self.failed = true;
                    return Some(Err(Error::ChunkFetch(format!(
                        "empty chunk at relative offset {relative_offset}"
                    ))));
                }
                let remaining = (self.tx_size - self.bytes_emitted) as usize;
                chunk.truncate(remaining);
                self.bytes_emitted += chunk.len() as u64;
                Some(Ok(chunk))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }

    /// Bytes delivered so far.
    pub fn bytes_emitted(&self) -> u64 {
        self.bytes_emitted
    }

    /// Drains the stream into one buffer. Test and small-payload helper; the
    /// serving path consumes chunks incrementally.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

/// Assembles the payload stream for a transaction.
///
/// The data root and the weave placement are fetched concurrently; the
/// stream's first chunk starts at `offset − size + 1` (the offset addresses
/// the last payload byte).
pub async fn get_tx_data(
    chain: &dyn ChainSource,
    chunks: Arc<dyn ChunkSource>,
    tx_id: &str,
) -> Result<TxData> {
    let (data_root, placement) =
        tokio::join!(chain.get_tx_data_root(tx_id), chain.get_tx_offset(tx_id));
    let data_root = data_root?;
    let (offset, size) = placement?;

    let start_offset = (offset + 1).saturating_sub(size);
    Ok(TxData {
        stream: TxDataStream {
            chunks,
            data_root,
            tx_size: size,
            start_offset,
            bytes_emitted: 0,
            failed: false,
        },
        size,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeChain {
        data_root: String,
        offset: u64,
        size: u64,
    }

    #[async_trait]
    impl ChainSource for FakeChain {
        async fn get_tx_data_root(&self, _tx_id: &str) -> Result<String> {
            Ok(self.data_root.clone())
        }

        async fn get_tx_offset(&self, _tx_id: &str) -> Result<(u64, u64)> {
            Ok((self.offset, self.size))
        }
    }

    /// Serves a payload split into fixed-size chunks, counting fetches and
    /// verifying the caller derives absolute offsets correctly.
    struct FakeChunks {
        payload: Vec<u8>,
        chunk_size: usize,
        start_offset: u64,
        fetches: AtomicUsize,
        fail_at_relative: Option<u64>,
    }

    #[async_trait]
    impl ChunkSource for FakeChunks {
        async fn get_chunk_data(
            &self,
            _tx_size: u64,
            absolute_offset: u64,
            _data_root: &str,
            relative_offset: u64,
        ) -> Result<Vec<u8>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_at_relative == Some(relative_offset) {
                return Err(Error::ChunkFetch("synthetic chunk failure".into()));
            }
            assert_eq!(absolute_offset - self.start_offset, relative_offset);
            let start = relative_offset as usize;
            let end = (start + self.chunk_size).min(self.payload.len());
            Ok(self.payload[start..end].to_vec())
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_stream_length_equals_size() {
        let body = payload(1000);
        let chain = FakeChain {
            data_root: "root-1".to_string(),
            offset: 5999, // last byte of the payload
            size: 1000,
        };
        let chunks = Arc::new(FakeChunks {
            payload: body.clone(),
            chunk_size: 256,
            start_offset: 5000,
            fetches: AtomicUsize::new(0),
            fail_at_relative: None,
        });

        let mut data = get_tx_data(&chain, chunks, "tx").await.unwrap();
        assert_eq!(data.size, 1000);
        let bytes = data.stream.read_to_end().await.unwrap();
        assert_eq!(bytes.len() as u64, data.size);
        assert_eq!(bytes, body);
    }

    #[tokio::test]
    async fn test_chunks_requested_strictly_in_order() {
        let chain = FakeChain {
            data_root: "root-2".to_string(),
            offset: 99,
            size: 100,
        };
        let chunks = Arc::new(FakeChunks {
            payload: payload(100),
            chunk_size: 30,
            start_offset: 0,
            fetches: AtomicUsize::new(0),
            fail_at_relative: None,
        });

        let mut data = get_tx_data(&chain, Arc::clone(&chunks) as Arc<dyn ChunkSource>, "tx")
            .await
            .unwrap();
        let mut sizes = Vec::new();
        while let Some(chunk) = data.stream.next_chunk().await {
            sizes.push(chunk.unwrap().len());
        }
        // 30 + 30 + 30 + 10, one fetch per chunk, none speculative.
        assert_eq!(sizes, vec![30, 30, 30, 10]);
        assert_eq!(chunks.fetches.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fetch_failure_ends_stream() {
        let chain = FakeChain {
            data_root: "root-3".to_string(),
            offset: 99,
            size: 100,
        };
        let chunks = Arc::new(FakeChunks {
            payload: payload(100),
            chunk_size: 40,
            start_offset: 0,
            fetches: AtomicUsize::new(0),
            fail_at_relative: Some(40),
        });

        let mut data = get_tx_data(&chain, chunks, "tx").await.unwrap();
        let first = data.stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.len(), 40);

        let failure = data.stream.next_chunk().await.unwrap();
        assert!(matches!(failure, Err(Error::ChunkFetch(_))));

        // Dead stream: no further chunks, no further fetches.
        assert!(data.stream.next_chunk().await.is_none());
        assert_eq!(data.stream.bytes_emitted(), 40);
    }

    /// A chunk source that records per-key fetch counts.
    struct CountingChunks {
        counts: std::sync::Mutex<HashMap<(String, u64), usize>>,
    }

    #[async_trait]
    impl ChunkSource for CountingChunks {
        async fn get_chunk_data(
            &self,
            _tx_size: u64,
            _absolute_offset: u64,
            data_root: &str,
            relative_offset: u64,
        ) -> Result<Vec<u8>> {
            let mut counts = self.counts.lock().unwrap();
            *counts
                .entry((data_root.to_string(), relative_offset))
                .or_default() += 1;
            Ok(vec![relative_offset as u8; 8])
        }
    }

    #[tokio::test]
    async fn test_cache_keys_on_data_root_and_relative_offset() {
        let inner = CountingChunks {
            counts: std::sync::Mutex::new(HashMap::new()),
        };
        let cached = CachingChunkSource::new(inner);

        // Same content address through two different absolute offsets: one
        // underlying fetch.
        let a = cached.get_chunk_data(64, 10_000, "root-x", 8).await.unwrap();
        let b = cached.get_chunk_data(64, 77_000, "root-x", 8).await.unwrap();
        assert_eq!(a, b);

        // Different data root at the same relative offset misses.
        let _ = cached.get_chunk_data(64, 10_000, "root-y", 8).await.unwrap();

        let counts = cached.inner.counts.lock().unwrap();
        assert_eq!(counts[&("root-x".to_string(), 8)], 1);
        assert_eq!(counts[&("root-y".to_string(), 8)], 1);
    }
}
