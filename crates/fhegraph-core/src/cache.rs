//! In-memory LRU cache for block timestamps.
//!
//! The op-bucket rollup needs one timestamp per block and must not refetch
//! a block it has already resolved within a run. Confirmed block
//! timestamps are immutable, so entries never need invalidation, only
//! eviction under memory pressure.

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::Mutex;

/// Default maximum number of cached block timestamps.
const DEFAULT_CAPACITY: usize = 50_000;

/// Shared block-number → unix-timestamp cache.
///
/// Uses `tokio::sync::Mutex` for async-friendly access; LRU reads update
/// recency tracking, so lookups also need the lock.
pub struct BlockTimeCache {
    timestamps: Mutex<LruCache<u64, u64>>,
}

impl BlockTimeCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a cache with an explicit capacity. Must be > 0.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            timestamps: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("cache capacity must be > 0"),
            )),
        }
    }

    pub async fn get(&self, block_number: u64) -> Option<u64> {
        self.timestamps.lock().await.get(&block_number).copied()
    }

    pub async fn insert(&self, block_number: u64, timestamp: u64) {
        self.timestamps.lock().await.put(block_number, timestamp);
    }
}

impl Default for BlockTimeCache {
    fn default() -> Self {
        Self::new()
    }
}
