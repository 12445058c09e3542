//! Sharded LRU + TTL cache for embedding vectors.
//!
//! Keys are SHA-256 digests of `(model, intent, text)`; values are shared
//! vectors. The cache is split into independently locked [`LruCache`]
//! shards so unrelated keys never contend on the same lock. Each shard
//! evicts its least recently used entry when full. Expiry is checked lazily
//! on read against an injectable [`Clock`], which lets tests advance time.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::embedding::EmbedIntent;

const SHARDS: usize = 16;

/// Time source for TTL checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock [`Clock`] backed by [`Instant::now`].
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A [`Clock`] that only moves when told to.
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

struct CacheEntry {
    vector: Arc<Vec<f32>>,
    inserted_at: Instant,
}

/// Hit/miss counters, exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Process-wide embedding cache. Construct once and share via `Arc`.
pub struct EmbeddingCache {
    shards: Vec<Mutex<LruCache<String, CacheEntry>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self::with_clock(ttl, max_entries, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        let per_shard =
            NonZeroUsize::new(max_entries.div_ceil(SHARDS)).unwrap_or(NonZeroUsize::MIN);
        Self {
            shards: (0..SHARDS)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
            ttl,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<LruCache<String, CacheEntry>> {
        let idx = key
            .bytes()
            .take(2)
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
        &self.shards[idx % SHARDS]
    }

    /// Look up a live entry. Expired entries are removed and count as misses.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<f32>>> {
        let now = self.clock.now();
        let mut shard = self.shard(key).lock();
        let found = shard
            .get(key)
            .map(|e| (now.duration_since(e.inserted_at) < self.ttl, e.vector.clone()));
        let live = match found {
            Some((true, vector)) => Some(vector),
            Some((false, _)) => {
                shard.pop(key);
                None
            }
            None => None,
        };
        let counter = if live.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        live
    }

    /// Insert or refresh an entry, evicting the shard's least recently used
    /// entry when it is full.
    pub fn insert(&self, key: String, vector: Arc<Vec<f32>>) {
        let now = self.clock.now();
        self.shard(&key).lock().put(
            key,
            CacheEntry {
                vector,
                inserted_at: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

/// Stable cache key for a text embedded by `model` with `intent`.
pub fn cache_key(model: &str, intent: EmbedIntent, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(intent.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
