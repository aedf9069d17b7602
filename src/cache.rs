use std::{num::NonZeroUsize, time::Duration};

use ahash::RandomState;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::tile::TileKey;

struct CacheEntry {
    payload: Bytes,
    expires_at: Instant,
}

/// Bounded tile payload cache with LRU and TTL eviction.
///
/// Every operation takes the single lock, since a read also moves the key to the
/// most recently used position. Expiry is checked lazily on `get`; there is no
/// background sweep, capacity eviction still bounds memory.
///
/// An empty payload is a cached "no points in this tile" and is returned as
/// `Some(Bytes::new())`, unlike a missing key.
pub struct TileCache {
    entries: Mutex<LruCache<TileKey, CacheEntry, RandomState>>,
    ttl: Duration,
}

impl TileCache {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            // we use ahash because it's faster for small keys
            entries: Mutex::new(LruCache::with_hasher(capacity, RandomState::default())),
            ttl,
        }
    }

    /// Returns the payload if present and not expired, marking it as most recently used.
    /// Expired entries are removed.
    pub fn get(&self, key: &TileKey) -> Option<Bytes> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.payload.clone()),
            Some(_) => {}
            None => return None,
        }

        entries.pop(key);
        None
    }

    /// Inserts or overwrites the payload with a fresh expiry, evicting the least
    /// recently used entries if the cache is over capacity.
    pub fn set(&self, key: TileKey, payload: Bytes) {
        let entry = CacheEntry {
            payload,
            expires_at: Instant::now() + self.ttl,
        };

        let mut entries = self.entries.lock();
        if let Some((evicted, _)) = entries.push(key, entry) {
            if evicted != key {
                tracing::trace!(%evicted, "evicted tile from cache");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.entries.lock().cap()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
