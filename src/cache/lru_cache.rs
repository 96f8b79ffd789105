use lru::LruCache;
use parking_lot::Mutex;
use std::{
    hash::Hash,
    num::NonZeroUsize,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use tracing::debug;

/// Cache entry with optional absolute expiry.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            value,
            expires_at: ttl.filter(|ttl| !ttl.is_zero()).map(|ttl| now + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Capacity-bounded LRU cache with per-entry expiry.
///
/// Recency is tracked by `get`/`set`, never by insertion order alone. Expired
/// entries are dropped lazily on access or by [`LRUCache::cleanup_expired`].
#[derive(Debug)]
pub struct LRUCache<K: Hash + Eq, V> {
    data: Mutex<LruCache<K, CacheEntry<V>>>,
    default_ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> LRUCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Creates a cache without expiry. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self::with_ttl(capacity, None)
    }

    /// Creates a cache whose entries expire `ttl` after their last `set`.
    /// `None` or a zero duration means entries never expire.
    pub fn with_ttl(capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            data: Mutex::new(LruCache::new(capacity)),
            default_ttl: ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut data = self.data.lock();

        let expired = match data.get(key) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            None => false,
        };

        if expired {
            data.pop(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: K, value: V, ttl: Option<Duration>) {
        let mut data = self.data.lock();
        // push hands back either the previous value for this key or the evicted LRU entry
        if let Some((old_key, _)) = data.push(key.clone(), CacheEntry::new(value, ttl)) {
            if old_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Cache full, evicted least recently used entry");
            }
        }
    }

    pub fn delete(&self, key: &K) -> bool {
        self.data.lock().pop(key).is_some()
    }

    pub fn clear(&self) {
        self.data.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.lock().cap().get()
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut data = self.data.lock();

        let expired: Vec<K> = data
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            data.pop(key);
        }

        let removed = expired.len();
        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("Swept {} expired cache entries", removed);
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.len(),
        }
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        1.0 - self.hit_rate()
    }
}
