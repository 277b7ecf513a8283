//! Process-local LRU cache with per-entry TTL (the "L1" tier).
//!
//! Recency order lives in an [`lru::LruCache`] behind a single `Mutex`; the
//! lock is never held across an `.await`, so concurrent callers interleave
//! safely without blocking the runtime for long.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct L1Entry<V> {
    value: V,
    expires_at: Instant,
    access_count: u64,
}

impl<V> L1Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
struct LruInner<V> {
    entries: LruCache<String, L1Entry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

/// Snapshot of L1 counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LruStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub capacity: usize,
}

impl LruStats {
    /// Hit rate in `0.0..=1.0`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Fixed-capacity, per-entry-TTL cache.
#[derive(Debug)]
pub struct LocalLruCache<V = Value> {
    inner: Mutex<LruInner<V>>,
    default_ttl: Duration,
    capacity: usize,
}

impl<V: Clone> LocalLruCache<V> {
    /// `max_size` is clamped to a minimum of 1.
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        let capacity = max_size.max(1);
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruInner {
                entries: LruCache::new(cap),
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
            default_ttl,
            capacity,
        }
    }

    /// Return a clone of the value if present and unexpired.
    ///
    /// A hit becomes most-recently-used. An expired entry is dropped and the
    /// call counts as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("l1 lock poisoned");

        let expired = match inner.entries.peek(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                inner.misses += 1;
                return None;
            }
        };

        if expired {
            inner.entries.pop(key);
            inner.expirations += 1;
            inner.misses += 1;
            debug!(key = %key, "L1 entry expired");
            return None;
        }

        let value = inner.entries.get_mut(key).map(|entry| {
            entry.access_count = entry.access_count.saturating_add(1);
            entry.value.clone()
        });
        inner.hits += 1;
        value
    }

    /// Insert with the default TTL.
    pub fn set(&self, key: &str, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Insert or refresh an entry.
    ///
    /// Existing keys are refreshed in place (value, TTL and recency). New keys
    /// evict the least-recently-used entry when the cache is full.
    pub fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("l1 lock poisoned");

        if let Some(entry) = inner.entries.get_mut(key) {
            entry.value = value;
            entry.expires_at = now + ttl;
            return;
        }

        if inner.entries.len() >= self.capacity {
            if let Some((evicted, _)) = inner.entries.pop_lru() {
                inner.evictions += 1;
                debug!(key = %evicted, "L1 evicted least-recently-used entry");
            }
        }

        inner.entries.put(
            key.to_string(),
            L1Entry {
                value,
                expires_at: now + ttl,
                access_count: 0,
            },
        );
    }

    /// Whether an unexpired entry exists. Does not touch recency or counters.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let inner = self.inner.lock().expect("l1 lock poisoned");
        inner
            .entries
            .peek(key)
            .map(|e| !e.is_expired(now))
            .unwrap_or(false)
    }

    /// Number of recorded reads for a key, if present.
    pub fn access_count(&self, key: &str) -> Option<u64> {
        let inner = self.inner.lock().expect("l1 lock poisoned");
        inner.entries.peek(key).map(|e| e.access_count)
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("l1 lock poisoned");
        inner.entries.pop(key).is_some()
    }

    /// Remove every key starting with `prefix`. Returns how many were removed.
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock().expect("l1 lock poisoned");
        let doomed: Vec<String> = inner
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            inner.entries.pop(key.as_str());
        }
        doomed.len()
    }

    /// Drop all expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("l1 lock poisoned");
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.entries.pop(key.as_str());
        }
        inner.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("l1 lock poisoned");
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("l1 lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> LruStats {
        let inner = self.inner.lock().expect("l1 lock poisoned");
        LruStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            size: inner.entries.len(),
            capacity: self.capacity,
        }
    }

    /// Zero the hit/miss/eviction counters; entries are kept.
    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock().expect("l1 lock poisoned");
        inner.hits = 0;
        inner.misses = 0;
        inner.evictions = 0;
        inner.expirations = 0;
    }
}
