//! General-purpose tagged cache with compression and stale-while-revalidate.
//!
//! Entries and the tag → keys index share one mutex so they can never drift
//! apart: an index entry exists exactly as long as some live entry carries
//! that tag.
//!
//! Once an entry's TTL passes it is still served for `stale_grace` more
//! seconds, flagged stale, while a refresh job is queued for the
//! [`Revalidator`]. Jobs go through a bounded channel drained by
//! [`TaggedCache::run_revalidation_worker`]; duplicates for a key already
//! queued are dropped.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TaggedConfig;
use crate::error::{CacheError, Result};
use crate::utils::glob::glob_to_regex;
use crate::utils::hash::{digest_bytes, short};

/// Produces a fresh value for a stale entry.
#[async_trait]
pub trait Revalidator: Send + Sync {
    /// `current` is the stale value being served. An error leaves it in place.
    async fn revalidate(&self, key: &str, current: &Value) -> Result<Value>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Vec<u8>,
    compressed: bool,
    size_bytes: usize,
    etag: String,
    tags: BTreeSet<String>,
    created_at: Instant,
    expires_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    /// Unique per write; tells a revalidation whether its entry was replaced.
    generation: u64,
}

impl CacheEntry {
    fn ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(self.created_at)
    }
}

#[derive(Debug, Default)]
struct TaggedInner {
    entries: HashMap<String, CacheEntry>,
    tag_index: HashMap<String, HashSet<String>>,
    pending: HashSet<String>,
}

impl TaggedInner {
    /// Remove an entry and unlink it from every tag it carried.
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        for tag in &entry.tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        Some(entry)
    }

    fn insert(&mut self, key: &str, entry: CacheEntry) {
        self.remove(key);
        for tag in &entry.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.entries.insert(key.to_string(), entry);
    }
}

/// A successful read.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedHit {
    pub value: Value,
    pub etag: String,
    /// Served past its TTL while a refresh is pending.
    pub stale: bool,
}

/// Entry metadata for debugging surfaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaggedEntryInfo {
    pub etag: String,
    pub tags: Vec<String>,
    pub compressed: bool,
    pub size_bytes: usize,
    pub access_count: u64,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub ttl_remaining_secs: u64,
    pub stale: bool,
}

#[derive(Debug, Default)]
struct TaggedCounters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    invalidations: AtomicU64,
    revalidations_ok: AtomicU64,
    revalidations_failed: AtomicU64,
    revalidations_discarded: AtomicU64,
    dropped_jobs: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaggedStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub invalidations: u64,
    pub revalidations_ok: u64,
    pub revalidations_failed: u64,
    /// Revalidations whose entry was invalidated or rewritten meanwhile.
    pub revalidations_discarded: u64,
    pub dropped_jobs: u64,
    pub entries: usize,
    pub tags: usize,
    pub compressed_entries: usize,
    pub stored_bytes: usize,
}

pub struct TaggedCache {
    inner: Mutex<TaggedInner>,
    default_ttl: Duration,
    stale_grace: Duration,
    compression_threshold: usize,
    revalidator: Option<Arc<dyn Revalidator>>,
    queue_tx: mpsc::Sender<String>,
    queue_rx: Mutex<Option<mpsc::Receiver<String>>>,
    generations: AtomicU64,
    counters: TaggedCounters,
}

impl TaggedCache {
    pub fn new(config: &TaggedConfig, revalidator: Option<Arc<dyn Revalidator>>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.revalidation_queue_capacity.max(1));
        Self {
            inner: Mutex::new(TaggedInner::default()),
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            stale_grace: Duration::from_secs(config.stale_grace_secs),
            compression_threshold: config.compression_threshold_bytes,
            revalidator,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            generations: AtomicU64::new(0),
            counters: TaggedCounters::default(),
        }
    }

    /// Store `value` with the default TTL. Returns its ETag.
    pub fn set(&self, key: &str, value: &Value, tags: &[&str]) -> Result<String> {
        self.set_with_ttl(key, value, tags, self.default_ttl)
    }

    /// Store `value`, replacing any previous entry and its tag links.
    pub fn set_with_ttl(
        &self,
        key: &str,
        value: &Value,
        tags: &[&str],
        ttl: Duration,
    ) -> Result<String> {
        let tags = tags.iter().map(|t| t.to_string()).collect();
        self.store_entry(key, value, tags, ttl)
    }

    fn store_entry(
        &self,
        key: &str,
        value: &Value,
        tags: BTreeSet<String>,
        ttl: Duration,
    ) -> Result<String> {
        let entry = self.build_entry(key, value, tags, ttl)?;
        let etag = entry.etag.clone();
        let compressed = entry.compressed;
        self.inner
            .lock()
            .expect("tagged cache lock poisoned")
            .insert(key, entry);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, compressed, "Tagged entry stored");
        Ok(etag)
    }

    fn build_entry(
        &self,
        key: &str,
        value: &Value,
        tags: BTreeSet<String>,
        ttl: Duration,
    ) -> Result<CacheEntry> {
        let raw = serde_json::to_vec(value)
            .map_err(|e| CacheError::serialization(format!("tagged set {}", key), e))?;
        let etag = etag_for(&raw);
        let (payload, compressed) = self.maybe_compress(raw)?;

        let now = Instant::now();
        Ok(CacheEntry {
            size_bytes: payload.len(),
            payload,
            compressed,
            etag,
            tags,
            created_at: now,
            expires_at: now + ttl,
            last_accessed: now,
            access_count: 0,
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Gzip payloads above the threshold, keeping the result only when it
    /// saves at least 10%.
    fn maybe_compress(&self, raw: Vec<u8>) -> Result<(Vec<u8>, bool)> {
        if raw.len() < self.compression_threshold {
            return Ok((raw, false));
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        let packed = encoder.finish()?;
        if packed.len() * 10 <= raw.len() * 9 {
            Ok((packed, true))
        } else {
            Ok((raw, false))
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lookup(key).map(|hit| hit.value)
    }

    /// Read an entry, serving it stale inside the grace window.
    pub fn lookup(&self, key: &str) -> Option<TaggedHit> {
        let now = Instant::now();
        let (payload, compressed, etag, stale) = {
            let mut inner = self.inner.lock().expect("tagged cache lock poisoned");
            let Some(entry) = inner.entries.get_mut(key) else {
                drop(inner);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            };

            if now >= entry.expires_at + self.stale_grace {
                inner.remove(key);
                drop(inner);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Tagged entry past stale grace, purged");
                return None;
            }

            entry.last_accessed = now;
            entry.access_count = entry.access_count.saturating_add(1);
            let stale = now >= entry.expires_at;
            let snapshot = (
                entry.payload.clone(),
                entry.compressed,
                entry.etag.clone(),
                stale,
            );
            if stale {
                self.schedule_revalidation(&mut inner, key);
            }
            snapshot
        };

        match decode_payload(&payload, compressed) {
            Ok(value) => {
                if stale {
                    self.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                }
                Some(TaggedHit { value, etag, stale })
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Tagged entry unreadable, dropping");
                self.inner
                    .lock()
                    .expect("tagged cache lock poisoned")
                    .remove(key);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn schedule_revalidation(&self, inner: &mut TaggedInner, key: &str) {
        if self.revalidator.is_none() || inner.pending.contains(key) {
            return;
        }
        match self.queue_tx.try_send(key.to_string()) {
            Ok(()) => {
                inner.pending.insert(key.to_string());
            }
            Err(_) => {
                self.counters.dropped_jobs.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Revalidation queue full, job dropped");
            }
        }
    }

    /// Drain revalidation jobs until `shutdown` flips to `true`.
    ///
    /// Only one worker can run per cache; a second call returns immediately.
    /// The queue is handed back on exit, so a later call can start a new
    /// worker that picks up any jobs still queued.
    pub async fn run_revalidation_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let receiver = self
            .queue_rx
            .lock()
            .expect("tagged cache lock poisoned")
            .take();
        let Some(mut receiver) = receiver else {
            warn!("Revalidation worker already running");
            return;
        };
        info!("Revalidation worker started");

        loop {
            tokio::select! {
                job = receiver.recv() => {
                    match job {
                        Some(key) => self.revalidate_key(&key).await,
                        None => break,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        *self.queue_rx.lock().expect("tagged cache lock poisoned") = Some(receiver);
        info!("Revalidation worker stopped");
    }

    async fn revalidate_key(&self, key: &str) {
        let Some(revalidator) = self.revalidator.as_ref() else {
            return;
        };

        let snapshot = {
            let mut inner = self.inner.lock().expect("tagged cache lock poisoned");
            inner.pending.remove(key);
            inner.entries.get(key).map(|e| {
                (
                    e.payload.clone(),
                    e.compressed,
                    e.tags.clone(),
                    e.ttl(),
                    e.generation,
                )
            })
        };
        let Some((payload, compressed, tags, ttl, generation)) = snapshot else {
            debug!(key = %key, "Entry gone before revalidation");
            return;
        };

        let current = match decode_payload(&payload, compressed) {
            Ok(value) => value,
            Err(e) => {
                self.counters
                    .revalidations_failed
                    .fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Stale entry unreadable, skipping revalidation");
                return;
            }
        };

        let fresh = match revalidator.revalidate(key, &current).await {
            Ok(fresh) => fresh,
            Err(e) => {
                self.counters
                    .revalidations_failed
                    .fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Revalidation failed, keeping stale entry");
                return;
            }
        };
        let entry = match self.build_entry(key, &fresh, tags, ttl) {
            Ok(entry) => entry,
            Err(e) => {
                self.counters
                    .revalidations_failed
                    .fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Revalidated value could not be stored");
                return;
            }
        };

        // Only replace the exact entry that was revalidated. An invalidation
        // or a newer `set` while the revalidator ran wins.
        let mut inner = self.inner.lock().expect("tagged cache lock poisoned");
        let unchanged = inner
            .entries
            .get(key)
            .is_some_and(|e| e.generation == generation);
        if !unchanged {
            drop(inner);
            self.counters
                .revalidations_discarded
                .fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Entry changed during revalidation, result discarded");
            return;
        }
        inner.insert(key, entry);
        drop(inner);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        self.counters.revalidations_ok.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Entry revalidated");
    }

    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self
            .inner
            .lock()
            .expect("tagged cache lock poisoned")
            .remove(key)
            .is_some();
        if removed {
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every entry carrying `tag`. Returns how many were removed.
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut inner = self.inner.lock().expect("tagged cache lock poisoned");
        let Some(keys) = inner.tag_index.remove(tag) else {
            return 0;
        };
        let mut removed = 0;
        for key in keys {
            if inner.remove(&key).is_some() {
                removed += 1;
            }
        }
        drop(inner);
        self.counters
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        debug!(tag = %tag, removed, "Tag invalidated");
        removed
    }

    /// Remove every key matching a glob pattern.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let re = glob_to_regex(pattern);
        let mut inner = self.inner.lock().expect("tagged cache lock poisoned");
        let doomed: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| re.is_match(k))
            .cloned()
            .collect();
        for key in &doomed {
            inner.remove(key);
        }
        drop(inner);
        self.counters
            .invalidations
            .fetch_add(doomed.len() as u64, Ordering::Relaxed);
        doomed.len()
    }

    /// Drop entries past their TTL and stale grace.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("tagged cache lock poisoned");
        let doomed: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| now >= e.expires_at + self.stale_grace)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            inner.remove(key);
        }
        doomed.len()
    }

    /// Metadata for one entry without counting as a read.
    pub fn inspect(&self, key: &str) -> Option<TaggedEntryInfo> {
        let now = Instant::now();
        let inner = self.inner.lock().expect("tagged cache lock poisoned");
        inner.entries.get(key).map(|e| TaggedEntryInfo {
            etag: e.etag.clone(),
            tags: e.tags.iter().cloned().collect(),
            compressed: e.compressed,
            size_bytes: e.size_bytes,
            access_count: e.access_count,
            age_secs: now.saturating_duration_since(e.created_at).as_secs(),
            idle_secs: now.saturating_duration_since(e.last_accessed).as_secs(),
            ttl_remaining_secs: e.expires_at.saturating_duration_since(now).as_secs(),
            stale: now >= e.expires_at,
        })
    }

    /// Sorted list of stored keys, stale ones included.
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("tagged cache lock poisoned");
        let mut keys: Vec<String> = inner.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Keys currently linked to `tag`, sorted.
    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("tagged cache lock poisoned");
        let mut keys: Vec<String> = inner
            .tag_index
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().expect("tagged cache lock poisoned");
        let count = inner.entries.len();
        inner.entries.clear();
        inner.tag_index.clear();
        inner.pending.clear();
        count
    }

    pub fn stats(&self) -> TaggedStats {
        let inner = self.inner.lock().expect("tagged cache lock poisoned");
        TaggedStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            stale_hits: self.counters.stale_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            revalidations_ok: self.counters.revalidations_ok.load(Ordering::Relaxed),
            revalidations_failed: self.counters.revalidations_failed.load(Ordering::Relaxed),
            revalidations_discarded: self
                .counters
                .revalidations_discarded
                .load(Ordering::Relaxed),
            dropped_jobs: self.counters.dropped_jobs.load(Ordering::Relaxed),
            entries: inner.entries.len(),
            tags: inner.tag_index.len(),
            compressed_entries: inner.entries.values().filter(|e| e.compressed).count(),
            stored_bytes: inner.entries.values().map(|e| e.size_bytes).sum(),
        }
    }
}

impl std::fmt::Debug for TaggedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggedCache")
            .field("default_ttl", &self.default_ttl)
            .field("stale_grace", &self.stale_grace)
            .field("revalidator", &self.revalidator.is_some())
            .finish()
    }
}

/// Quoted content hash of the serialized value.
fn etag_for(raw: &[u8]) -> String {
    format!("\"{}\"", short(&digest_bytes(raw), 32))
}

fn decode_payload(payload: &[u8], compressed: bool) -> Result<Value> {
    if compressed {
        let mut raw = Vec::new();
        GzDecoder::new(payload).read_to_end(&mut raw)?;
        Ok(serde_json::from_slice(&raw)?)
    } else {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    fn config() -> TaggedConfig {
        TaggedConfig {
            default_ttl_secs: 60,
            stale_grace_secs: 30,
            compression_threshold_bytes: 256,
            revalidation_queue_capacity: 4,
        }
    }

    /// Returns `{"version": n}` with an increasing counter, or fails while `fail` is set.
    #[derive(Default)]
    struct CountingRevalidator {
        calls: AtomicU64,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Revalidator for CountingRevalidator {
        async fn revalidate(&self, _key: &str, _current: &Value) -> Result<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail.load(Ordering::SeqCst) {
                return Err(CacheError::BackendUnavailable("origin down".into()));
            }
            Ok(json!({ "version": n }))
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_set_get_and_etag() {
        let cache = TaggedCache::new(&config(), None);
        let etag = cache.set("product:1", &json!({"name": "Tent"}), &["products"]).unwrap();
        let hit = cache.lookup("product:1").unwrap();
        assert_eq!(hit.value, json!({"name": "Tent"}));
        assert_eq!(hit.etag, etag);
        assert!(!hit.stale);

        let same = cache.set("product:2", &json!({"name": "Tent"}), &[]).unwrap();
        assert_eq!(etag, same, "etag depends only on content");
        let other = cache.set("product:3", &json!({"name": "Stove"}), &[]).unwrap();
        assert_ne!(etag, other);
    }

    #[test]
    fn test_invalidate_by_tag_is_complete() {
        let cache = TaggedCache::new(&config(), None);
        cache.set("a", &json!(1), &["catalog", "es"]).unwrap();
        cache.set("b", &json!(2), &["catalog"]).unwrap();
        cache.set("c", &json!(3), &["es"]).unwrap();

        assert_eq!(cache.invalidate_by_tag("catalog"), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_none());
        assert!(cache.keys_for_tag("catalog").is_empty());
        // "a" also carried "es"; the index must not keep pointing at it.
        assert_eq!(cache.keys_for_tag("es"), vec!["c".to_string()]);
        assert_eq!(cache.stats().tags, 1);
    }

    #[test]
    fn test_overwrite_relinks_tags() {
        let cache = TaggedCache::new(&config(), None);
        cache.set("a", &json!(1), &["old"]).unwrap();
        cache.set("a", &json!(2), &["new"]).unwrap();
        assert!(cache.keys_for_tag("old").is_empty());
        assert_eq!(cache.invalidate_by_tag("old"), 0);
        assert_eq!(cache.get("a"), Some(json!(2)));
    }

    #[test]
    fn test_invalidate_pattern_and_key() {
        let cache = TaggedCache::new(&config(), None);
        cache.set("user:1:profile", &json!(1), &["users"]).unwrap();
        cache.set("user:2:profile", &json!(2), &["users"]).unwrap();
        cache.set("order:1", &json!(3), &[]).unwrap();

        assert_eq!(cache.invalidate_pattern("user:*:profile"), 2);
        assert_eq!(cache.keys(), vec!["order:1".to_string()]);
        assert!(cache.keys_for_tag("users").is_empty());
        assert!(cache.invalidate("order:1"));
        assert!(!cache.invalidate("order:1"));
    }

    #[test]
    fn test_large_repetitive_payload_is_compressed() {
        let cache = TaggedCache::new(&config(), None);
        let value = json!({ "body": "hola ".repeat(500) });
        cache.set("big", &value, &[]).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.compressed_entries, 1);
        assert!(stats.stored_bytes < serde_json::to_vec(&value).unwrap().len());
        assert_eq!(cache.get("big"), Some(value));
    }

    #[test]
    fn test_incompressible_payload_stored_raw() {
        // Gzip framing alone outweighs any saving on a short payload.
        let cfg = TaggedConfig {
            compression_threshold_bytes: 8,
            ..config()
        };
        let cache = TaggedCache::new(&cfg, None);
        let value = json!("q7Zx!2Lm");
        cache.set("noise", &value, &[]).unwrap();
        assert_eq!(cache.stats().compressed_entries, 0);
        assert_eq!(cache.get("noise"), Some(value));
    }

    #[test]
    fn test_small_payload_not_compressed() {
        let cache = TaggedCache::new(&config(), None);
        cache.set("small", &json!("aaaaaaaa"), &[]).unwrap();
        assert_eq!(cache.stats().compressed_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_then_purged() {
        let cache = TaggedCache::new(&config(), None);
        cache.set("k", &json!("v"), &["t"]).unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let hit = cache.lookup("k").unwrap();
        assert!(hit.stale);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cache.lookup("k").is_none());
        assert!(cache.keys_for_tag("t").is_empty());

        let stats = cache.stats();
        assert_eq!(stats.stale_hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_respects_grace() {
        let cache = TaggedCache::new(&config(), None);
        cache.set("a", &json!(1), &["t"]).unwrap();
        cache.set_with_ttl("b", &json!(2), &["t"], Duration::from_secs(600)).unwrap();

        tokio::time::advance(Duration::from_secs(70)).await;
        assert_eq!(cache.purge_expired(), 0, "a is stale but inside grace");
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.keys_for_tag("t"), vec!["b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_read_triggers_revalidation() {
        let revalidator = Arc::new(CountingRevalidator::default());
        let cache = Arc::new(TaggedCache::new(&config(), Some(revalidator.clone())));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(cache.clone().run_revalidation_worker(shutdown_rx));

        cache.set("k", &json!({"version": 0}), &["t"]).unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        let hit = cache.lookup("k").unwrap();
        assert!(hit.stale);
        assert_eq!(hit.value, json!({"version": 0}), "stale value served immediately");

        // A second stale read while the job is queued does not enqueue again.
        let _ = cache.lookup("k");

        let c = cache.clone();
        wait_for(move || c.stats().revalidations_ok == 1).await;
        let fresh = cache.lookup("k").unwrap();
        assert!(!fresh.stale);
        assert_eq!(fresh.value, json!({"version": 1}));
        assert_eq!(cache.keys_for_tag("t"), vec!["k".to_string()]);
        assert_eq!(revalidator.calls.load(Ordering::SeqCst), 1);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_revalidation_keeps_stale_entry() {
        let revalidator = Arc::new(CountingRevalidator::default());
        revalidator.fail.store(true, Ordering::SeqCst);
        let cache = Arc::new(TaggedCache::new(&config(), Some(revalidator.clone())));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(cache.clone().run_revalidation_worker(shutdown_rx));

        cache.set("k", &json!("old"), &[]).unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.lookup("k").unwrap().stale);

        let c = cache.clone();
        wait_for(move || c.stats().revalidations_failed == 1).await;
        let hit = cache.lookup("k").unwrap();
        assert_eq!(hit.value, json!("old"));
        assert!(hit.stale);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_jobs() {
        let revalidator = Arc::new(CountingRevalidator::default());
        let cfg = TaggedConfig {
            revalidation_queue_capacity: 1,
            ..config()
        };
        // No worker running, so the queue stays full.
        let cache = TaggedCache::new(&cfg, Some(revalidator));
        cache.set("a", &json!(1), &[]).unwrap();
        cache.set("b", &json!(2), &[]).unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(cache.lookup("a").is_some());
        assert!(cache.lookup("b").is_some());
        assert_eq!(cache.stats().dropped_jobs, 1);
    }

    #[tokio::test]
    async fn test_second_worker_returns_immediately() {
        let cache = Arc::new(TaggedCache::new(&config(), None));
        let (shutdown_tx, rx1) = watch::channel(false);
        let rx2 = shutdown_tx.subscribe();
        let first = tokio::spawn(cache.clone().run_revalidation_worker(rx1));
        tokio::task::yield_now().await;
        cache.clone().run_revalidation_worker(rx2).await;

        shutdown_tx.send(true).unwrap();
        first.await.unwrap();
    }

    /// Holds every revalidation until the test releases it.
    #[derive(Default)]
    struct GatedRevalidator {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl Revalidator for GatedRevalidator {
        async fn revalidate(&self, _key: &str, _current: &Value) -> Result<Value> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(json!("revalidated"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_during_revalidation_wins() {
        let revalidator = Arc::new(GatedRevalidator::default());
        let cache = Arc::new(TaggedCache::new(&config(), Some(revalidator.clone())));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(cache.clone().run_revalidation_worker(shutdown_rx));

        cache.set("product:1", &json!("v1"), &["catalog"]).unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.lookup("product:1").unwrap().stale);

        revalidator.entered.notified().await;
        assert_eq!(cache.invalidate_by_tag("catalog"), 1);
        revalidator.release.notify_one();

        let c = cache.clone();
        wait_for(move || c.stats().revalidations_discarded == 1).await;
        assert!(cache.get("product:1").is_none());
        assert!(cache.keys_for_tag("catalog").is_empty());
        assert_eq!(cache.stats().tags, 0);
        assert_eq!(cache.stats().revalidations_ok, 0);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_during_revalidation_is_not_overwritten() {
        let revalidator = Arc::new(GatedRevalidator::default());
        let cache = Arc::new(TaggedCache::new(&config(), Some(revalidator.clone())));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(cache.clone().run_revalidation_worker(shutdown_rx));

        cache.set("k", &json!("v1"), &["old"]).unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        let _ = cache.lookup("k");

        revalidator.entered.notified().await;
        cache.set("k", &json!("v2"), &["new"]).unwrap();
        revalidator.release.notify_one();

        let c = cache.clone();
        wait_for(move || c.stats().revalidations_discarded == 1).await;
        assert_eq!(cache.get("k"), Some(json!("v2")));
        assert!(cache.keys_for_tag("old").is_empty());
        assert_eq!(cache.keys_for_tag("new"), vec!["k".to_string()]);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_can_be_restarted() {
        let revalidator = Arc::new(CountingRevalidator::default());
        let cache = Arc::new(TaggedCache::new(&config(), Some(revalidator.clone())));

        let (first_tx, first_rx) = watch::channel(false);
        let first = tokio::spawn(cache.clone().run_revalidation_worker(first_rx));
        tokio::task::yield_now().await;
        first_tx.send(true).unwrap();
        first.await.unwrap();

        let (second_tx, second_rx) = watch::channel(false);
        let second = tokio::spawn(cache.clone().run_revalidation_worker(second_rx));
        cache.set("k", &json!(0), &[]).unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.lookup("k").unwrap().stale);

        let c = cache.clone();
        wait_for(move || c.stats().revalidations_ok == 1).await;
        assert_eq!(cache.get("k"), Some(json!({"version": 1})));

        second_tx.send(true).unwrap();
        second.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_inspect_reports_metadata() {
        let cache = TaggedCache::new(&config(), None);
        cache.set("k", &json!("v"), &["b", "a"]).unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let _ = cache.get("k");

        let info = cache.inspect("k").unwrap();
        assert_eq!(info.tags, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(info.access_count, 1);
        assert_eq!(info.age_secs, 10);
        assert_eq!(info.idle_secs, 0);
        assert_eq!(info.ttl_remaining_secs, 50);
        assert!(!info.stale);
        assert!(cache.inspect("missing").is_none());
    }

    #[test]
    fn test_clear() {
        let cache = TaggedCache::new(&config(), None);
        cache.set("a", &json!(1), &["t"]).unwrap();
        assert_eq!(cache.clear(), 1);
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().tags, 0);
    }
}
