//! Policy-driven decision cache spanning L1 and the key-value store.
//!
//! Every named data class (customer profiles, intent analyses, LLM replies,
//! ...) has a [`CachePolicy`] saying how long values live, which tiers hold
//! them, and how large they may be. The table is fixed once the cache is
//! built.
//!
//! Reads go L1 → L2 and promote L2 hits into L1 when the policy includes it.
//! Writes go to each tier independently so one tier failing never blocks the
//! other. Backend failures are counted in `errors` and never returned.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::lru::{LocalLruCache, LruStats};
use crate::config::TieredConfig;
use crate::error::CacheError;
use crate::store::KeyValueStore;
use crate::utils::hash::digest_parts;

/// Sub-namespace under which decisions live in the key-value store.
pub const L2_PREFIX: &str = "decision";

/// Which tiers a data class is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierMembership {
    L1,
    L2,
    Both,
}

impl TierMembership {
    pub fn uses_l1(self) -> bool {
        matches!(self, TierMembership::L1 | TierMembership::Both)
    }

    pub fn uses_l2(self) -> bool {
        matches!(self, TierMembership::L2 | TierMembership::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub ttl_seconds: u64,
    pub tiers: TierMembership,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size_kb: Option<u64>,
}

impl CachePolicy {
    pub fn new(ttl_seconds: u64, tiers: TierMembership, max_size_kb: Option<u64>) -> Self {
        Self {
            ttl_seconds,
            tiers,
            max_size_kb,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    fn max_bytes(&self) -> Option<usize> {
        self.max_size_kb.map(|kb| (kb as usize).saturating_mul(1024))
    }
}

/// Built-in policy table.
pub fn default_policies() -> HashMap<String, CachePolicy> {
    use TierMembership::*;
    [
        ("customer_profile", 1800, Both, 64),
        ("conversation_context", 300, L1, 128),
        ("intent_analysis", 600, Both, 32),
        ("objection_analysis", 3600, L2, 32),
        ("sales_stage", 900, Both, 8),
        ("ml_prediction", 900, Both, 16),
        ("response_template", 86400, Both, 64),
        ("llm_response", 1800, L2, 256),
        ("conversation_response", 1800, L2, 256),
    ]
    .into_iter()
    .map(|(class, ttl, tiers, kb)| (class.to_string(), CachePolicy::new(ttl, tiers, Some(kb))))
    .collect()
}

/// One `{data_class, key, value}` triple for bulk preloading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupEntry {
    pub data_class: String,
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Default)]
struct TieredCounters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    sets: AtomicU64,
    rejected_writes: AtomicU64,
    warmed: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TieredStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub sets: u64,
    pub rejected_writes: u64,
    pub warmed: u64,
    pub hit_rate: f64,
    pub l1: LruStats,
}

pub struct TieredDecisionCache {
    l1: LocalLruCache<Value>,
    store: Arc<KeyValueStore>,
    policies: HashMap<String, CachePolicy>,
    counters: TieredCounters,
}

impl TieredDecisionCache {
    /// Build a cache whose policy table is the built-in one with `overrides`
    /// merged on top.
    pub fn new(
        l1_max_size: usize,
        store: Arc<KeyValueStore>,
        overrides: HashMap<String, CachePolicy>,
    ) -> Self {
        let mut policies = default_policies();
        policies.extend(overrides);
        Self {
            // Per-entry TTLs always come from the policy; this default is unused.
            l1: LocalLruCache::new(l1_max_size, Duration::from_secs(300)),
            store,
            policies,
            counters: TieredCounters::default(),
        }
    }

    pub fn from_config(config: &TieredConfig, store: Arc<KeyValueStore>) -> Self {
        Self::new(config.l1_max_size, store, config.policies.clone())
    }

    /// Deterministic key for a decision.
    ///
    /// Components are hashed in a fixed order with length prefixes; `extra`
    /// is a sorted map so insertion order never matters. The data class stays
    /// readable as the key prefix.
    pub fn generate_cache_key(
        data_class: &str,
        conversation_id: &str,
        message_count: u64,
        profile_hash: Option<&str>,
        objectives_hash: Option<&str>,
        extra: &BTreeMap<String, String>,
    ) -> String {
        fn optional(v: Option<&str>) -> String {
            match v {
                Some(v) => format!("+{}", v),
                None => "-".to_string(),
            }
        }

        let mut parts = vec![
            data_class.to_string(),
            conversation_id.to_string(),
            message_count.to_string(),
            optional(profile_hash),
            optional(objectives_hash),
        ];
        for (k, v) in extra {
            parts.push(k.clone());
            parts.push(v.clone());
        }
        format!("{}:{}", data_class, digest_parts(&parts))
    }

    pub fn policy(&self, data_class: &str) -> Option<&CachePolicy> {
        self.policies.get(data_class)
    }

    /// Names of all configured data classes, sorted.
    pub fn data_classes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub async fn get(&self, data_class: &str, key: &str) -> Option<Value> {
        let Some(policy) = self.policies.get(data_class) else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(data_class = %data_class, "Read for unknown data class");
            return None;
        };
        let key = scoped_key(data_class, key);

        if policy.tiers.uses_l1() {
            if let Some(value) = self.l1.get(&key) {
                self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
                debug!(data_class = %data_class, tier = "l1", "Decision cache hit");
                return Some(value);
            }
        }

        if policy.tiers.uses_l2() {
            match self.store.try_get::<Value>(&l2_key(&key)).await {
                Ok(Some(value)) => {
                    self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                    if policy.tiers.uses_l1() {
                        self.l1.set_with_ttl(&key, value.clone(), policy.ttl());
                    }
                    debug!(data_class = %data_class, tier = "l2", "Decision cache hit");
                    return Some(value);
                }
                Ok(None) => {}
                Err(_) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(data_class = %data_class, "Decision cache miss");
        None
    }

    /// Store a value under its data-class policy.
    ///
    /// Returns `true` if at least one tier accepted the write. Oversized
    /// values are refused outright.
    pub async fn set(&self, data_class: &str, key: &str, value: &Value) -> bool {
        let Some(policy) = self.policies.get(data_class) else {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(data_class = %data_class, "Write for unknown data class ignored");
            return false;
        };

        let size = match serde_json::to_vec(value) {
            Ok(bytes) => bytes.len(),
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                let err = CacheError::serialization(data_class, e);
                warn!(data_class = %data_class, error = %err, "Decision not serializable");
                return false;
            }
        };
        if let Some(max) = policy.max_bytes() {
            if size > max {
                self.counters.rejected_writes.fetch_add(1, Ordering::Relaxed);
                let err = CacheError::PolicyViolation(format!(
                    "{} value is {} bytes, limit {} bytes",
                    data_class, size, max
                ));
                warn!(data_class = %data_class, error = %err, "Decision write refused");
                return false;
            }
        }

        let key = scoped_key(data_class, key);
        let mut stored = false;

        if policy.tiers.uses_l1() {
            self.l1.set_with_ttl(&key, value.clone(), policy.ttl());
            stored = true;
        }
        if policy.tiers.uses_l2() {
            match self
                .store
                .try_set(&l2_key(&key), value, Some(policy.ttl()))
                .await
            {
                Ok(()) => stored = true,
                Err(_) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if stored {
            self.counters.sets.fetch_add(1, Ordering::Relaxed);
        }
        stored
    }

    /// Preload many entries. Returns how many were stored.
    pub async fn warmup(&self, entries: &[WarmupEntry]) -> usize {
        let mut stored = 0;
        for entry in entries {
            if self.set(&entry.data_class, &entry.key, &entry.value).await {
                stored += 1;
            }
        }
        self.counters
            .warmed
            .fetch_add(stored as u64, Ordering::Relaxed);
        debug!(requested = entries.len(), stored = stored, "Decision cache warmed");
        stored
    }

    /// Remove one key from both tiers. Returns whether anything was removed.
    pub async fn delete(&self, data_class: &str, key: &str) -> bool {
        let key = scoped_key(data_class, key);
        let in_l1 = self.l1.delete(&key);
        let in_l2 = self.store.delete(&l2_key(&key)).await;
        in_l1 || in_l2
    }

    /// Drop every cached value of one data class from both tiers.
    pub async fn invalidate_class(&self, data_class: &str) -> u64 {
        let prefix = format!("{}:", data_class);
        let from_l1 = self.l1.delete_prefix(&prefix) as u64;
        let from_l2 = self
            .store
            .delete_pattern(&format!("{}:{}*", L2_PREFIX, prefix))
            .await;
        debug!(data_class = %data_class, from_l1, from_l2, "Data class invalidated");
        from_l1 + from_l2
    }

    /// Empty the decision L1. L2 is cleared through the store's namespace.
    pub fn clear_l1(&self) {
        self.l1.clear();
    }

    pub fn stats(&self) -> TieredStats {
        let l1_hits = self.counters.l1_hits.load(Ordering::Relaxed);
        let l2_hits = self.counters.l2_hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = l1_hits + l2_hits + misses;
        TieredStats {
            l1_hits,
            l2_hits,
            misses,
            errors: self.counters.errors.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            rejected_writes: self.counters.rejected_writes.load(Ordering::Relaxed),
            warmed: self.counters.warmed.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                (l1_hits + l2_hits) as f64 / total as f64
            },
            l1: self.l1.stats(),
        }
    }
}

/// Keys produced by [`TieredDecisionCache::generate_cache_key`] already carry
/// the class prefix; free-form keys get it added so class invalidation
/// reaches them too.
fn scoped_key(data_class: &str, key: &str) -> String {
    match key.strip_prefix(data_class) {
        Some(rest) if rest.starts_with(':') => key.to_string(),
        _ => format!("{}:{}", data_class, key),
    }
}

fn l2_key(scoped: &str) -> String {
    format!("{}:{}", L2_PREFIX, scoped)
}

impl std::fmt::Debug for TieredDecisionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredDecisionCache")
            .field("policies", &self.policies.len())
            .field("l1_size", &self.l1.len())
            .field("store", &self.store)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::error::Result;
    use crate::store::{InMemoryBackend, KeyValueBackend};
    use async_trait::async_trait;
    use serde_json::json;

    fn cache() -> (TieredDecisionCache, Arc<KeyValueStore>) {
        let store = Arc::new(KeyValueStore::in_memory("test"));
        (
            TieredDecisionCache::new(100, store.clone(), HashMap::new()),
            store,
        )
    }

    fn extra(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Backend that refuses every call.
    struct DownBackend;

    #[async_trait]
    impl KeyValueBackend for DownBackend {
        fn name(&self) -> &str {
            "down"
        }
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(CacheError::BackendUnavailable("down".into()))
        }
        async fn set(&self, _key: &str, _value: String, _ttl: Option<Duration>) -> Result<()> {
            Err(CacheError::BackendUnavailable("down".into()))
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(CacheError::BackendUnavailable("down".into()))
        }
        async fn exists(&self, _key: &str) -> Result<bool> {
            Err(CacheError::BackendUnavailable("down".into()))
        }
        async fn delete_pattern(&self, _pattern: &str) -> Result<u64> {
            Err(CacheError::BackendUnavailable("down".into()))
        }
        async fn ping(&self) -> Result<()> {
            Err(CacheError::BackendUnavailable("down".into()))
        }
    }

    #[test]
    fn test_key_is_stable_under_extra_ordering() {
        let mut a = BTreeMap::new();
        a.insert("channel".to_string(), "web".to_string());
        a.insert("lang".to_string(), "es".to_string());
        let mut b = BTreeMap::new();
        b.insert("lang".to_string(), "es".to_string());
        b.insert("channel".to_string(), "web".to_string());

        let key = TieredDecisionCache::generate_cache_key;
        let k1 = key("intent_analysis", "c1", 3, Some("p"), None, &a);
        let k2 = key("intent_analysis", "c1", 3, Some("p"), None, &b);
        assert_eq!(k1, k2);
        assert!(k1.starts_with("intent_analysis:"));
    }

    #[test]
    fn test_key_changes_with_any_argument() {
        let key = TieredDecisionCache::generate_cache_key;
        let base_extra = extra(&[("lang", "es")]);
        let other_extra = extra(&[("lang", "en")]);
        let no_extra = BTreeMap::new();
        let base = key("intent_analysis", "c1", 3, Some("p"), Some("o"), &base_extra);
        let variants = [
            key("sales_stage", "c1", 3, Some("p"), Some("o"), &base_extra),
            key("intent_analysis", "c2", 3, Some("p"), Some("o"), &base_extra),
            key("intent_analysis", "c1", 4, Some("p"), Some("o"), &base_extra),
            key("intent_analysis", "c1", 3, Some("q"), Some("o"), &base_extra),
            key("intent_analysis", "c1", 3, None, Some("o"), &base_extra),
            key("intent_analysis", "c1", 3, Some("p"), None, &base_extra),
            key("intent_analysis", "c1", 3, Some("p"), Some("o"), &other_extra),
            key("intent_analysis", "c1", 3, Some("p"), Some("o"), &no_extra),
        ];
        for v in &variants {
            assert_ne!(&base, v);
        }
    }

    #[test]
    fn test_empty_hash_differs_from_missing_hash() {
        let e = BTreeMap::new();
        assert_ne!(
            TieredDecisionCache::generate_cache_key("x", "c", 1, Some(""), None, &e),
            TieredDecisionCache::generate_cache_key("x", "c", 1, None, None, &e)
        );
    }

    #[tokio::test]
    async fn test_exactly_one_counter_per_get() {
        let (cache, _) = cache();
        cache.set("intent_analysis", "k", &json!({"intent": "pricing"})).await;

        assert!(cache.get("intent_analysis", "k").await.is_some());
        assert!(cache.get("intent_analysis", "missing").await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.l2_hits, 0);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
    }

    #[tokio::test]
    async fn test_l2_hit_promotes_into_l1() {
        let (cache, _) = cache();
        cache.set("customer_profile", "p1", &json!({"tier": "gold"})).await;
        cache.clear_l1();

        assert_eq!(
            cache.get("customer_profile", "p1").await,
            Some(json!({"tier": "gold"}))
        );
        assert_eq!(
            cache.get("customer_profile", "p1").await,
            Some(json!({"tier": "gold"}))
        );
        let stats = cache.stats();
        assert_eq!(stats.l2_hits, 1);
        assert_eq!(stats.l1_hits, 1);
    }

    #[tokio::test]
    async fn test_l2_only_class_never_touches_l1() {
        let (cache, store) = cache();
        cache.set("objection_analysis", "o1", &json!("price")).await;
        assert_eq!(cache.stats().l1.size, 0);
        assert!(store.exists("decision:objection_analysis:o1").await);
        assert!(cache.get("objection_analysis", "o1").await.is_some());
        assert_eq!(cache.stats().l1.size, 0);
    }

    #[tokio::test]
    async fn test_l1_only_class_skips_store() {
        let (cache, store) = cache();
        cache.set("conversation_context", "c1", &json!({"turns": 2})).await;
        assert!(!store.exists("decision:conversation_context:c1").await);
        assert!(cache.get("conversation_context", "c1").await.is_some());
    }

    #[tokio::test]
    async fn test_oversized_value_is_refused() {
        let (cache, _) = cache();
        let big = json!("x".repeat(9 * 1024));
        assert!(!cache.set("sales_stage", "s1", &big).await);
        assert!(cache.get("sales_stage", "s1").await.is_none());
        let stats = cache.stats();
        assert_eq!(stats.rejected_writes, 1);
        assert_eq!(stats.sets, 0);
    }

    #[tokio::test]
    async fn test_l2_failure_does_not_block_l1() {
        let store = Arc::new(KeyValueStore::new(Arc::new(DownBackend), &StoreConfig::default()));
        let cache = TieredDecisionCache::new(10, store, HashMap::new());

        assert!(cache.set("intent_analysis", "k", &json!(1)).await);
        assert_eq!(cache.get("intent_analysis", "k").await, Some(json!(1)));
        assert!(cache.get("intent_analysis", "other").await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.errors, 2, "one failed L2 write, one failed L2 read");
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_unknown_class_is_soft() {
        let (cache, _) = cache();
        assert!(!cache.set("nope", "k", &json!(1)).await);
        assert!(cache.get("nope", "k").await.is_none());
        assert_eq!(cache.stats().errors, 2);
    }

    #[tokio::test]
    async fn test_overrides_replace_defaults() {
        let store = Arc::new(KeyValueStore::in_memory("test"));
        let mut overrides = HashMap::new();
        overrides.insert(
            "sales_stage".to_string(),
            CachePolicy::new(60, TierMembership::L1, None),
        );
        overrides.insert(
            "custom".to_string(),
            CachePolicy::new(10, TierMembership::Both, Some(1)),
        );
        let cache = TieredDecisionCache::new(10, store, overrides);

        assert_eq!(cache.policy("sales_stage").unwrap().ttl_seconds, 60);
        assert!(cache.policy("custom").is_some());
        assert!(cache.policy("customer_profile").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_ttl_applies() {
        let (cache, _) = cache();
        cache.set("conversation_context", "c", &json!(1)).await;
        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(cache.get("conversation_context", "c").await.is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("conversation_context", "c").await.is_none());
    }

    #[tokio::test]
    async fn test_warmup_and_invalidate_class() {
        let (cache, _) = cache();
        let entries = vec![
            WarmupEntry {
                data_class: "response_template".into(),
                key: "greeting".into(),
                value: json!("Hola"),
            },
            WarmupEntry {
                data_class: "response_template".into(),
                key: "farewell".into(),
                value: json!("Adios"),
            },
            WarmupEntry {
                data_class: "intent_analysis".into(),
                key: "i1".into(),
                value: json!("pricing"),
            },
        ];
        assert_eq!(cache.warmup(&entries).await, 3);
        assert_eq!(cache.stats().warmed, 3);

        let removed = cache.invalidate_class("response_template").await;
        assert_eq!(removed, 4, "two keys from each tier");
        assert!(cache.get("response_template", "greeting").await.is_none());
        assert!(cache.get("intent_analysis", "i1").await.is_some());
    }

    #[tokio::test]
    async fn test_generated_key_is_not_double_prefixed() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = Arc::new(KeyValueStore::new(backend.clone(), &StoreConfig::default()));
        let cache = TieredDecisionCache::new(10, store, HashMap::new());
        let key = TieredDecisionCache::generate_cache_key(
            "ml_prediction",
            "c",
            1,
            None,
            None,
            &BTreeMap::new(),
        );

        cache.set("ml_prediction", &key, &json!(0.8)).await;
        let full = format!("zeptocache:decision:{}", key);
        assert!(backend.exists(&full).await.unwrap());

        assert!(cache.delete("ml_prediction", &key).await);
        assert!(cache.get("ml_prediction", &key).await.is_none());
    }

    #[test]
    fn test_policy_serde() {
        let policy: CachePolicy =
            serde_json::from_str(r#"{"ttl_seconds": 5, "tiers": "both"}"#).unwrap();
        assert_eq!(policy, CachePolicy::new(5, TierMembership::Both, None));
        assert!(policy.tiers.uses_l1() && policy.tiers.uses_l2());
    }
}
