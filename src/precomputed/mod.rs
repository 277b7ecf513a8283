//! Instant-tier lookup for common questions.
//!
//! Two strategies, tried in order:
//!
//! 1. **Exact**: hash of the normalized message text.
//! 2. **Pattern**: first intent pattern that matches, combined with a hash of
//!    the customer type and tier from the context.
//!
//! Both live in the key-value store under the `precomputed` sub-namespace.
//! Fresh answers are only written back when they are generic: the message
//! must fall inside a word-count band and neither side may mention anything
//! on the personal-data denylist.

pub mod patterns;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aho_corasick::AhoCorasick;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::PrecomputedConfig;
use crate::error::{CacheError, Result};
use crate::store::KeyValueStore;
use crate::utils::hash::{digest_parts, normalize_text, short};

use patterns::{classify_normalized, DEFAULT_DENYLIST, LONG_NUMBER_RE, NAME_PLACEHOLDER_RE};

/// Sub-namespace for precomputed answers in the key-value store.
pub const L2_PREFIX: &str = "precomputed";

const DEFAULT_CUSTOMER_TYPE: &str = "general";
const DEFAULT_TIER: &str = "standard";

/// Which strategy produced a hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MatchSource {
    Exact,
    Pattern { category: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrecomputedHit {
    /// Response map, personalized for the caller when it came from a pattern.
    pub response: Value,
    pub source: MatchSource,
}

/// Reply preloaded for one exact message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExactWarmup {
    pub text: String,
    /// A reply map, or a bare string used as its `response` field.
    pub response: Value,
}

/// Reply preloaded for an intent category and customer segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryWarmup {
    pub category: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub response: Value,
}

#[derive(Debug, Default)]
struct PrecomputedCounters {
    exact_hits: AtomicU64,
    pattern_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    skipped_writes: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrecomputedStats {
    pub exact_hits: u64,
    pub pattern_hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub skipped_writes: u64,
}

pub struct PrecomputedResponseStore {
    store: Arc<KeyValueStore>,
    denylist: AhoCorasick,
    exact_ttl: Duration,
    category_ttl: Duration,
    min_words: usize,
    max_words: usize,
    counters: PrecomputedCounters,
}

impl PrecomputedResponseStore {
    pub fn new(store: Arc<KeyValueStore>, config: &PrecomputedConfig) -> Result<Self> {
        let phrases: Vec<String> = DEFAULT_DENYLIST
            .iter()
            .map(|s| s.to_string())
            .chain(config.extra_denylist.iter().map(|s| s.to_lowercase()))
            .filter(|s| !s.is_empty())
            .collect();
        let denylist = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(&phrases)
            .map_err(|e| CacheError::Config(format!("invalid denylist: {}", e)))?;

        Ok(Self {
            store,
            denylist,
            exact_ttl: Duration::from_secs(config.exact_ttl_secs),
            category_ttl: Duration::from_secs(config.category_ttl_secs),
            min_words: config.min_words,
            max_words: config.max_words,
            counters: PrecomputedCounters::default(),
        })
    }

    /// Intent category for a raw message, if any pattern matches.
    pub fn classify(&self, text: &str) -> Option<&'static str> {
        classify_normalized(&normalize_text(text))
    }

    /// Exact match first, then pattern match.
    pub async fn lookup(
        &self,
        message: &str,
        context: &Map<String, Value>,
    ) -> Option<PrecomputedHit> {
        let normalized = normalize_text(message);
        if normalized.is_empty() {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if let Some(response) = self.store.get::<Value>(&exact_key(&normalized)).await {
            self.counters.exact_hits.fetch_add(1, Ordering::Relaxed);
            debug!(strategy = "exact", "Precomputed hit");
            return Some(PrecomputedHit {
                response,
                source: MatchSource::Exact,
            });
        }

        if let Some(category) = classify_normalized(&normalized) {
            let key = category_key(category, context);
            if let Some(cached) = self.store.get::<Value>(&key).await {
                self.counters.pattern_hits.fetch_add(1, Ordering::Relaxed);
                debug!(strategy = "pattern", category = category, "Precomputed hit");
                return Some(PrecomputedHit {
                    response: personalize(&cached, context),
                    source: MatchSource::Pattern {
                        category: category.to_string(),
                    },
                });
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Whether a message/reply pair is generic enough to share.
    pub fn is_cacheable(&self, input: &str, output: &str) -> bool {
        let normalized = normalize_text(input);
        let words = normalized.split(' ').filter(|w| !w.is_empty()).count();
        if words < self.min_words || words > self.max_words {
            return false;
        }
        !self.is_sensitive(&normalized) && !self.is_sensitive(&output.to_lowercase())
    }

    fn is_sensitive(&self, text: &str) -> bool {
        self.denylist.is_match(text) || LONG_NUMBER_RE.is_match(text)
    }

    /// Write a freshly computed reply back under the exact key and, when the
    /// message matches an intent, the category key.
    ///
    /// Returns `true` if anything was written.
    pub async fn store_computed(
        &self,
        message: &str,
        context: &Map<String, Value>,
        response: &Value,
    ) -> bool {
        let Some(text) = response.get("response").and_then(Value::as_str) else {
            self.counters.skipped_writes.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        if !self.is_cacheable(message, text) || mentions_customer(text, context) {
            self.counters.skipped_writes.fetch_add(1, Ordering::Relaxed);
            debug!("Computed reply not generic enough for the precomputed tier");
            return false;
        }

        let normalized = normalize_text(message);
        let exact_k = exact_key(&normalized);
        let category_k = classify_normalized(&normalized).map(|c| category_key(c, context));

        let exact = self.store.set(&exact_k, response, Some(self.exact_ttl));
        let category = async {
            match &category_k {
                Some(key) => self.store.set(key, response, Some(self.category_ttl)).await,
                None => false,
            }
        };
        let (exact_ok, category_ok) = tokio::join!(exact, category);

        let written = u64::from(exact_ok) + u64::from(category_ok);
        self.counters.writes.fetch_add(written, Ordering::Relaxed);
        written > 0
    }

    /// Preload a reply for one exact message.
    pub async fn warm_exact(&self, text: &str, response: &Value) -> bool {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return false;
        }
        let ok = self
            .store
            .set(&exact_key(&normalized), &as_response_map(response), Some(self.exact_ttl))
            .await;
        if ok {
            self.counters.writes.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Preload a reply for an intent category and customer segment.
    pub async fn warm_category(
        &self,
        category: &str,
        context: &Map<String, Value>,
        response: &Value,
    ) -> bool {
        let ok = self
            .store
            .set(
                &category_key(category, context),
                &as_response_map(response),
                Some(self.category_ttl),
            )
            .await;
        if ok {
            self.counters.writes.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    pub fn stats(&self) -> PrecomputedStats {
        PrecomputedStats {
            exact_hits: self.counters.exact_hits.load(Ordering::Relaxed),
            pattern_hits: self.counters.pattern_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            skipped_writes: self.counters.skipped_writes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for PrecomputedResponseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrecomputedResponseStore")
            .field("exact_ttl", &self.exact_ttl)
            .field("category_ttl", &self.category_ttl)
            .field("words", &(self.min_words..=self.max_words))
            .finish()
    }
}

fn exact_key(normalized: &str) -> String {
    format!("{}:exact:{}", L2_PREFIX, digest_parts(&[normalized]))
}

fn category_key(category: &str, context: &Map<String, Value>) -> String {
    let customer_type = context_str(context, "customer_type").unwrap_or(DEFAULT_CUSTOMER_TYPE);
    let tier = context_str(context, "tier").unwrap_or(DEFAULT_TIER);
    let segment = digest_parts(&[customer_type, tier]);
    format!("{}:category:{}:{}", L2_PREFIX, category, short(&segment, 16))
}

fn context_str<'a>(context: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    context
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Bare strings become `{"response": text}`.
fn as_response_map(response: &Value) -> Value {
    match response {
        Value::String(text) => serde_json::json!({ "response": text }),
        other => other.clone(),
    }
}

/// Fill `{name}` on a copy of the cached reply.
fn personalize(cached: &Value, context: &Map<String, Value>) -> Value {
    let mut out = cached.clone();
    if let Some(Value::String(text)) = out.get_mut("response") {
        if text.contains("{name}") {
            *text = match context_str(context, "customer_name") {
                Some(name) => text.replace("{name}", name),
                None => NAME_PLACEHOLDER_RE.replace_all(text, "").into_owned(),
            };
        }
    }
    out
}

fn mentions_customer(reply: &str, context: &Map<String, Value>) -> bool {
    match context_str(context, "customer_name") {
        Some(name) if name.chars().count() >= 3 => {
            reply.to_lowercase().contains(&name.to_lowercase())
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> PrecomputedResponseStore {
        PrecomputedResponseStore::new(
            Arc::new(KeyValueStore::in_memory("test")),
            &PrecomputedConfig::default(),
        )
        .unwrap()
    }

    fn ctx(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_exact_hit_ignores_case_and_spacing() {
        let pre = store();
        pre.warm_exact("Cual es su horario?", &json!("9 a 18h")).await;

        let hit = pre
            .lookup("  cual ES su   horario? ", &Map::new())
            .await
            .unwrap();
        assert_eq!(hit.source, MatchSource::Exact);
        assert_eq!(hit.response, json!({"response": "9 a 18h"}));
        assert_eq!(pre.stats().exact_hits, 1);
    }

    #[tokio::test]
    async fn test_pattern_hit_uses_segment() {
        let pre = store();
        let general = ctx(json!({"customer_type": "general"}));
        pre.warm_category(patterns::PRICING, &general, &json!("Desde $10"))
            .await;

        let hit = pre.lookup("cuanto cuesta", &general).await.unwrap();
        assert_eq!(
            hit.source,
            MatchSource::Pattern {
                category: patterns::PRICING.to_string()
            }
        );

        let vip = ctx(json!({"customer_type": "vip"}));
        assert!(pre.lookup("cuanto cuesta", &vip).await.is_none());
        let stats = pre.stats();
        assert_eq!(stats.pattern_hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_missing_segment_fields_use_defaults() {
        let pre = store();
        pre.warm_category(patterns::SHIPPING, &Map::new(), &json!("Enviamos a todo el pais"))
            .await;
        let explicit = ctx(json!({"customer_type": "general", "tier": "standard"}));
        assert!(pre.lookup("hacen envios?", &explicit).await.is_some());
    }

    #[tokio::test]
    async fn test_name_substitution_on_copy() {
        let pre = store();
        pre.warm_category(
            patterns::GREETING,
            &Map::new(),
            &json!("Hola {name}, ¿en qué te ayudo?"),
        )
        .await;

        let named = ctx(json!({"customer_name": "Ana"}));
        let hit = pre.lookup("hola", &named).await.unwrap();
        assert_eq!(hit.response["response"], "Hola Ana, ¿en qué te ayudo?");

        let anon = pre.lookup("hola", &Map::new()).await.unwrap();
        assert_eq!(anon.response["response"], "Hola, ¿en qué te ayudo?");

        // The stored template is untouched.
        let raw: Value = pre
            .store
            .get(&category_key(patterns::GREETING, &Map::new()))
            .await
            .unwrap();
        assert_eq!(raw["response"], "Hola {name}, ¿en qué te ayudo?");
    }

    #[test]
    fn test_is_cacheable_rules() {
        let pre = store();
        assert!(pre.is_cacheable("cuanto cuesta", "Desde $10"));
        assert!(!pre.is_cacheable("", "x"), "empty input is below the band");
        assert!(!pre.is_cacheable(&"palabra ".repeat(13), "x"), "too many words");
        assert!(!pre.is_cacheable("cual es mi pedido", "x"));
        assert!(!pre.is_cacheable("precio", "Tu password es abc"));
        assert!(!pre.is_cacheable("llamame al 987654321", "ok"));
        assert!(!pre.is_cacheable("escribe a ana@example.com", "ok"));
        assert!(!pre.is_cacheable("MY ORDER status", "ok"), "case-insensitive");
    }

    #[tokio::test]
    async fn test_store_computed_writes_both_keys() {
        let pre = store();
        let context = ctx(json!({"customer_type": "general"}));
        let reply = json!({"response": "El plan cuesta $10"});

        assert!(pre.store_computed("cuanto cuesta", &context, &reply).await);
        assert_eq!(pre.stats().writes, 2);

        // A differently worded pricing question now hits the category.
        let hit = pre.lookup("precio del plan", &context).await.unwrap();
        assert!(matches!(hit.source, MatchSource::Pattern { .. }));
    }

    #[tokio::test]
    async fn test_store_computed_without_category_writes_exact_only() {
        let pre = store();
        let reply = json!({"response": "Claro"});
        assert!(pre.store_computed("me interesa saber mas", &Map::new(), &reply).await);
        assert_eq!(pre.stats().writes, 1);
    }

    #[tokio::test]
    async fn test_store_computed_skips_personal_replies() {
        let pre = store();
        let context = ctx(json!({"customer_name": "Carolina"}));
        let reply = json!({"response": "Hola Carolina, el precio es $10"});
        assert!(!pre.store_computed("cuanto cuesta", &context, &reply).await);

        let no_text = json!({"answer": 1});
        assert!(!pre.store_computed("cuanto cuesta", &Map::new(), &no_text).await);

        let stats = pre.stats();
        assert_eq!(stats.skipped_writes, 2);
        assert_eq!(stats.writes, 0);
        assert!(pre.lookup("cuanto cuesta", &Map::new()).await.is_none());
    }

    #[test]
    fn test_extra_denylist() {
        let config = PrecomputedConfig {
            extra_denylist: vec!["Factura".into()],
            ..PrecomputedConfig::default()
        };
        let pre = PrecomputedResponseStore::new(
            Arc::new(KeyValueStore::in_memory("test")),
            &config,
        )
        .unwrap();
        assert!(!pre.is_cacheable("necesito mi factura", "ok"));
    }

    #[test]
    fn test_classify() {
        let pre = store();
        assert_eq!(pre.classify("  CUANTO cuesta "), Some(patterns::PRICING));
        assert_eq!(pre.classify("blue sky"), None);
    }
}
