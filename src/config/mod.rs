//! Configuration for the cache service.
//!
//! Loaded from `~/.zeptocache/config.json`. Every section has defaults, so a
//! missing file (or a file that only sets a couple of fields) is fine.
//! A handful of deployment knobs can be overridden from the environment:
//!
//! - `ZEPTOCACHE_BACKEND`: `memory` or `redis`
//! - `ZEPTOCACHE_REDIS_URL`
//! - `ZEPTOCACHE_NAMESPACE`
//! - `ZEPTOCACHE_L1_MAX_SIZE`

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::tiered::CachePolicy;
use crate::error::{CacheError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub l1: L1Config,
    pub tiered: TieredConfig,
    pub precomputed: PrecomputedConfig,
    pub router: RouterConfig,
    pub tagged: TaggedConfig,
    pub admin: AdminConfig,
}

/// Which implementation backs the key-value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local map. Deterministic, used for tests and single-node setups.
    #[default]
    Memory,
    /// Remote Redis server (requires the `redis-backend` feature).
    Redis,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redis => write!(f, "redis"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "mock" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            _ => Err(format!("unknown backend: '{}' (expected memory/redis)", s)),
        }
    }
}

/// Key-value store (L2) settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    pub redis_url: String,
    /// Prefix applied to every key, e.g. `zeptocache:`.
    pub namespace: String,
    /// Upper bound for a single backend call.
    pub timeout_ms: u64,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit short-circuits calls.
    pub cooldown_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            namespace: "zeptocache".to_string(),
            timeout_ms: 150,
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

/// Router-owned process-local LRU (the "fast" tier).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct L1Config {
    pub max_size: usize,
    pub default_ttl_secs: u64,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieredConfig {
    /// Capacity of the decision cache's own L1.
    pub l1_max_size: usize,
    /// Policies merged over the built-in table at construction time.
    pub policies: HashMap<String, CachePolicy>,
}

impl Default for TieredConfig {
    fn default() -> Self {
        Self {
            l1_max_size: 2000,
            policies: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecomputedConfig {
    pub exact_ttl_secs: u64,
    pub category_ttl_secs: u64,
    /// Inclusive word-count band for inputs considered generic enough to share.
    pub min_words: usize,
    pub max_words: usize,
    /// Keywords added to the built-in personal-data denylist.
    pub extra_denylist: Vec<String>,
}

impl Default for PrecomputedConfig {
    fn default() -> Self {
        Self {
            exact_ttl_secs: 3600,
            category_ttl_secs: 86_400,
            min_words: 1,
            max_words: 12,
            extra_denylist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub instant_target_ms: u64,
    pub fast_target_ms: u64,
    pub standard_target_ms: u64,
    pub computed_target_ms: u64,
    /// Reply substituted when the compute callback fails.
    pub fallback_response: String,
    /// Accept the last reply of the same conversation when its stored
    /// customer type, tier and stage match exactly.
    pub conversation_fallback: bool,
    /// Pending write-backs held for the background worker. Further replies
    /// are served but not cached while it is full.
    pub write_back_queue_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            instant_target_ms: 50,
            fast_target_ms: 100,
            standard_target_ms: 200,
            computed_target_ms: 500,
            fallback_response:
                "Sorry, I'm having trouble answering right now. Could you try again in a moment?"
                    .to_string(),
            conversation_fallback: true,
            write_back_queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaggedConfig {
    pub default_ttl_secs: u64,
    /// Extra window after expiry during which stale values are still served.
    pub stale_grace_secs: u64,
    /// Payloads at or above this size are candidates for compression.
    pub compression_threshold_bytes: usize,
    pub revalidation_queue_capacity: usize,
}

impl Default for TaggedConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            stale_grace_secs: 60,
            compression_threshold_bytes: 1024,
            revalidation_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Namespaces that `clear_namespace` is allowed to wipe.
    pub clearable_namespaces: Vec<String>,
    /// Period of the background stats log line. `0` disables it.
    pub stats_interval_secs: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            clearable_namespaces: vec![
                "decision".to_string(),
                "precomputed".to_string(),
                "response".to_string(),
                "tagged".to_string(),
            ],
            stats_interval_secs: 60,
        }
    }
}

impl Config {
    /// Base directory: `~/.zeptocache`.
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".zeptocache")
    }

    /// Default config file path.
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load from the default path, apply env overrides, and validate.
    ///
    /// A missing file yields defaults.
    pub fn load() -> Result<Self> {
        let path = Self::path();
        let mut config = if path.exists() {
            Self::load_from_path(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without env overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CacheError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            CacheError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Apply `ZEPTOCACHE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("ZEPTOCACHE_BACKEND") {
            match raw.parse() {
                Ok(kind) => self.store.backend = kind,
                Err(e) => warn!(error = %e, "Ignoring ZEPTOCACHE_BACKEND"),
            }
        }
        if let Some(url) = lookup("ZEPTOCACHE_REDIS_URL") {
            self.store.redis_url = url;
        }
        if let Some(ns) = lookup("ZEPTOCACHE_NAMESPACE") {
            self.store.namespace = ns;
        }
        if let Some(raw) = lookup("ZEPTOCACHE_L1_MAX_SIZE") {
            match raw.trim().parse::<usize>() {
                Ok(n) => self.l1.max_size = n,
                Err(e) => warn!(value = %raw, error = %e, "Ignoring ZEPTOCACHE_L1_MAX_SIZE"),
            }
        }
    }

    /// Reject settings that would make a tier unusable.
    pub fn validate(&self) -> Result<()> {
        if self.l1.max_size == 0 {
            return Err(CacheError::Config("l1.max_size must be at least 1".into()));
        }
        if self.tiered.l1_max_size == 0 {
            return Err(CacheError::Config(
                "tiered.l1_max_size must be at least 1".into(),
            ));
        }
        if self.precomputed.min_words > self.precomputed.max_words {
            return Err(CacheError::Config(format!(
                "precomputed word band is inverted ({} > {})",
                self.precomputed.min_words, self.precomputed.max_words
            )));
        }
        if self.tagged.revalidation_queue_capacity == 0 {
            return Err(CacheError::Config(
                "tagged.revalidation_queue_capacity must be at least 1".into(),
            ));
        }
        if self.router.write_back_queue_capacity == 0 {
            return Err(CacheError::Config(
                "router.write_back_queue_capacity must be at least 1".into(),
            ));
        }
        if self.store.namespace.trim().is_empty() {
            return Err(CacheError::Config("store.namespace must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.store.backend, BackendKind::Memory);
        assert_eq!(cfg.store.failure_threshold, 5);
        assert_eq!(cfg.l1.max_size, 1000);
        assert_eq!(cfg.router.instant_target_ms, 50);
        assert_eq!(cfg.router.computed_target_ms, 500);
        assert!(cfg.router.conversation_fallback);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"l1": {"max_size": 2}, "store": {"backend": "redis"}}"#)
            .unwrap();

        let cfg = Config::load_from_path(&path).unwrap();
        assert_eq!(cfg.l1.max_size, 2);
        assert_eq!(cfg.l1.default_ttl_secs, 300);
        assert_eq!(cfg.store.backend, BackendKind::Redis);
        assert_eq!(cfg.store.namespace, "zeptocache");
    }

    #[test]
    fn test_unparsable_file_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        match Config::load_from_path(&path) {
            Err(CacheError::Config(msg)) => assert!(msg.contains("parse"), "{msg}"),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::default();
        let env: HashMap<&str, &str> = [
            ("ZEPTOCACHE_BACKEND", "redis"),
            ("ZEPTOCACHE_REDIS_URL", "redis://cache:6380"),
            ("ZEPTOCACHE_NAMESPACE", "sales"),
            ("ZEPTOCACHE_L1_MAX_SIZE", "42"),
        ]
        .into_iter()
        .collect();
        cfg.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(cfg.store.backend, BackendKind::Redis);
        assert_eq!(cfg.store.redis_url, "redis://cache:6380");
        assert_eq!(cfg.store.namespace, "sales");
        assert_eq!(cfg.l1.max_size, 42);
    }

    #[test]
    fn test_bad_env_values_are_ignored() {
        let mut cfg = Config::default();
        cfg.apply_overrides(|name| match name {
            "ZEPTOCACHE_BACKEND" => Some("memcached".to_string()),
            "ZEPTOCACHE_L1_MAX_SIZE" => Some("lots".to_string()),
            _ => None,
        });
        assert_eq!(cfg.store.backend, BackendKind::Memory);
        assert_eq!(cfg.l1.max_size, 1000);
    }

    #[test]
    fn test_validate_rejects_inverted_word_band() {
        let mut cfg = Config::default();
        cfg.precomputed.min_words = 10;
        cfg.precomputed.max_words = 3;
        assert!(matches!(cfg.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_l1() {
        let mut cfg = Config::default();
        cfg.l1.max_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_write_back_queue() {
        let mut cfg = Config::default();
        cfg.router.write_back_queue_capacity = 0;
        assert!(matches!(cfg.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("Redis".parse::<BackendKind>().unwrap(), BackendKind::Redis);
        assert_eq!("mock".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert!("etcd".parse::<BackendKind>().is_err());
    }
}
