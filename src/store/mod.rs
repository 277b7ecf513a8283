//! Namespaced key-value store (the "L2" tier).
//!
//! [`KeyValueBackend`] is the raw, fallible interface implemented by
//! [`InMemoryBackend`] and (with the `redis-backend` feature) `RedisBackend`.
//! The backend is picked once at construction.
//!
//! [`KeyValueStore`] is what the rest of the crate talks to. It prefixes every
//! key with the namespace, bounds each call with a timeout, routes calls
//! through a [`CircuitBreaker`], and turns every failure into `None`/`false`
//! plus a log line. Callers never see a backend error.

pub mod breaker;
pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis_backend;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{BackendKind, StoreConfig};
use crate::error::{CacheError, Result};

pub use breaker::{BreakerState, CircuitBreaker};
pub use memory::InMemoryBackend;
#[cfg(feature = "redis-backend")]
pub use redis_backend::RedisBackend;

/// Raw backend operations. Keys passed here are already namespaced.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Short backend label used in logs and stats.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value`; `ttl = None` means no expiry.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete every key matching a glob pattern. Returns the number removed.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}

/// Build the backend named in `config`.
pub async fn connect_backend(config: &StoreConfig) -> Result<Arc<dyn KeyValueBackend>> {
    match config.backend {
        BackendKind::Memory => Ok(Arc::new(InMemoryBackend::new())),
        #[cfg(feature = "redis-backend")]
        BackendKind::Redis => Ok(Arc::new(RedisBackend::connect(&config.redis_url).await?)),
        #[cfg(not(feature = "redis-backend"))]
        BackendKind::Redis => Err(CacheError::Config(
            "store.backend = \"redis\" requires building with --features redis-backend".into(),
        )),
    }
}

#[derive(Debug, Default)]
struct StoreCounters {
    gets: AtomicU64,
    hits: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    failures: AtomicU64,
    short_circuited: AtomicU64,
    serialization_errors: AtomicU64,
}

/// Point-in-time store statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub backend: String,
    pub namespace: String,
    pub gets: u64,
    pub hits: u64,
    pub sets: u64,
    pub deletes: u64,
    pub failures: u64,
    pub short_circuited: u64,
    pub serialization_errors: u64,
    pub breaker_state: BreakerState,
    pub breaker_trips: u64,
}

pub struct KeyValueStore {
    backend: Arc<dyn KeyValueBackend>,
    namespace: String,
    timeout: Duration,
    breaker: CircuitBreaker,
    counters: StoreCounters,
}

impl KeyValueStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>, config: &StoreConfig) -> Self {
        let breaker = CircuitBreaker::new(
            backend.name(),
            config.failure_threshold,
            Duration::from_secs(config.cooldown_secs),
        );
        Self {
            backend,
            namespace: config.namespace.trim_end_matches(':').to_string(),
            timeout: Duration::from_millis(config.timeout_ms.max(1)),
            breaker,
            counters: StoreCounters::default(),
        }
    }

    /// In-memory store with default settings under `namespace`.
    pub fn in_memory(namespace: &str) -> Self {
        let config = StoreConfig {
            namespace: namespace.to_string(),
            ..StoreConfig::default()
        };
        Self::new(Arc::new(InMemoryBackend::new()), &config)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Fully-qualified backend key for `key`.
    pub fn namespaced_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Fetch and decode a value. Misses, backend failures and undecodable
    /// payloads all come back as `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.try_get(key).await.ok().flatten()
    }

    /// Like [`get`](Self::get) but reports the failure instead of hiding it.
    ///
    /// The failure is already logged and counted when this returns `Err`.
    pub async fn try_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        let full_key = self.namespaced_key(key);
        let raw = match self.guarded("get", self.backend.get(&full_key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.log_failure("get", key, &e);
                return Err(e);
            }
        };
        match serde_json::from_str::<T>(&raw) {
            Ok(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            Err(e) => {
                self.counters
                    .serialization_errors
                    .fetch_add(1, Ordering::Relaxed);
                let err = CacheError::serialization(format!("store get {}", key), e);
                warn!(key = %key, error = %err, "Undecodable cached value treated as miss");
                Err(err)
            }
        }
    }

    /// Encode and store a value. Returns `false` on any failure.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        self.try_set(key, value, ttl).await.is_ok()
    }

    /// Like [`set`](Self::set) but returns the (already logged) failure.
    pub async fn try_set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                self.counters
                    .serialization_errors
                    .fetch_add(1, Ordering::Relaxed);
                let err = CacheError::serialization(format!("store set {}", key), e);
                warn!(key = %key, error = %err, "Value not serializable, write skipped");
                return Err(err);
            }
        };
        let full_key = self.namespaced_key(key);
        match self
            .guarded("set", self.backend.set(&full_key, raw, ttl))
            .await
        {
            Ok(()) => {
                self.counters.sets.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.log_failure("set", key, &e);
                Err(e)
            }
        }
    }

    /// Remove a key. Returns `false` if it was absent or the backend failed.
    pub async fn delete(&self, key: &str) -> bool {
        let full_key = self.namespaced_key(key);
        match self.guarded("delete", self.backend.delete(&full_key)).await {
            Ok(removed) => {
                if removed {
                    self.counters.deletes.fetch_add(1, Ordering::Relaxed);
                }
                removed
            }
            Err(e) => {
                self.log_failure("delete", key, &e);
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        let full_key = self.namespaced_key(key);
        match self.guarded("exists", self.backend.exists(&full_key)).await {
            Ok(found) => found,
            Err(e) => {
                self.log_failure("exists", key, &e);
                false
            }
        }
    }

    /// Delete every key in this namespace matching `pattern` (glob).
    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        let full_pattern = self.namespaced_key(pattern);
        match self
            .guarded("delete_pattern", self.backend.delete_pattern(&full_pattern))
            .await
        {
            Ok(n) => {
                self.counters.deletes.fetch_add(n, Ordering::Relaxed);
                n
            }
            Err(e) => {
                self.log_failure("delete_pattern", pattern, &e);
                0
            }
        }
    }

    /// Delete everything under `<namespace>:<sub>:`.
    pub async fn clear_namespace(&self, sub: &str) -> u64 {
        self.delete_pattern(&format!("{}:*", sub)).await
    }

    /// Whether the backend answers a ping within the timeout.
    pub async fn health_check(&self) -> bool {
        match self.guarded("ping", self.backend.ping()).await {
            Ok(()) => true,
            Err(e) => {
                debug!(backend = %self.backend.name(), error = %e, "Backend ping failed");
                false
            }
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            backend: self.backend.name().to_string(),
            namespace: self.namespace.clone(),
            gets: self.counters.gets.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            short_circuited: self.counters.short_circuited.load(Ordering::Relaxed),
            serialization_errors: self.counters.serialization_errors.load(Ordering::Relaxed),
            breaker_state: self.breaker.state(),
            breaker_trips: self.breaker.trips(),
        }
    }

    /// Run one backend call through the breaker and the timeout.
    async fn guarded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.breaker.allow() {
            self.counters.short_circuited.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::CircuitOpen(self.backend.name().to_string()));
        }
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => {
                self.breaker.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                if e.is_backend_failure() {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    self.breaker.record_failure();
                } else {
                    self.breaker.record_success();
                }
                Err(e)
            }
            Err(_) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.breaker.record_failure();
                debug!(
                    op = op,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Backend call timed out"
                );
                Err(CacheError::Timeout(self.timeout.as_millis() as u64))
            }
        }
    }

    fn log_failure(&self, op: &str, key: &str, err: &CacheError) {
        match err {
            // Already logged when the circuit opened; keep the hot path quiet.
            CacheError::CircuitOpen(_) => {
                debug!(op = op, key = %key, "Store call short-circuited")
            }
            _ => warn!(
                op = op,
                key = %key,
                backend = %self.backend.name(),
                error = %err,
                "Store call failed, degrading to miss"
            ),
        }
    }
}

impl std::fmt::Debug for KeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueStore")
            .field("backend", &self.backend.name())
            .field("namespace", &self.namespace)
            .field("breaker", &self.breaker.state())
            .finish()
    }
}
