//! Service object wiring every tier together.
//!
//! [`CacheService`] is built once at startup and handed to consumers. It owns
//! the background tasks (router write-back worker, revalidation worker and
//! periodic stats flush), started by [`CacheService::start`] and stopped by
//! [`CacheService::shutdown`], and exposes the admin calls an HTTP layer
//! would wrap.
//!
//! # Example
//!
//! ```rust
//! # tokio_test::block_on(async {
//! use std::sync::Arc;
//! use serde_json::{json, Map, Value};
//! use zeptocache::{CacheLevel, CacheService, Config, FnCompute, InMemoryBackend};
//!
//! let backend = Arc::new(InMemoryBackend::new());
//! let service = CacheService::new(&Config::default(), backend, None).unwrap();
//! let compute = FnCompute::new(|_m: String, _c: Map<String, Value>| async {
//!     Ok::<_, anyhow::Error>(json!({ "response": "Plans start at $10" }))
//! });
//!
//! let first = service.route_request("how much is it", &Map::new(), &compute).await;
//! assert_eq!(first.metrics.cache_level, CacheLevel::Computed);
//! let again = service.route_request("how much is it", &Map::new(), &compute).await;
//! assert_eq!(again.metrics.cache_level, CacheLevel::Instant);
//! # });
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{
    LocalLruCache, LruStats, Revalidator, TaggedCache, TaggedEntryInfo, TaggedStats,
    TieredDecisionCache, TieredStats, WarmupEntry,
};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::precomputed::{
    CategoryWarmup, ExactWarmup, PrecomputedResponseStore, PrecomputedStats,
};
use crate::router::{ResponseCacheRouter, ResponseCompute, RoutedResponse, RouterStats};
use crate::store::{connect_backend, KeyValueBackend, KeyValueStore, StoreStats};

/// Sub-namespaces `clear_namespace` knows how to clear beyond the key-value store.
const RESPONSE_NAMESPACE: &str = "response";
const TAGGED_NAMESPACE: &str = "tagged";
const DECISION_NAMESPACE: &str = "decision";

/// Preload document accepted by [`CacheService::warmup_from_file`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupFile {
    pub decisions: Vec<WarmupEntry>,
    pub exact: Vec<ExactWarmup>,
    pub categories: Vec<CategoryWarmup>,
}

/// How many warmup entries were stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmupReport {
    pub decisions: usize,
    pub instant: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStats {
    pub router: RouterStats,
    pub l1: LruStats,
    pub decisions: TieredStats,
    pub precomputed: PrecomputedStats,
    pub store: StoreStats,
    pub tagged: TaggedStats,
}

/// Result of [`CacheService::debug_get`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugEntry {
    /// `"store"` or `"tagged"`.
    pub source: &'static str,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tagged: Option<TaggedEntryInfo>,
}

struct BackgroundTasks {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct CacheService {
    config: Config,
    store: Arc<KeyValueStore>,
    l1: Arc<LocalLruCache<Value>>,
    decisions: Arc<TieredDecisionCache>,
    precomputed: Arc<PrecomputedResponseStore>,
    router: Arc<ResponseCacheRouter>,
    tagged: Arc<TaggedCache>,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl CacheService {
    /// Connect the configured backend and build every tier.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let backend = connect_backend(&config.store).await?;
        Self::new(config, backend, None)
    }

    /// Build on an already-constructed backend, optionally with a revalidator
    /// for the tagged cache.
    pub fn new(
        config: &Config,
        backend: Arc<dyn KeyValueBackend>,
        revalidator: Option<Arc<dyn Revalidator>>,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(KeyValueStore::new(backend, &config.store));
        let l1 = Arc::new(LocalLruCache::new(
            config.l1.max_size,
            Duration::from_secs(config.l1.default_ttl_secs),
        ));
        let decisions = Arc::new(TieredDecisionCache::from_config(
            &config.tiered,
            store.clone(),
        ));
        let precomputed = Arc::new(PrecomputedResponseStore::new(
            store.clone(),
            &config.precomputed,
        )?);
        let router = Arc::new(ResponseCacheRouter::new(
            precomputed.clone(),
            l1.clone(),
            decisions.clone(),
            &config.router,
        ));
        let tagged = Arc::new(TaggedCache::new(&config.tagged, revalidator));

        info!(
            backend = %store.backend_name(),
            namespace = %store.namespace(),
            l1_max_size = config.l1.max_size,
            "Cache service ready"
        );

        Ok(Self {
            config: config.clone(),
            store,
            l1,
            decisions,
            precomputed,
            router,
            tagged,
            tasks: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Arc<ResponseCacheRouter> {
        &self.router
    }

    pub fn decisions(&self) -> &Arc<TieredDecisionCache> {
        &self.decisions
    }

    pub fn precomputed(&self) -> &Arc<PrecomputedResponseStore> {
        &self.precomputed
    }

    pub fn tagged(&self) -> &Arc<TaggedCache> {
        &self.tagged
    }

    pub fn store(&self) -> &Arc<KeyValueStore> {
        &self.store
    }

    /// Start the write-back and revalidation workers and the periodic stats
    /// flush.
    ///
    /// Calling this again while running does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("service task lock poisoned");
        if tasks.is_some() {
            debug!("Cache service already started");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = vec![
            tokio::spawn(
                self.router
                    .clone()
                    .run_write_back_worker(shutdown_rx.clone()),
            ),
            tokio::spawn(
                self.tagged
                    .clone()
                    .run_revalidation_worker(shutdown_rx.clone()),
            ),
        ];
        let interval_secs = self.config.admin.stats_interval_secs;
        if interval_secs > 0 {
            handles.push(start_periodic_stats_flush(
                Arc::clone(self),
                Duration::from_secs(interval_secs),
                shutdown_rx,
            ));
        }

        info!(tasks = handles.len(), "Cache service background tasks started");
        *tasks = Some(BackgroundTasks {
            shutdown_tx,
            handles,
        });
    }

    pub fn is_running(&self) -> bool {
        self.tasks
            .lock()
            .expect("service task lock poisoned")
            .is_some()
    }

    /// Signal the background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        let tasks = self.tasks.lock().expect("service task lock poisoned").take();
        let Some(tasks) = tasks else {
            return;
        };
        let _ = tasks.shutdown_tx.send(true);
        for handle in tasks.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Cache service stopped");
    }

    pub async fn route_request(
        &self,
        message: &str,
        context: &Map<String, Value>,
        compute: &dyn ResponseCompute,
    ) -> RoutedResponse {
        self.router.route_request(message, context, compute).await
    }

    /// Wait for queued write-backs to land in the cheaper tiers.
    pub async fn flush_write_backs(&self) {
        self.router.flush_write_backs().await;
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            router: self.router.stats(),
            l1: self.l1.stats(),
            decisions: self.decisions.stats(),
            precomputed: self.precomputed.stats(),
            store: self.store.stats(),
            tagged: self.tagged.stats(),
        }
    }

    /// Log a one-line stats summary.
    pub fn emit_stats(&self, reason: &str) {
        let stats = self.stats();
        info!(
            event = "cache_stats",
            reason = reason,
            requests = stats.router.total_requests,
            efficiency_pct = stats.router.cache_efficiency,
            avg_response_ms = stats.router.avg_response_ms,
            fallbacks = stats.router.fallbacks,
            l1_size = stats.l1.size,
            l1_hit_rate = stats.l1.hit_rate(),
            decision_hit_rate = stats.decisions.hit_rate,
            decision_errors = stats.decisions.errors,
            store_failures = stats.store.failures,
            breaker_state = stats.store.breaker_state.as_str(),
            tagged_entries = stats.tagged.entries,
            "Cache statistics"
        );
    }

    /// Drop expired entries from the in-process tiers.
    pub fn purge_expired(&self) -> usize {
        self.l1.purge_expired() + self.tagged.purge_expired()
    }

    /// Clear one named cache area. Only names on the admin allow-list are
    /// accepted.
    pub async fn clear_namespace(&self, name: &str) -> Result<u64> {
        if !self
            .config
            .admin
            .clearable_namespaces
            .iter()
            .any(|allowed| allowed == name)
        {
            warn!(namespace = %name, "Refused to clear namespace not on the allow-list");
            return Err(CacheError::PolicyViolation(format!(
                "namespace '{}' is not clearable",
                name
            )));
        }

        let removed = match name {
            RESPONSE_NAMESPACE => {
                let size = self.l1.len() as u64;
                self.l1.clear();
                size
            }
            TAGGED_NAMESPACE => self.tagged.clear() as u64,
            DECISION_NAMESPACE => {
                let size = self.decisions.stats().l1.size as u64;
                self.decisions.clear_l1();
                size + self.store.clear_namespace(name).await
            }
            other => self.store.clear_namespace(other).await,
        };
        info!(namespace = %name, removed, "Namespace cleared");
        Ok(removed)
    }

    /// Raw lookup by key: the key-value store first (key relative to the
    /// namespace), then the tagged cache.
    pub async fn debug_get(&self, key: &str) -> Option<DebugEntry> {
        if let Some(value) = self.store.get::<Value>(key).await {
            return Some(DebugEntry {
                source: "store",
                value,
                tagged: None,
            });
        }
        let info = self.tagged.inspect(key)?;
        let value = self.tagged.get(key)?;
        Some(DebugEntry {
            source: TAGGED_NAMESPACE,
            value,
            tagged: Some(info),
        })
    }

    /// Remove a key from the key-value store and the tagged cache.
    pub async fn debug_delete(&self, key: &str) -> bool {
        let from_store = self.store.delete(key).await;
        let from_tagged = self.tagged.invalidate(key);
        from_store || from_tagged
    }

    pub fn invalidate_tag(&self, tag: &str) -> usize {
        self.tagged.invalidate_by_tag(tag)
    }

    /// Remove keys matching a glob from the tagged cache and the key-value
    /// store.
    pub async fn invalidate_pattern(&self, pattern: &str) -> u64 {
        let tagged = self.tagged.invalidate_pattern(pattern) as u64;
        let stored = self.store.delete_pattern(pattern).await;
        tagged + stored
    }

    pub async fn health_check(&self) -> bool {
        self.store.health_check().await
    }

    /// Preload decisions and instant-tier replies from a JSON file.
    pub async fn warmup_from_file(&self, path: &Path) -> Result<WarmupReport> {
        let content = tokio::fs::read_to_string(path).await?;
        let file: WarmupFile = serde_json::from_str(&content).map_err(|e| {
            CacheError::Config(format!("invalid warmup file {}: {}", path.display(), e))
        })?;
        let report = self.warmup(&file).await;
        info!(
            path = %path.display(),
            decisions = report.decisions,
            instant = report.instant,
            "Warmup file loaded"
        );
        Ok(report)
    }

    pub async fn warmup(&self, file: &WarmupFile) -> WarmupReport {
        WarmupReport {
            decisions: self.decisions.warmup(&file.decisions).await,
            instant: self.router.prewarm(&file.exact, &file.categories).await,
        }
    }
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("store", &self.store)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Emit stats and purge expired entries every `interval` until shutdown.
fn start_periodic_stats_flush(
    service: Arc<CacheService>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = service.purge_expired();
                    if purged > 0 {
                        debug!(purged, "Expired entries purged");
                    }
                    service.emit_stats("periodic");
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        service.emit_stats("shutdown");
                        break;
                    }
                }
            }
        }
    })
}
