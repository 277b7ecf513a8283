//! Four-tier response router.
//!
//! Lookups run strictly in cost order and stop at the first hit:
//!
//! | level      | source                                   | default target |
//! |------------|------------------------------------------|----------------|
//! | `instant`  | precomputed exact / pattern store        | 50 ms          |
//! | `fast`     | process-local L1 keyed by context        | 100 ms         |
//! | `standard` | decision cache (profile hash, last reply) | 200 ms         |
//! | `computed` | caller's [`ResponseCompute`]             | 500 ms         |
//!
//! Whatever answers is written back into every cheaper tier it is eligible
//! for, so an equivalent request next time resolves earlier. While
//! [`ResponseCacheRouter::run_write_back_worker`] is running those writes go
//! through a bounded queue and never hold up the caller; without it they run
//! inline before `route_request` returns. A failing
//! compute callback yields a fixed fallback reply with an `error` field and
//! is never cached. `route_request` itself cannot fail.

pub mod metrics;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{LocalLruCache, TieredDecisionCache};
use crate::config::RouterConfig;
use crate::error::CacheError;
use crate::precomputed::{CategoryWarmup, ExactWarmup, PrecomputedResponseStore};
use crate::utils::hash::{digest_parts, normalize_text};

pub use metrics::{LevelStats, RouterMetrics, RouterStats};

/// Decision-cache class holding replies keyed by customer profile.
pub const LLM_RESPONSE_CLASS: &str = "llm_response";
/// Decision-cache class holding the last reply per conversation.
pub const CONVERSATION_RESPONSE_CLASS: &str = "conversation_response";

/// Tier that produced a reply, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLevel {
    Instant,
    Fast,
    Standard,
    Computed,
}

impl CacheLevel {
    pub const ALL: [CacheLevel; 4] = [
        CacheLevel::Instant,
        CacheLevel::Fast,
        CacheLevel::Standard,
        CacheLevel::Computed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLevel::Instant => "instant",
            CacheLevel::Fast => "fast",
            CacheLevel::Standard => "standard",
            CacheLevel::Computed => "computed",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produces a fresh reply when no tier has one.
///
/// The returned map must contain a string `response` field.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResponseCompute: Send + Sync {
    async fn compute(&self, message: &str, context: &Map<String, Value>) -> anyhow::Result<Value>;
}

/// Adapts an async closure into a [`ResponseCompute`].
///
/// ```rust,ignore
/// let compute = FnCompute::new(|message: String, _ctx| async move {
///     Ok::<_, anyhow::Error>(serde_json::json!({ "response": format!("echo: {message}") }))
/// });
/// ```
pub struct FnCompute<F> {
    f: F,
}

impl<F> FnCompute<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ResponseCompute for FnCompute<F>
where
    F: Fn(String, Map<String, Value>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send,
{
    async fn compute(&self, message: &str, context: &Map<String, Value>) -> anyhow::Result<Value> {
        (self.f)(message.to_string(), context.clone()).await
    }
}

/// Per-request routing outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingMetrics {
    pub cache_level: CacheLevel,
    pub response_time_ms: f64,
    pub target_time_ms: u64,
    pub within_target: bool,
    pub cache_efficiency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutedResponse {
    /// Reply map with `_cache_metadata` attached.
    pub response: Value,
    pub metrics: RoutingMetrics,
}

impl RoutedResponse {
    /// The reply text, if present.
    pub fn text(&self) -> Option<&str> {
        self.response.get("response").and_then(Value::as_str)
    }
}

/// Fields the standard tier compares when reusing a conversation's last reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Segment {
    customer_type: Option<String>,
    tier: Option<String>,
    stage: Option<String>,
}

impl Segment {
    fn from_context(context: &Map<String, Value>) -> Self {
        Self {
            customer_type: context_str(context, "customer_type").map(str::to_string),
            tier: context_str(context, "tier").map(str::to_string),
            stage: context_str(context, "stage").map(str::to_string),
        }
    }
}

/// Envelope stored in L1 and the decision cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedReply {
    response: Value,
    cached_at: DateTime<Utc>,
    segment: Segment,
}

/// Latency target per level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Targets {
    pub instant_ms: u64,
    pub fast_ms: u64,
    pub standard_ms: u64,
    pub computed_ms: u64,
}

impl Targets {
    pub fn for_level(&self, level: CacheLevel) -> u64 {
        match level {
            CacheLevel::Instant => self.instant_ms,
            CacheLevel::Fast => self.fast_ms,
            CacheLevel::Standard => self.standard_ms,
            CacheLevel::Computed => self.computed_ms,
        }
    }
}

impl From<&RouterConfig> for Targets {
    fn from(config: &RouterConfig) -> Self {
        Self {
            instant_ms: config.instant_target_ms,
            fast_ms: config.fast_target_ms,
            standard_ms: config.standard_target_ms,
            computed_ms: config.computed_target_ms,
        }
    }
}

/// Keys derived once per request.
struct RequestKeys {
    fast: String,
    profile: String,
    conversation: Option<String>,
}

impl RequestKeys {
    fn new(message: &str, context: &Map<String, Value>) -> Self {
        let normalized = normalize_text(message);
        let conversation_id = context_str(context, "conversation_id");
        let customer_type = context_str(context, "customer_type").unwrap_or("");
        let stage = context_str(context, "stage").unwrap_or("");
        let tier = context_str(context, "tier").unwrap_or("");
        let message_count = context
            .get("message_count")
            .and_then(Value::as_u64)
            .unwrap_or(0)
            .to_string();

        let fast = format!(
            "ctx:{}",
            digest_parts(&[
                conversation_id.unwrap_or(""),
                customer_type,
                stage,
                message_count.as_str(),
                normalized.as_str(),
            ])
        );

        let profile_hash = digest_parts(&[
            customer_type,
            tier,
            stage,
            interests(context).as_str(),
            normalized.as_str(),
        ]);
        let profile = TieredDecisionCache::generate_cache_key(
            LLM_RESPONSE_CLASS,
            "",
            0,
            Some(&profile_hash),
            None,
            &BTreeMap::new(),
        );

        let conversation = conversation_id.map(|id| {
            TieredDecisionCache::generate_cache_key(
                CONVERSATION_RESPONSE_CLASS,
                id,
                0,
                None,
                None,
                &BTreeMap::new(),
            )
        });

        Self {
            fast,
            profile,
            conversation,
        }
    }
}

/// A reply waiting to be copied into the cheaper tiers.
struct PendingWrite {
    level: CacheLevel,
    message: String,
    context: Map<String, Value>,
    keys: RequestKeys,
    segment: Segment,
    response: Value,
}

pub struct ResponseCacheRouter {
    precomputed: Arc<PrecomputedResponseStore>,
    l1: Arc<LocalLruCache<Value>>,
    decisions: Arc<TieredDecisionCache>,
    targets: Targets,
    fallback_response: String,
    conversation_fallback: bool,
    metrics: RouterMetrics,
    write_tx: mpsc::Sender<Box<PendingWrite>>,
    /// Taken by the write-back worker while it runs.
    write_rx: Mutex<Option<mpsc::Receiver<Box<PendingWrite>>>>,
    worker_running: AtomicBool,
    /// Jobs accepted into the queue and not yet applied.
    pending_writes: AtomicUsize,
    writes_idle: Notify,
}

impl ResponseCacheRouter {
    pub fn new(
        precomputed: Arc<PrecomputedResponseStore>,
        l1: Arc<LocalLruCache<Value>>,
        decisions: Arc<TieredDecisionCache>,
        config: &RouterConfig,
    ) -> Self {
        let (write_tx, write_rx) = mpsc::channel(config.write_back_queue_capacity.max(1));
        Self {
            precomputed,
            l1,
            decisions,
            targets: Targets::from(config),
            fallback_response: config.fallback_response.clone(),
            conversation_fallback: config.conversation_fallback,
            metrics: RouterMetrics::new(),
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            worker_running: AtomicBool::new(false),
            pending_writes: AtomicUsize::new(0),
            writes_idle: Notify::new(),
        }
    }

    pub fn targets(&self) -> Targets {
        self.targets
    }

    /// Resolve a reply through the tier cascade. Never fails.
    pub async fn route_request(
        &self,
        message: &str,
        context: &Map<String, Value>,
        compute: &dyn ResponseCompute,
    ) -> RoutedResponse {
        let started = Instant::now();
        let keys = RequestKeys::new(message, context);
        let segment = Segment::from_context(context);

        let (level, response, cached_at) =
            match self.lookup(message, context, &keys, &segment).await {
                Some(found) => found,
                None => {
                    let (response, ok) = self.compute(message, context, compute).await;
                    if !ok {
                        self.metrics.record_fallback();
                    }
                    let elapsed = started.elapsed();
                    let routed =
                        self.finish(CacheLevel::Computed, response.clone(), None, elapsed);
                    if ok {
                        self.schedule_write_back(PendingWrite {
                            level: CacheLevel::Computed,
                            message: message.to_string(),
                            context: context.clone(),
                            keys,
                            segment,
                            response,
                        })
                        .await;
                    }
                    return routed;
                }
            };

        let elapsed = started.elapsed();
        let routed = self.finish(level, response.clone(), cached_at, elapsed);
        if level != CacheLevel::Instant {
            self.schedule_write_back(PendingWrite {
                level,
                message: message.to_string(),
                context: context.clone(),
                keys,
                segment,
                response,
            })
            .await;
        }
        routed
    }

    /// Steps 1-3 of the cascade.
    async fn lookup(
        &self,
        message: &str,
        context: &Map<String, Value>,
        keys: &RequestKeys,
        segment: &Segment,
    ) -> Option<(CacheLevel, Value, Option<DateTime<Utc>>)> {
        if let Some(hit) = self.precomputed.lookup(message, context).await {
            debug!(level = "instant", source = ?hit.source, "Router hit");
            return Some((CacheLevel::Instant, hit.response, None));
        }

        if let Some(reply) = self.l1.get(&keys.fast).and_then(decode_reply) {
            debug!(level = "fast", "Router hit");
            return Some((CacheLevel::Fast, reply.response, Some(reply.cached_at)));
        }

        if let Some(reply) = self
            .decisions
            .get(LLM_RESPONSE_CLASS, &keys.profile)
            .await
            .and_then(decode_reply)
        {
            debug!(level = "standard", source = "profile", "Router hit");
            return Some((CacheLevel::Standard, reply.response, Some(reply.cached_at)));
        }

        if self.conversation_fallback {
            if let Some(conversation_key) = &keys.conversation {
                if let Some(reply) = self
                    .decisions
                    .get(CONVERSATION_RESPONSE_CLASS, conversation_key)
                    .await
                    .and_then(decode_reply)
                {
                    if &reply.segment == segment {
                        debug!(level = "standard", source = "conversation", "Router hit");
                        return Some((CacheLevel::Standard, reply.response, Some(reply.cached_at)));
                    }
                    debug!("Conversation reply skipped, segment changed");
                }
            }
        }

        None
    }

    /// Step 4. Returns the reply and whether it is a real (cacheable) answer.
    async fn compute(
        &self,
        message: &str,
        context: &Map<String, Value>,
        compute: &dyn ResponseCompute,
    ) -> (Value, bool) {
        let mut augmented = context.clone();
        augmented.insert("cache_level".into(), json!(CacheLevel::Computed.as_str()));
        augmented.insert("latency_target_ms".into(), json!(self.targets.computed_ms));

        let result = match compute.compute(message, &augmented).await {
            Ok(value) if value.get("response").and_then(Value::as_str).is_some() => Ok(value),
            Ok(_) => Err(CacheError::ComputeFailure(
                "reply has no string `response` field".into(),
            )),
            Err(e) => Err(CacheError::from(e)),
        };

        match result {
            Ok(value) => (value, true),
            Err(e) => {
                warn!(error = %e, "Compute failed, serving fallback reply");
                (
                    json!({
                        "response": self.fallback_response,
                        "error": e.to_string(),
                    }),
                    false,
                )
            }
        }
    }

    fn finish(
        &self,
        level: CacheLevel,
        response: Value,
        cached_at: Option<DateTime<Utc>>,
        elapsed: Duration,
    ) -> RoutedResponse {
        let target = self.targets.for_level(level);
        let response_time_ms = elapsed.as_secs_f64() * 1000.0;
        let within_target = response_time_ms <= target as f64;
        if !within_target {
            warn!(
                level = %level,
                response_time_ms,
                target_ms = target,
                "Tier exceeded latency target"
            );
        }
        self.metrics.record(level, elapsed, within_target);

        let mut response = match response {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("response".into(), other);
                map
            }
        };
        response.insert(
            "_cache_metadata".into(),
            json!({
                "cache_level": level.as_str(),
                "response_time_ms": response_time_ms,
                "cached_at": cached_at.map(|t| t.to_rfc3339()),
            }),
        );

        RoutedResponse {
            response: Value::Object(response),
            metrics: RoutingMetrics {
                cache_level: level,
                response_time_ms,
                target_time_ms: target,
                within_target,
                cache_efficiency: self.metrics.efficiency(),
            },
        }
    }

    /// Queue the write when the worker runs, otherwise apply it inline.
    async fn schedule_write_back(&self, pending: PendingWrite) {
        if !self.worker_running.load(Ordering::Acquire) {
            self.write_back(&pending).await;
            return;
        }
        self.pending_writes.fetch_add(1, Ordering::AcqRel);
        match self.write_tx.try_send(Box::new(pending)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.write_done();
                self.metrics.record_dropped_write_back();
                warn!("Write-back queue full, reply not cached");
            }
            Err(TrySendError::Closed(pending)) => {
                self.write_done();
                self.write_back(&pending).await;
            }
        }
    }

    fn write_done(&self) {
        if self.pending_writes.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.writes_idle.notify_waiters();
        }
    }

    /// Apply queued write-backs until `shutdown` flips to `true`.
    ///
    /// Jobs still queued at shutdown are applied before returning, and the
    /// queue is handed back so the worker can be started again.
    pub async fn run_write_back_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let receiver = self
            .write_rx
            .lock()
            .expect("router lock poisoned")
            .take();
        let Some(mut receiver) = receiver else {
            warn!("Write-back worker already running");
            return;
        };
        self.worker_running.store(true, Ordering::Release);
        info!("Write-back worker started");

        loop {
            tokio::select! {
                job = receiver.recv() => {
                    match job {
                        Some(pending) => {
                            self.write_back(&pending).await;
                            self.write_done();
                        }
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

        self.worker_running.store(false, Ordering::Release);
        while let Ok(pending) = receiver.try_recv() {
            self.write_back(&pending).await;
            self.write_done();
        }
        *self.write_rx.lock().expect("router lock poisoned") = Some(receiver);
        self.writes_idle.notify_waiters();
        info!("Write-back worker stopped");
    }

    /// Wait until every queued write-back has been applied.
    ///
    /// Returns at once when nothing is queued. Jobs left behind by a stopped
    /// worker are applied by the caller.
    pub async fn flush_write_backs(&self) {
        loop {
            let idle = self.writes_idle.notified();
            if self.pending_writes.load(Ordering::Acquire) == 0 {
                return;
            }
            if !self.worker_running.load(Ordering::Acquire) {
                let receiver = self.write_rx.lock().expect("router lock poisoned").take();
                if let Some(mut receiver) = receiver {
                    while let Ok(pending) = receiver.try_recv() {
                        self.write_back(&pending).await;
                        self.write_done();
                    }
                    *self.write_rx.lock().expect("router lock poisoned") = Some(receiver);
                    continue;
                }
            }
            idle.await;
        }
    }

    /// Write a reply into every tier cheaper than the one that produced it.
    async fn write_back(&self, pending: &PendingWrite) {
        let PendingWrite {
            level,
            message,
            context,
            keys,
            segment,
            response,
        } = pending;
        let level = *level;
        if level == CacheLevel::Instant {
            return;
        }

        let reply = CachedReply {
            response: response.clone(),
            cached_at: Utc::now(),
            segment: segment.clone(),
        };
        let envelope = match serde_json::to_value(&reply) {
            Ok(v) => v,
            Err(e) => {
                let e = CacheError::serialization("router write-back", e);
                warn!(error = %e, "Write-back skipped");
                return;
            }
        };

        if level > CacheLevel::Fast {
            self.l1.set(&keys.fast, envelope.clone());
        }

        let precomputed = self.precomputed.store_computed(message, context, response);
        let decisions = async {
            if level <= CacheLevel::Standard {
                return 0;
            }
            let profile = self
                .decisions
                .set(LLM_RESPONSE_CLASS, &keys.profile, &envelope);
            let conversation = async {
                match &keys.conversation {
                    Some(key) => {
                        self.decisions
                            .set(CONVERSATION_RESPONSE_CLASS, key, &envelope)
                            .await
                    }
                    None => false,
                }
            };
            let (a, b) = tokio::join!(profile, conversation);
            u64::from(a) + u64::from(b)
        };
        let (pre_ok, decision_writes) = tokio::join!(precomputed, decisions);

        let l1_writes = u64::from(level > CacheLevel::Fast);
        let written = l1_writes + u64::from(pre_ok) + decision_writes;
        self.metrics.record_write_backs(written);
        debug!(level = %level, written, "Write-back complete");
    }

    /// Preload the instant tier. Returns how many entries were stored.
    pub async fn prewarm(&self, exact: &[ExactWarmup], categories: &[CategoryWarmup]) -> usize {
        let mut stored = 0;
        for entry in exact {
            if self.precomputed.warm_exact(&entry.text, &entry.response).await {
                stored += 1;
            }
        }
        for entry in categories {
            if self
                .precomputed
                .warm_category(&entry.category, &entry.context, &entry.response)
                .await
            {
                stored += 1;
            }
        }
        debug!(stored, "Instant tier pre-warmed");
        stored
    }

    pub fn stats(&self) -> RouterStats {
        let targets = self.targets;
        self.metrics.snapshot(move |level| targets.for_level(level))
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }
}

impl std::fmt::Debug for ResponseCacheRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCacheRouter")
            .field("targets", &self.targets)
            .field("conversation_fallback", &self.conversation_fallback)
            .finish()
    }
}

fn decode_reply(value: Value) -> Option<CachedReply> {
    match serde_json::from_value(value) {
        Ok(reply) => Some(reply),
        Err(e) => {
            let e = CacheError::serialization("router cached reply", e);
            warn!(error = %e, "Cached reply unreadable");
            None
        }
    }
}

fn context_str<'a>(context: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    context
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Sorted, comma-joined `interests` list.
fn interests(context: &Map<String, Value>) -> String {
    let mut items: Vec<String> = match context.get("interests") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_lowercase())
            .collect(),
        Some(Value::String(s)) => vec![s.trim().to_lowercase()],
        _ => Vec::new(),
    };
    items.sort();
    items.dedup();
    items.join(",")
}
