//! Lock-free per-tier routing counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::CacheLevel;

const LOW_EFFICIENCY_PCT: f64 = 50.0;
const HIGH_EFFICIENCY_PCT: f64 = 90.0;

#[derive(Debug, Default)]
struct LevelCounters {
    count: AtomicU64,
    total_us: AtomicU64,
    within_target: AtomicU64,
}

/// Aggregated routing metrics, one counter set per [`CacheLevel`].
#[derive(Debug, Default)]
pub struct RouterMetrics {
    levels: [LevelCounters; 4],
    fallbacks: AtomicU64,
    write_backs: AtomicU64,
    dropped_write_backs: AtomicU64,
}

/// Per-tier summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LevelStats {
    pub count: u64,
    pub avg_response_ms: f64,
    pub target_ms: u64,
    pub within_target: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouterStats {
    pub total_requests: u64,
    pub levels: BTreeMap<String, LevelStats>,
    /// Percentage of requests answered without fresh computation.
    pub cache_efficiency: f64,
    pub avg_response_ms: f64,
    pub within_target_ratio: f64,
    pub fallbacks: u64,
    pub write_backs: u64,
    /// Write-backs lost because the queue was full.
    pub dropped_write_backs: u64,
    pub recommendations: Vec<String>,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, level: CacheLevel, elapsed: Duration, within_target: bool) {
        let counters = &self.levels[level.index()];
        counters.count.fetch_add(1, Ordering::Relaxed);
        counters
            .total_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if within_target {
            counters.within_target.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_backs(&self, count: u64) {
        self.write_backs.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dropped_write_back(&self) {
        self.dropped_write_backs.fetch_add(1, Ordering::Relaxed);
    }

    /// Non-computed resolutions as a percentage of all requests.
    pub fn efficiency(&self) -> f64 {
        let total: u64 = CacheLevel::ALL.iter().map(|l| self.count(*l)).sum();
        if total == 0 {
            return 0.0;
        }
        let cached = total - self.count(CacheLevel::Computed);
        cached as f64 / total as f64 * 100.0
    }

    fn count(&self, level: CacheLevel) -> u64 {
        self.levels[level.index()].count.load(Ordering::Relaxed)
    }

    /// Snapshot with per-tier averages and guidance. `targets` maps each
    /// level to its latency target in milliseconds.
    pub fn snapshot(&self, targets: impl Fn(CacheLevel) -> u64) -> RouterStats {
        let mut levels = BTreeMap::new();
        let mut total_requests = 0;
        let mut total_us = 0;
        let mut total_within = 0;

        for level in CacheLevel::ALL {
            let counters = &self.levels[level.index()];
            let count = counters.count.load(Ordering::Relaxed);
            let us = counters.total_us.load(Ordering::Relaxed);
            let within = counters.within_target.load(Ordering::Relaxed);
            total_requests += count;
            total_us += us;
            total_within += within;
            levels.insert(
                level.as_str().to_string(),
                LevelStats {
                    count,
                    avg_response_ms: average_ms(us, count),
                    target_ms: targets(level),
                    within_target: within,
                },
            );
        }

        let cache_efficiency = self.efficiency();
        let recommendations = recommendations(total_requests, cache_efficiency, &levels);
        RouterStats {
            total_requests,
            levels,
            cache_efficiency,
            avg_response_ms: average_ms(total_us, total_requests),
            within_target_ratio: if total_requests == 0 {
                0.0
            } else {
                total_within as f64 / total_requests as f64
            },
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
            dropped_write_backs: self.dropped_write_backs.load(Ordering::Relaxed),
            recommendations,
        }
    }

    pub fn reset(&self) {
        for counters in &self.levels {
            counters.count.store(0, Ordering::Relaxed);
            counters.total_us.store(0, Ordering::Relaxed);
            counters.within_target.store(0, Ordering::Relaxed);
        }
        self.fallbacks.store(0, Ordering::Relaxed);
        self.write_backs.store(0, Ordering::Relaxed);
        self.dropped_write_backs.store(0, Ordering::Relaxed);
    }
}

fn average_ms(total_us: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total_us as f64 / count as f64 / 1000.0
    }
}

fn recommendations(
    total: u64,
    efficiency: f64,
    levels: &BTreeMap<String, LevelStats>,
) -> Vec<String> {
    let mut out = Vec::new();
    if total == 0 {
        return out;
    }
    if efficiency < LOW_EFFICIENCY_PCT {
        out.push(format!(
            "Cache efficiency is {:.1}%: pre-warm common responses",
            efficiency
        ));
    } else if efficiency > HIGH_EFFICIENCY_PCT {
        out.push(format!("Cache efficiency is {:.1}%: optimized", efficiency));
    }
    for (name, stats) in levels {
        if stats.count > 0 && stats.avg_response_ms > stats.target_ms as f64 {
            out.push(format!(
                "{} tier averages {:.1}ms against a {}ms target",
                name, stats.avg_response_ms, stats.target_ms
            ));
        }
    }
    out
}
