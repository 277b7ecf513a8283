//! Consecutive-failure circuit breaker for remote tiers.
//!
//! Closed → Open after `threshold` consecutive failures. While open every call
//! is short-circuited until `cooldown` has elapsed, then a single half-open
//! trial call is let through: success closes the circuit, failure re-opens
//! it. A trial whose caller went away without reporting a result is replaced
//! by a new one once another `cooldown` has passed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Start of the outstanding half-open trial call.
    trial_started: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
    trips: AtomicU64,
}

impl CircuitBreaker {
    /// `threshold` is clamped to at least 1.
    pub fn new(name: &str, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.to_string(),
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_started: None,
            }),
            trips: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call may go through right now.
    ///
    /// Moves an expired open circuit into half-open and admits exactly one trial call.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_started = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                let abandoned = inner
                    .trial_started
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if abandoned {
                    if inner.trial_started.is_some() {
                        debug!(
                            backend = %self.name,
                            "Half-open trial never reported, admitting another"
                        );
                    }
                    inner.trial_started = Some(Instant::now());
                }
                abandoned
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state != BreakerState::Closed {
            info!(backend = %self.name, "Circuit closed after successful trial call");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_started = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_started = None;
                self.trips.fetch_add(1, Ordering::Relaxed);
                warn!(backend = %self.name, "Half-open trial call failed, circuit re-opened");
            }
            BreakerState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    self.trips.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        backend = %self.name,
                        failures = inner.consecutive_failures,
                        cooldown_secs = self.cooldown.as_secs(),
                        "Circuit opened"
                    );
                }
            }
            // Late failure from a call admitted before the circuit opened.
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Number of times the circuit has opened.
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }
}
