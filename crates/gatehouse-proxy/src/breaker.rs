//! Per-endpoint circuit breakers.
//!
//! One breaker exists per `(route, endpoint)` pair, created lazily on
//! first use and kept in a [`BreakerRegistry`] that survives config
//! reloads. The state machine:
//!
//! ```text
//!              threshold failures inside window
//!   ┌────────┐ ─────────────────────────────────> ┌──────┐
//!   │ Closed │                                     │ Open │ <──┐
//!   └────────┘ <──── trial success ── ┌──────────┐ └──────┘    │
//!        ^                            │ HalfOpen │ <── cooldown │
//!        └─── (reset) ─────────────── └──────────┘ ── trial ───┘
//!                                                     failure
//! ```
//!
//! Failures are counted over a fixed window: the first failure starts
//! it, and a failure arriving after the window has lapsed starts a new
//! one at count 1. While `Open`, admission is rejected outright until
//! the cooldown lapses, at which point exactly one request is admitted
//! as a trial; concurrent arrivals during the trial are rejected.
//!
//! Admission hands out a [`BreakerPermit`]. The caller reports the
//! attempt outcome through the permit; dropping it unreported releases
//! the trial slot without counting anything, so cancelled or
//! unclassified attempts never skew the failure count.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use gatehouse_core::{CircuitBreakerSpec, EndpointAddr};
use parking_lot::Mutex;

// ── State machine ───────────────────────────────────────────────────────

/// Observable breaker state.
///
/// `Open` is reported until the next admission attempt performs the
/// lazy transition to `HalfOpen`; the breaker has no background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// Failures seen in the current window (only meaningful in Closed).
    failures: u32,
    /// Start of the current failure window, if one is running.
    window_started: Option<Instant>,
    /// When the breaker last tripped (set on every entry into Open).
    opened_at: Option<Instant>,
    /// Whether the single half-open trial slot is taken.
    trial_in_flight: bool,
}

/// Failure-rate guard for one `(route, endpoint)` pair.
#[derive(Debug)]
pub struct CircuitBreaker {
    spec: CircuitBreakerSpec,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(spec: CircuitBreakerSpec) -> Self {
        Self {
            spec,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                window_started: None,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn spec(&self) -> &CircuitBreakerSpec {
        &self.spec
    }

    /// Current state, without performing any lazy transition.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.spec.window_ms)
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.spec.cooldown_ms)
    }

    /// Asks the breaker to admit one attempt.
    ///
    /// Returns a permit on admission, or the suggested wait until the
    /// next admission is worth trying.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, Duration> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(self.permit(false)),
            BreakerState::Open => {
                let since_open = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if since_open < self.cooldown() {
                    return Err(self.cooldown() - since_open);
                }
                // Cooldown lapsed: this caller becomes the trial.
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                Ok(self.permit(true))
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(Duration::ZERO)
                } else {
                    inner.trial_in_flight = true;
                    Ok(self.permit(true))
                }
            }
        }
    }

    fn permit(self: &Arc<Self>, trial: bool) -> BreakerPermit {
        BreakerPermit {
            breaker: Arc::clone(self),
            trial,
            resolved: false,
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.state = BreakerState::Closed;
            inner.trial_in_flight = false;
        }
        inner.failures = 0;
        inner.window_started = None;
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            // The probe failed: straight back to Open, fresh cooldown.
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_in_flight = false;
            inner.failures = 0;
            inner.window_started = None;
            return;
        }
        if inner.state != BreakerState::Closed {
            return;
        }
        let now = Instant::now();
        let window_lapsed = inner
            .window_started
            .map(|started| now.duration_since(started) > self.window())
            .unwrap_or(true);
        if window_lapsed {
            inner.window_started = Some(now);
            inner.failures = 1;
        } else {
            inner.failures += 1;
        }
        if inner.failures >= self.spec.failure_threshold {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            inner.failures = 0;
            inner.window_started = None;
        }
    }

    fn release_unreported(&self, trial: bool) {
        if trial {
            let mut inner = self.inner.lock();
            if inner.state == BreakerState::HalfOpen {
                inner.trial_in_flight = false;
            }
        }
    }
}

// ── Permit ──────────────────────────────────────────────────────────────

/// Proof that the breaker admitted one attempt.
///
/// Consume it with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure); dropping it unconsumed
/// releases a half-open trial slot without counting the attempt.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl BreakerPermit {
    pub fn record_success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    pub fn record_failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.release_unreported(self.trial);
        }
    }
}

// ── Registry ────────────────────────────────────────────────────────────

/// All live breakers, keyed by `(route id, endpoint address)`.
///
/// The registry outlives route-table swaps so breaker state carries
/// across config reloads. A reload that changes a route's breaker
/// parameters replaces that breaker (and its state) on next use.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<(String, String), Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches the breaker for a `(route, endpoint)` pair, creating it
    /// on first use.
    pub fn checkout(
        &self,
        route_id: &str,
        endpoint: &EndpointAddr,
        spec: &CircuitBreakerSpec,
    ) -> Arc<CircuitBreaker> {
        let key = (route_id.to_string(), endpoint.to_string());
        let mut entry = self
            .breakers
            .entry(key)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(spec.clone())));
        if entry.spec() != spec {
            *entry.value_mut() = Arc::new(CircuitBreaker::new(spec.clone()));
        }
        entry.value().clone()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

// ===== Tests =====
