//! Per-Provider Circuit Breaker
//!
//! Stops traffic to a provider that keeps failing and lets a single probe
//! through once the cool-down window has passed.
//!
//! ```text
//! +--------+  threshold failures  +------+   open_until reached   +-----------+
//! | Closed | -------------------> | Open | ---------------------> | Half-Open |
//! +--------+                      +------+     (lazily, on use)   +-----------+
//!     ^                               ^                                 |
//!     |          probe success        |        probe failure            |
//!     +-------------------------------+---------------------------------+
//! ```
//!
//! - **Closed**: requests flow; circuit-affecting failures are counted and any
//!   success resets the count.
//! - **Open**: requests are rejected without contacting the provider.
//! - **Half-Open**: exactly one probe is admitted; everything else is rejected
//!   as if the circuit were still open.
//!
//! Outcomes whose classification does not affect the circuit (cancellation,
//! client errors) never change state. A probe that ends that way just frees
//! the probe slot for the next arrival.
//!
//! # Thread Safety
//!
//! State lives behind a `parking_lot::Mutex` that is never held across an
//! await point. [`BreakerRegistry`] keeps one breaker per provider in a
//! `DashMap`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use super::config::{BreakerConfig, RouterConfig};

// ============================================================================
// Circuit State
// ============================================================================

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,

    /// Rejecting requests until the reset window passes
    Open,

    /// One probe in flight or about to be admitted
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Rejection returned while the circuit refuses traffic
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("circuit for provider '{provider}' is open")]
pub struct CircuitOpen {
    pub provider: String,
}

// ============================================================================
// Circuit Breaker
// ============================================================================

#[derive(Debug, Default)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug, Default)]
struct BreakerStats {
    total_admitted: AtomicU64,
    total_rejected: AtomicU64,
    total_trips: AtomicU64,
    total_probes: AtomicU64,
}

/// Failure tracking for a single provider
#[derive(Debug)]
pub struct CircuitBreaker {
    provider_id: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    stats: BreakerStats,
}

impl CircuitBreaker {
    /// Create a closed breaker
    #[must_use]
    pub fn new(provider_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            provider_id: provider_id.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
            stats: BreakerStats::default(),
        }
    }

    /// Provider this breaker guards
    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Current recorded state (OPEN is reported until an admission moves it)
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Current consecutive failure count
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Whether an arrival right now would be rejected
    ///
    /// Read-only: it never moves OPEN to HALF_OPEN or claims the probe, so the
    /// router can skip hopeless providers before queueing at their gate.
    #[must_use]
    pub fn is_rejecting(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => inner.open_until.is_some_and(|t| Instant::now() < t),
            CircuitState::HalfOpen => inner.probe_in_flight,
        }
    }

    /// Admit an attempt, claiming the half-open probe if one is due
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpen`] while the circuit is open or a probe is already
    /// in flight.
    pub fn try_admit(self: &Arc<Self>) -> Result<BreakerPermit, CircuitOpen> {
        let mut inner = self.inner.lock();

        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if inner.open_until.is_some_and(|t| Instant::now() < t) {
                    return Err(self.reject());
                }
                inner.state = CircuitState::HalfOpen;
                tracing::info!(
                    provider = %self.provider_id,
                    "Circuit breaker transitioning to half-open"
                );
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(self.reject());
                }
                true
            }
        };

        if probe {
            inner.probe_in_flight = true;
            self.stats.total_probes.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.total_admitted.fetch_add(1, Ordering::Relaxed);

        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            probe,
            settled: false,
        })
    }

    fn reject(&self) -> CircuitOpen {
        self.stats.total_rejected.fetch_add(1, Ordering::Relaxed);
        CircuitOpen {
            provider: self.provider_id.clone(),
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        if probe {
            inner.probe_in_flight = false;
            self.close_locked(&mut inner);
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, probe: bool, affects_circuit: bool) {
        let mut inner = self.inner.lock();
        if probe {
            inner.probe_in_flight = false;
            if affects_circuit {
                self.open_locked(&mut inner);
            }
            return;
        }

        // Late results from attempts admitted before the trip are ignored
        if affects_circuit && inner.state == CircuitState::Closed {
            inner.consecutive_failures += 1;
            if inner.consecutive_failures >= self.config.failure_threshold {
                self.open_locked(&mut inner);
            }
        }
    }

    fn on_abandoned(&self, probe: bool) {
        if probe {
            self.inner.lock().probe_in_flight = false;
        }
    }

    fn open_locked(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.open_until = Some(Instant::now() + self.config.reset_window());
        self.stats.total_trips.fetch_add(1, Ordering::Relaxed);

        tracing::warn!(
            provider = %self.provider_id,
            consecutive_failures = inner.consecutive_failures,
            reset_window_ms = self.config.reset_window_ms,
            "Circuit breaker opened"
        );
    }

    fn close_locked(&self, inner: &mut BreakerInner) {
        let was = inner.state;
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.open_until = None;

        if was != CircuitState::Closed {
            tracing::info!(
                provider = %self.provider_id,
                "Circuit breaker closed - provider recovered"
            );
        }
    }

    /// Force the breaker back to CLOSED (admin / tests)
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
        self.close_locked(&mut inner);
    }

    /// Point-in-time view of this breaker
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let now = Instant::now();
        BreakerSnapshot {
            provider_id: self.provider_id.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            probe_in_flight: inner.probe_in_flight,
            open_remaining_ms: inner
                .open_until
                .filter(|_| inner.state == CircuitState::Open)
                .map(|t| u64::try_from(t.saturating_duration_since(now).as_millis()).unwrap_or(u64::MAX)),
            total_admitted: self.stats.total_admitted.load(Ordering::Relaxed),
            total_rejected: self.stats.total_rejected.load(Ordering::Relaxed),
            total_trips: self.stats.total_trips.load(Ordering::Relaxed),
            total_probes: self.stats.total_probes.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Permit
// ============================================================================

/// Admission ticket; report exactly one outcome through it
///
/// Dropping a permit without reporting (e.g. the attempt was cancelled)
/// counts as an outcome that does not affect the circuit.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl BreakerPermit {
    /// Whether this admission is the half-open probe
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Report a successful attempt
    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    /// Report a failed attempt
    pub fn fail(mut self, affects_circuit: bool) {
        self.settled = true;
        self.breaker.on_failure(self.probe, affects_circuit);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned(self.probe);
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time breaker state
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub provider_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub probe_in_flight: bool,
    pub open_remaining_ms: Option<u64>,
    pub total_admitted: u64,
    pub total_rejected: u64,
    pub total_trips: u64,
    pub total_probes: u64,
}

// ============================================================================
// Registry
// ============================================================================

/// Lazily-created breakers, one per provider
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
}

impl BreakerRegistry {
    /// Registry where every provider uses `config`
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config: config,
            overrides: HashMap::new(),
        }
    }

    /// Build a registry from router configuration
    #[must_use]
    pub fn from_config(config: &RouterConfig) -> Self {
        let overrides = config
            .providers
            .iter()
            .filter_map(|(id, l)| l.breaker.map(|b| (id.clone(), b)))
            .collect();

        Self {
            breakers: DashMap::new(),
            default_config: config.breaker,
            overrides,
        }
    }

    /// Breaker for a provider, creating it on first use
    pub fn get_or_create(&self, provider_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(provider_id) {
            return Arc::clone(breaker.value());
        }

        let config = self
            .overrides
            .get(provider_id)
            .copied()
            .unwrap_or(self.default_config);

        let entry = self
            .breakers
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(provider_id, config)));
        Arc::clone(entry.value())
    }

    /// Breaker for a provider if it has been used
    #[must_use]
    pub fn get(&self, provider_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(provider_id).map(|b| Arc::clone(b.value()))
    }

    /// Reset a provider's breaker; returns false if it was never created
    pub fn reset(&self, provider_id: &str) -> bool {
        match self.get(provider_id) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Snapshots of every breaker created so far
    #[must_use]
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        snapshots
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
