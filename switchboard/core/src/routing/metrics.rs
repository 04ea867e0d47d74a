//! Router Metrics
//!
//! Observability for the routing layer:
//! - Call totals (every `call`, successful or not)
//! - Per-provider attempt outcomes, broken down by [`ErrorKind`]
//! - Per-provider latency distribution
//! - Current breaker and gate state, folded in at snapshot time
//!
//! Recording sits on the hot path of every attempt, so counters are sharded
//! across cache lines and never take a lock. A snapshot reads the shards
//! without blocking writers.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use super::breaker::{BreakerRegistry, BreakerSnapshot, CircuitState};
use super::classify::ErrorKind;
use super::gate::{GateRegistry, GateSnapshot};

// ============================================================================
// Sharded Counter
// ============================================================================

const SHARD_COUNT: usize = 16;

#[derive(Debug, Default)]
#[repr(align(64))]
struct Shard(AtomicU64);

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_INDEX: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) % SHARD_COUNT;
}

/// A monotonically increasing counter spread over cache-line-sized shards
///
/// Each thread sticks to one shard, so concurrent writers rarely share a line.
#[derive(Debug)]
pub struct ShardedCounter {
    shards: [Shard; SHARD_COUNT],
}

impl Default for ShardedCounter {
    fn default() -> Self {
        Self {
            shards: std::array::from_fn(|_| Shard::default()),
        }
    }
}

impl ShardedCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        let idx = SHARD_INDEX.with(|i| *i);
        self.shards[idx].0.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.0.load(Ordering::Relaxed))
            .sum()
    }
}

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions in milliseconds
#[derive(Debug)]
pub struct Histogram {
    /// Upper bucket boundaries
    buckets: Vec<u64>,
    /// Count per bucket (last bucket also takes overflow)
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given bucket boundaries
    #[must_use]
    pub fn new(buckets: Vec<u64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Create with default latency buckets
    #[must_use]
    pub fn latency_default() -> Self {
        Self::new(vec![
            10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000, 120_000,
        ])
    }

    /// Record a value
    pub fn record(&self, value: u64) {
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len().saturating_sub(1));

        if let Some(count) = self.counts.get(bucket_idx) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.min.fetch_min(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    /// Get histogram snapshot
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let min = self.min.load(Ordering::Relaxed);

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total: self.total_count.load(Ordering::Relaxed),
            sum: self.sum.load(Ordering::Relaxed),
            min: if min == u64::MAX { 0 } else { min },
            max: self.max.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistogramSnapshot {
    pub buckets: Vec<u64>,
    pub counts: Vec<u64>,
    pub total: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the `p` quantile
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn percentile(&self, p: f64) -> u64 {
        if self.total == 0 {
            return 0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }

        self.buckets.last().copied().unwrap_or(0)
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.sum as f64 / self.total as f64
        }
    }

    /// Condensed view for reporting
    #[must_use]
    pub fn summary(&self) -> LatencySummary {
        LatencySummary {
            count: self.total,
            mean_ms: self.mean(),
            min_ms: self.min,
            max_ms: self.max,
            p50_ms: self.percentile(0.5),
            p90_ms: self.percentile(0.9),
            p99_ms: self.percentile(0.99),
        }
    }
}

/// Latency percentiles for one provider
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p99_ms: u64,
}

// ============================================================================
// Attempt Records
// ============================================================================

/// How a single provider attempt ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Provider returned output
    Success,
    /// Provider was contacted and failed
    Failure,
    /// Attempt was cancelled before it finished
    Aborted,
    /// Router refused the attempt without contacting the provider
    Rejected,
}

/// One finished attempt, folded into metrics and then discarded
#[derive(Clone, Debug)]
pub struct AttemptRecord {
    pub provider_id: String,
    pub role_id: String,
    pub started_at: Instant,
    pub finished_at: Instant,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<ErrorKind>,
    pub latency_ms: u64,
}

// ============================================================================
// Per-Provider Metrics
// ============================================================================

/// Counters for a single provider
#[derive(Debug)]
pub struct ProviderMetrics {
    attempts: ShardedCounter,
    dispatched: ShardedCounter,
    successes: ShardedCounter,
    by_kind: [ShardedCounter; ErrorKind::COUNT],
    latency: Histogram,
}

impl Default for ProviderMetrics {
    fn default() -> Self {
        Self {
            attempts: ShardedCounter::new(),
            dispatched: ShardedCounter::new(),
            successes: ShardedCounter::new(),
            by_kind: std::array::from_fn(|_| ShardedCounter::new()),
            latency: Histogram::latency_default(),
        }
    }
}

impl ProviderMetrics {
    fn record(&self, attempt: &AttemptRecord) {
        self.attempts.inc();

        if attempt.outcome != AttemptOutcome::Rejected {
            self.dispatched.inc();
            self.latency.record(attempt.latency_ms);
        }
        if attempt.outcome == AttemptOutcome::Success {
            self.successes.inc();
        }
        if let Some(kind) = attempt.error_kind {
            self.by_kind[kind.index()].inc();
        }
    }

    fn snapshot(&self) -> ProviderSnapshot {
        let failures = ErrorKind::ALL
            .iter()
            .map(|k| (*k, self.by_kind[k.index()].get()))
            .filter(|(_, n)| *n > 0)
            .collect();

        ProviderSnapshot {
            attempts: self.attempts.get(),
            dispatched: self.dispatched.get(),
            successes: self.successes.get(),
            failures,
            latency: self.latency.snapshot().summary(),
        }
    }
}

/// Point-in-time counters for one provider
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ProviderSnapshot {
    /// Every recorded attempt, including rejections
    pub attempts: u64,
    /// Attempts that reached the provider
    pub dispatched: u64,
    pub successes: u64,
    /// Non-success attempts by kind (zero counts omitted)
    pub failures: BTreeMap<ErrorKind, u64>,
    pub latency: LatencySummary,
}

impl ProviderSnapshot {
    /// Count for one failure kind
    #[must_use]
    pub fn failures_of(&self, kind: ErrorKind) -> u64 {
        self.failures.get(&kind).copied().unwrap_or(0)
    }

    /// Successes over dispatched attempts (1.0 when nothing was dispatched)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.dispatched == 0 {
            1.0
        } else {
            self.successes as f64 / self.dispatched as f64
        }
    }
}

// ============================================================================
// Router Metrics
// ============================================================================

/// Metrics for the whole router
#[derive(Debug, Default)]
pub struct RouterMetrics {
    total_calls: ShardedCounter,
    successful_calls: ShardedCounter,
    providers: DashMap<String, Arc<ProviderMetrics>>,
}

impl RouterMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a finished `call`
    pub fn record_call(&self, success: bool) {
        self.total_calls.inc();
        if success {
            self.successful_calls.inc();
        }
    }

    /// Fold one attempt into the per-provider counters
    pub fn record(&self, attempt: &AttemptRecord) {
        self.provider_metrics(&attempt.provider_id).record(attempt);
    }

    fn provider_metrics(&self, provider_id: &str) -> Arc<ProviderMetrics> {
        if let Some(m) = self.providers.get(provider_id) {
            return Arc::clone(m.value());
        }
        let entry = self
            .providers
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(ProviderMetrics::default()));
        Arc::clone(entry.value())
    }

    /// Counters for one provider, if it has recorded anything
    #[must_use]
    pub fn provider(&self, provider_id: &str) -> Option<ProviderSnapshot> {
        self.providers.get(provider_id).map(|m| m.snapshot())
    }

    /// Total calls so far
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.total_calls.get()
    }

    /// Compose a snapshot including current breaker and gate state
    #[must_use]
    pub fn snapshot(&self, breakers: &BreakerRegistry, gates: &GateRegistry) -> MetricsSnapshot {
        let total_calls = self.total_calls.get();
        let successful_calls = self.successful_calls.get();

        // Clone the handles first so no map shard is held while reading counters
        let providers: Vec<(String, Arc<ProviderMetrics>)> = self
            .providers
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        MetricsSnapshot {
            total_calls,
            successful_calls,
            failed_calls: total_calls.saturating_sub(successful_calls),
            by_provider: providers
                .into_iter()
                .map(|(id, m)| (id, m.snapshot()))
                .collect(),
            circuit_states: breakers
                .snapshot()
                .into_iter()
                .map(|s| (s.provider_id.clone(), s))
                .collect(),
            concurrency: gates
                .snapshot()
                .into_iter()
                .map(|s| (s.provider_id.clone(), s))
                .collect(),
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time view of the router
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub by_provider: BTreeMap<String, ProviderSnapshot>,
    pub circuit_states: BTreeMap<String, BreakerSnapshot>,
    pub concurrency: BTreeMap<String, GateSnapshot>,
}

impl MetricsSnapshot {
    /// Breaker state for a provider (`Closed` if never used)
    #[must_use]
    pub fn circuit_state(&self, provider_id: &str) -> CircuitState {
        self.circuit_states
            .get(provider_id)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    /// Serialize as JSON for observability consumers
    ///
    /// # Errors
    ///
    /// Propagates `serde_json` serialization errors.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Export in Prometheus text format
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let _ = write!(
            out,
            "# HELP switchboard_calls_total Calls handled by the router\n\
             # TYPE switchboard_calls_total counter\n\
             switchboard_calls_total{{result=\"success\"}} {}\n\
             switchboard_calls_total{{result=\"failure\"}} {}\n\n",
            self.successful_calls, self.failed_calls
        );

        out.push_str(
            "# HELP switchboard_attempts_total Provider attempts by outcome\n\
             # TYPE switchboard_attempts_total counter\n",
        );
        for (provider, m) in &self.by_provider {
            let provider = escape_label(provider);
            let _ = writeln!(
                out,
                "switchboard_attempts_total{{provider=\"{provider}\",outcome=\"success\"}} {}",
                m.successes
            );
            for (kind, count) in &m.failures {
                let _ = writeln!(
                    out,
                    "switchboard_attempts_total{{provider=\"{provider}\",outcome=\"{kind}\"}} {count}"
                );
            }
        }
        out.push('\n');

        out.push_str(
            "# HELP switchboard_latency_ms Provider latency percentiles\n\
             # TYPE switchboard_latency_ms gauge\n",
        );
        for (provider, m) in &self.by_provider {
            let provider = escape_label(provider);
            for (q, v) in [
                ("0.5", m.latency.p50_ms),
                ("0.9", m.latency.p90_ms),
                ("0.99", m.latency.p99_ms),
            ] {
                let _ = writeln!(
                    out,
                    "switchboard_latency_ms{{provider=\"{provider}\",quantile=\"{q}\"}} {v}"
                );
            }
        }
        out.push('\n');

        out.push_str(
            "# HELP switchboard_circuit_state Breaker state (0=closed, 1=open, 2=half-open)\n\
             # TYPE switchboard_circuit_state gauge\n",
        );
        for (provider, b) in &self.circuit_states {
            let provider = escape_label(provider);
            let state = match b.state {
                CircuitState::Closed => 0,
                CircuitState::Open => 1,
                CircuitState::HalfOpen => 2,
            };
            let _ = writeln!(
                out,
                "switchboard_circuit_state{{provider=\"{provider}\"}} {state}"
            );
        }
        out.push('\n');

        out.push_str(
            "# HELP switchboard_gate_active In-flight attempts per provider\n\
             # TYPE switchboard_gate_active gauge\n",
        );
        for (provider, g) in &self.concurrency {
            let provider = escape_label(provider);
            let _ = writeln!(
                out,
                "switchboard_gate_active{{provider=\"{provider}\"}} {}",
                g.active
            );
        }
        out.push('\n');

        out.push_str(
            "# HELP switchboard_gate_waiting Attempts queued per provider\n\
             # TYPE switchboard_gate_waiting gauge\n",
        );
        for (provider, g) in &self.concurrency {
            let provider = escape_label(provider);
            let _ = writeln!(
                out,
                "switchboard_gate_waiting{{provider=\"{provider}\"}} {}",
                g.waiting
            );
        }

        out
    }
}

/// Escape a Prometheus label value
fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(c),
        }
    }
    escaped
}
