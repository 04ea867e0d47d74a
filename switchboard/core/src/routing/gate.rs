//! Per-Provider Concurrency Gate
//!
//! Bounds the number of in-flight attempts against a provider. Arrivals that
//! find the gate full wait in a strict FIFO queue; a released slot is handed
//! directly to the oldest live waiter so later arrivals can never overtake it.
//!
//! ```text
//!   acquire ──► active < capacity && queue empty ──► GatePermit
//!      │
//!      └──► enqueue ──► granted by release ──► GatePermit
//!                  ├──► queue_timeout elapsed ──► GateError::TimedOut
//!                  └──► token cancelled ──────► GateError::Cancelled
//! ```
//!
//! Permits release on drop, so every exit path of an attempt (success,
//! failure, timeout, cancellation) returns its slot exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::cancel::CancelToken;
use super::config::RouterConfig;

// ============================================================================
// Errors
// ============================================================================

/// Reasons a gate refuses to hand out a permit
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GateError {
    /// The gate has capacity zero
    #[error("provider '{provider}' accepts no concurrent attempts")]
    Closed { provider: String },

    /// No free slot and the caller would not wait
    #[error("provider '{provider}' is at capacity")]
    Saturated { provider: String },

    /// Waited in the queue longer than the queue timeout
    #[error("timed out after {waited_ms}ms waiting for provider '{provider}'")]
    TimedOut { provider: String, waited_ms: u64 },

    /// The waiter's token was cancelled
    #[error("wait for provider '{provider}' was cancelled")]
    Cancelled { provider: String },
}

// ============================================================================
// Concurrency Gate
// ============================================================================

struct Waiter {
    id: u64,
    enqueued_at: Instant,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct GateState {
    active: usize,
    next_waiter_id: u64,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct GateStats {
    total_grants: AtomicU64,
    total_queued: AtomicU64,
    total_timeouts: AtomicU64,
    total_rejections: AtomicU64,
    total_wait_time_ms: AtomicU64,
    peak_active: AtomicU64,
}

/// Admission control for a single provider
pub struct ConcurrencyGate {
    provider_id: String,
    /// `None` means unbounded
    capacity: Option<usize>,
    queue_timeout: Duration,
    state: Mutex<GateState>,
    stats: GateStats,
}

impl std::fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyGate")
            .field("provider_id", &self.provider_id)
            .field("capacity", &self.capacity)
            .field("active", &self.active())
            .field("waiting", &self.waiting())
            .finish_non_exhaustive()
    }
}

impl ConcurrencyGate {
    /// Create a gate; `capacity = None` never blocks
    #[must_use]
    pub fn new(
        provider_id: impl Into<String>,
        capacity: Option<usize>,
        queue_timeout: Duration,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            capacity,
            queue_timeout,
            state: Mutex::new(GateState::default()),
            stats: GateStats::default(),
        }
    }

    /// Provider this gate guards
    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Configured capacity
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Attempts currently holding a permit
    #[must_use]
    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    /// Attempts currently queued
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Take a slot if one is free right now, without queueing
    ///
    /// # Errors
    ///
    /// [`GateError::Closed`] for a zero-capacity gate, [`GateError::Saturated`]
    /// when every slot is taken or others are already queued.
    pub fn try_acquire(self: &Arc<Self>) -> Result<GatePermit, GateError> {
        let mut state = self.state.lock();
        match self.capacity {
            Some(0) => Err(self.reject_closed()),
            Some(cap) if state.active >= cap || !state.waiters.is_empty() => {
                self.stats.total_rejections.fetch_add(1, Ordering::Relaxed);
                Err(GateError::Saturated {
                    provider: self.provider_id.clone(),
                })
            }
            _ => Ok(self.grant_locked(&mut state)),
        }
    }

    /// Take a slot, queueing behind earlier arrivals if the gate is full
    ///
    /// # Errors
    ///
    /// [`GateError::Closed`] immediately for a zero-capacity gate,
    /// [`GateError::TimedOut`] once the queue timeout elapses, and
    /// [`GateError::Cancelled`] if `cancel` fires first.
    pub async fn acquire(self: &Arc<Self>, cancel: &CancelToken) -> Result<GatePermit, GateError> {
        let (id, rx) = {
            let mut state = self.state.lock();
            match self.capacity {
                Some(0) => return Err(self.reject_closed()),
                Some(cap) if state.active >= cap || !state.waiters.is_empty() => {
                    let (tx, rx) = oneshot::channel();
                    let id = state.next_waiter_id;
                    state.next_waiter_id += 1;
                    state.waiters.push_back(Waiter {
                        id,
                        enqueued_at: Instant::now(),
                        grant: tx,
                    });
                    self.stats.total_queued.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        provider = %self.provider_id,
                        queue_depth = state.waiters.len(),
                        "Gate full, queueing attempt"
                    );
                    (id, rx)
                }
                _ => return Ok(self.grant_locked(&mut state)),
            }
        };

        let queued_at = Instant::now();
        let mut pending = PendingWaiter {
            gate: self,
            id,
            rx,
            claimed: false,
        };

        let outcome = tokio::time::timeout(self.queue_timeout, async {
            tokio::select! {
                biased;
                granted = &mut pending.rx => granted.is_ok(),
                () = cancel.cancelled() => false,
            }
        })
        .await;

        let waited_ms = duration_ms(queued_at.elapsed());
        self.stats
            .total_wait_time_ms
            .fetch_add(waited_ms, Ordering::Relaxed);

        match outcome {
            Ok(true) => {
                pending.claimed = true;
                self.stats.total_grants.fetch_add(1, Ordering::Relaxed);
                Ok(GatePermit::new(Arc::clone(self)))
            }
            Ok(false) if cancel.is_cancelled() => Err(GateError::Cancelled {
                provider: self.provider_id.clone(),
            }),
            // Elapsed, or evicted by a release that found us expired
            _ => {
                self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                Err(GateError::TimedOut {
                    provider: self.provider_id.clone(),
                    waited_ms,
                })
            }
        }
    }

    fn reject_closed(&self) -> GateError {
        self.stats.total_rejections.fetch_add(1, Ordering::Relaxed);
        GateError::Closed {
            provider: self.provider_id.clone(),
        }
    }

    fn grant_locked(self: &Arc<Self>, state: &mut GateState) -> GatePermit {
        state.active += 1;
        self.stats.total_grants.fetch_add(1, Ordering::Relaxed);
        self.stats
            .peak_active
            .fetch_max(state.active as u64, Ordering::Relaxed);
        GatePermit::new(Arc::clone(self))
    }

    /// Return one slot: hand it to the oldest live waiter, else free it
    fn release_slot(&self) {
        let mut state = self.state.lock();
        self.hand_off_locked(&mut state);
    }

    fn hand_off_locked(&self, state: &mut GateState) {
        let now = Instant::now();
        while let Some(waiter) = state.waiters.pop_front() {
            if now.duration_since(waiter.enqueued_at) >= self.queue_timeout {
                // Dropping the sender wakes the waiter as evicted
                continue;
            }
            if waiter.grant.send(()).is_ok() {
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
    }

    /// Point-in-time view of this gate
    #[must_use]
    pub fn snapshot(&self) -> GateSnapshot {
        let (active, waiting) = {
            let state = self.state.lock();
            (state.active, state.waiters.len())
        };
        GateSnapshot {
            provider_id: self.provider_id.clone(),
            capacity: self.capacity,
            active,
            waiting,
            queue_timeout_ms: duration_ms(self.queue_timeout),
            total_grants: self.stats.total_grants.load(Ordering::Relaxed),
            total_queued: self.stats.total_queued.load(Ordering::Relaxed),
            total_timeouts: self.stats.total_timeouts.load(Ordering::Relaxed),
            total_rejections: self.stats.total_rejections.load(Ordering::Relaxed),
            total_wait_time_ms: self.stats.total_wait_time_ms.load(Ordering::Relaxed),
            peak_active: self.stats.peak_active.load(Ordering::Relaxed),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Queue entry owned by a suspended `acquire`
///
/// Dropping it (timeout, cancellation, or the caller's future being dropped)
/// withdraws the entry. If a release already handed us the slot, the slot is
/// passed on instead of leaking.
struct PendingWaiter<'a> {
    gate: &'a ConcurrencyGate,
    id: u64,
    rx: oneshot::Receiver<()>,
    claimed: bool,
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        let mut state = self.gate.state.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
            state.waiters.remove(pos);
        } else if self.rx.try_recv().is_ok() {
            self.gate.hand_off_locked(&mut state);
        }
    }
}

// ============================================================================
// Permit
// ============================================================================

/// A held concurrency slot; released on drop
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<ConcurrencyGate>,
    released: bool,
}

impl GatePermit {
    fn new(gate: Arc<ConcurrencyGate>) -> Self {
        Self {
            gate,
            released: false,
        }
    }

    /// Provider this permit belongs to
    #[must_use]
    pub fn provider_id(&self) -> &str {
        self.gate.provider_id()
    }

    /// Release the slot now; later calls and the eventual drop are no-ops
    pub fn release(&mut self) {
        if !std::mem::replace(&mut self.released, true) {
            self.gate.release_slot();
        }
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time gate statistics
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GateSnapshot {
    pub provider_id: String,
    pub capacity: Option<usize>,
    pub active: usize,
    pub waiting: usize,
    pub queue_timeout_ms: u64,
    pub total_grants: u64,
    pub total_queued: u64,
    pub total_timeouts: u64,
    pub total_rejections: u64,
    pub total_wait_time_ms: u64,
    pub peak_active: u64,
}

// ============================================================================
// Registry
// ============================================================================

/// Lazily-created gates, one per provider
#[derive(Debug)]
pub struct GateRegistry {
    gates: DashMap<String, Arc<ConcurrencyGate>>,
    limits: HashMap<String, (Option<usize>, Duration)>,
    default_queue_timeout: Duration,
}

impl GateRegistry {
    /// Build a registry from router configuration
    #[must_use]
    pub fn from_config(config: &RouterConfig) -> Self {
        let limits = config
            .providers
            .iter()
            .map(|(id, l)| (id.clone(), (l.max_concurrent, config.queue_timeout_for(id))))
            .collect();

        Self {
            gates: DashMap::new(),
            limits,
            default_queue_timeout: Duration::from_millis(config.queue_timeout_ms),
        }
    }

    /// Gate for a provider, creating it on first use
    pub fn get_or_create(&self, provider_id: &str) -> Arc<ConcurrencyGate> {
        if let Some(gate) = self.gates.get(provider_id) {
            return Arc::clone(gate.value());
        }

        let (capacity, queue_timeout) = self
            .limits
            .get(provider_id)
            .copied()
            .unwrap_or((None, self.default_queue_timeout));

        let entry = self
            .gates
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                Arc::new(ConcurrencyGate::new(provider_id, capacity, queue_timeout))
            });
        Arc::clone(entry.value())
    }

    /// Gate for a provider if it has been used
    #[must_use]
    pub fn get(&self, provider_id: &str) -> Option<Arc<ConcurrencyGate>> {
        self.gates.get(provider_id).map(|g| Arc::clone(g.value()))
    }

    /// Snapshots of every gate created so far
    #[must_use]
    pub fn snapshot(&self) -> Vec<GateSnapshot> {
        let mut snapshots: Vec<_> = self.gates.iter().map(|g| g.snapshot()).collect();
        snapshots.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        snapshots
    }
}
