#![allow(missing_docs)]
//! Resilient Provider Routing
//!
//! Routes role-based completion calls across interchangeable LLM providers.
//! Each provider is shielded by a circuit breaker and a concurrency gate, and
//! roles choose between sequential fallback and hedged racing.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |   HedgedRouter   |  <-- Entry point: call(role, request)
//! +--------+---------+
//!          |  per candidate provider
//!          v
//! +------------------+
//! |  CircuitBreaker  |  <-- Peek: skip providers with an open circuit
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! | ConcurrencyGate  |  <-- FIFO slot per provider, queue timeout
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! |  CircuitBreaker  |  <-- Admit (claims the half-open probe)
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! |     Provider     |  <-- call(payload, timeout, cancel)
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! |     classify     |  --> breaker feedback + RouterMetrics
//! +------------------+
//! ```
//!
//! # Design Principles
//!
//! 1. **Fail Fast**: open circuits and closed gates cost nothing to skip
//! 2. **Bounded Work**: every attempt holds a gate slot and a deadline
//! 3. **Clean Cancellation**: hedge losers release everything and record ABORTED
//! 4. **Observability**: every attempt lands in metrics exactly once

pub mod breaker;
pub mod cancel;
pub mod classify;
pub mod config;
pub mod gate;
pub mod metrics;
pub mod provider;
pub mod router;

#[cfg(test)]
pub mod test_utils;

pub use breaker::{BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use cancel::CancelToken;
pub use classify::{classify, Classification, ErrorKind, RawError};
pub use config::*;
pub use gate::{ConcurrencyGate, GateError, GatePermit, GateRegistry, GateSnapshot};
pub use metrics::{AttemptOutcome, MetricsSnapshot, ProviderSnapshot, RouterMetrics};
pub use provider::*;
pub use router::*;
