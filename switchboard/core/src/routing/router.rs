//! Hedged Router
//!
//! The entry point for role-based calls. Looks up the role's policy and
//! drives each candidate provider through breaker, gate and provider call.
//!
//! # Usage
//!
//! ```ignore
//! let router = HedgedRouter::builder()
//!     .config(RouterConfig::new().with_role(RoleConfig::hedged("drafter", ["fast", "slow"])))
//!     .provider("fast", fast_provider)
//!     .provider("slow", slow_provider)
//!     .build()?;
//!
//! let reply = router.call("drafter", CompletionRequest::new("Summarise this")).await?;
//! println!("{} answered in {}ms", reply.provider, reply.latency_ms);
//! ```
//!
//! # Modes
//!
//! - **Single**: candidates are tried one after another in priority order.
//!   Any failure moves on to the next candidate; a provider is never retried
//!   within one call.
//! - **Hedged**: up to `hedge_fanout` candidates that are admissible right now
//!   are raced as separate tasks. The first success cancels the rest, which
//!   release their permits and are recorded as ABORTED.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use super::breaker::{BreakerPermit, BreakerRegistry};
use super::cancel::CancelToken;
use super::classify::{classify, ErrorKind, RawError};
use super::config::{RoleConfig, RouterConfig, RoutingMode};
use super::gate::{GateError, GatePermit, GateRegistry};
use super::metrics::{AttemptOutcome, AttemptRecord, MetricsSnapshot, RouterMetrics};
use super::provider::{CompletionRequest, Provider, ProviderOutput, ProviderPayload, ProviderRegistry};

use crate::config::ConfigError;

// ============================================================================
// Results
// ============================================================================

/// One provider's failure within a call
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AttemptFailure {
    pub provider: String,
    pub error_kind: ErrorKind,
    pub retryable: bool,
    /// Human-readable cause, for logs
    pub detail: String,
}

impl AttemptFailure {
    fn new(provider: &str, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            error_kind: kind,
            retryable: kind.is_retryable(),
            detail: detail.into(),
        }
    }
}

/// Every failure collected while serving one call
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AggregateFailure {
    pub role_id: String,
    pub attempts: Vec<AttemptFailure>,
}

impl AggregateFailure {
    /// Whether every entry has the given kind
    #[must_use]
    pub fn all_of_kind(&self, kind: ErrorKind) -> bool {
        self.attempts.iter().all(|a| a.error_kind == kind)
    }
}

impl std::fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.attempts.is_empty() {
            return write!(f, "no attempts");
        }
        for (i, a) in self.attempts.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", a.provider, a.error_kind)?;
        }
        Ok(())
    }
}

/// A successful call
#[derive(Clone, Debug)]
pub struct CallSuccess {
    /// Winning provider's output
    pub output: ProviderOutput,
    /// Winning provider
    pub provider: String,
    /// Time from the start of the call to the result
    pub latency_ms: u64,
    /// Attempts that failed or were cancelled along the way
    pub failed_attempts: Vec<AttemptFailure>,
}

/// Errors surfaced to callers of the router
#[derive(Debug, Error)]
pub enum RouterError {
    /// No role with this id is configured
    #[error("unknown role '{0}'")]
    UnknownRole(String),

    /// Hedged call found no provider it could start right now
    #[error("no eligible provider for role '{}' ({})", .0.role_id, .0)]
    NoEligibleProvider(AggregateFailure),

    /// Every candidate failed
    #[error("all providers failed for role '{}' ({})", .0.role_id, .0)]
    Exhausted(AggregateFailure),

    /// The caller cancelled the call
    #[error("call for role '{}' was cancelled", .0.role_id)]
    Cancelled(AggregateFailure),

    /// A role names a provider that is not registered
    #[error("role '{role}' references unregistered provider '{provider}'")]
    UnknownProvider { role: String, provider: String },

    /// The configuration failed validation
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

impl RouterError {
    /// Per-provider failures, if this error carries them
    #[must_use]
    pub fn attempts(&self) -> &[AttemptFailure] {
        match self {
            Self::NoEligibleProvider(agg) | Self::Exhausted(agg) | Self::Cancelled(agg) => {
                &agg.attempts
            }
            _ => &[],
        }
    }
}

// ============================================================================
// Attempt Bookkeeping
// ============================================================================

/// Records an attempt exactly once
///
/// An attempt whose future is dropped before it reports is recorded as
/// ABORTED.
struct AttemptRecorder {
    metrics: Arc<RouterMetrics>,
    provider_id: String,
    role_id: String,
    started_at: Instant,
    finished: bool,
}

impl AttemptRecorder {
    fn start(metrics: &Arc<RouterMetrics>, provider_id: &str, role_id: &str) -> Self {
        Self {
            metrics: Arc::clone(metrics),
            provider_id: provider_id.to_string(),
            role_id: role_id.to_string(),
            started_at: Instant::now(),
            finished: false,
        }
    }

    fn finish(mut self, outcome: AttemptOutcome, kind: Option<ErrorKind>) -> u64 {
        self.finished = true;
        self.write(outcome, kind)
    }

    fn write(&self, outcome: AttemptOutcome, error_kind: Option<ErrorKind>) -> u64 {
        let finished_at = Instant::now();
        let latency_ms = elapsed_ms(self.started_at, finished_at);
        self.metrics.record(&AttemptRecord {
            provider_id: self.provider_id.clone(),
            role_id: self.role_id.clone(),
            started_at: self.started_at,
            finished_at,
            outcome,
            error_kind,
            latency_ms,
        });
        latency_ms
    }
}

impl Drop for AttemptRecorder {
    fn drop(&mut self) {
        if !self.finished {
            self.write(AttemptOutcome::Aborted, Some(ErrorKind::Aborted));
        }
    }
}

fn elapsed_ms(from: Instant, to: Instant) -> u64 {
    u64::try_from(to.saturating_duration_since(from).as_millis()).unwrap_or(u64::MAX)
}

/// Everything one dispatched attempt owns
struct Attempt {
    provider: Arc<dyn Provider>,
    payload: ProviderPayload,
    timeout: Duration,
    cancel: CancelToken,
    gate_permit: GatePermit,
    breaker_permit: BreakerPermit,
    recorder: AttemptRecorder,
}

async fn run_attempt(attempt: Attempt) -> Result<ProviderOutput, AttemptFailure> {
    let Attempt {
        provider,
        payload,
        timeout,
        cancel,
        mut gate_permit,
        breaker_permit,
        recorder,
    } = attempt;

    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => Err(RawError::Cancelled),
        res = tokio::time::timeout(timeout, provider.call(&payload, timeout, cancel.clone())) => {
            res.unwrap_or(Err(RawError::TimedOut))
        }
    };

    gate_permit.release();

    match result {
        Ok(output) => {
            breaker_permit.succeed();
            let latency_ms = recorder.finish(AttemptOutcome::Success, None);
            tracing::debug!(
                provider = %payload.provider_id,
                latency_ms,
                "Attempt succeeded"
            );
            Ok(output)
        }
        Err(raw) => {
            let class = classify(&raw);
            breaker_permit.fail(class.affects_circuit);

            let outcome = if class.kind == ErrorKind::Aborted {
                AttemptOutcome::Aborted
            } else {
                AttemptOutcome::Failure
            };
            let latency_ms = recorder.finish(outcome, Some(class.kind));
            tracing::debug!(
                provider = %payload.provider_id,
                kind = %class.kind,
                latency_ms,
                error = %raw,
                "Attempt failed"
            );

            Err(AttemptFailure {
                provider: payload.provider_id,
                error_kind: class.kind,
                retryable: class.retryable,
                detail: raw.to_string(),
            })
        }
    }
}

// ============================================================================
// Hedged Router
// ============================================================================

/// Routes role calls across providers with breakers, gates and hedging
pub struct HedgedRouter {
    roles: HashMap<String, Arc<RoleConfig>>,
    providers: ProviderRegistry,
    gates: Arc<GateRegistry>,
    breakers: Arc<BreakerRegistry>,
    metrics: Arc<RouterMetrics>,
}

impl std::fmt::Debug for HedgedRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HedgedRouter")
            .field("roles", &self.roles.keys().collect::<Vec<_>>())
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

impl HedgedRouter {
    /// Start building a router
    #[must_use]
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Build a router from a configuration and the providers it names
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or a role names an
    /// unregistered provider.
    pub fn new(config: RouterConfig, providers: ProviderRegistry) -> Result<Self, RouterError> {
        config.validate()?;

        for role in &config.roles {
            if let Some(missing) = role.providers.iter().find(|p| !providers.contains(p)) {
                return Err(RouterError::UnknownProvider {
                    role: role.role_id.clone(),
                    provider: missing.clone(),
                });
            }
        }

        let gates = Arc::new(GateRegistry::from_config(&config));
        let breakers = Arc::new(BreakerRegistry::from_config(&config));
        let roles = config
            .roles
            .into_iter()
            .map(|r| (r.role_id.clone(), Arc::new(r)))
            .collect();

        Ok(Self {
            roles,
            providers,
            gates,
            breakers,
            metrics: Arc::new(RouterMetrics::new()),
        })
    }

    /// Policy for a role
    #[must_use]
    pub fn role(&self, role_id: &str) -> Option<&RoleConfig> {
        self.roles.get(role_id).map(AsRef::as_ref)
    }

    /// Per-provider breakers
    #[must_use]
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Per-provider gates
    #[must_use]
    pub fn gates(&self) -> &GateRegistry {
        &self.gates
    }

    /// Snapshot of call metrics plus current breaker and gate state
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(&self.breakers, &self.gates)
    }

    /// Route a call for `role_id`
    ///
    /// # Errors
    ///
    /// [`RouterError::UnknownRole`] for an unconfigured role, otherwise an
    /// aggregate error listing every provider's classified failure.
    pub async fn call(
        &self,
        role_id: &str,
        request: CompletionRequest,
    ) -> Result<CallSuccess, RouterError> {
        self.call_with_cancel(role_id, request, &CancelToken::new())
            .await
    }

    /// Route a call that the caller may cancel
    ///
    /// Cancelling `cancel` withdraws queued gate waits and aborts in-flight
    /// attempts; the call then fails with [`RouterError::Cancelled`].
    ///
    /// # Errors
    ///
    /// As for [`call`](Self::call), plus [`RouterError::Cancelled`].
    pub async fn call_with_cancel(
        &self,
        role_id: &str,
        request: CompletionRequest,
        cancel: &CancelToken,
    ) -> Result<CallSuccess, RouterError> {
        let Some(role) = self.roles.get(role_id).cloned() else {
            return Err(RouterError::UnknownRole(role_id.to_string()));
        };

        let span = tracing::info_span!(
            "route_call",
            role = %role.role_id,
            call_id = %Uuid::new_v4(),
            mode = %role.mode,
        );

        async move {
            let started = Instant::now();
            let request = Arc::new(request);

            let result = match role.mode {
                RoutingMode::Single => self.call_single(&role, request, cancel).await,
                RoutingMode::Hedged => self.call_hedged(&role, request, cancel).await,
            };

            self.metrics.record_call(result.is_ok());
            match result {
                Ok((provider, output, failed_attempts)) => {
                    let latency_ms = elapsed_ms(started, Instant::now());
                    tracing::debug!(provider = %provider, latency_ms, "Call succeeded");
                    Ok(CallSuccess {
                        output,
                        provider,
                        latency_ms,
                        failed_attempts,
                    })
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Call failed");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    fn aggregate(role: &RoleConfig, attempts: Vec<AttemptFailure>) -> AggregateFailure {
        AggregateFailure {
            role_id: role.role_id.clone(),
            attempts,
        }
    }

    /// Record a refusal that never reached the provider
    fn reject(
        &self,
        role: &RoleConfig,
        provider_id: &str,
        kind: ErrorKind,
        detail: String,
    ) -> AttemptFailure {
        let now = Instant::now();
        self.metrics.record(&AttemptRecord {
            provider_id: provider_id.to_string(),
            role_id: role.role_id.clone(),
            started_at: now,
            finished_at: now,
            outcome: AttemptOutcome::Rejected,
            error_kind: Some(kind),
            latency_ms: 0,
        });
        tracing::debug!(provider = %provider_id, kind = %kind, "Provider skipped");
        AttemptFailure::new(provider_id, kind, detail)
    }

    fn circuit_open(&self, role: &RoleConfig, provider_id: &str) -> AttemptFailure {
        self.reject(
            role,
            provider_id,
            ErrorKind::CircuitOpen,
            format!("circuit for provider '{provider_id}' is open"),
        )
    }

    fn prepare(
        &self,
        role: &RoleConfig,
        provider_id: &str,
        request: &Arc<CompletionRequest>,
        cancel: CancelToken,
        gate_permit: GatePermit,
        breaker_permit: BreakerPermit,
    ) -> Option<Attempt> {
        let provider = self.providers.get(provider_id)?;
        Some(Attempt {
            provider,
            payload: ProviderPayload {
                role_id: role.role_id.clone(),
                provider_id: provider_id.to_string(),
                request: Arc::clone(request),
            },
            timeout: role.timeout(),
            cancel,
            gate_permit,
            breaker_permit,
            recorder: AttemptRecorder::start(&self.metrics, provider_id, &role.role_id),
        })
    }

    async fn call_single(
        &self,
        role: &RoleConfig,
        request: Arc<CompletionRequest>,
        cancel: &CancelToken,
    ) -> Result<(String, ProviderOutput, Vec<AttemptFailure>), RouterError> {
        let mut failures = Vec::new();

        for provider_id in &role.providers {
            if cancel.is_cancelled() {
                return Err(RouterError::Cancelled(Self::aggregate(role, failures)));
            }

            let breaker = self.breakers.get_or_create(provider_id);
            if breaker.is_rejecting() {
                failures.push(self.circuit_open(role, provider_id));
                continue;
            }

            let gate = self.gates.get_or_create(provider_id);
            let gate_permit = match gate.acquire(cancel).await {
                Ok(permit) => permit,
                Err(err @ GateError::Cancelled { .. }) => {
                    failures.push(self.reject(role, provider_id, ErrorKind::Aborted, err.to_string()));
                    return Err(RouterError::Cancelled(Self::aggregate(role, failures)));
                }
                Err(err) => {
                    failures.push(self.reject(
                        role,
                        provider_id,
                        ErrorKind::GateTimeout,
                        err.to_string(),
                    ));
                    continue;
                }
            };

            // Re-checked after the gate: the circuit may have opened while we queued
            let Ok(breaker_permit) = breaker.try_admit() else {
                failures.push(self.circuit_open(role, provider_id));
                continue;
            };

            let Some(attempt) = self.prepare(
                role,
                provider_id,
                &request,
                cancel.child_token(),
                gate_permit,
                breaker_permit,
            ) else {
                continue;
            };

            match run_attempt(attempt).await {
                Ok(output) => return Ok((provider_id.clone(), output, failures)),
                Err(failure) => {
                    let aborted = failure.error_kind == ErrorKind::Aborted;
                    failures.push(failure);
                    if aborted && cancel.is_cancelled() {
                        return Err(RouterError::Cancelled(Self::aggregate(role, failures)));
                    }
                }
            }
        }

        Err(RouterError::Exhausted(Self::aggregate(role, failures)))
    }

    async fn call_hedged(
        &self,
        role: &RoleConfig,
        request: Arc<CompletionRequest>,
        cancel: &CancelToken,
    ) -> Result<(String, ProviderOutput, Vec<AttemptFailure>), RouterError> {
        let mut failures = Vec::new();
        if cancel.is_cancelled() {
            return Err(RouterError::Cancelled(Self::aggregate(role, failures)));
        }

        let fanout = role.fanout_limit();
        let race = cancel.child_token();
        let mut in_flight: JoinSet<(String, Result<ProviderOutput, AttemptFailure>)> =
            JoinSet::new();
        let mut launched: Vec<String> = Vec::with_capacity(fanout);

        for provider_id in &role.providers {
            if launched.len() >= fanout {
                break;
            }

            let breaker = self.breakers.get_or_create(provider_id);
            if breaker.is_rejecting() {
                failures.push(self.circuit_open(role, provider_id));
                continue;
            }

            // Hedging buys latency, so never queue behind a busy provider
            let gate_permit = match self.gates.get_or_create(provider_id).try_acquire() {
                Ok(permit) => permit,
                Err(err) => {
                    failures.push(self.reject(
                        role,
                        provider_id,
                        ErrorKind::GateTimeout,
                        err.to_string(),
                    ));
                    continue;
                }
            };

            let Ok(breaker_permit) = breaker.try_admit() else {
                failures.push(self.circuit_open(role, provider_id));
                continue;
            };

            let Some(attempt) = self.prepare(
                role,
                provider_id,
                &request,
                race.child_token(),
                gate_permit,
                breaker_permit,
            ) else {
                continue;
            };

            let id = provider_id.clone();
            in_flight.spawn(async move { (id, run_attempt(attempt).await) }.in_current_span());
            launched.push(provider_id.clone());
        }

        if launched.is_empty() {
            return Err(RouterError::NoEligibleProvider(Self::aggregate(
                role, failures,
            )));
        }

        tracing::debug!(fanout = launched.len(), providers = ?launched, "Hedged attempts launched");

        let mut winner = None;
        while let Some(joined) = in_flight.join_next().await {
            let Ok((provider_id, result)) = joined else {
                continue;
            };
            launched.retain(|p| *p != provider_id);

            match result {
                Ok(output) if winner.is_none() => {
                    // Losers observe the token, release their permits and record ABORTED
                    race.cancel();
                    winner = Some((provider_id, output));
                }
                Ok(_) => {}
                Err(failure) => failures.push(failure),
            }
        }

        // Tasks that died without reporting
        for provider_id in launched {
            failures.push(AttemptFailure::new(
                &provider_id,
                ErrorKind::Unknown,
                "attempt task terminated unexpectedly",
            ));
        }

        match winner {
            Some((provider_id, output)) => Ok((provider_id, output, failures)),
            None if cancel.is_cancelled() => {
                Err(RouterError::Cancelled(Self::aggregate(role, failures)))
            }
            None => Err(RouterError::Exhausted(Self::aggregate(role, failures))),
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`HedgedRouter`]
#[derive(Debug, Default)]
pub struct RouterBuilder {
    config: RouterConfig,
    providers: ProviderRegistry,
}

impl RouterBuilder {
    /// Use this configuration
    #[must_use]
    pub fn config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a provider
    #[must_use]
    pub fn provider(mut self, provider_id: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.providers.register(provider_id, provider);
        self
    }

    /// Use an existing provider registry
    #[must_use]
    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    /// Validate and build
    ///
    /// # Errors
    ///
    /// See [`HedgedRouter::new`].
    pub fn build(self) -> Result<HedgedRouter, RouterError> {
        HedgedRouter::new(self.config, self.providers)
    }
}
