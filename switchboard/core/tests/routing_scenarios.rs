//! End-to-end Routing Scenarios
//!
//! Drives the public router API against mock providers on a paused tokio
//! clock, so latencies are exact and the tests never sleep for real:
//! - Hedged race with a slow loser
//! - Breaker trip followed by fast fallback
//! - FIFO gate hand-off
//! - Single half-open probe under concurrent arrivals
//! - Fail-fast when every circuit is open
//!
//! Set `RUST_LOG=switchboard_core=debug` to see the router's tracing output.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::time::Instant;

use switchboard_core::routing::gate::ConcurrencyGate;
use switchboard_core::{
    BreakerConfig, CancelToken, CircuitState, CompletionRequest, ErrorKind, HedgedRouter,
    Provider, ProviderLimits, ProviderOutput, ProviderPayload, RawError, RoleConfig,
    RouterConfig, RouterError,
};

// =============================================================================
// Test Infrastructure
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One scripted reply: `Ok(text)` or `Err(error)`, delivered after `delay`
#[derive(Clone, Debug)]
struct Reply {
    delay: Duration,
    result: Result<String, RawError>,
}

impl Reply {
    fn ok(ms: u64, text: &str) -> Self {
        Self {
            delay: Duration::from_millis(ms),
            result: Ok(text.to_string()),
        }
    }

    fn err(ms: u64, error: RawError) -> Self {
        Self {
            delay: Duration::from_millis(ms),
            result: Err(error),
        }
    }
}

/// Mock provider that follows a script and tracks concurrency
#[derive(Debug)]
struct MockProvider {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockProvider {
    fn scripted(script: Vec<Reply>, fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn always(reply: Reply) -> Arc<Self> {
        Self::scripted(Vec::new(), reply)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn call(
        &self,
        _payload: &ProviderPayload,
        _timeout: Duration,
        cancel: CancelToken,
    ) -> Result<ProviderOutput, RawError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let reply = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        tokio::select! {
            () = cancel.cancelled() => Err(RawError::Cancelled),
            () = tokio::time::sleep(reply.delay) => reply.result.map(ProviderOutput::text),
        }
    }
}

fn build(config: RouterConfig, providers: &[(&str, &Arc<MockProvider>)]) -> HedgedRouter {
    let mut builder = HedgedRouter::builder().config(config);
    for (id, provider) in providers {
        builder = builder.provider(*id, Arc::clone(provider) as Arc<dyn Provider>);
    }
    builder.build().expect("valid router")
}

fn request() -> CompletionRequest {
    CompletionRequest::new("Write a haiku about retries").with_max_tokens(64)
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// Scenario A: hedged race
// =============================================================================

#[tokio::test(start_paused = true)]
async fn scenario_a_hedged_fast_provider_wins() {
    init_tracing();

    let p1 = MockProvider::always(Reply::ok(50, "from p1"));
    let p2 = MockProvider::always(Reply::ok(500, "from p2"));
    let config = RouterConfig::new().with_role(RoleConfig::hedged("drafter", ["p1", "p2"]));
    let router = build(config, &[("p1", &p1), ("p2", &p2)]);

    let started = Instant::now();
    let reply = router.call("drafter", request()).await.unwrap();

    assert_eq!(reply.provider, "p1");
    assert_eq!(reply.output.text, "from p1");
    assert_eq!(started.elapsed(), Duration::from_millis(50));
    assert_eq!(reply.latency_ms, 50);

    let snapshot = router.metrics();

    // Winner finished before the race was cancelled: one record, no ABORTED
    let p1_metrics = &snapshot.by_provider["p1"];
    assert_eq!(p1_metrics.attempts, 1);
    assert_eq!(p1_metrics.successes, 1);
    assert_eq!(p1_metrics.failures_of(ErrorKind::Aborted), 0);

    let p2_metrics = &snapshot.by_provider["p2"];
    assert_eq!(p2_metrics.attempts, 1);
    assert_eq!(p2_metrics.successes, 0);
    assert_eq!(p2_metrics.failures_of(ErrorKind::Aborted), 1);

    // Loser left no trace on its breaker or gate
    let p2_breaker = &snapshot.circuit_states["p2"];
    assert_eq!(p2_breaker.state, CircuitState::Closed);
    assert_eq!(p2_breaker.consecutive_failures, 0);
    assert_eq!(snapshot.concurrency["p2"].active, 0);
    assert_eq!(p2.max_in_flight(), 1);

    assert_eq!(snapshot.total_calls, 1);
    assert_eq!(snapshot.successful_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn hedged_early_failure_is_not_recorded_as_aborted() {
    init_tracing();

    let p1 = MockProvider::always(Reply::err(10, RawError::status(502, "bad gateway")));
    let p2 = MockProvider::always(Reply::ok(50, "from p2"));
    let p3 = MockProvider::always(Reply::ok(500, "from p3"));
    let config =
        RouterConfig::new().with_role(RoleConfig::hedged("drafter", ["p1", "p2", "p3"]));
    let router = build(config, &[("p1", &p1), ("p2", &p2), ("p3", &p3)]);

    let reply = router.call("drafter", request()).await.unwrap();
    assert_eq!(reply.provider, "p2");

    let mut failed: Vec<_> = reply
        .failed_attempts
        .iter()
        .map(|a| (a.provider.as_str(), a.error_kind))
        .collect();
    failed.sort();
    assert_eq!(
        failed,
        vec![("p1", ErrorKind::Server), ("p3", ErrorKind::Aborted)]
    );

    let snapshot = router.metrics();

    let p1_metrics = &snapshot.by_provider["p1"];
    assert_eq!(p1_metrics.attempts, 1);
    assert_eq!(p1_metrics.failures_of(ErrorKind::Server), 1);
    assert_eq!(p1_metrics.failures_of(ErrorKind::Aborted), 0);
    assert_eq!(snapshot.circuit_states["p1"].consecutive_failures, 1);

    let p2_metrics = &snapshot.by_provider["p2"];
    assert_eq!(p2_metrics.attempts, 1);
    assert_eq!(p2_metrics.successes, 1);
    assert_eq!(p2_metrics.failures_of(ErrorKind::Aborted), 0);

    let p3_metrics = &snapshot.by_provider["p3"];
    assert_eq!(p3_metrics.attempts, 1);
    assert_eq!(p3_metrics.failures_of(ErrorKind::Aborted), 1);

    for provider in ["p1", "p2", "p3"] {
        assert_eq!(snapshot.concurrency[provider].active, 0);
    }
}

// =============================================================================
// Scenario B: breaker trip then fast fallback
// =============================================================================

#[tokio::test(start_paused = true)]
async fn scenario_b_open_circuit_skips_provider_without_waiting() {
    init_tracing();

    let p1 = MockProvider::always(Reply::err(0, RawError::status(503, "overloaded")));
    let p2 = MockProvider::always(Reply::ok(10, "from p2"));
    let config = RouterConfig::new()
        .with_role(RoleConfig::single("planner", ["p1", "p2"]).with_timeout_ms(5_000))
        .with_breaker(BreakerConfig {
            failure_threshold: 5,
            reset_window_ms: 60_000,
        });
    let router = build(config, &[("p1", &p1), ("p2", &p2)]);

    for _ in 0..5 {
        let reply = router.call("planner", request()).await.unwrap();
        assert_eq!(reply.provider, "p2");
        assert_eq!(reply.failed_attempts[0].error_kind, ErrorKind::Server);
    }
    assert_eq!(p1.calls(), 5);
    assert_eq!(router.metrics().circuit_state("p1"), CircuitState::Open);

    let started = Instant::now();
    let reply = router.call("planner", request()).await.unwrap();

    assert_eq!(reply.provider, "p2");
    assert_eq!(p1.calls(), 5);
    assert_eq!(reply.failed_attempts.len(), 1);
    assert_eq!(reply.failed_attempts[0].error_kind, ErrorKind::CircuitOpen);
    assert!(reply.failed_attempts[0].retryable);
    // Only p2's own latency: no wait on p1's timeout
    assert_eq!(started.elapsed(), Duration::from_millis(10));

    let p1_metrics = &router.metrics().by_provider["p1"];
    assert_eq!(p1_metrics.failures_of(ErrorKind::Server), 5);
    assert_eq!(p1_metrics.failures_of(ErrorKind::CircuitOpen), 1);
    assert_eq!(p1_metrics.dispatched, 5);
}

// =============================================================================
// Scenario C: FIFO gate hand-off
// =============================================================================

#[tokio::test(start_paused = true)]
async fn scenario_c_gate_grants_in_arrival_order() {
    let gate = Arc::new(ConcurrencyGate::new("p3", Some(2), Duration::from_secs(30)));
    let token = CancelToken::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut first = gate.acquire(&token).await.unwrap();
    let _second = gate.acquire(&token).await.unwrap();
    assert_eq!(gate.active(), 2);

    let spawn_waiter = |name: &'static str| {
        let gate = Arc::clone(&gate);
        let order = Arc::clone(&order);
        let token = token.clone();
        tokio::spawn(async move {
            let permit = gate.acquire(&token).await.unwrap();
            order.lock().push(name);
            permit
        })
    };

    let third = spawn_waiter("third");
    settle().await;
    assert_eq!(gate.waiting(), 1);

    let fourth = spawn_waiter("fourth");
    settle().await;
    assert_eq!(gate.waiting(), 2);

    first.release();
    let third_permit = third.await.unwrap();
    assert_eq!(*order.lock(), vec!["third"]);
    assert_eq!(gate.active(), 2);
    assert_eq!(gate.waiting(), 1);

    drop(third_permit);
    let _fourth_permit = fourth.await.unwrap();
    assert_eq!(*order.lock(), vec!["third", "fourth"]);
    assert_eq!(gate.active(), 2);
    assert_eq!(gate.waiting(), 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_router_never_exceeds_gate_capacity() {
    let p3 = MockProvider::always(Reply::ok(20, "from p3"));
    let config = RouterConfig::new()
        .with_role(RoleConfig::single("worker", ["p3"]))
        .with_provider("p3", ProviderLimits::default().with_max_concurrent(2));
    let router = Arc::new(build(config, &[("p3", &p3)]));

    let calls: Vec<_> = (0..6)
        .map(|_| {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.call("worker", request()).await })
        })
        .collect();

    let started = Instant::now();
    for call in calls {
        assert_eq!(call.await.unwrap().unwrap().provider, "p3");
    }

    assert_eq!(p3.calls(), 6);
    assert_eq!(p3.max_in_flight(), 2);
    // Three waves of two
    assert_eq!(started.elapsed(), Duration::from_millis(60));
    assert_eq!(router.metrics().concurrency["p3"].peak_active, 2);
}

// =============================================================================
// Scenario D: single half-open probe
// =============================================================================

#[tokio::test(start_paused = true)]
async fn scenario_d_one_probe_after_reset_window() {
    init_tracing();

    let p1 = MockProvider::scripted(
        vec![Reply::err(0, RawError::Transport("connection reset".into()))],
        Reply::ok(100, "recovered"),
    );
    let config = RouterConfig::new()
        .with_role(RoleConfig::single("checker", ["p1"]))
        .with_breaker(BreakerConfig {
            failure_threshold: 1,
            reset_window_ms: 1_000,
        });
    let router = build(config, &[("p1", &p1)]);

    let err = router.call("checker", request()).await.unwrap_err();
    assert!(matches!(err, RouterError::Exhausted(_)));
    assert_eq!(router.metrics().circuit_state("p1"), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(1_001)).await;

    let (first, second) = tokio::join!(
        router.call("checker", request()),
        router.call("checker", request()),
    );

    let (probe, rejected) = match (first, second) {
        (Ok(probe), Err(rejected)) | (Err(rejected), Ok(probe)) => (probe, rejected),
        other => panic!("expected exactly one probe, got {other:?}"),
    };

    assert_eq!(probe.output.text, "recovered");
    assert_eq!(
        rejected.attempts().iter().map(|a| a.error_kind).collect::<Vec<_>>(),
        vec![ErrorKind::CircuitOpen]
    );
    assert_eq!(p1.calls(), 2);
    assert_eq!(p1.max_in_flight(), 1);

    let breaker = &router.metrics().circuit_states["p1"];
    assert_eq!(breaker.state, CircuitState::Closed);
    assert_eq!(breaker.total_probes, 1);
}

// =============================================================================
// Scenario E: every circuit open
// =============================================================================

#[tokio::test(start_paused = true)]
async fn scenario_e_all_circuits_open_fails_fast() {
    init_tracing();

    let p1 = MockProvider::always(Reply::err(0, RawError::status(500, "boom")));
    let p2 = MockProvider::always(Reply::err(0, RawError::status(502, "bad gateway")));
    let config = RouterConfig::new()
        .with_role(RoleConfig::hedged("drafter", ["p1", "p2"]))
        .with_breaker(BreakerConfig {
            failure_threshold: 1,
            reset_window_ms: 60_000,
        });
    let router = build(config, &[("p1", &p1), ("p2", &p2)]);

    let err = router.call("drafter", request()).await.unwrap_err();
    assert!(matches!(err, RouterError::Exhausted(_)));
    assert_eq!((p1.calls(), p2.calls()), (1, 1));

    let started = Instant::now();
    let err = router.call("drafter", request()).await.unwrap_err();

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!((p1.calls(), p2.calls()), (1, 1));
    let RouterError::NoEligibleProvider(aggregate) = &err else {
        panic!("expected NoEligibleProvider, got {err:?}");
    };
    assert_eq!(aggregate.role_id, "drafter");
    assert_eq!(aggregate.attempts.len(), 2);
    assert!(aggregate.all_of_kind(ErrorKind::CircuitOpen));
    assert_eq!(err.to_string(), "no eligible provider for role 'drafter' (p1: CIRCUIT_OPEN, p2: CIRCUIT_OPEN)");
}

// =============================================================================
// Cancellation and administration
// =============================================================================

#[tokio::test(start_paused = true)]
async fn hedged_call_cancelled_by_caller_aborts_every_attempt() {
    let p1 = MockProvider::always(Reply::ok(300, "from p1"));
    let p2 = MockProvider::always(Reply::ok(400, "from p2"));
    let config = RouterConfig::new().with_role(RoleConfig::hedged("drafter", ["p1", "p2"]));
    let router = Arc::new(build(config, &[("p1", &p1), ("p2", &p2)]));

    let token = CancelToken::new();
    let call = {
        let router = Arc::clone(&router);
        let token = token.clone();
        tokio::spawn(async move { router.call_with_cancel("drafter", request(), &token).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, RouterError::Cancelled(_)));
    assert_eq!(err.attempts().len(), 2);
    assert!(err.attempts().iter().all(|a| a.error_kind == ErrorKind::Aborted));

    let snapshot = router.metrics();
    for provider in ["p1", "p2"] {
        assert_eq!(snapshot.by_provider[provider].failures_of(ErrorKind::Aborted), 1);
        assert_eq!(snapshot.concurrency[provider].active, 0);
        assert_eq!(snapshot.circuit_state(provider), CircuitState::Closed);
    }
}

#[tokio::test(start_paused = true)]
async fn reset_breaker_restores_traffic() {
    let p1 = MockProvider::scripted(
        vec![Reply::err(0, RawError::status(503, "busy"))],
        Reply::ok(5, "back"),
    );
    let config = RouterConfig::new()
        .with_role(RoleConfig::single("planner", ["p1"]))
        .with_breaker(BreakerConfig {
            failure_threshold: 1,
            reset_window_ms: 60_000,
        });
    let router = build(config, &[("p1", &p1)]);

    assert!(router.call("planner", request()).await.is_err());
    assert!(router.call("planner", request()).await.is_err());
    assert_eq!(p1.calls(), 1);

    assert!(router.breakers().reset("p1"));
    let reply = router.call("planner", request()).await.unwrap();
    assert_eq!(reply.output.text, "back");
    assert_eq!(p1.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn snapshot_exports_json_and_prometheus() {
    let p1 = MockProvider::always(Reply::ok(25, "ok"));
    let config = RouterConfig::new().with_role(RoleConfig::single("planner", ["p1"]));
    let router = build(config, &[("p1", &p1)]);

    router.call("planner", request()).await.unwrap();
    let snapshot = router.metrics();

    let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
    assert_eq!(json["total_calls"], 1);
    assert_eq!(json["circuit_states"]["p1"]["state"], "CLOSED");

    let text = snapshot.to_prometheus();
    assert!(text.contains("switchboard_calls_total{result=\"success\"} 1"));
    assert!(text.contains("switchboard_attempts_total{provider=\"p1\",outcome=\"success\"} 1"));
    assert!(text.contains("switchboard_circuit_state{provider=\"p1\"} 0"));
}
