//! Routing Test Utilities
//!
//! A scripted [`Provider`] for exercising the router without real backends.
//! Each call pops the next [`Step`] from the script, falling back to a default
//! step once the script runs out.
//!
//! # Usage
//!
//! ```ignore
//! use crate::routing::test_utils::{ScriptedProvider, Step};
//!
//! // Fails twice with a 503, then answers after 20ms
//! let flaky = ScriptedProvider::new(
//!     vec![Step::fail(RawError::status(503, "busy")), Step::fail(RawError::status(503, "busy"))],
//!     Step::succeed_after(20),
//! );
//!
//! assert_eq!(flaky.calls(), 0);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::cancel::CancelToken;
use super::classify::RawError;
use super::provider::{CompletionRequest, Provider, ProviderOutput, ProviderPayload};

/// Text returned by [`Step::Succeed`]
pub const SCRIPTED_REPLY: &str = "ok from provider";

// ============================================================================
// Script Steps
// ============================================================================

/// What one scripted call does
#[derive(Clone, Debug)]
pub enum Step {
    /// Answer with [`SCRIPTED_REPLY`] after a delay
    Succeed { after: Duration },
    /// Fail with the given error after a delay
    Fail { after: Duration, error: RawError },
    /// Answer with the request's user prompt, immediately
    Echo,
    /// Never answer
    Hang,
}

impl Step {
    pub fn succeed_after(ms: u64) -> Self {
        Self::Succeed {
            after: Duration::from_millis(ms),
        }
    }

    pub fn fail(error: RawError) -> Self {
        Self::Fail {
            after: Duration::ZERO,
            error,
        }
    }
}

// ============================================================================
// Scripted Provider
// ============================================================================

/// Mock provider that follows a script and counts what happened
#[derive(Debug)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Step>>,
    default_step: Step,
    calls: AtomicUsize,
    cancellations: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

/// Counts a call that ends without producing a result
struct Unfinished<'a> {
    counter: &'a AtomicUsize,
    finished: bool,
}

impl Drop for Unfinished<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl ScriptedProvider {
    pub fn new(script: Vec<Step>, default_step: Step) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            default_step,
            calls: AtomicUsize::new(0),
            cancellations: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Always succeeds after `ms`
    pub fn succeeding(ms: u64) -> Arc<Self> {
        Self::new(Vec::new(), Step::succeed_after(ms))
    }

    /// Always fails immediately with `error`
    pub fn failing(error: RawError) -> Arc<Self> {
        Self::new(Vec::new(), Step::fail(error))
    }

    /// Never answers
    pub fn hanging() -> Arc<Self> {
        Self::new(Vec::new(), Step::Hang)
    }

    /// Calls received so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls that were cancelled or dropped before answering
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }

    /// Requests received, in order
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_step.clone())
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn call(
        &self,
        payload: &ProviderPayload,
        _timeout: Duration,
        cancel: CancelToken,
    ) -> Result<ProviderOutput, RawError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push((*payload.request).clone());

        let mut unfinished = Unfinished {
            counter: &self.cancellations,
            finished: false,
        };

        let (after, result) = match self.next_step() {
            Step::Succeed { after } => (after, Ok(ProviderOutput::text(SCRIPTED_REPLY))),
            Step::Fail { after, error } => (after, Err(error)),
            Step::Echo => (
                Duration::ZERO,
                Ok(ProviderOutput::text(payload.request.user_prompt.clone())),
            ),
            Step::Hang => {
                cancel.cancelled().await;
                return Err(RawError::Cancelled);
            }
        };

        tokio::select! {
            () = cancel.cancelled() => Err(RawError::Cancelled),
            () = tokio::time::sleep(after) => {
                unfinished.finished = true;
                result
            }
        }
    }
}
