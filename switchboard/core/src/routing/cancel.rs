//! Cooperative Cancellation
//!
//! A [`CancelToken`] is passed into every gate wait and every provider call.
//! Hedged dispatch hands each attempt a child token so the winner can cancel
//! its siblings without touching the caller's token, while a caller cancelling
//! the parent tears down every attempt at once.
//!
//! ```text
//!            caller token
//!                 |
//!        +--------+--------+
//!        |        |        |
//!     attempt  attempt  attempt     <-- child tokens
//! ```
//!
//! Cancellation is sticky and idempotent: once cancelled a token stays
//! cancelled, and cancelling again is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A cloneable cancellation signal
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<TokenInner>>>,
}

impl TokenInner {
    fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.notify.notify_waiters();

        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
        true
    }
}

impl CancelToken {
    /// Create a fresh, uncancelled token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel this token and every child derived from it
    ///
    /// Returns `true` only for the call that actually flipped the token.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// Whether the token has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Derive a token that is cancelled together with this one
    ///
    /// Cancelling the child leaves the parent untouched.
    #[must_use]
    pub fn child_token(&self) -> Self {
        let child = Arc::new(TokenInner::default());
        {
            let mut children = self.inner.children.lock();
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }

        // The parent may have been cancelled while we registered
        if self.is_cancelled() {
            child.cancel();
        }

        Self { inner: child }
    }

    /// Resolve once the token is cancelled
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
