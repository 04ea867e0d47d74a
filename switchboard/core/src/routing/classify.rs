//! Error Classification
//!
//! Every provider failure is reduced to an [`ErrorKind`] before the router
//! acts on it. The kind decides two things:
//!
//! - `retryable`: whether the failure is transient for the provider
//! - `affects_circuit`: whether it counts toward tripping the breaker
//!
//! | kind          | retryable | affects_circuit |
//! |---------------|-----------|-----------------|
//! | ABORTED       | false     | false           |
//! | TIMEOUT       | true      | true            |
//! | THROTTLED     | false     | true            |
//! | SERVER        | true      | true            |
//! | CLIENT        | false     | false           |
//! | UNKNOWN       | false     | true            |
//! | GATE_TIMEOUT  | true      | false           |
//! | CIRCUIT_OPEN  | true      | false           |
//!
//! The last two are produced by the router itself, never by [`classify`].
//! Classification is a pure function of the raw error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Kinds
// ============================================================================

/// Classified failure kind of a single attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Attempt was cancelled (hedge loser or caller abort)
    Aborted,
    /// Attempt exceeded its deadline
    Timeout,
    /// Provider is rate limiting us
    Throttled,
    /// Provider-side failure (5xx, connection reset)
    Server,
    /// Request was rejected as invalid (4xx)
    Client,
    /// Failure that could not be recognised
    Unknown,
    /// Router gave up waiting for a concurrency slot
    GateTimeout,
    /// Router refused to contact a provider with an open circuit
    CircuitOpen,
}

impl ErrorKind {
    /// Number of kinds
    pub const COUNT: usize = 8;

    /// Every kind, in display order
    pub const ALL: [ErrorKind; Self::COUNT] = [
        Self::Aborted,
        Self::Timeout,
        Self::Throttled,
        Self::Server,
        Self::Client,
        Self::Unknown,
        Self::GateTimeout,
        Self::CircuitOpen,
    ];

    /// Whether the failure is transient for this provider
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Server | Self::GateTimeout | Self::CircuitOpen
        )
    }

    /// Whether the failure counts toward opening the circuit
    #[must_use]
    pub fn affects_circuit(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Throttled | Self::Server | Self::Unknown
        )
    }

    /// Whether the router synthesised this kind without contacting a provider
    #[must_use]
    pub fn is_synthetic(self) -> bool {
        matches!(self, Self::GateTimeout | Self::CircuitOpen)
    }

    /// Stable uppercase label, used in logs and metric labels
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aborted => "ABORTED",
            Self::Timeout => "TIMEOUT",
            Self::Throttled => "THROTTLED",
            Self::Server => "SERVER",
            Self::Client => "CLIENT",
            Self::Unknown => "UNKNOWN",
            Self::GateTimeout => "GATE_TIMEOUT",
            Self::CircuitOpen => "CIRCUIT_OPEN",
        }
    }

    /// Position of this kind in [`ErrorKind::ALL`]
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Full classification record for this kind
    #[must_use]
    pub fn classification(self) -> Classification {
        Classification {
            kind: self,
            retryable: self.is_retryable(),
            affects_circuit: self.affects_circuit(),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying a raw failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub affects_circuit: bool,
}

// ============================================================================
// Raw Provider Errors
// ============================================================================

/// Failure as reported by a provider call, before classification
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RawError {
    /// The call observed its cancellation token
    #[error("call cancelled")]
    Cancelled,

    /// The call ran past its deadline
    #[error("call timed out")]
    TimedOut,

    /// The provider answered with an HTTP error status
    #[error("provider returned status {code}: {message}")]
    Status { code: u16, message: String },

    /// Connection-level failure (refused, reset, DNS)
    #[error("transport failure: {0}")]
    Transport(String),

    /// Anything else, described only by a message
    #[error("{0}")]
    Other(String),
}

impl RawError {
    /// Convenience constructor for status failures
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }
}

// ============================================================================
// Classifier
// ============================================================================

/// Classify a raw provider failure
#[must_use]
pub fn classify(raw: &RawError) -> Classification {
    let kind = match raw {
        RawError::Cancelled => ErrorKind::Aborted,
        RawError::TimedOut => ErrorKind::Timeout,
        RawError::Status { code, .. } => kind_for_status(*code),
        RawError::Transport(_) => ErrorKind::Server,
        RawError::Other(message) => kind_for_message(message),
    };
    kind.classification()
}

fn kind_for_status(code: u16) -> ErrorKind {
    match code {
        408 => ErrorKind::Timeout,
        429 => ErrorKind::Throttled,
        500..=599 => ErrorKind::Server,
        400..=499 => ErrorKind::Client,
        _ => ErrorKind::Unknown,
    }
}

const ABORT_MARKERS: &[&str] = &["abort", "cancel"];
const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "deadline exceeded"];
const THROTTLE_MARKERS: &[&str] = &["rate limit", "ratelimit", "too many requests", "429", "quota"];
const SERVER_MARKERS: &[&str] = &[
    "500",
    "502",
    "503",
    "504",
    "internal server error",
    "bad gateway",
    "overloaded",
    "unavailable",
    "connection reset",
    "connection refused",
];
const CLIENT_MARKERS: &[&str] = &[
    "400",
    "401",
    "403",
    "404",
    "invalid",
    "unauthorized",
    "forbidden",
    "not found",
];

// Checked in order: the first matching family wins
fn kind_for_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if has(ABORT_MARKERS) {
        ErrorKind::Aborted
    } else if has(TIMEOUT_MARKERS) {
        ErrorKind::Timeout
    } else if has(THROTTLE_MARKERS) {
        ErrorKind::Throttled
    } else if has(SERVER_MARKERS) {
        ErrorKind::Server
    } else if has(CLIENT_MARKERS) {
        ErrorKind::Client
    } else {
        ErrorKind::Unknown
    }
}
