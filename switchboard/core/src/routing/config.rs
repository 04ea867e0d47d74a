//! Routing Configuration
//!
//! Role policies, per-provider admission limits, and breaker tuning.
//! A [`RouterConfig`] is validated once when the router is built and is
//! read-only for the router's lifetime.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

// ============================================================================
// Routing Mode
// ============================================================================

/// How a role spreads a call across its providers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Try providers one at a time in priority order
    #[default]
    Single,

    /// Race several providers and keep the first success
    Hedged,
}

impl FromStr for RoutingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "hedged" | "hedge" => Ok(Self::Hedged),
            other => Err(ConfigError::ValidationError(format!(
                "unknown routing mode '{other}' (expected 'single' or 'hedged')"
            ))),
        }
    }
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Hedged => write!(f, "hedged"),
        }
    }
}

// ============================================================================
// Role Configuration
// ============================================================================

/// Routing policy for one logical caller
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Role identifier callers route by
    pub role_id: String,

    /// Single or hedged dispatch
    #[serde(default)]
    pub mode: RoutingMode,

    /// Per-attempt deadline
    #[serde(default = "default_role_timeout_ms")]
    pub timeout_ms: u64,

    /// Providers in priority order
    pub providers: Vec<String>,

    /// Maximum concurrent attempts in hedged mode (`None` = all eligible)
    #[serde(default)]
    pub hedge_fanout: Option<usize>,
}

fn default_role_timeout_ms() -> u64 {
    30_000
}

impl RoleConfig {
    /// Single-mode role over the given providers
    pub fn single<I, S>(role_id: impl Into<String>, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            role_id: role_id.into(),
            mode: RoutingMode::Single,
            timeout_ms: default_role_timeout_ms(),
            providers: providers.into_iter().map(Into::into).collect(),
            hedge_fanout: None,
        }
    }

    /// Hedged role over the given providers
    pub fn hedged<I, S>(role_id: impl Into<String>, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: RoutingMode::Hedged,
            ..Self::single(role_id, providers)
        }
    }

    /// Set the per-attempt timeout
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Cap the hedged fanout
    #[must_use]
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.hedge_fanout = Some(fanout);
        self
    }

    /// Per-attempt timeout as a duration
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Number of attempts a hedged call may launch
    #[must_use]
    pub fn fanout_limit(&self) -> usize {
        self.hedge_fanout
            .unwrap_or(self.providers.len())
            .min(self.providers.len())
    }
}

// ============================================================================
// Provider Limits
// ============================================================================

/// Circuit breaker tuning
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive circuit-affecting failures before opening
    pub failure_threshold: u32,

    /// How long the circuit stays open before a probe is allowed
    pub reset_window_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_window_ms: 60_000, // 1 minute
        }
    }
}

impl BreakerConfig {
    /// Reset window as a duration
    #[must_use]
    pub fn reset_window(&self) -> Duration {
        Duration::from_millis(self.reset_window_ms)
    }
}

/// Admission limits and breaker overrides for one provider
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLimits {
    /// Maximum in-flight attempts (`None` = unbounded, `Some(0)` = reject all)
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// How long an attempt may wait for a slot (falls back to the router default)
    #[serde(default)]
    pub queue_timeout_ms: Option<u64>,

    /// Breaker tuning for this provider only
    #[serde(default)]
    pub breaker: Option<BreakerConfig>,
}

impl ProviderLimits {
    /// Limit concurrency to `max` in-flight attempts
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    /// Override the queue timeout
    #[must_use]
    pub fn with_queue_timeout_ms(mut self, ms: u64) -> Self {
        self.queue_timeout_ms = Some(ms);
        self
    }

    /// Override breaker tuning
    #[must_use]
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = Some(breaker);
        self
    }
}

// ============================================================================
// Router Configuration
// ============================================================================

/// Complete router configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Role policies
    pub roles: Vec<RoleConfig>,

    /// Per-provider limits, keyed by provider id
    pub providers: BTreeMap<String, ProviderLimits>,

    /// Breaker tuning for providers without an override
    pub breaker: BreakerConfig,

    /// Default gate queue timeout
    pub queue_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            roles: Vec::new(),
            providers: BTreeMap::new(),
            breaker: BreakerConfig::default(),
            queue_timeout_ms: 30_000, // 30 seconds
        }
    }
}

impl RouterConfig {
    /// Empty configuration with default tuning
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a role
    #[must_use]
    pub fn with_role(mut self, role: RoleConfig) -> Self {
        self.roles.push(role);
        self
    }

    /// Set limits for a provider
    #[must_use]
    pub fn with_provider(mut self, provider_id: impl Into<String>, limits: ProviderLimits) -> Self {
        self.providers.insert(provider_id.into(), limits);
        self
    }

    /// Set the default breaker tuning
    #[must_use]
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Set the default gate queue timeout
    #[must_use]
    pub fn with_queue_timeout_ms(mut self, ms: u64) -> Self {
        self.queue_timeout_ms = ms;
        self
    }

    /// Look up a role by id
    #[must_use]
    pub fn role(&self, role_id: &str) -> Option<&RoleConfig> {
        self.roles.iter().find(|r| r.role_id == role_id)
    }

    /// Mutable role lookup, inserting an empty single-mode role if absent
    pub fn role_mut_or_insert(&mut self, role_id: &str) -> &mut RoleConfig {
        let idx = match self.roles.iter().position(|r| r.role_id == role_id) {
            Some(idx) => idx,
            None => {
                self.roles
                    .push(RoleConfig::single(role_id, Vec::<String>::new()));
                self.roles.len() - 1
            }
        };
        &mut self.roles[idx]
    }

    /// Gate queue timeout for a provider
    #[must_use]
    pub fn queue_timeout_for(&self, provider_id: &str) -> Duration {
        let ms = self
            .providers
            .get(provider_id)
            .and_then(|l| l.queue_timeout_ms)
            .unwrap_or(self.queue_timeout_ms);
        Duration::from_millis(ms)
    }

    /// Breaker tuning for a provider
    #[must_use]
    pub fn breaker_for(&self, provider_id: &str) -> BreakerConfig {
        self.providers
            .get(provider_id)
            .and_then(|l| l.breaker)
            .unwrap_or(self.breaker)
    }

    /// Every provider id referenced by any role
    #[must_use]
    pub fn referenced_providers(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.roles
            .iter()
            .flat_map(|r| r.providers.iter())
            .map(String::as_str)
            .filter(|p| seen.insert(*p))
            .collect()
    }

    /// Check the configuration for values the router cannot honor
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.breaker.failure_threshold == 0 {
            return invalid("breaker failure_threshold must be at least 1".into());
        }

        for (provider, limits) in &self.providers {
            if provider.is_empty() {
                return invalid("provider ids must not be empty".into());
            }
            if let Some(breaker) = limits.breaker {
                if breaker.failure_threshold == 0 {
                    return invalid(format!(
                        "provider '{provider}': breaker failure_threshold must be at least 1"
                    ));
                }
            }
        }

        let mut role_ids = HashSet::new();
        for role in &self.roles {
            if role.role_id.is_empty() {
                return invalid("role ids must not be empty".into());
            }
            if !role_ids.insert(role.role_id.as_str()) {
                return invalid(format!("duplicate role '{}'", role.role_id));
            }
            if role.providers.is_empty() {
                return invalid(format!("role '{}' has no providers", role.role_id));
            }
            if role.timeout_ms == 0 {
                return invalid(format!("role '{}' has a zero timeout", role.role_id));
            }
            if role.hedge_fanout == Some(0) {
                return invalid(format!("role '{}' has a zero hedge fanout", role.role_id));
            }

            let mut seen = HashSet::new();
            for provider in &role.providers {
                if !seen.insert(provider.as_str()) {
                    return invalid(format!(
                        "role '{}' lists provider '{provider}' twice",
                        role.role_id
                    ));
                }
            }
        }

        Ok(())
    }
}
