//! TOML Configuration File Support
//!
//! Loads the router configuration from `~/.config/switchboard/router.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. Environment variables
//! 2. TOML configuration file
//! 3. Default values
//!
//! # XDG Base Directory Compliance
//!
//! The configuration file follows XDG Base Directory specification:
//! - `$XDG_CONFIG_HOME/switchboard/router.toml` (typically `~/.config/switchboard/router.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [router]
//! queue_timeout_ms = 30000
//!
//! [breaker]
//! failure_threshold = 5
//! reset_window_ms = 60000
//!
//! [[roles]]
//! role_id = "drafter"
//! mode = "hedged"
//! timeout_ms = 20000
//! providers = ["openai", "anthropic", "local"]
//! hedge_fanout = 2
//!
//! [[roles]]
//! role_id = "summarizer"
//! providers = ["local", "openai"]
//!
//! [providers.local]
//! max_concurrent = 2
//! queue_timeout_ms = 5000
//!
//! [providers.openai]
//! breaker_threshold = 3
//! breaker_reset_ms = 10000
//! ```
//!
//! # Environment Variables
//!
//! - `SWITCHBOARD_BREAKER_THRESHOLD`, `SWITCHBOARD_BREAKER_RESET_MS`
//! - `SWITCHBOARD_QUEUE_TIMEOUT_MS`
//! - `SWITCHBOARD_ROLE_<ROLE>_PROVIDERS` (comma separated), `_MODE`,
//!   `_TIMEOUT_MS`, `_FANOUT`
//!
//! `<ROLE>` matches a configured role id case-insensitively; an unmatched
//! name creates a new role with the lowercased id.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::config::{BreakerConfig, ProviderLimits, RoleConfig, RouterConfig, RoutingMode};

const ENV_PREFIX: &str = "SWITCHBOARD_";
const ROLE_ENV_PREFIX: &str = "SWITCHBOARD_ROLE_";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Router section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterToml {
    /// Default gate queue timeout in milliseconds
    pub queue_timeout_ms: Option<u64>,
}

/// Breaker section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerToml {
    /// Consecutive failures before a circuit opens
    pub failure_threshold: Option<u32>,

    /// How long an open circuit waits before probing
    pub reset_window_ms: Option<u64>,
}

/// One `[[roles]]` entry
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleToml {
    /// Role identifier
    pub role_id: String,

    /// "single" or "hedged"
    pub mode: Option<String>,

    /// Per-attempt deadline in milliseconds
    pub timeout_ms: Option<u64>,

    /// Providers in priority order
    pub providers: Vec<String>,

    /// Hedged fanout cap
    pub hedge_fanout: Option<usize>,
}

/// One `[providers.<id>]` entry
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderToml {
    /// Maximum in-flight attempts
    pub max_concurrent: Option<usize>,

    /// Queue timeout override in milliseconds
    pub queue_timeout_ms: Option<u64>,

    /// Breaker threshold override
    pub breaker_threshold: Option<u32>,

    /// Breaker reset window override in milliseconds
    pub breaker_reset_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardToml {
    /// Router defaults
    pub router: RouterToml,

    /// Breaker defaults
    pub breaker: BreakerToml,

    /// Role policies
    pub roles: Vec<RoleToml>,

    /// Per-provider limits
    pub providers: BTreeMap<String, ProviderToml>,
}

// =============================================================================
// Loaded Configuration
// =============================================================================

/// Router configuration together with where it came from
#[derive(Clone, Debug)]
pub struct SwitchboardConfig {
    /// The router configuration
    pub router: RouterConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl SwitchboardConfig {
    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/switchboard/router.toml` or
/// `~/.config/switchboard/router.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("switchboard").join("router.toml"))
}

/// Load configuration from the default path and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the merged configuration fails validation. A missing config file is not
/// an error (defaults are used).
pub fn load_config() -> Result<SwitchboardConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the process environment
///
/// # Errors
///
/// See [`load_config`].
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<SwitchboardConfig, ConfigError> {
    load_config_with_env(path, std::env::vars())
}

/// Load configuration from a specific path and an explicit set of variables
///
/// # Errors
///
/// See [`load_config`].
pub fn load_config_with_env<I>(path: Option<PathBuf>, vars: I) -> Result<SwitchboardConfig, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut config = SwitchboardConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: SwitchboardToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config.router, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                roles = config.router.roles.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    if apply_env_config(&mut config.router, vars) {
        config.source = ConfigSource::Env;
    }

    config.router.validate()?;
    Ok(config)
}

/// Apply TOML configuration values to the router config
///
/// # Errors
///
/// Fails on an unknown routing mode.
pub fn apply_toml_config(config: &mut RouterConfig, toml: &SwitchboardToml) -> Result<(), ConfigError> {
    if let Some(ms) = toml.router.queue_timeout_ms {
        config.queue_timeout_ms = ms;
    }
    if let Some(threshold) = toml.breaker.failure_threshold {
        config.breaker.failure_threshold = threshold;
    }
    if let Some(ms) = toml.breaker.reset_window_ms {
        config.breaker.reset_window_ms = ms;
    }

    for role in &toml.roles {
        let mode = match role.mode.as_deref() {
            Some(mode) => RoutingMode::from_str(mode)?,
            None => RoutingMode::default(),
        };
        let mut parsed = RoleConfig::single(role.role_id.clone(), role.providers.clone());
        parsed.mode = mode;
        parsed.hedge_fanout = role.hedge_fanout;
        if let Some(ms) = role.timeout_ms {
            parsed.timeout_ms = ms;
        }
        config.roles.push(parsed);
    }

    for (provider_id, p) in &toml.providers {
        let breaker = match (p.breaker_threshold, p.breaker_reset_ms) {
            (None, None) => None,
            (threshold, reset) => Some(BreakerConfig {
                failure_threshold: threshold.unwrap_or(config.breaker.failure_threshold),
                reset_window_ms: reset.unwrap_or(config.breaker.reset_window_ms),
            }),
        };
        config.providers.insert(
            provider_id.clone(),
            ProviderLimits {
                max_concurrent: p.max_concurrent,
                queue_timeout_ms: p.queue_timeout_ms,
                breaker,
            },
        );
    }

    Ok(())
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Option<T> {
    let parsed = value.trim().parse::<T>().ok();
    if parsed.is_none() {
        tracing::warn!(key, value, "Ignoring unparseable environment override");
    }
    parsed
}

/// Apply `SWITCHBOARD_*` overrides to the router config
///
/// Unparseable values are logged and ignored. Returns whether any override
/// was applied.
pub fn apply_env_config<I>(config: &mut RouterConfig, vars: I) -> bool
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut applied = false;

    for (key, value) in vars {
        if !key.starts_with(ENV_PREFIX) {
            continue;
        }

        match key.as_str() {
            "SWITCHBOARD_BREAKER_THRESHOLD" => {
                if let Some(n) = parse_env(&key, &value) {
                    config.breaker.failure_threshold = n;
                    applied = true;
                }
            }
            "SWITCHBOARD_BREAKER_RESET_MS" => {
                if let Some(ms) = parse_env(&key, &value) {
                    config.breaker.reset_window_ms = ms;
                    applied = true;
                }
            }
            "SWITCHBOARD_QUEUE_TIMEOUT_MS" => {
                if let Some(ms) = parse_env(&key, &value) {
                    config.queue_timeout_ms = ms;
                    applied = true;
                }
            }
            _ => {
                if let Some(rest) = key.strip_prefix(ROLE_ENV_PREFIX) {
                    applied |= apply_role_env(config, &key, rest, &value);
                }
            }
        }
    }

    applied
}

fn apply_role_env(config: &mut RouterConfig, key: &str, rest: &str, value: &str) -> bool {
    const SUFFIXES: [&str; 4] = ["_PROVIDERS", "_MODE", "_TIMEOUT_MS", "_FANOUT"];

    let Some((name, suffix)) = SUFFIXES
        .iter()
        .find_map(|s| rest.strip_suffix(s).map(|name| (name, *s)))
    else {
        return false;
    };
    if name.is_empty() {
        return false;
    }

    let role_id = config
        .roles
        .iter()
        .find(|r| r.role_id.eq_ignore_ascii_case(name))
        .map_or_else(|| name.to_lowercase(), |r| r.role_id.clone());

    match suffix {
        "_PROVIDERS" => {
            let providers: Vec<String> = value
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
            config.role_mut_or_insert(&role_id).providers = providers;
        }
        "_MODE" => match RoutingMode::from_str(value) {
            Ok(mode) => config.role_mut_or_insert(&role_id).mode = mode,
            Err(e) => {
                tracing::warn!(key, error = %e, "Ignoring invalid routing mode");
                return false;
            }
        },
        "_TIMEOUT_MS" => match parse_env(key, value) {
            Some(ms) => config.role_mut_or_insert(&role_id).timeout_ms = ms,
            None => return false,
        },
        "_FANOUT" => match parse_env(key, value) {
            Some(n) => config.role_mut_or_insert(&role_id).hedge_fanout = Some(n),
            None => return false,
        },
        _ => return false,
    }

    true
}

// =============================================================================
// Tests
// =============================================================================
