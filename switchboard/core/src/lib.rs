//! Switchboard Core - Resilient Routing for LLM Provider Calls
//!
//! This crate routes role-based completion requests across interchangeable
//! text-generation providers. It keeps calls alive when individual providers
//! are slow, throttled or down, and it does so without any network code of
//! its own: providers are plugged in behind the [`Provider`] trait.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Callers                               │
//! │            router.call("drafter", CompletionRequest)             │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                        SWITCHBOARD CORE                          │
//! │  ┌────────────────────────────┴───────────────────────────────┐  │
//! │  │                       HedgedRouter                         │  │
//! │  │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌────────────┐  │  │
//! │  │  │ Breakers │  │  Gates   │  │ Classify │  │  Metrics   │  │  │
//! │  │  └──────────┘  └──────────┘  └──────────┘  └────────────┘  │  │
//! │  └────────────────────────────┬───────────────────────────────┘  │
//! └───────────────────────────────┼──────────────────────────────────┘
//!                                 │
//!               ┌─────────────────┼─────────────────┐
//!               v                 v                 v
//!         ┌──────────┐      ┌──────────┐      ┌──────────┐
//!         │ Provider │      │ Provider │      │ Provider │
//!         └──────────┘      └──────────┘      └──────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchboard_core::{
//!     load_config, CompletionRequest, FnProvider, HedgedRouter, ProviderOutput,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = load_config()?;
//!
//!     let router = HedgedRouter::builder()
//!         .config(config.router)
//!         .provider("local", Arc::new(FnProvider::new(|payload, _timeout, _cancel| async move {
//!             Ok(ProviderOutput::text(format!("echo: {}", payload.request.user_prompt)))
//!         })))
//!         .build()?;
//!
//!     let reply = router.call("drafter", CompletionRequest::new("Hello")).await?;
//!     println!("{}", reply.output.text);
//!
//!     println!("{}", router.metrics().to_prometheus());
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`routing`]: Router, breakers, gates, classification and metrics
//! - [`config`]: TOML and environment configuration loading

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod routing;

// Routing exports
pub use routing::{
    classify, AggregateFailure, AttemptFailure, BreakerSnapshot, CallSuccess, CancelToken,
    CircuitState, Classification, CompletionRequest, ErrorKind, FnProvider, GateSnapshot,
    HedgedRouter, MetricsSnapshot, Provider, ProviderOutput, ProviderPayload, ProviderRegistry,
    RawError, RoleConfig, RouterBuilder, RouterConfig, RouterError, RoutingMode,
};
pub use routing::config::{BreakerConfig, ProviderLimits};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigSource,
    SwitchboardConfig, SwitchboardToml,
};
