//! Provider Abstraction
//!
//! The router never talks to a network itself. Each backend is plugged in as
//! a [`Provider`] and looked up by id in a [`ProviderRegistry`]. Transport,
//! authentication and wire formats all live behind this trait.
//!
//! Implementations receive the per-attempt deadline and a [`CancelToken`].
//! The router also enforces both from the outside, so a provider that ignores
//! them is still bounded; honouring them lets it stop work early.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::cancel::CancelToken;
use super::classify::RawError;

// ============================================================================
// Requests and Outputs
// ============================================================================

/// What a caller asks the router to complete
///
/// Prompt content is passed through untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// System prompt
    pub system_prompt: String,
    /// User prompt
    pub user_prompt: String,
    /// Maximum tokens in the response (`None` = provider default)
    pub max_tokens: Option<u32>,
    /// Provider-specific parameters (temperature, response format, ...)
    pub extra_params: serde_json::Map<String, serde_json::Value>,
}

impl CompletionRequest {
    /// Create a request with just a user prompt
    pub fn new(user_prompt: impl Into<String>) -> Self {
        Self {
            user_prompt: user_prompt.into(),
            ..Default::default()
        }
    }

    /// Set system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = system.into();
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set a provider-specific parameter
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra_params.insert(key.into(), value.into());
        self
    }
}

/// Payload handed to a provider for one attempt
#[derive(Clone, Debug)]
pub struct ProviderPayload {
    /// Role the call is made for
    pub role_id: String,
    /// Provider being attempted
    pub provider_id: String,
    /// The caller's request, shared across hedged attempts
    pub request: Arc<CompletionRequest>,
}

/// Successful provider response
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOutput {
    /// Generated text
    pub text: String,
    /// Model that produced it, if the provider reports one
    pub model: Option<String>,
    /// Tokens used, if reported
    pub tokens_used: Option<u32>,
}

impl ProviderOutput {
    /// Output carrying only text
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Set the reporting model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set tokens used
    #[must_use]
    pub fn with_tokens_used(mut self, tokens: u32) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

// ============================================================================
// Provider Trait
// ============================================================================

/// A text-generation backend
#[async_trait]
pub trait Provider: Send + Sync {
    /// Perform one completion attempt
    ///
    /// `timeout` is the attempt deadline; `cancel` fires when the attempt is
    /// no longer wanted (hedge lost, caller gave up).
    async fn call(
        &self,
        payload: &ProviderPayload,
        timeout: Duration,
        cancel: CancelToken,
    ) -> Result<ProviderOutput, RawError>;
}

type CallFn =
    dyn Fn(ProviderPayload, Duration, CancelToken) -> BoxFuture<'static, Result<ProviderOutput, RawError>>
        + Send
        + Sync;

/// Adapts a closure into a [`Provider`]
///
/// ```ignore
/// let echo = FnProvider::new(|payload, _timeout, _cancel| async move {
///     Ok(ProviderOutput::text(payload.request.user_prompt.clone()))
/// });
/// ```
pub struct FnProvider {
    call: Box<CallFn>,
}

impl FnProvider {
    /// Wrap an async closure
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ProviderPayload, Duration, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ProviderOutput, RawError>> + Send + 'static,
    {
        Self {
            call: Box::new(move |payload, timeout, cancel| Box::pin(f(payload, timeout, cancel))),
        }
    }
}

impl std::fmt::Debug for FnProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnProvider").finish_non_exhaustive()
    }
}

#[async_trait]
impl Provider for FnProvider {
    async fn call(
        &self,
        payload: &ProviderPayload,
        timeout: Duration,
        cancel: CancelToken,
    ) -> Result<ProviderOutput, RawError> {
        (self.call)(payload.clone(), timeout, cancel).await
    }
}

// ============================================================================
// Provider Registry
// ============================================================================

/// Providers available to the router, keyed by id
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any previous one with the same id
    pub fn register(&mut self, provider_id: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(provider_id.into(), provider);
    }

    /// Builder-style [`register`](Self::register)
    #[must_use]
    pub fn with(mut self, provider_id: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.register(provider_id, provider);
        self
    }

    /// Look up a provider
    #[must_use]
    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(provider_id).cloned()
    }

    /// Whether a provider is registered
    #[must_use]
    pub fn contains(&self, provider_id: &str) -> bool {
        self.providers.contains_key(provider_id)
    }

    /// Registered ids in sorted order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Number of registered providers
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no provider is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}
