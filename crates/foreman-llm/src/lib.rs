//! Language-model access for the Foreman pipeline.
//!
//! The model is treated as an opaque capability: a prompt plus structured
//! context goes in, a completion that may carry tool calls comes out. Concrete
//! providers implement [`LlmBackend`]; callers hold an [`LlmClient`].
//!
//! # Main types
//!
//! - [`LlmBackend`] — Provider trait.
//! - [`LlmClient`] — Cheap-to-clone handle used by the planner, builder and extractor.
//! - [`LlmRequest`] / [`LlmResponse`] — Provider-neutral request and completion.
//! - [`ModelConfig`] — Serde configuration for a provider.
//! - [`FailoverBackend`] — Retries transient errors and falls back across backends.

/// Provider backends.
pub mod backends;
/// Model configuration.
pub mod config;
/// Retry and failover.
pub mod failover;
/// Provider-neutral request and response types.
pub mod types;

pub use backends::command::CommandBackend;
pub use backends::openai::OpenAiBackend;
pub use backends::LlmBackend;
pub use config::{LlmProvider, ModelConfig};
pub use failover::{is_retryable, FailoverBackend, RetryPolicy};
pub use types::{LlmRequest, LlmResponse, StopReason, ToolSpec};

use foreman_core::ForemanResult;
use std::sync::Arc;

/// LLM client that dispatches to the configured provider backend.
#[derive(Clone)]
pub struct LlmClient {
    backend: Arc<dyn LlmBackend>,
}

impl LlmClient {
    /// Build the backend described by `config`.
    ///
    /// When fallback models or an explicit retry policy are configured, the
    /// backend is wrapped in a [`FailoverBackend`].
    pub fn new(config: ModelConfig) -> Self {
        let wrap = !config.fallback_models.is_empty() || config.retry_policy.is_some();
        if !wrap {
            return Self::from_backend(Arc::from(build_backend(config)));
        }
        let policy = config.retry_policy.clone().unwrap_or_default();
        let mut backends: Vec<Box<dyn LlmBackend>> = Vec::new();
        let fallbacks = config.fallback_models.clone();
        backends.push(build_backend(config));
        backends.extend(fallbacks.into_iter().map(build_backend));
        Self::from_backend(Arc::new(FailoverBackend::new(backends, policy)))
    }

    /// Create from a pre-built backend (custom providers and tests).
    pub fn from_backend(backend: Arc<dyn LlmBackend>) -> Self {
        Self { backend }
    }

    /// Run one completion.
    pub async fn complete(&self, request: &LlmRequest) -> ForemanResult<LlmResponse> {
        self.backend.complete(request).await
    }
}

fn build_backend(config: ModelConfig) -> Box<dyn LlmBackend> {
    match config.provider {
        LlmProvider::OpenAi => Box::new(OpenAiBackend::new(config)),
        LlmProvider::Command => Box::new(CommandBackend::new(config)),
    }
}
