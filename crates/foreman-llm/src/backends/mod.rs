pub mod command;
pub mod openai;

use crate::types::{LlmRequest, LlmResponse};
use async_trait::async_trait;
use foreman_core::ForemanResult;

/// Trait for language-model provider backends.
///
/// To add a new provider:
/// 1. Create a new module in `backends/`
/// 2. Implement `LlmBackend` for your struct
/// 3. Add the variant to `LlmProvider` in `config.rs`
/// 4. Wire it up in `build_backend` in `lib.rs`
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Non-streaming completion.
    async fn complete(&self, request: &LlmRequest) -> ForemanResult<LlmResponse>;
}
