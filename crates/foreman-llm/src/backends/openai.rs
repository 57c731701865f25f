use super::LlmBackend;
use crate::config::ModelConfig;
use crate::types::{LlmRequest, LlmResponse, StopReason, ToolSpec};
use async_trait::async_trait;
use foreman_core::{ForemanError, ForemanResult, Role, ToolCall};
use std::time::Duration;

/// OpenAI-compatible chat completions backend.
///
/// Works with OpenAI, OpenRouter, Groq, Ollama and any other provider that
/// implements the chat completions API with function tools.
pub struct OpenAiBackend {
    config: ModelConfig,
    http: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: ModelConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    fn build_messages(&self, request: &LlmRequest) -> Vec<serde_json::Value> {
        let mut api_messages: Vec<serde_json::Value> = Vec::new();

        if let Some(sys) = &request.system {
            api_messages.push(serde_json::json!({
                "role": "system",
                "content": sys
            }));
        }

        for m in &request.messages {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => "system",
            };
            api_messages.push(serde_json::json!({
                "role": role,
                "content": m.content
            }));
        }

        api_messages
    }

    fn build_tools(tools: &[ToolSpec]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn complete(&self, request: &LlmRequest) -> ForemanResult<LlmResponse> {
        let url = format!("{}/v1/chat/completions", self.config.base_url());

        let mut body = serde_json::json!({
            "model": self.config.model_id,
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "temperature": self.config.temperature,
            "messages": self.build_messages(request),
        });

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::build_tools(&request.tools));
        }

        tracing::debug!(url = %url, model = %self.config.model_id, "OpenAI: sending request");

        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ForemanError::Http(format!("request timed out: {e}"))
                } else {
                    ForemanError::Http(e.to_string())
                }
            })?;

        let status = resp.status();
        let resp_body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ForemanError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(ForemanError::Http(format!(
                "OpenAI API error {status}: {resp_body}"
            )));
        }

        parse_openai_response(&resp_body)
    }
}

/// Convert a chat completions response body into an [`LlmResponse`].
pub fn parse_openai_response(body: &serde_json::Value) -> ForemanResult<LlmResponse> {
    let choice = body["choices"]
        .get(0)
        .ok_or_else(|| ForemanError::Llm(format!("Response has no choices: {body}")))?;
    let message = &choice["message"];
    let content = message["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let tool_calls: Vec<ToolCall> = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|tc| {
                    let id = tc["id"].as_str()?.to_string();
                    let name = tc["function"]["name"].as_str()?.to_string();
                    let arguments: serde_json::Value =
                        serde_json::from_str(tc["function"]["arguments"].as_str()?)
                            .unwrap_or_default();
                    Some(ToolCall {
                        id,
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let stop_reason = match choice["finish_reason"].as_str().unwrap_or("stop") {
        _ if !tool_calls.is_empty() => StopReason::ToolUse,
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" => StopReason::ToolUse,
        _ => StopReason::Other,
    };

    Ok(LlmResponse {
        content,
        tool_calls,
        stop_reason,
    })
}
