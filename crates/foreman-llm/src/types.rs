use foreman_core::{Message, ToolCall};
use serde::{Deserialize, Serialize};

/// A tool the model may call, described by a JSON schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Provider-neutral completion request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmRequest {
    #[serde(default)]
    pub system: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl LlmRequest {
    /// Request with a system prompt and no messages yet.
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            ..Default::default()
        }
    }

    /// Append a user message.
    pub fn user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(Message::user(content));
        self
    }

    /// Offer a tool to the model.
    pub fn with_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    /// Concatenated text of the user messages, oldest first.
    pub fn user_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == foreman_core::Role::User)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
    Other,
}

/// A completion: optional text plus zero or more tool calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub stop_reason: StopReason,
}

impl LlmResponse {
    /// Text-only completion.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            stop_reason: StopReason::EndTurn,
        }
    }

    /// Completion consisting of a single tool call.
    pub fn tool(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            content: None,
            tool_calls: vec![ToolCall {
                id: "call_0".to_string(),
                name: name.into(),
                arguments,
            }],
            stop_reason: StopReason::ToolUse,
        }
    }

    /// First tool call with the given name.
    pub fn tool_call(&self, name: &str) -> Option<&ToolCall> {
        self.tool_calls.iter().find(|c| c.name == name)
    }

    /// Text content, or an empty string.
    pub fn content_text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}
