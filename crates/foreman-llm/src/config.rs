use crate::failover::RetryPolicy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Any OpenAI-compatible chat completions endpoint.
    OpenAi,
    /// A local program that reads the request as JSON on stdin and prints a
    /// JSON response on stdout.
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: LlmProvider,
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Program and arguments for [`LlmProvider::Command`].
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout_secs() -> u64 {
    120
}

impl ModelConfig {
    /// Config for a command-line provider.
    pub fn command(program: Vec<String>) -> Self {
        Self {
            provider: LlmProvider::Command,
            model_id: String::new(),
            api_key: String::new(),
            api_base_url: None,
            command: program,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            fallback_models: Vec::new(),
            retry_policy: None,
        }
    }

    pub fn base_url(&self) -> &str {
        if let Some(url) = &self.api_base_url {
            url
        } else {
            match self.provider {
                LlmProvider::OpenAi => "https://api.openai.com",
                LlmProvider::Command => "local://command",
            }
        }
    }
}
