use super::LlmBackend;
use crate::config::ModelConfig;
use crate::types::{LlmRequest, LlmResponse};
use async_trait::async_trait;
use foreman_core::{ForemanError, ForemanResult};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Local program backend.
///
/// Spawns the configured command, writes the [`LlmRequest`] as JSON on its
/// stdin and parses an [`LlmResponse`] from the last JSON line on stdout.
/// Output that is not JSON is taken as plain text content.
pub struct CommandBackend {
    config: ModelConfig,
}

impl CommandBackend {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LlmBackend for CommandBackend {
    async fn complete(&self, request: &LlmRequest) -> ForemanResult<LlmResponse> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| ForemanError::Config("LLM command provider has no command".into()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.config.model_id.is_empty() {
            cmd.env("FOREMAN_MODEL", &self.config.model_id);
        }

        let payload = serde_json::to_vec(request)?;
        tracing::info!(program = %program, bytes = payload.len(), "Command LLM: spawning");

        let mut child = cmd.spawn().map_err(|e| {
            ForemanError::Llm(format!("Failed to run LLM command '{program}': {e}"))
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ForemanError::Llm(format!(
                    "LLM command timed out after {}s",
                    timeout.as_secs()
                ))
            })??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ForemanError::Llm(format!(
                "LLM command failed (exit {}): {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        Ok(parse_command_output(&stdout))
    }
}

/// Interpret command stdout: the last line holding an [`LlmResponse`] JSON
/// object wins, otherwise the whole output is text content.
pub fn parse_command_output(stdout: &str) -> LlmResponse {
    stdout
        .lines()
        .rev()
        .filter(|line| line.trim_start().starts_with('{'))
        .find_map(|line| serde_json::from_str::<LlmResponse>(line).ok())
        .unwrap_or_else(|| LlmResponse::text(stdout.trim()))
}
