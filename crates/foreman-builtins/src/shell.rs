use crate::root::WorkspaceRoot;
use async_trait::async_trait;
use foreman_skills::{Capability, CapabilityDescriptor, CapabilityFailure, FailureKind, Resource};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 300;
const BLOCKED_PATTERNS: &[&str] = &["rm -rf /", "mkfs", "dd if=", ":(){ :|:& };:"];

/// Runs a shell command in the workspace directory.
///
/// A non-zero exit status is reported in the output, not as a failure.
pub struct RunCommand {
    descriptor: CapabilityDescriptor,
    root: WorkspaceRoot,
}

impl RunCommand {
    pub fn new(root: WorkspaceRoot) -> Self {
        let descriptor = CapabilityDescriptor::builtin(
            "run_command",
            "Execute a shell command and return its output",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "The shell command to execute"},
                    "timeout_secs": {"type": "integer", "description": "Timeout in seconds (default: 30, max: 300)"}
                },
                "required": ["command"]
            }),
            json!({
                "type": "object",
                "properties": {
                    "exit_code": {"type": "integer"},
                    "stdout": {"type": "string"},
                    "stderr": {"type": "string"}
                },
                "required": ["exit_code", "stdout", "stderr"]
            }),
        )
        .with_resources(vec![Resource::Process { commands: vec![] }]);
        Self { descriptor, root }
    }
}

#[async_trait]
impl Capability for RunCommand {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, input: Value) -> Result<Value, CapabilityFailure> {
        let command = input["command"].as_str().unwrap_or_default();
        if command.trim().is_empty() {
            return Err(CapabilityFailure::invalid_input("Empty command"));
        }
        let timeout_secs = input["timeout_secs"]
            .as_u64()
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .min(MAX_TIMEOUT_SECS);

        if let Some(pattern) = BLOCKED_PATTERNS.iter().find(|p| command.contains(**p)) {
            warn!(command = %command, "Blocked dangerous command");
            return Err(CapabilityFailure::new(
                FailureKind::PermissionDenied,
                format!("Command blocked: contains dangerous pattern '{pattern}'"),
            ));
        }

        info!(command = %command, timeout = timeout_secs, "Executing shell command");
        let result = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(self.root.path())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => Ok(json!({
                "exit_code": output.status.code().unwrap_or(-1),
                "stdout": truncate_output(&String::from_utf8_lossy(&output.stdout), 50_000),
                "stderr": truncate_output(&String::from_utf8_lossy(&output.stderr), 10_000),
            })),
            Ok(Err(e)) => Err(CapabilityFailure::runtime(format!(
                "Failed to execute command: {e}"
            ))),
            Err(_) => Err(CapabilityFailure::new(
                FailureKind::Timeout,
                format!("Command timed out after {timeout_secs}s"),
            )),
        }
    }
}

fn truncate_output(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut cut = max_len;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... [truncated, {} total bytes]", &s[..cut], s.len())
}
