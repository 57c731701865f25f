use crate::root::WorkspaceRoot;
use async_trait::async_trait;
use foreman_skills::{Capability, CapabilityDescriptor, CapabilityFailure, Resource};
use serde_json::{json, Value};
use tracing::info;

const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024; // 10MB

/// Reads a text file inside the workspace.
pub struct ReadFile {
    descriptor: CapabilityDescriptor,
    root: WorkspaceRoot,
}

impl ReadFile {
    pub fn new(root: WorkspaceRoot) -> Self {
        let descriptor = CapabilityDescriptor::builtin(
            "read_file",
            "Read the contents of a file at the given path",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path, relative to the workspace"},
                    "offset": {"type": "integer", "description": "Character offset to start at (default: 0)"},
                    "limit": {"type": "integer", "description": "Maximum characters to return"}
                },
                "required": ["path"]
            }),
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "size": {"type": "integer"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
        )
        .with_resources(vec![Resource::FileRead { paths: vec![] }])
        .idempotent(true);
        Self { descriptor, root }
    }
}

#[async_trait]
impl Capability for ReadFile {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, input: Value) -> Result<Value, CapabilityFailure> {
        let requested = input["path"].as_str().unwrap_or_default();
        let path = self.root.resolve(requested)?;

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| CapabilityFailure::runtime(format!("File not found: {requested} ({e})")))?;
        if !metadata.is_file() {
            return Err(CapabilityFailure::runtime(format!("Not a file: {requested}")));
        }
        if metadata.len() > MAX_FILE_SIZE {
            return Err(CapabilityFailure::runtime(format!(
                "File too large: {} bytes (max: {MAX_FILE_SIZE} bytes)",
                metadata.len()
            )));
        }

        info!(path = %path.display(), size = metadata.len(), "Reading file");
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| CapabilityFailure::runtime(format!("Failed to read '{requested}': {e}")))?;
        let content = String::from_utf8_lossy(&bytes);

        let offset = input["offset"].as_u64().unwrap_or(0) as usize;
        let slice: String = match input["limit"].as_u64() {
            Some(limit) => content.chars().skip(offset).take(limit as usize).collect(),
            None => content.chars().skip(offset).collect(),
        };

        Ok(json!({
            "path": self.root.display(&path),
            "size": metadata.len(),
            "content": slice,
        }))
    }
}
