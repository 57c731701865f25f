use crate::root::WorkspaceRoot;
use async_trait::async_trait;
use foreman_skills::{Capability, CapabilityDescriptor, CapabilityFailure, Resource};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Writes (or appends to) a file inside the workspace, creating parent
/// directories as needed.
pub struct WriteFile {
    descriptor: CapabilityDescriptor,
    root: WorkspaceRoot,
}

impl WriteFile {
    pub fn new(root: WorkspaceRoot) -> Self {
        let descriptor = CapabilityDescriptor::builtin(
            "write_file",
            "Write content to a file at the given path",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path, relative to the workspace"},
                    "content": {"type": "string"},
                    "append": {"type": "boolean", "description": "Append instead of overwrite (default: false)"}
                },
                "required": ["path", "content"]
            }),
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "bytes": {"type": "integer"}
                },
                "required": ["path", "bytes"]
            }),
        )
        .with_resources(vec![Resource::FileWrite { paths: vec![] }]);
        Self { descriptor, root }
    }
}

#[async_trait]
impl Capability for WriteFile {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, input: Value) -> Result<Value, CapabilityFailure> {
        let requested = input["path"].as_str().unwrap_or_default();
        let content = input["content"].as_str().unwrap_or_default();
        let append = input["append"].as_bool().unwrap_or(false);
        let path = self.root.resolve(requested)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CapabilityFailure::runtime(format!("Cannot create directory: {e}")))?;
        }

        let write = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(&path)
                .await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await
        };
        write
            .await
            .map_err(|e| CapabilityFailure::runtime(format!("Failed to write '{requested}': {e}")))?;

        info!(path = %path.display(), bytes = content.len(), append, "Wrote file");
        Ok(json!({
            "path": self.root.display(&path),
            "bytes": content.len(),
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_creates_parents_and_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let cap = WriteFile::new(WorkspaceRoot::new(tmp.path()));

        let out = cap
            .invoke(json!({"path": "out/report.md", "content": "# Report\n"}))
            .await
            .unwrap();
        assert_eq!(out["bytes"], 9);
        cap.invoke(json!({"path": "out/report.md", "content": "done\n", "append": true}))
            .await
            .unwrap();

        let written = std::fs::read_to_string(tmp.path().join("out/report.md")).unwrap();
        assert_eq!(written, "# Report\ndone\n");

        cap.invoke(json!({"path": "out/report.md", "content": "new"}))
            .await
            .unwrap();
        let written = std::fs::read_to_string(tmp.path().join("out/report.md")).unwrap();
        assert_eq!(written, "new");
    }

    #[tokio::test]
    async fn test_write_outside_is_denied() {
        let tmp = tempfile::tempdir().unwrap();
        let cap = WriteFile::new(WorkspaceRoot::new(tmp.path().join("ws")));
        assert!(cap
            .invoke(json!({"path": "../../evil", "content": "x"}))
            .await
            .is_err());
    }
}
