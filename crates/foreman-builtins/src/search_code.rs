use crate::root::{walk_files, WorkspaceRoot};
use async_trait::async_trait;
use foreman_skills::{Capability, CapabilityDescriptor, CapabilityFailure, Resource};
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

const MAX_MATCHES: usize = 500;
const MAX_SEARCH_FILE_SIZE: u64 = 1024 * 1024;

/// Regex search over the text files under a directory.
pub struct SearchCode {
    descriptor: CapabilityDescriptor,
    root: WorkspaceRoot,
}

impl SearchCode {
    pub fn new(root: WorkspaceRoot) -> Self {
        let descriptor = CapabilityDescriptor::builtin(
            "search_code",
            "Search for a pattern in files under a directory",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Regular expression"},
                    "directory": {"type": "string", "description": "Directory to search (default: workspace root)"}
                },
                "required": ["pattern"]
            }),
            json!({
                "type": "object",
                "properties": {
                    "matches": {"type": "array"},
                    "count": {"type": "integer"},
                    "truncated": {"type": "boolean"}
                },
                "required": ["matches", "count"]
            }),
        )
        .with_resources(vec![Resource::FileRead { paths: vec![] }])
        .idempotent(true);
        Self { descriptor, root }
    }
}

#[async_trait]
impl Capability for SearchCode {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, input: Value) -> Result<Value, CapabilityFailure> {
        let pattern = input["pattern"].as_str().unwrap_or_default();
        let directory = input["directory"].as_str().unwrap_or(".");
        let re = Regex::new(pattern)
            .map_err(|e| CapabilityFailure::invalid_input(format!("bad pattern: {e}")))?;
        let dir = self.root.resolve(directory)?;
        if !dir.is_dir() {
            return Err(CapabilityFailure::runtime(format!("Not a directory: {directory}")));
        }

        let root = self.root.clone();
        let (matches, truncated) = tokio::task::spawn_blocking(move || search(&root, &dir, &re))
            .await
            .map_err(|e| CapabilityFailure::runtime(format!("search aborted: {e}")))?
            .map_err(|e| CapabilityFailure::runtime(format!("Cannot search {directory}: {e}")))?;

        Ok(json!({
            "count": matches.len(),
            "truncated": truncated,
            "matches": matches,
        }))
    }
}

fn search(
    root: &WorkspaceRoot,
    dir: &std::path::Path,
    re: &Regex,
) -> std::io::Result<(Vec<Value>, bool)> {
    let mut matches = Vec::new();
    for path in walk_files(dir)? {
        let too_big = std::fs::metadata(&path).map(|m| m.len() > MAX_SEARCH_FILE_SIZE)?;
        if too_big {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(&path) else {
            debug!(path = %path.display(), "Skipping non-text file");
            continue;
        };
        for (idx, line) in text.lines().enumerate() {
            if re.is_match(line) {
                matches.push(json!({
                    "path": root.display(&path),
                    "line": idx + 1,
                    "text": line.trim_end(),
                }));
                if matches.len() >= MAX_MATCHES {
                    return Ok((matches, true));
                }
            }
        }
    }
    Ok((matches, false))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use foreman_skills::FailureKind;

    #[tokio::test]
    async fn test_search_reports_lines() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/lib.rs"), "fn alpha() {}\n// TODO: beta\n").unwrap();
        std::fs::write(tmp.path().join("README.md"), "nothing here\n").unwrap();
        let cap = SearchCode::new(WorkspaceRoot::new(tmp.path()));

        let out = cap.invoke(json!({"pattern": "TODO"})).await.unwrap();
        assert_eq!(out["count"], 1);
        assert_eq!(out["matches"][0]["path"], "src/lib.rs");
        assert_eq!(out["matches"][0]["line"], 2);
        assert_eq!(out["truncated"], false);
    }

    #[tokio::test]
    async fn test_bad_regex_is_invalid_input() {
        let tmp = tempfile::tempdir().unwrap();
        let cap = SearchCode::new(WorkspaceRoot::new(tmp.path()));
        let err = cap.invoke(json!({"pattern": "("})).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidInput);
    }
}
