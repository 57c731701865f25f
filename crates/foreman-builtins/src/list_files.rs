use crate::root::{walk_files, WorkspaceRoot};
use async_trait::async_trait;
use foreman_skills::{Capability, CapabilityDescriptor, CapabilityFailure, Resource};
use regex::Regex;
use serde_json::{json, Value};

/// Lists files under a directory that match a glob pattern.
pub struct ListFiles {
    descriptor: CapabilityDescriptor,
    root: WorkspaceRoot,
}

impl ListFiles {
    pub fn new(root: WorkspaceRoot) -> Self {
        let descriptor = CapabilityDescriptor::builtin(
            "list_files",
            "List files matching a glob pattern in a directory",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Glob such as `*.rs` or `src/**/*.toml` (default: `*`)"},
                    "directory": {"type": "string", "description": "Directory to search (default: workspace root)"}
                }
            }),
            json!({
                "type": "object",
                "properties": {
                    "files": {"type": "array", "items": {"type": "string"}},
                    "count": {"type": "integer"}
                },
                "required": ["files", "count"]
            }),
        )
        .with_resources(vec![Resource::FileRead { paths: vec![] }])
        .idempotent(true);
        Self { descriptor, root }
    }
}

/// Translate a glob into an anchored regex. `*` and `?` stay within one path
/// segment, `**` crosses segments.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out)
}

#[async_trait]
impl Capability for ListFiles {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, input: Value) -> Result<Value, CapabilityFailure> {
        let pattern = input["pattern"].as_str().unwrap_or("*").to_string();
        let directory = input["directory"].as_str().unwrap_or(".");
        let dir = self.root.resolve(directory)?;
        if !dir.is_dir() {
            return Err(CapabilityFailure::runtime(format!("Not a directory: {directory}")));
        }
        let matcher = glob_to_regex(&pattern)
            .map_err(|e| CapabilityFailure::invalid_input(format!("bad pattern '{pattern}': {e}")))?;

        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<String>> {
            let base = WorkspaceRoot::new(&dir);
            Ok(walk_files(&dir)?
                .into_iter()
                .filter(|p| matcher.is_match(&base.display(p)))
                .map(|p| root.display(&p))
                .collect())
        })
        .await
        .map_err(|e| CapabilityFailure::runtime(format!("listing aborted: {e}")))?
        .map_err(|e| CapabilityFailure::runtime(format!("Cannot list {directory}: {e}")))?;

        Ok(json!({ "count": files.len(), "files": files }))
    }
}
