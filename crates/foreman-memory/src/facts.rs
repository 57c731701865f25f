use foreman_core::ForemanResult;
use std::path::PathBuf;
use tracing::warn;

/// A project fact file, e.g. `context/conventions.md`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectFact {
    pub name: String,
    pub content: String,
}

/// Reads the Markdown files of a project context directory.
#[derive(Debug, Clone)]
pub struct ProjectFacts {
    dir: PathBuf,
}

impl ProjectFacts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Every non-empty `*.md` file, ordered by file name. A missing directory
    /// yields no facts.
    pub async fn load(&self) -> ForemanResult<Vec<ProjectFact>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "md") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut facts = Vec::new();
        for path in paths {
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            match tokio::fs::read_to_string(&path).await {
                Ok(content) if !content.trim().is_empty() => facts.push(ProjectFact {
                    name,
                    content: content.trim().to_string(),
                }),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable fact file"),
            }
        }
        Ok(facts)
    }
}
