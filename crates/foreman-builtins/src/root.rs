use foreman_skills::{CapabilityFailure, FailureKind};
use std::path::{Component, Path, PathBuf};

/// Upper bound on files visited by a single directory walk.
pub const MAX_WALK_ENTRIES: usize = 10_000;

/// The directory builtins operate in. Paths given to builtins are resolved
/// against it and may not leave it.
#[derive(Debug, Clone)]
pub struct WorkspaceRoot {
    root: PathBuf,
}

impl WorkspaceRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::fs::canonicalize(&root).unwrap_or(root);
        Self { root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve `requested` (relative or absolute) to a path inside the root.
    ///
    /// `..` is folded lexically. Existing paths are also canonicalized so a
    /// symlink cannot lead outside the root.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, CapabilityFailure> {
        if requested.trim().is_empty() {
            return Err(CapabilityFailure::invalid_input("empty path"));
        }

        let joined = self.root.join(requested);
        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(outside(requested));
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other),
            }
        }
        if !normalized.starts_with(&self.root) {
            return Err(outside(requested));
        }

        if let Ok(canonical) = std::fs::canonicalize(&normalized) {
            if !canonical.starts_with(&self.root) {
                return Err(outside(requested));
            }
            return Ok(canonical);
        }
        Ok(normalized)
    }

    /// `path` relative to the root, with `/` separators.
    pub fn display(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

fn outside(requested: &str) -> CapabilityFailure {
    CapabilityFailure::new(
        FailureKind::PermissionDenied,
        format!("'{requested}' is outside the workspace"),
    )
}

/// Every regular file under `dir`, sorted, at most [`MAX_WALK_ENTRIES`].
/// Hidden directories are not descended into.
pub fn walk_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                let hidden = entry.file_name().to_string_lossy().starts_with('.');
                if !hidden {
                    pending.push(path);
                }
            } else if file_type.is_file() {
                files.push(path);
                if files.len() >= MAX_WALK_ENTRIES {
                    files.sort();
                    return Ok(files);
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_inside_and_outside() {
        let tmp = tempfile::tempdir().unwrap();
        let root = WorkspaceRoot::new(tmp.path());
        let p = root.resolve("a/b/../c.txt").unwrap();
        assert_eq!(p, root.path().join("a/c.txt"));
        assert_eq!(root.display(&p), "a/c.txt");

        let err = root.resolve("../escape.txt").unwrap_err();
        assert_eq!(err.kind, FailureKind::PermissionDenied);
        assert!(root.resolve("/etc/hostname").is_err());
        assert!(root.resolve("  ").is_err());
    }

    #[test]
    fn test_walk_skips_hidden_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src/nested")).unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join("src/a.rs"), "a").unwrap();
        std::fs::write(tmp.path().join("src/nested/b.rs"), "b").unwrap();
        std::fs::write(tmp.path().join(".git/HEAD"), "x").unwrap();

        let files = walk_files(tmp.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| !f.to_string_lossy().contains(".git")));
    }
}
