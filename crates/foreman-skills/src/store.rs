use crate::capability::CapabilityDescriptor;
use foreman_core::fs::write_atomic_async;
use foreman_core::{ForemanError, ForemanResult};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const DESCRIPTOR_FILE: &str = "descriptor.json";
const SCRIPT_FILE: &str = "capability.rhai";
const REJECTED_DESCRIPTOR_FILE: &str = "rejected.json";
const REJECTED_SCRIPT_FILE: &str = "rejected.rhai";

/// A persisted generated capability: its descriptor and script source.
#[derive(Debug, Clone)]
pub struct StoredCapability {
    pub descriptor: CapabilityDescriptor,
    pub source: String,
}

/// On-disk home of generated capabilities, one directory per name:
/// `<root>/<name>/descriptor.json` and `<root>/<name>/capability.rhai`.
/// The last rejected candidate for a name is kept beside them as
/// `rejected.json` and `rejected.rhai` and never replaces an admitted one.
#[derive(Debug, Clone)]
pub struct CapabilityStore {
    root: PathBuf,
}

impl CapabilityStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, name: &str) -> ForemanResult<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(ForemanError::Capability(format!(
                "invalid capability name for storage: '{name}'"
            )));
        }
        Ok(self.root.join(name))
    }

    /// Path of the script file for `name`.
    pub fn script_path(&self, name: &str) -> ForemanResult<PathBuf> {
        Ok(self.dir(name)?.join(SCRIPT_FILE))
    }

    /// Persist a descriptor and its source. The script is written first so a
    /// descriptor on disk always has its artifact next to it.
    pub async fn save(&self, descriptor: &CapabilityDescriptor, source: &str) -> ForemanResult<()> {
        let dir = self.dir(&descriptor.name)?;
        tokio::fs::create_dir_all(&dir).await?;

        write_atomic_async(&dir.join(SCRIPT_FILE), source.as_bytes().to_vec()).await?;
        let json = serde_json::to_vec_pretty(descriptor)?;
        write_atomic_async(&dir.join(DESCRIPTOR_FILE), json).await?;

        debug!(capability = %descriptor.name, dir = %dir.display(), "Saved capability");
        Ok(())
    }

    /// Keep a candidate that failed validation, for inspection.
    pub async fn save_rejected(&self, descriptor: &CapabilityDescriptor, source: &str) -> ForemanResult<()> {
        let dir = self.dir(&descriptor.name)?;
        tokio::fs::create_dir_all(&dir).await?;

        write_atomic_async(&dir.join(REJECTED_SCRIPT_FILE), source.as_bytes().to_vec()).await?;
        let json = serde_json::to_vec_pretty(descriptor)?;
        write_atomic_async(&dir.join(REJECTED_DESCRIPTOR_FILE), json).await?;
        debug!(capability = %descriptor.name, "Saved rejected candidate");
        Ok(())
    }

    /// The last rejected candidate for `name`, if any.
    pub async fn load_rejected(&self, name: &str) -> ForemanResult<Option<StoredCapability>> {
        let dir = self.dir(name)?;
        let raw = match tokio::fs::read_to_string(dir.join(REJECTED_DESCRIPTOR_FILE)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let descriptor: CapabilityDescriptor = serde_json::from_str(&raw)?;
        let source = tokio::fs::read_to_string(dir.join(REJECTED_SCRIPT_FILE)).await?;
        Ok(Some(StoredCapability { descriptor, source }))
    }

    /// Load one stored capability.
    pub async fn load(&self, name: &str) -> ForemanResult<StoredCapability> {
        let dir = self.dir(name)?;
        let raw = tokio::fs::read_to_string(dir.join(DESCRIPTOR_FILE)).await?;
        let descriptor: CapabilityDescriptor = serde_json::from_str(&raw)?;
        let source = tokio::fs::read_to_string(dir.join(SCRIPT_FILE)).await?;
        Ok(StoredCapability { descriptor, source })
    }

    /// Every readable stored capability, ordered by name. Unreadable entries
    /// are logged and skipped.
    pub async fn load_all(&self) -> ForemanResult<Vec<StoredCapability>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if !tokio::fs::try_exists(entry.path().join(DESCRIPTOR_FILE)).await? {
                debug!(dir = %entry.path().display(), "No admitted capability, skipping");
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();

        let mut loaded = Vec::with_capacity(names.len());
        for name in names {
            match self.load(&name).await {
                Ok(stored) => loaded.push(stored),
                Err(e) => warn!(capability = %name, error = %e, "Skipping unreadable capability"),
            }
        }
        Ok(loaded)
    }

    /// Delete a stored capability. Missing entries are not an error.
    pub async fn remove(&self, name: &str) -> ForemanResult<()> {
        let dir = self.dir(name)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
