use crate::capability::{CapabilityDescriptor, Provenance, SourceArtifact, ValidationState};
use crate::registry::{CapabilityRegistry, RegisterMode};
use crate::resources::Resource;
use crate::script::{source_digest, ScriptCapability};
use crate::store::{CapabilityStore, StoredCapability};
use crate::validator::ScriptValidator;
use chrono::Utc;
use foreman_core::{ForemanError, ForemanResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// A hand-written script capability declared in `foreman.toml`:
///
/// ```toml
/// [[capabilities]]
/// name = "word_count"
/// description = "Count words in a text"
/// path = "scripts/word_count.rhai"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
    #[serde(default)]
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub output_schema: serde_json::Value,
    #[serde(default)]
    pub idempotent: bool,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// Re-admits persisted and configured scripts into a registry.
///
/// Every script is re-validated before registration; anything that fails is
/// logged and skipped so one bad artifact never blocks startup.
pub struct CapabilityLoader {
    validator: ScriptValidator,
}

impl CapabilityLoader {
    pub fn new(validator: ScriptValidator) -> Self {
        Self { validator }
    }

    /// Register every valid capability in `store`. Returns how many were loaded.
    pub async fn load_store(
        &self,
        store: &CapabilityStore,
        registry: &CapabilityRegistry,
    ) -> ForemanResult<usize> {
        let mut loaded = 0;
        for stored in store.load_all().await? {
            let name = stored.descriptor.name.clone();
            if stored.descriptor.validation != ValidationState::Valid {
                info!(capability = %name, "Skipping capability that never validated");
                continue;
            }
            let script_path = store.script_path(&name)?;
            match self.admit_stored(stored, script_path, registry) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(capability = %name, error = %e, "Failed to load capability, skipping"),
            }
        }
        info!(count = loaded, root = %store.root().display(), "Loaded stored capabilities");
        Ok(loaded)
    }

    fn admit_stored(
        &self,
        stored: StoredCapability,
        script_path: PathBuf,
        registry: &CapabilityRegistry,
    ) -> ForemanResult<()> {
        let StoredCapability {
            mut descriptor,
            source,
        } = stored;

        let digest = source_digest(&source);
        match &descriptor.source {
            SourceArtifact::Script { sha256, .. } if *sha256 == digest => {}
            SourceArtifact::Script { .. } => {
                return Err(ForemanError::Capability(format!(
                    "digest mismatch for '{}'",
                    descriptor.name
                )))
            }
            SourceArtifact::Builtin => {
                return Err(ForemanError::Capability(format!(
                    "'{}' is stored but declared builtin",
                    descriptor.name
                )))
            }
        }

        let ast = self
            .validator
            .compile_checked(&source)
            .map_err(|e| ForemanError::Capability(e.to_string()))?;
        descriptor.source = SourceArtifact::Script {
            path: Some(script_path),
            sha256: digest,
        };

        let capability = ScriptCapability::new(descriptor, ast, self.validator.runtime().clone());
        registry.register(Arc::new(capability), RegisterMode::Create)?;
        Ok(())
    }

    /// Register scripts declared in configuration, resolving relative paths
    /// against `base_dir`. Returns how many were loaded.
    pub fn load_configured(
        &self,
        configs: &[ScriptConfig],
        base_dir: &Path,
        registry: &CapabilityRegistry,
    ) -> usize {
        let mut loaded = 0;
        for config in configs {
            match self.load_one(config, base_dir, registry) {
                Ok(()) => {
                    info!(capability = %config.name, "Loaded configured capability");
                    loaded += 1;
                }
                Err(e) => {
                    warn!(capability = %config.name, error = %e, "Failed to load capability, skipping");
                }
            }
        }
        loaded
    }

    fn load_one(
        &self,
        config: &ScriptConfig,
        base_dir: &Path,
        registry: &CapabilityRegistry,
    ) -> ForemanResult<()> {
        let path = if config.path.is_absolute() {
            config.path.clone()
        } else {
            base_dir.join(&config.path)
        };
        let source = std::fs::read_to_string(&path).map_err(|e| {
            ForemanError::Capability(format!("cannot read {}: {e}", path.display()))
        })?;
        let ast = self
            .validator
            .compile_checked(&source)
            .map_err(|e| ForemanError::Capability(e.to_string()))?;

        let descriptor = CapabilityDescriptor {
            name: config.name.clone(),
            description: config.description.clone(),
            input_schema: config.input_schema.clone(),
            output_schema: config.output_schema.clone(),
            validation: ValidationState::Valid,
            source: SourceArtifact::Script {
                path: Some(path),
                sha256: source_digest(&source),
            },
            provenance: Provenance::Builtin,
            version: 1,
            idempotent: config.idempotent,
            resources: config.resources.clone(),
            created_at: Utc::now(),
        };

        let capability = ScriptCapability::new(descriptor, ast, self.validator.runtime().clone());
        registry.register(Arc::new(capability), RegisterMode::Overwrite)?;
        Ok(())
    }
}
