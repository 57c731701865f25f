use crate::capability::{Capability, CapabilityDescriptor, CapabilityFailure, FailureKind};
use crate::resources::ResourceGrant;
use crate::schema;
use foreman_core::{ForemanError, ForemanResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// How `register` treats an existing entry under the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    /// Fail with `DuplicateCapability` if a valid entry exists.
    Create,
    /// Replace any existing entry, keeping the new descriptor's version.
    Overwrite,
    /// Replace any existing entry and set version to previous + 1.
    BumpVersion,
}

struct Entry {
    descriptor: CapabilityDescriptor,
    handler: Arc<dyn Capability>,
}

/// Central catalog of every capability a plan may bind to.
///
/// Reads are lock-free with respect to each other. Writers that build or
/// replace a capability serialize per name through [`CapabilityRegistry::name_lock`].
pub struct CapabilityRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
    name_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    grant: ResourceGrant,
}

impl CapabilityRegistry {
    /// Empty registry that grants no resources.
    pub fn new() -> Self {
        Self::with_grant(ResourceGrant::new())
    }

    /// Empty registry whose invocations may touch the given resources.
    pub fn with_grant(grant: ResourceGrant) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            name_locks: Mutex::new(HashMap::new()),
            grant,
        }
    }

    /// Register a capability and return the descriptor as stored.
    pub fn register(
        &self,
        handler: Arc<dyn Capability>,
        mode: RegisterMode,
    ) -> ForemanResult<CapabilityDescriptor> {
        let mut descriptor = handler.descriptor().clone();
        let name = descriptor.name.clone();
        let mut entries = self.entries.write();

        if let Some(existing) = entries.get(&name) {
            match mode {
                RegisterMode::Create if existing.descriptor.is_valid() => {
                    warn!(capability = %name, "Rejected duplicate registration");
                    return Err(ForemanError::DuplicateCapability(name));
                }
                RegisterMode::BumpVersion => {
                    descriptor.version = existing.descriptor.version + 1;
                }
                _ => {}
            }
        }

        info!(
            capability = %name,
            version = descriptor.version,
            provenance = ?descriptor.provenance,
            "Registered capability"
        );
        entries.insert(
            name,
            Entry {
                descriptor: descriptor.clone(),
                handler,
            },
        );
        Ok(descriptor)
    }

    /// The handler registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries.read().get(name).map(|e| e.handler.clone())
    }

    /// The descriptor registered under `name`.
    pub fn descriptor(&self, name: &str) -> Option<CapabilityDescriptor> {
        self.entries.read().get(name).map(|e| e.descriptor.clone())
    }

    /// Whether a valid capability is registered under `name`.
    pub fn contains_valid(&self, name: &str) -> bool {
        self.entries
            .read()
            .get(name)
            .is_some_and(|e| e.descriptor.is_valid())
    }

    /// All descriptors, ordered by name.
    pub fn list(&self) -> Vec<CapabilityDescriptor> {
        self.entries
            .read()
            .values()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// One line per valid capability, for prompts.
    pub fn catalog(&self) -> String {
        self.list()
            .iter()
            .filter(|d| d.is_valid())
            .map(|d| {
                let inputs = schema::property_names(&d.input_schema);
                format!("- {}({}): {}", d.name, inputs.join(", "), d.description)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Mutex serializing builds and registrations of `name`.
    pub fn name_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.name_locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Invoke `name` with schema and resource checks on both sides of the call.
    pub async fn invoke(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, CapabilityFailure> {
        let (descriptor, handler) = {
            let entries = self.entries.read();
            let entry = entries.get(name).ok_or_else(|| {
                CapabilityFailure::new(
                    FailureKind::NotFound,
                    format!("no capability named '{name}'"),
                )
            })?;
            (entry.descriptor.clone(), entry.handler.clone())
        };

        if !descriptor.is_valid() {
            return Err(CapabilityFailure::new(
                FailureKind::Unavailable,
                format!("capability '{name}' is not validated"),
            ));
        }

        schema::validate(&input, &descriptor.input_schema)
            .map_err(CapabilityFailure::invalid_input)?;

        if let Some(denied) = self.grant.first_denied(&descriptor.resources) {
            warn!(capability = %name, resource = ?denied, "Permission denied");
            return Err(CapabilityFailure::new(
                FailureKind::PermissionDenied,
                format!("capability '{name}' requires {denied:?}"),
            ));
        }

        let output = handler.invoke(input).await?;

        schema::validate(&output, &descriptor.output_schema)
            .map_err(|e| CapabilityFailure::new(FailureKind::InvalidOutput, e))?;
        Ok(output)
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::capability::ValidationState;
    use crate::resources::Resource;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo {
        descriptor: CapabilityDescriptor,
    }

    impl Echo {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                descriptor: CapabilityDescriptor::builtin(
                    name,
                    "Echo the input",
                    json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
                    json!({"type": "object", "required": ["text"]}),
                ),
            })
        }

        fn with(descriptor: CapabilityDescriptor) -> Arc<Self> {
            Arc::new(Self { descriptor })
        }
    }

    #[async_trait]
    impl Capability for Echo {
        fn descriptor(&self) -> &CapabilityDescriptor {
            &self.descriptor
        }

        async fn invoke(
            &self,
            input: serde_json::Value,
        ) -> Result<serde_json::Value, CapabilityFailure> {
            if input["text"] == "bad-output" {
                return Ok(json!({"nope": true}));
            }
            Ok(input)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = CapabilityRegistry::new();
        registry.register(Echo::new("echo"), RegisterMode::Create).unwrap();
        assert!(registry.lookup("echo").is_some());
        assert!(registry.lookup("missing").is_none());
        assert!(registry.contains_valid("echo"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_valid_is_rejected() {
        let registry = CapabilityRegistry::new();
        registry.register(Echo::new("echo"), RegisterMode::Create).unwrap();
        let err = registry
            .register(Echo::new("echo"), RegisterMode::Create)
            .unwrap_err();
        assert!(matches!(err, ForemanError::DuplicateCapability(ref n) if n == "echo"));
    }

    #[test]
    fn test_invalid_entry_can_be_replaced_by_create() {
        let registry = CapabilityRegistry::new();
        let mut d = Echo::new("echo").descriptor.clone();
        d.validation = ValidationState::Invalid;
        registry.register(Echo::with(d), RegisterMode::Create).unwrap();
        registry.register(Echo::new("echo"), RegisterMode::Create).unwrap();
        assert!(registry.contains_valid("echo"));
    }

    #[test]
    fn test_overwrite_and_bump_version() {
        let registry = CapabilityRegistry::new();
        registry.register(Echo::new("echo"), RegisterMode::Create).unwrap();
        let d = registry
            .register(Echo::new("echo"), RegisterMode::BumpVersion)
            .unwrap();
        assert_eq!(d.version, 2);
        assert_eq!(registry.descriptor("echo").unwrap().version, 2);

        let d = registry
            .register(Echo::new("echo"), RegisterMode::Overwrite)
            .unwrap();
        assert_eq!(d.version, 1);
    }

    #[test]
    fn test_list_is_sorted_by_name() {
        let registry = CapabilityRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(Echo::new(name), RegisterMode::Create).unwrap();
        }
        let names: Vec<String> = registry.list().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        assert!(registry.catalog().starts_with("- alpha(text): Echo the input"));
    }

    #[test]
    fn test_name_lock_is_shared_per_name() {
        let registry = CapabilityRegistry::new();
        let a = registry.name_lock("x");
        let b = registry.name_lock("x");
        let c = registry.name_lock("y");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_invoke_checks_schemas() {
        let registry = CapabilityRegistry::new();
        registry.register(Echo::new("echo"), RegisterMode::Create).unwrap();

        let out = registry.invoke("echo", json!({"text": "hi"})).await.unwrap();
        assert_eq!(out["text"], "hi");

        let err = registry.invoke("echo", json!({})).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidInput);

        let err = registry
            .invoke("echo", json!({"text": "bad-output"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidOutput);

        let err = registry.invoke("nope", json!({})).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::NotFound);
    }

    #[tokio::test]
    async fn test_invoke_enforces_resource_grant() {
        let d = Echo::new("net")
            .descriptor
            .clone()
            .with_resources(vec![Resource::Network { hosts: vec![] }]);

        let closed = CapabilityRegistry::new();
        closed.register(Echo::with(d.clone()), RegisterMode::Create).unwrap();
        let err = closed.invoke("net", json!({"text": "x"})).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::PermissionDenied);

        let open = CapabilityRegistry::with_grant(ResourceGrant::allow_all());
        open.register(Echo::with(d), RegisterMode::Create).unwrap();
        assert!(open.invoke("net", json!({"text": "x"})).await.is_ok());
    }
}
