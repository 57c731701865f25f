//! Capability registry, sandboxed script runtime and capability builder.
//!
//! Every step of a plan is bound to a named [`Capability`]. Builtins are
//! native Rust; everything else is a Rhai script synthesized by the
//! [`CapabilityBuilder`], checked by the [`ScriptValidator`] and admitted to
//! the [`CapabilityRegistry`] only once it is valid.
//!
//! # Main types
//!
//! - [`Capability`] — Trait every capability implements.
//! - [`CapabilityDescriptor`] — Name, schemas, validation state and provenance.
//! - [`CapabilityRegistry`] — Name-ordered catalog with schema and resource checks.
//! - [`CapabilityBuilder`] / [`BuildSession`] — Synthesis with per-session coalescing.
//! - [`ScriptRuntime`] — Resource-limited Rhai engine.
//! - [`CapabilityStore`] / [`CapabilityLoader`] — Persistence and startup re-admission.

/// Capability synthesis.
pub mod builder;
/// The capability trait and its descriptors.
pub mod capability;
/// Startup loading of stored and configured scripts.
pub mod loader;
/// The capability catalog.
pub mod registry;
/// Resource declarations and grants.
pub mod resources;
/// JSON-schema checks.
pub mod schema;
/// Sandboxed script execution.
pub mod script;
/// On-disk capability persistence.
pub mod store;
/// Admission checks for generated scripts.
pub mod validator;

pub use builder::{extract_code, BuildSession, BuilderConfig, CapabilityBuilder};
pub use capability::{
    Capability, CapabilityDescriptor, CapabilityFailure, CapabilitySpec, FailureKind, Provenance,
    SourceArtifact, ValidationState,
};
pub use loader::{CapabilityLoader, ScriptConfig};
pub use registry::{CapabilityRegistry, RegisterMode};
pub use resources::{Resource, ResourceGrant};
pub use script::{ScriptCapability, ScriptLlm, ScriptRuntime, SandboxLimits};
pub use store::{CapabilityStore, StoredCapability};
pub use validator::{ScriptValidator, ValidationError, ValidationStage};
