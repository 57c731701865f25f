use crate::resources::Resource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::{FailureDetail, ReasonCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Whether a capability has passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    Unvalidated,
    Valid,
    Invalid,
}

/// Where a capability came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Builtin,
    Generated,
}

/// The executable artifact behind a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceArtifact {
    /// Native code compiled into the binary.
    Builtin,
    /// A sandboxed script, identified by its SHA-256 digest.
    Script {
        #[serde(default)]
        path: Option<PathBuf>,
        sha256: String,
    },
}

/// Metadata describing a capability's contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub output_schema: serde_json::Value,
    pub validation: ValidationState,
    pub source: SourceArtifact,
    pub provenance: Provenance,
    #[serde(default = "default_version")]
    pub version: u32,
    /// Safe to run more than once with the same input.
    #[serde(default)]
    pub idempotent: bool,
    /// Resources the capability touches outside its own input and output.
    #[serde(default)]
    pub resources: Vec<Resource>,
    pub created_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl CapabilityDescriptor {
    /// Descriptor for a native builtin. Builtins are valid from the start.
    pub fn builtin(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
        output_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            output_schema,
            validation: ValidationState::Valid,
            source: SourceArtifact::Builtin,
            provenance: Provenance::Builtin,
            version: 1,
            idempotent: false,
            resources: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_resources(mut self, resources: Vec<Resource>) -> Self {
        self.resources = resources;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.validation == ValidationState::Valid
    }

    /// Names listed under `required` in the input schema.
    pub fn required_inputs(&self) -> Vec<String> {
        crate::schema::required_fields(&self.input_schema)
    }
}

/// What the builder needs to synthesize a missing capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub output_schema: serde_json::Value,
    /// Input for the post-build smoke run, when one is known.
    #[serde(default)]
    pub smoke_input: Option<serde_json::Value>,
    #[serde(default)]
    pub idempotent: bool,
}

/// Machine-readable failure reasons a capability may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidInput,
    InvalidOutput,
    PermissionDenied,
    NotFound,
    Runtime,
    Timeout,
    Unavailable,
}

impl FailureKind {
    pub fn reason_code(self) -> ReasonCode {
        match self {
            FailureKind::InvalidInput => ReasonCode::InvalidInput,
            FailureKind::InvalidOutput => ReasonCode::InvalidOutput,
            FailureKind::PermissionDenied => ReasonCode::PermissionDenied,
            FailureKind::NotFound => ReasonCode::CapabilityNotFound,
            FailureKind::Runtime => ReasonCode::StepExecutionFailed,
            FailureKind::Timeout => ReasonCode::Timeout,
            FailureKind::Unavailable => ReasonCode::Unavailable,
        }
    }
}

/// A structured failure returned by a capability invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl CapabilityFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidInput, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Runtime, message)
    }

    pub fn to_detail(&self) -> FailureDetail {
        FailureDetail::new(self.kind.reason_code(), self.message.clone())
    }
}

impl fmt::Display for CapabilityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.reason_code(), self.message)
    }
}

impl std::error::Error for CapabilityFailure {}

/// Trait that every capability implements, native or scripted.
///
/// `invoke` receives input that already conforms to the descriptor's input
/// schema and must return a value conforming to its output schema, or a
/// [`CapabilityFailure`].
#[async_trait]
pub trait Capability: Send + Sync {
    fn descriptor(&self) -> &CapabilityDescriptor;

    async fn invoke(
        &self,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, CapabilityFailure>;
}
