use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level error type for the Foreman workspace.
///
/// Each variant corresponds to a failure kind a subsystem can surface. Use
/// [`ForemanError::reason_code`] to obtain the machine-readable code that is
/// recorded alongside terminal failures.
#[derive(Debug, thiserror::Error)]
pub enum ForemanError {
    /// The planner could not produce an acceptable plan.
    #[error("Planning failed: {0}")]
    PlanningFailed(String),

    /// A capability with the same name is already registered and valid.
    #[error("Capability '{0}' is already registered")]
    DuplicateCapability(String),

    /// No capability is registered under the requested name.
    #[error("Capability '{0}' not found")]
    CapabilityNotFound(String),

    /// Synthesizing a capability exhausted its attempts.
    #[error("Building capability '{name}' failed: {reason}")]
    CapabilityBuildFailed {
        /// Capability name that was being built.
        name: String,
        /// Last failure reported by the builder.
        reason: String,
    },

    /// A step failed while running its capability.
    #[error("Step '{step}' failed: {reason}")]
    StepExecution {
        /// Id of the failed step.
        step: String,
        /// Failure reported by the capability.
        reason: String,
    },

    /// A capability artifact could not be loaded or run.
    #[error("Capability error: {0}")]
    Capability(String),

    /// The language model backend failed.
    #[error("LLM error: {0}")]
    Llm(String),

    /// An error from an outbound HTTP request.
    #[error("HTTP error: {0}")]
    Http(String),

    /// An error related to session persistence.
    #[error("Session error: {0}")]
    Session(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A minion record could not be read, written or scheduled.
    #[error("Minion error: {0}")]
    Minion(String),

    /// A running minion stopped reporting heartbeats.
    #[error("Minion '{0}' missed its heartbeat")]
    MinionLivenessTimeout(String),

    /// No minion exists with the given id.
    #[error("Minion '{0}' not found")]
    MinionNotFound(String),

    /// A compare-and-swap on a minion record lost against another writer.
    #[error("Claim conflict on minion '{0}'")]
    ClaimConflict(String),

    /// A state machine was asked to take a transition it does not allow.
    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition {
        /// State the machine was in.
        from: String,
        /// Event that was rejected.
        event: String,
    },

    /// The operation was cancelled before it completed.
    #[error("Cancelled")]
    Cancelled,

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForemanError {
    /// Machine-readable code for this error.
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            ForemanError::PlanningFailed(_) => ReasonCode::PlanningFailed,
            ForemanError::CapabilityNotFound(_) => ReasonCode::CapabilityNotFound,
            ForemanError::CapabilityBuildFailed { .. } => ReasonCode::CapabilityBuildFailed,
            ForemanError::Llm(_) | ForemanError::Http(_) => ReasonCode::Unavailable,
            ForemanError::StepExecution { .. } => ReasonCode::StepExecutionFailed,
            ForemanError::MinionLivenessTimeout(_) => ReasonCode::MinionLivenessTimeout,
            ForemanError::Cancelled => ReasonCode::Cancelled,
            _ => ReasonCode::Internal,
        }
    }

    /// Converts the error into a [`FailureDetail`] for reports and transcripts.
    pub fn to_failure(&self) -> FailureDetail {
        FailureDetail::new(self.reason_code(), self.to_string())
    }
}

/// A convenience `Result` alias using [`ForemanError`].
pub type ForemanResult<T> = Result<T, ForemanError>;

/// How a failure should be treated by retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// May succeed if attempted again.
    Transient,
    /// Will not succeed on retry.
    Permanent,
    /// The input or output contract was violated. Never retried.
    Validation,
}

/// Machine-readable reason attached to a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    PlanningFailed,
    CapabilityBuildFailed,
    CapabilityNotFound,
    StepExecutionFailed,
    InvalidInput,
    InvalidOutput,
    PermissionDenied,
    Timeout,
    Unavailable,
    DependencyFailure,
    Cancelled,
    MinionLivenessTimeout,
    Internal,
}

impl ReasonCode {
    /// Retry classification for this reason.
    pub fn class(self) -> ErrorClass {
        match self {
            ReasonCode::Timeout | ReasonCode::Unavailable => ErrorClass::Transient,
            ReasonCode::InvalidInput | ReasonCode::InvalidOutput => ErrorClass::Validation,
            _ => ErrorClass::Permanent,
        }
    }

    /// Stable snake_case name, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::PlanningFailed => "planning_failed",
            ReasonCode::CapabilityBuildFailed => "capability_build_failed",
            ReasonCode::CapabilityNotFound => "capability_not_found",
            ReasonCode::StepExecutionFailed => "step_execution_failed",
            ReasonCode::InvalidInput => "invalid_input",
            ReasonCode::InvalidOutput => "invalid_output",
            ReasonCode::PermissionDenied => "permission_denied",
            ReasonCode::Timeout => "timeout",
            ReasonCode::Unavailable => "unavailable",
            ReasonCode::DependencyFailure => "dependency_failure",
            ReasonCode::Cancelled => "cancelled",
            ReasonCode::MinionLivenessTimeout => "minion_liveness_timeout",
            ReasonCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured failure: reason code plus a human-readable summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub code: ReasonCode,
    pub message: String,
}

impl FailureDetail {
    /// Creates a failure detail.
    pub fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Whether a retry could change the outcome.
    pub fn is_transient(&self) -> bool {
        self.code.class() == ErrorClass::Transient
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}
