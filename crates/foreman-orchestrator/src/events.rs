use crate::types::{RunStatus, StepStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Coarse stage of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    MemoryRecall,
    Planning,
    SkillBuilding,
    Executing,
    Complete,
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::MemoryRecall => write!(f, "memory_recall"),
            Phase::Planning => write!(f, "planning"),
            Phase::SkillBuilding => write!(f, "skill_building"),
            Phase::Executing => write!(f, "executing"),
            Phase::Complete => write!(f, "complete"),
            Phase::Failed => write!(f, "failed"),
        }
    }
}

/// Progress notifications published while a task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Status {
        phase: Phase,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eta_secs: Option<f64>,
    },
    StepStarted {
        step_id: String,
        capability: String,
    },
    StepFinished {
        step_id: String,
        capability: String,
        status: StepStatus,
        duration_ms: u64,
    },
    CapabilityBuilt {
        name: String,
        ok: bool,
    },
    Finished {
        status: RunStatus,
        summary: String,
    },
}

impl RunEvent {
    pub fn status(phase: Phase, message: impl Into<String>) -> Self {
        RunEvent::Status {
            phase,
            message: message.into(),
            eta_secs: None,
        }
    }

    /// One-line rendering for terminal output.
    pub fn line(&self) -> String {
        match self {
            RunEvent::Status {
                phase,
                message,
                eta_secs: Some(eta),
            } => format!("[{phase}] {message} (~{eta:.0}s)"),
            RunEvent::Status { phase, message, .. } => format!("[{phase}] {message}"),
            RunEvent::StepStarted {
                step_id,
                capability,
            } => format!("  > {step_id} ({capability})"),
            RunEvent::StepFinished {
                step_id,
                status,
                duration_ms,
                ..
            } => format!("  < {step_id} {status} in {duration_ms}ms"),
            RunEvent::CapabilityBuilt { name, ok: true } => format!("  + built {name}"),
            RunEvent::CapabilityBuilt { name, ok: false } => format!("  ! could not build {name}"),
            RunEvent::Finished { status, .. } => format!("[{status}]"),
        }
    }
}

/// Fan-out of [`RunEvent`]s. Publishing never blocks; with no subscribers the
/// event is dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
