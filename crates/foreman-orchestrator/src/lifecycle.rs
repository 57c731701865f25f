use crate::types::{StepBinding, StepStatus};
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};

/// Something that happened to a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEvent {
    /// A capability now backs the step.
    Bind,
    /// Every dependency succeeded.
    Unblock,
    Start,
    Succeed,
    Fail,
    /// A dependency failed or the run was cancelled before the step started.
    Skip,
}

impl std::fmt::Display for StepEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepEvent::Bind => write!(f, "bind"),
            StepEvent::Unblock => write!(f, "unblock"),
            StepEvent::Start => write!(f, "start"),
            StepEvent::Succeed => write!(f, "succeed"),
            StepEvent::Fail => write!(f, "fail"),
            StepEvent::Skip => write!(f, "skip"),
        }
    }
}

/// Status a step starts in given its binding.
pub fn initial_status(binding: &StepBinding) -> StepStatus {
    if binding.is_bound() {
        StepStatus::Bound
    } else {
        StepStatus::Proposed
    }
}

/// Apply `event` to a step in status `from`.
///
/// ```text
/// proposed --bind--> bound --unblock--> ready --start--> running
/// running  --succeed--> succeeded
/// proposed | ready | running --fail--> failed
/// proposed | bound | ready --skip--> skipped
/// ```
pub fn transition(from: StepStatus, event: StepEvent) -> ForemanResult<StepStatus> {
    use StepEvent::*;
    use StepStatus::*;

    let next = match (from, event) {
        (Proposed, Bind) => Bound,
        (Bound, Unblock) => Ready,
        (Ready, Start) => Running,
        (Running, Succeed) => Succeeded,
        (Proposed | Ready | Running, Fail) => Failed,
        (Proposed | Bound | Ready, Skip) => Skipped,
        _ => {
            return Err(ForemanError::InvalidTransition {
                from: from.to_string(),
                event: event.to_string(),
            })
        }
    };
    Ok(next)
}

/// Apply a sequence of events, stopping at the first rejected one.
pub fn replay(from: StepStatus, events: &[StepEvent]) -> ForemanResult<StepStatus> {
    events.iter().try_fold(from, |status, &event| transition(status, event))
}
