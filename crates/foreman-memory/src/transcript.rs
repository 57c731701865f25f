use chrono::{DateTime, Utc};
use foreman_core::FailureDetail;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TranscriptEvent
// ---------------------------------------------------------------------------

/// One thing that happened during a run, as recorded in `transcript.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEvent {
    Task {
        content: String,
    },
    Plan {
        plan_id: String,
        steps: Vec<PlanStepNote>,
    },
    CapabilityBuilt {
        name: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Step {
        step_id: String,
        capability: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<FailureDetail>,
        duration_ms: u64,
    },
    Complete {
        summary: String,
    },
    Failed {
        error: String,
    },
}

/// Compact description of one planned step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStepNote {
    pub id: String,
    pub capability: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

// ---------------------------------------------------------------------------
// TranscriptEntry
// ---------------------------------------------------------------------------

/// A timestamped transcript line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TranscriptEvent,
}

impl TranscriptEntry {
    pub fn now(event: TranscriptEvent) -> Self {
        Self {
            ts: Utc::now(),
            event,
        }
    }
}
