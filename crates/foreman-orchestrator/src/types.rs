use chrono::{DateTime, Utc};
use foreman_core::{FailureDetail, ForemanError, ForemanResult};
use foreman_skills::CapabilitySpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// A submitted unit of work. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub goal: String,
    /// Optional structured hints passed to the planner alongside the goal.
    #[serde(default)]
    pub hints: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            goal: goal.into(),
            hints: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_hint(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.hints.insert(key.into(), value);
        self
    }
}

/// Identifier of a step within its plan.
pub type StepId = String;

/// How a step reaches its capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepBinding {
    /// Bound to a registered capability.
    Bound { name: String },
    /// No capability fits yet; the builder must synthesize one.
    Unbound { spec: CapabilitySpec },
}

impl StepBinding {
    /// The capability name this step will invoke once bound.
    pub fn capability_name(&self) -> &str {
        match self {
            StepBinding::Bound { name } => name,
            StepBinding::Unbound { spec } => &spec.name,
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, StepBinding::Bound { .. })
    }
}

/// Where one input value of a step comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputBinding {
    /// A literal JSON value.
    Literal { value: serde_json::Value },
    /// The output of an earlier step, optionally narrowed by a JSON pointer.
    StepOutput {
        step: StepId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pointer: Option<String>,
    },
}

impl InputBinding {
    /// Step this input reads from, if it is a reference.
    pub fn source_step(&self) -> Option<&str> {
        match self {
            InputBinding::StepOutput { step, .. } => Some(step),
            InputBinding::Literal { .. } => None,
        }
    }
}

/// One node of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub description: String,
    pub binding: StepBinding,
    /// Steps that must be terminal before this one starts, in declaration order.
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputBinding>,
    /// Safe to re-run after a transient failure.
    #[serde(default)]
    pub idempotent: bool,
    /// Per-attempt timeout override in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Step {
    pub fn bound(id: impl Into<StepId>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            binding: StepBinding::Bound {
                name: capability.into(),
            },
            depends_on: Vec::new(),
            inputs: BTreeMap::new(),
            idempotent: false,
            timeout_secs: None,
        }
    }

    pub fn unbound(id: impl Into<StepId>, spec: CapabilitySpec) -> Self {
        Self {
            binding: StepBinding::Unbound { spec },
            ..Self::bound(id, String::new())
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn after(mut self, step: impl Into<StepId>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn literal(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs
            .insert(name.into(), InputBinding::Literal { value });
        self
    }

    /// Read input `name` from a prior step's output. Also records the dependency.
    pub fn from_step(
        mut self,
        name: impl Into<String>,
        step: impl Into<StepId>,
        pointer: Option<&str>,
    ) -> Self {
        let step = step.into();
        if !self.depends_on.contains(&step) {
            self.depends_on.push(step.clone());
        }
        self.inputs.insert(
            name.into(),
            InputBinding::StepOutput {
                step,
                pointer: pointer.map(str::to_string),
            },
        );
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Lifecycle of a step during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Proposed,
    Bound,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Proposed => write!(f, "proposed"),
            StepStatus::Bound => write!(f, "bound"),
            StepStatus::Ready => write!(f, "ready"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// A validated, immutable DAG of steps in decomposition order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    id: Uuid,
    task_id: Uuid,
    reasoning: String,
    steps: Vec<Step>,
    estimated_secs: Option<f64>,
    created_at: DateTime<Utc>,
}

impl Plan {
    /// Build a plan, rejecting empty plans, duplicate ids, dangling or forward
    /// references and cycles.
    pub fn new(task_id: Uuid, reasoning: impl Into<String>, steps: Vec<Step>) -> ForemanResult<Self> {
        crate::graph::validate(&steps).map_err(ForemanError::PlanningFailed)?;
        Ok(Self {
            id: Uuid::new_v4(),
            task_id,
            reasoning: reasoning.into(),
            steps,
            estimated_secs: None,
            created_at: Utc::now(),
        })
    }

    /// Attach the model's own duration estimate.
    pub fn with_estimate(mut self, secs: Option<f64>) -> Self {
        self.estimated_secs = secs.filter(|s| s.is_finite() && *s >= 0.0);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn estimated_secs(&self) -> Option<f64> {
        self.estimated_secs
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Steps no other step depends on.
    pub fn goal_steps(&self) -> Vec<&Step> {
        let goals = crate::graph::goal_steps(&self.steps);
        self.steps.iter().filter(|s| goals.contains(&s.id)).collect()
    }

    /// Steps that need the builder before they can run.
    pub fn unbound_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| !s.binding.is_bound())
    }
}

/// Outcome of one step, appended to the execution trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    /// Capability the step invoked, or would have invoked.
    pub capability: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub failure: Option<FailureDetail>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub retries: u32,
}

impl StepResult {
    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at).to_std().unwrap_or_default()
    }

    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// Overall outcome of executing a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every step succeeded.
    Succeeded,
    /// Some goal steps completed, others failed or were skipped.
    Partial,
    /// No goal step completed.
    Failed,
    /// A cancellation stopped the run.
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Partial => write!(f, "partial"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What the executor hands back: the trace, the run status and a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub plan_id: Uuid,
    pub status: RunStatus,
    /// Step results in completion order.
    pub trace: Vec<StepResult>,
    pub summary: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.trace.iter().find(|r| r.step_id == step_id)
    }

    /// Whether the trace holds exactly one result per plan step.
    pub fn is_complete(&self, plan: &Plan) -> bool {
        self.trace.len() == plan.len()
            && plan.steps().iter().all(|s| self.result(&s.id).is_some())
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.trace.iter().filter(|r| r.status == StepStatus::Failed)
    }

    pub fn elapsed(&self) -> Duration {
        (self.ended_at - self.started_at).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_builder_records_reference_dependency() {
        let step = Step::bound("b", "render")
            .from_step("data", "a", Some("/rows"))
            .literal("title", json!("Report"));
        assert_eq!(step.depends_on, vec!["a".to_string()]);
        assert_eq!(step.inputs["data"].source_step(), Some("a"));
        assert_eq!(step.inputs["title"].source_step(), None);
    }

    #[test]
    fn test_plan_rejects_empty() {
        let err = Plan::new(Uuid::new_v4(), "", vec![]).unwrap_err();
        assert!(matches!(err, ForemanError::PlanningFailed(_)));
    }

    #[test]
    fn test_goal_steps() {
        let plan = Plan::new(
            Uuid::new_v4(),
            "two leaves",
            vec![
                Step::bound("a", "x"),
                Step::bound("b", "x").after("a"),
                Step::bound("c", "x").after("a"),
            ],
        )
        .unwrap();
        let goals: Vec<&str> = plan.goal_steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(goals, vec!["b", "c"]);
    }

    #[test]
    fn test_binding_serde() {
        let step = Step::bound("s", "read_file");
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["binding"]["kind"], "bound");
        let back: Step = serde_json::from_value(json).unwrap();
        assert_eq!(back, step);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(StepStatus::Skipped.to_string(), "skipped");
        assert_eq!(RunStatus::Partial.to_string(), "partial");
        assert!(StepStatus::Failed.is_terminal());
        assert!(!StepStatus::Ready.is_terminal());
    }
}
