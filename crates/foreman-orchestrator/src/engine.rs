use crate::estimator::TimeEstimator;
use crate::events::{EventBus, Phase, RunEvent};
use crate::executor::Executor;
use crate::extractor::LearningsExtractor;
use crate::planner::Planner;
use crate::types::{ExecutionReport, Plan, RunStatus, StepBinding, StepStatus, Task};
use foreman_core::{ForemanResult, ReasonCode};
use foreman_memory::{ContextAssembler, Learning, PlanStepNote, SessionStore, TranscriptEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Everything a finished pipeline run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub task: Task,
    pub session_id: Option<String>,
    pub plan: Plan,
    pub report: ExecutionReport,
    /// Learnings recorded by this run.
    pub learnings: Vec<Learning>,
}

/// The task pipeline: recall context, plan, build missing capabilities,
/// execute and learn.
pub struct Orchestrator {
    planner: Planner,
    executor: Executor,
    assembler: ContextAssembler,
    extractor: Option<LearningsExtractor>,
    sessions: Option<Arc<SessionStore>>,
    estimator: Arc<TimeEstimator>,
    estimates_path: Option<PathBuf>,
    events: EventBus,
}

impl Orchestrator {
    pub fn new(planner: Planner, executor: Executor) -> Self {
        let events = EventBus::default();
        Self {
            planner,
            executor: executor.with_events(events.clone()),
            assembler: ContextAssembler::default(),
            extractor: None,
            sessions: None,
            estimator: Arc::new(TimeEstimator::new()),
            estimates_path: None,
            events,
        }
    }

    pub fn with_context(mut self, assembler: ContextAssembler) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_extractor(mut self, extractor: LearningsExtractor) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Use `estimator` for ETAs, saving it to `path` after each run when given.
    pub fn with_estimator(mut self, estimator: Arc<TimeEstimator>, path: Option<PathBuf>) -> Self {
        self.estimator = estimator;
        self.estimates_path = path;
        self
    }

    /// Progress events for every run of this orchestrator.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run `task` through the whole pipeline.
    ///
    /// Step failures end up in the report; an error is returned only when no
    /// plan could be made or execution could not proceed at all.
    pub async fn run(&self, task: Task, cancel: CancellationToken) -> ForemanResult<RunOutcome> {
        info!(task = %task.id, goal = %task.goal, "Orchestrator: starting pipeline");
        let session_id = self.start_session(&task).await;

        self.status(Phase::MemoryRecall, "Recalling relevant context");
        let context = self.assembler.assemble(&task.goal).await;

        self.status(Phase::Planning, "Planning");
        let plan = match self.planner.plan(&task, &context).await {
            Ok(plan) => plan,
            Err(e) => {
                error!(task = %task.id, error = %e, "Planning failed");
                self.fail_session(session_id.as_deref(), &e.to_string()).await;
                self.status(Phase::Failed, e.to_string());
                return Err(e);
            }
        };
        self.note(session_id.as_deref(), plan_event(&plan)).await;

        let eta = self
            .estimator
            .estimate_plan(plan.steps().iter().map(|s| s.binding.capability_name()))
            .or(plan.estimated_secs());
        self.events.publish(RunEvent::Status {
            phase: Phase::Planning,
            message: format!("Planned {} steps", plan.len()),
            eta_secs: eta,
        });

        let unbound = plan.unbound_steps().count();
        if unbound > 0 {
            self.status(
                Phase::SkillBuilding,
                format!("{unbound} step(s) need a new capability"),
            );
        }

        self.status(Phase::Executing, "Executing plan");
        let report = match self.executor.execute(&plan, cancel).await {
            Ok(report) => report,
            Err(e) => {
                error!(task = %task.id, error = %e, "Execution aborted");
                self.fail_session(session_id.as_deref(), &e.to_string()).await;
                self.status(Phase::Failed, e.to_string());
                return Err(e);
            }
        };

        self.record_trace(session_id.as_deref(), &plan, &report).await;
        self.record_durations(&report).await;
        self.finish_session(session_id.as_deref(), &report).await;

        let learnings = match &self.extractor {
            Some(extractor) => extractor.extract(&task, &plan, &report).await,
            None => Vec::new(),
        };

        self.events.publish(RunEvent::Finished {
            status: report.status,
            summary: report.summary.clone(),
        });
        let phase = match report.status {
            RunStatus::Succeeded | RunStatus::Partial => Phase::Complete,
            RunStatus::Failed | RunStatus::Cancelled => Phase::Failed,
        };
        self.status(phase, format!("Run {}", report.status));
        info!(task = %task.id, status = %report.status, learnings = learnings.len(), "Orchestrator: pipeline finished");

        Ok(RunOutcome {
            task,
            session_id,
            plan,
            report,
            learnings,
        })
    }

    fn status(&self, phase: Phase, message: impl Into<String>) {
        self.events.publish(RunEvent::status(phase, message));
    }

    async fn start_session(&self, task: &Task) -> Option<String> {
        let sessions = self.sessions.as_ref()?;
        match sessions.start(&task.goal).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(task = %task.id, error = %e, "Could not open session");
                None
            }
        }
    }

    async fn note(&self, session: Option<&str>, event: TranscriptEvent) {
        let (Some(sessions), Some(id)) = (&self.sessions, session) else {
            return;
        };
        if let Err(e) = sessions.append(id, event).await {
            warn!(session = %id, error = %e, "Could not append transcript entry");
        }
    }

    async fn fail_session(&self, session: Option<&str>, error: &str) {
        let (Some(sessions), Some(id)) = (&self.sessions, session) else {
            return;
        };
        if let Err(e) = sessions.fail(id, error).await {
            warn!(session = %id, error = %e, "Could not close session");
        }
    }

    async fn finish_session(&self, session: Option<&str>, report: &ExecutionReport) {
        let (Some(sessions), Some(id)) = (&self.sessions, session) else {
            return;
        };
        let result = match report.status {
            RunStatus::Succeeded | RunStatus::Partial => sessions.complete(id, &report.summary).await,
            RunStatus::Failed | RunStatus::Cancelled => sessions.fail(id, &report.summary).await,
        };
        if let Err(e) = result {
            warn!(session = %id, error = %e, "Could not close session");
        }
    }

    async fn record_trace(&self, session: Option<&str>, plan: &Plan, report: &ExecutionReport) {
        for step in plan.steps() {
            let StepBinding::Unbound { spec } = &step.binding else {
                continue;
            };
            let Some(result) = report.result(&step.id) else {
                continue;
            };
            let build_failure = result
                .failure
                .as_ref()
                .filter(|f| f.code == ReasonCode::CapabilityBuildFailed);
            if result.status == StepStatus::Skipped {
                continue;
            }
            self.note(
                session,
                TranscriptEvent::CapabilityBuilt {
                    name: spec.name.clone(),
                    ok: build_failure.is_none(),
                    error: build_failure.map(|f| f.message.clone()),
                },
            )
            .await;
        }

        for result in &report.trace {
            self.note(
                session,
                TranscriptEvent::Step {
                    step_id: result.step_id.clone(),
                    capability: result.capability.clone(),
                    status: result.status.to_string(),
                    failure: result.failure.clone(),
                    duration_ms: result.duration().as_millis() as u64,
                },
            )
            .await;
        }
    }

    async fn record_durations(&self, report: &ExecutionReport) {
        for result in report.trace.iter().filter(|r| r.succeeded()) {
            self.estimator
                .record(&result.capability, result.duration().as_secs_f64());
        }
        if let Some(path) = &self.estimates_path {
            if let Err(e) = self.estimator.save(path).await {
                warn!(path = %path.display(), error = %e, "Could not save duration history");
            }
        }
    }
}

fn plan_event(plan: &Plan) -> TranscriptEvent {
    TranscriptEvent::Plan {
        plan_id: plan.id().to_string(),
        steps: plan
            .steps()
            .iter()
            .map(|s| PlanStepNote {
                id: s.id.clone(),
                capability: s.binding.capability_name().to_string(),
                description: s.description.clone(),
                depends_on: s.depends_on.clone(),
            })
            .collect(),
    }
}
