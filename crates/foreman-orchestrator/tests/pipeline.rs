#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end pipeline runs against a routing mock model.

use async_trait::async_trait;
use foreman_core::{ForemanError, ForemanResult, ReasonCode};
use foreman_llm::{LlmBackend, LlmClient, LlmRequest, LlmResponse};
use foreman_memory::{
    ContextAssembler, ContextConfig, LearningStore, SessionStatus, SessionStore, TranscriptEvent,
};
use foreman_orchestrator::{
    Executor, ExecutorConfig, LearningsExtractor, Orchestrator, Phase, Planner, RunEvent,
    RunStatus, StepStatus, Task,
};
use foreman_skills::{
    Capability, CapabilityBuilder, CapabilityDescriptor, CapabilityFailure, CapabilityRegistry,
    RegisterMode, ScriptRuntime, ScriptValidator,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Mock model
// ---------------------------------------------------------------------------

const COUNT_WORDS: &str =
    "```rhai\nfn run(input) { #{ words: input.text.split(\" \").len() } }\n```";

/// Answers planning, building and extraction requests with fixed replies.
struct Router {
    plan: Option<Value>,
    code: String,
    learnings: String,
    builds: AtomicUsize,
}

impl Router {
    fn new(plan: Option<Value>) -> Arc<Self> {
        Arc::new(Self {
            plan,
            code: COUNT_WORDS.into(),
            learnings: "[]".into(),
            builds: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LlmBackend for Router {
    async fn complete(&self, request: &LlmRequest) -> ForemanResult<LlmResponse> {
        if request.tools.iter().any(|t| t.name == "create_plan") {
            return Ok(match &self.plan {
                Some(plan) => LlmResponse::tool("create_plan", plan.clone()),
                None => LlmResponse::text("Which files do you mean?"),
            });
        }
        if request.system.as_deref().unwrap_or_default().contains("Rhai") {
            self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            return Ok(LlmResponse::text(self.code.clone()));
        }
        Ok(LlmResponse::text(self.learnings.clone()))
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

struct Native {
    descriptor: CapabilityDescriptor,
    fail: bool,
}

#[async_trait]
impl Capability for Native {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, input: Value) -> Result<Value, CapabilityFailure> {
        if self.fail {
            Err(CapabilityFailure::runtime("upstream returned 500"))
        } else {
            Ok(json!({ "data": input }))
        }
    }
}

fn native(name: &str, description: &str, fail: bool) -> Arc<Native> {
    Arc::new(Native {
        descriptor: CapabilityDescriptor::builtin(name, description, json!({}), json!({})),
        fail,
    })
}

struct Fixture {
    _tmp: TempDir,
    model: Arc<Router>,
    registry: Arc<CapabilityRegistry>,
    sessions: Arc<SessionStore>,
    learnings: Arc<LearningStore>,
    orchestrator: Orchestrator,
}

async fn fixture(plan: Option<Value>) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let model = Router::new(plan);
    let llm = LlmClient::from_backend(model.clone());

    let registry = Arc::new(CapabilityRegistry::new());
    registry
        .register(native("fetch", "Fetch the raw dataset", true), RegisterMode::Create)
        .unwrap();
    registry
        .register(native("transform", "Transform rows", false), RegisterMode::Create)
        .unwrap();
    registry
        .register(native("report", "Write the report", false), RegisterMode::Create)
        .unwrap();

    let sessions = Arc::new(SessionStore::new(tmp.path().join("sessions")).await.unwrap());
    let learnings = Arc::new(LearningStore::new(tmp.path().join("learnings")).await.unwrap());

    let builder = Arc::new(CapabilityBuilder::new(
        registry.clone(),
        llm.clone(),
        ScriptValidator::new(Arc::new(ScriptRuntime::default())),
    ));
    let executor = Executor::new(
        registry.clone(),
        ExecutorConfig {
            retry_backoff_ms: 1,
            ..ExecutorConfig::default()
        },
    )
    .with_builder(builder);

    let orchestrator = Orchestrator::new(Planner::new(llm.clone(), registry.clone()), executor)
        .with_context(
            ContextAssembler::new(ContextConfig::default())
                .with_sessions(sessions.clone())
                .with_learnings(learnings.clone()),
        )
        .with_sessions(sessions.clone())
        .with_extractor(LearningsExtractor::new(learnings.clone()).with_llm(llm));

    Fixture {
        _tmp: tmp,
        model,
        registry,
        sessions,
        learnings,
        orchestrator,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_fetch_skips_the_chain_and_fails_the_run() {
    let f = fixture(Some(json!({
        "reasoning": "fetch, transform, report",
        "steps": [
            {"skill_name": "fetch", "description": "Fetch data", "parameters": {"url": "http://example.test"}},
            {"skill_name": "transform", "description": "Transform", "parameters": {"rows": {"$from": 0, "path": "/data"}}},
            {"skill_name": "report", "description": "Report", "parameters": {"rows": {"$from": 1}}}
        ]
    })))
    .await;

    let outcome = f
        .orchestrator
        .run(Task::new("build the sales report"), CancellationToken::new())
        .await
        .unwrap();
    let report = &outcome.report;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.result("step_1").unwrap().status, StepStatus::Failed);
    for id in ["step_2", "step_3"] {
        let r = report.result(id).unwrap();
        assert_eq!(r.status, StepStatus::Skipped);
        assert_eq!(r.failure.as_ref().unwrap().code, ReasonCode::DependencyFailure);
    }

    let session = outcome.session_id.as_deref().unwrap();
    let detail = f.sessions.get(session).await.unwrap().unwrap();
    assert_eq!(detail.meta.status, SessionStatus::Failed);
    let transcript = f.sessions.transcript(session).await.unwrap();
    let steps = transcript
        .iter()
        .filter(|e| matches!(e.event, TranscriptEvent::Step { .. }))
        .count();
    assert_eq!(steps, 3);
    assert!(transcript
        .iter()
        .any(|e| matches!(e.event, TranscriptEvent::Plan { .. })));

    let learned = f.learnings.by_topic("fetch").await.unwrap();
    assert_eq!(learned.len(), 1);
    assert!(learned[0].insight.contains("step_execution_failed"));
    assert_eq!(outcome.learnings.len(), 1);
}

#[tokio::test]
async fn two_steps_needing_one_new_capability_build_it_once() {
    let f = fixture(Some(json!({
        "reasoning": "count both",
        "steps": [
            {"skill_name": "count_words", "description": "Count words in the greeting", "parameters": {"text": "hello world"}},
            {"skill_name": "count_words", "description": "Count words in the farewell", "parameters": {"text": "see you later"}}
        ],
        "skills_to_create": ["count words"]
    })))
    .await;

    let mut events = f.orchestrator.events().subscribe();
    let outcome = f
        .orchestrator
        .run(Task::new("count words"), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.report.status, RunStatus::Succeeded);
    assert_eq!(f.model.builds.load(Ordering::SeqCst), 1);
    assert!(f.registry.contains_valid("count_words"));
    assert_eq!(outcome.report.result("step_1").unwrap().output.as_ref().unwrap()["words"], 2);
    assert_eq!(outcome.report.result("step_2").unwrap().output.as_ref().unwrap()["words"], 3);
    for id in ["step_1", "step_2"] {
        assert_eq!(outcome.report.result(id).unwrap().capability, "count_words");
    }

    let mut phases = Vec::new();
    let mut built = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            RunEvent::Status { phase, .. } => phases.push(phase),
            RunEvent::CapabilityBuilt { ok: true, .. } => built += 1,
            _ => {}
        }
    }
    assert_eq!(built, 2);
    for phase in [
        Phase::MemoryRecall,
        Phase::Planning,
        Phase::SkillBuilding,
        Phase::Executing,
        Phase::Complete,
    ] {
        assert!(phases.contains(&phase), "missing {phase}");
    }

    let session = outcome.session_id.as_deref().unwrap();
    let detail = f.sessions.get(session).await.unwrap().unwrap();
    assert_eq!(detail.meta.status, SessionStatus::Completed);
    assert!(detail.summary.unwrap().contains("2/2 steps succeeded"));
}

#[tokio::test]
async fn clarification_reply_fails_planning() {
    let f = fixture(None).await;
    let err = f
        .orchestrator
        .run(Task::new("fix the thing"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ForemanError::PlanningFailed(_)));

    let listed = f.sessions.list(10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, SessionStatus::Failed);
}

#[tokio::test]
async fn earlier_runs_feed_the_next_plan() {
    let f = fixture(Some(json!({
        "reasoning": "just transform",
        "steps": [{"skill_name": "transform", "description": "Transform", "parameters": {"rows": [1, 2]}}]
    })))
    .await;

    let first = f
        .orchestrator
        .run(Task::new("transform the rows"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.report.status, RunStatus::Succeeded);

    let recent = f.sessions.recent_summaries(5).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].0.task, "transform the rows");
}
