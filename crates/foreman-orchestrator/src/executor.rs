use crate::events::{EventBus, RunEvent};
use crate::lifecycle::{initial_status, replay, StepEvent};
use crate::types::{
    ExecutionReport, InputBinding, Plan, RunStatus, Step, StepBinding, StepResult, StepStatus,
};
use chrono::{DateTime, Utc};
use foreman_core::text::truncate_chars;
use foreman_core::{FailureDetail, ForemanResult, ReasonCode};
use foreman_skills::{BuildSession, CapabilityBuilder, CapabilityRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const OUTPUT_PREVIEW_CHARS: usize = 200;

/// Executor limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Steps running at the same time.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Per-attempt timeout for steps without their own.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Extra attempts for idempotent steps after a transient failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// How long in-flight steps may keep running after cancellation.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

fn default_max_workers() -> usize {
    4
}
fn default_step_timeout_secs() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_cancel_grace_ms() -> u64 {
    5_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            step_timeout_secs: default_step_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

/// What a spawned step reports back to the coordinator.
struct Attempt {
    capability: String,
    /// For unbound steps: whether the builder produced a capability.
    built: Option<bool>,
    outcome: Result<Value, FailureDetail>,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    retries: u32,
}

/// Runs one step: build if needed, then invoke with timeout and retries.
#[derive(Clone)]
struct StepRunner {
    registry: Arc<CapabilityRegistry>,
    builds: Option<Arc<BuildSession>>,
    default_timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl StepRunner {
    async fn run(self, step: Step, input: Value) -> Attempt {
        let started_at = Utc::now();

        let (capability, built) = match &step.binding {
            StepBinding::Bound { name } => (name.clone(), None),
            StepBinding::Unbound { spec } => {
                let Some(builds) = &self.builds else {
                    return Attempt {
                        capability: spec.name.clone(),
                        built: Some(false),
                        outcome: Err(FailureDetail::new(
                            ReasonCode::CapabilityBuildFailed,
                            format!("no builder configured for '{}'", spec.name),
                        )),
                        started_at,
                        ended_at: Utc::now(),
                        retries: 0,
                    };
                };
                match builds.ensure(spec).await {
                    Ok(descriptor) => (descriptor.name, Some(true)),
                    Err(detail) => {
                        return Attempt {
                            capability: spec.name.clone(),
                            built: Some(false),
                            outcome: Err(FailureDetail::new(
                                ReasonCode::CapabilityBuildFailed,
                                detail.message,
                            )),
                            started_at,
                            ended_at: Utc::now(),
                            retries: 0,
                        };
                    }
                }
            }
        };

        let timeout = step.timeout_override().unwrap_or(self.default_timeout);
        let mut retries = 0;
        let outcome = loop {
            let failure = match tokio::time::timeout(
                timeout,
                self.registry.invoke(&capability, input.clone()),
            )
            .await
            {
                Ok(Ok(output)) => break Ok(output),
                Ok(Err(failure)) => failure.to_detail(),
                Err(_) => FailureDetail::new(
                    ReasonCode::Timeout,
                    format!("'{capability}' did not finish within {}s", timeout.as_secs_f64()),
                ),
            };

            if step.idempotent && failure.is_transient() && retries < self.max_retries {
                let delay = self.backoff.saturating_mul(2u32.saturating_pow(retries));
                warn!(
                    step = %step.id,
                    capability = %capability,
                    attempt = retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Transient step failure, retrying"
                );
                tokio::time::sleep(delay).await;
                retries += 1;
                continue;
            }
            break Err(failure);
        };

        Attempt {
            capability,
            built,
            outcome,
            started_at,
            ended_at: Utc::now(),
            retries,
        }
    }
}

/// Coordinator-side bookkeeping for one plan execution.
struct RunState<'p> {
    plan: &'p Plan,
    status: Vec<StepStatus>,
    results: Vec<Option<StepResult>>,
    /// Set once a step has been started, skipped or failed before starting.
    settled: Vec<bool>,
    trace: Vec<StepResult>,
    events: Option<&'p EventBus>,
}

impl<'p> RunState<'p> {
    fn new(plan: &'p Plan, events: Option<&'p EventBus>) -> Self {
        let n = plan.len();
        Self {
            plan,
            status: plan.steps().iter().map(|s| initial_status(&s.binding)).collect(),
            results: vec![None; n],
            settled: vec![false; n],
            trace: Vec::with_capacity(n),
            events,
        }
    }

    fn advance(&mut self, i: usize, events: &[StepEvent]) -> ForemanResult<()> {
        self.status[i] = replay(self.status[i], events)?;
        Ok(())
    }

    fn publish(&self, event: RunEvent) {
        if let Some(bus) = self.events {
            bus.publish(event);
        }
    }

    fn record(&mut self, i: usize, result: StepResult) {
        debug!(
            step = %result.step_id,
            status = %result.status,
            retries = result.retries,
            "Step settled"
        );
        self.publish(RunEvent::StepFinished {
            step_id: result.step_id.clone(),
            capability: result.capability.clone(),
            status: result.status,
            duration_ms: result.duration().as_millis() as u64,
        });
        self.settled[i] = true;
        self.results[i] = Some(result.clone());
        self.trace.push(result);
    }

    /// Terminal result for a step that never ran.
    fn settle_unstarted(&mut self, i: usize, event: StepEvent, failure: FailureDetail) -> ForemanResult<()> {
        self.advance(i, &[event])?;
        let now = Utc::now();
        let step = &self.plan.steps()[i];
        let result = StepResult {
            step_id: step.id.clone(),
            capability: step.binding.capability_name().to_string(),
            status: self.status[i],
            output: None,
            failure: Some(failure),
            started_at: now,
            ended_at: now,
            retries: 0,
        };
        self.record(i, result);
        Ok(())
    }

    fn complete(&mut self, i: usize, attempt: Attempt) -> ForemanResult<()> {
        let mut events = Vec::new();
        match attempt.built {
            Some(true) => events.extend([StepEvent::Bind, StepEvent::Unblock, StepEvent::Start]),
            Some(false) | None => {}
        }
        events.push(if attempt.outcome.is_ok() {
            StepEvent::Succeed
        } else {
            StepEvent::Fail
        });
        self.advance(i, &events)?;

        if let Some(ok) = attempt.built {
            self.publish(RunEvent::CapabilityBuilt {
                name: attempt.capability.clone(),
                ok,
            });
        }

        let (output, failure) = match attempt.outcome {
            Ok(output) => (Some(output), None),
            Err(failure) => {
                warn!(step = %self.plan.steps()[i].id, error = %failure, "Step failed");
                (None, Some(failure))
            }
        };
        let result = StepResult {
            step_id: self.plan.steps()[i].id.clone(),
            capability: attempt.capability,
            status: self.status[i],
            output,
            failure,
            started_at: attempt.started_at,
            ended_at: attempt.ended_at,
            retries: attempt.retries,
        };
        self.record(i, result);
        Ok(())
    }

    /// After step `i` ended without success, skip everything downstream of
    /// it that has not started, without waiting for their other dependencies.
    fn skip_dependents(&mut self, i: usize) -> ForemanResult<()> {
        if self.results[i].as_ref().map_or(true, StepResult::succeeded) {
            return Ok(());
        }
        let plan = self.plan;
        let steps = plan.steps();
        let root = &steps[i];
        for id in crate::graph::transitive_dependents(steps, &root.id) {
            let Some(j) = steps.iter().position(|s| s.id == id) else { continue };
            if self.settled[j] {
                continue;
            }
            let failure = FailureDetail::new(
                ReasonCode::DependencyFailure,
                format!("dependency '{}' {}", root.id, self.status[i]),
            );
            self.settle_unstarted(j, StepEvent::Skip, failure)?;
        }
        Ok(())
    }

    /// Skip every step that has not started.
    fn cancel_pending(&mut self) -> ForemanResult<()> {
        for i in 0..self.plan.len() {
            if !self.settled[i] {
                self.settle_unstarted(
                    i,
                    StepEvent::Skip,
                    FailureDetail::new(ReasonCode::Cancelled, "run cancelled before the step started"),
                )?;
            }
        }
        Ok(())
    }
}

/// Runs a plan's steps concurrently in dependency order.
pub struct Executor {
    registry: Arc<CapabilityRegistry>,
    builder: Option<Arc<CapabilityBuilder>>,
    events: Option<EventBus>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(registry: Arc<CapabilityRegistry>, config: ExecutorConfig) -> Self {
        Self {
            registry,
            builder: None,
            events: None,
            config,
        }
    }

    /// Builder used for unbound steps. Without one they fail to build.
    pub fn with_builder(mut self, builder: Arc<CapabilityBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute `plan` until every step is terminal or `cancel` fires.
    ///
    /// Step failures are recorded in the report; an error is returned only
    /// when the bookkeeping itself is inconsistent.
    pub async fn execute(&self, plan: &Plan, cancel: CancellationToken) -> ForemanResult<ExecutionReport> {
        let started_at = Utc::now();
        let steps = plan.steps();
        let index: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        let deps: Vec<Vec<usize>> = steps
            .iter()
            .map(|s| {
                s.depends_on
                    .iter()
                    .filter_map(|d| index.get(d.as_str()).copied())
                    .collect()
            })
            .collect();

        let order = crate::graph::topological_order(steps);

        let runner = StepRunner {
            registry: self.registry.clone(),
            builds: self
                .builder
                .as_ref()
                .map(|b| Arc::new(BuildSession::new(b.clone()))),
            default_timeout: Duration::from_secs(self.config.step_timeout_secs),
            max_retries: self.config.max_retries,
            backoff: Duration::from_millis(self.config.retry_backoff_ms),
        };
        let max_workers = self.config.max_workers.max(1);
        let grace = Duration::from_millis(self.config.cancel_grace_ms);

        let mut state = RunState::new(plan, self.events.as_ref());
        let mut inflight: JoinSet<(usize, Attempt)> = JoinSet::new();
        let mut tasks: HashMap<tokio::task::Id, (usize, DateTime<Utc>)> = HashMap::new();
        let mut cancelled = false;
        let mut abort_at: Option<Instant> = None;

        info!(plan = %plan.id(), steps = steps.len(), workers = max_workers, "Executing plan");

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                info!(plan = %plan.id(), in_flight = inflight.len(), "Cancellation requested");
                state.cancel_pending()?;
                abort_at = Some(Instant::now() + grace);
            }

            if !cancelled {
                for &i in &order {
                    if state.settled[i] || !deps[i].iter().all(|&d| state.results[d].is_some()) {
                        continue;
                    }

                    if let Some(&d) = deps[i]
                        .iter()
                        .find(|&&d| !state.results[d].as_ref().is_some_and(StepResult::succeeded))
                    {
                        let failure = FailureDetail::new(
                            ReasonCode::DependencyFailure,
                            format!("dependency '{}' {}", steps[d].id, state.status[d]),
                        );
                        state.settle_unstarted(i, StepEvent::Skip, failure)?;
                        continue;
                    }

                    if inflight.len() >= max_workers {
                        continue;
                    }

                    let step = &steps[i];
                    let input = match resolve_inputs(step, &state.results, &index) {
                        Ok(input) => input,
                        Err(failure) => {
                            if step.binding.is_bound() {
                                state.advance(i, &[StepEvent::Unblock])?;
                            }
                            state.settle_unstarted(i, StepEvent::Fail, failure)?;
                            state.skip_dependents(i)?;
                            continue;
                        }
                    };

                    if step.binding.is_bound() {
                        state.advance(i, &[StepEvent::Unblock, StepEvent::Start])?;
                    }
                    state.settled[i] = true;
                    state.publish(RunEvent::StepStarted {
                        step_id: step.id.clone(),
                        capability: step.binding.capability_name().to_string(),
                    });
                    debug!(step = %step.id, capability = step.binding.capability_name(), "Step started");

                    let run = runner.clone().run(step.clone(), input);
                    let handle = inflight.spawn(async move { (i, run.await) });
                    tasks.insert(handle.id(), (i, Utc::now()));
                }
            }

            if inflight.is_empty() {
                if cancelled {
                    state.cancel_pending()?;
                }
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !cancelled => {}
                _ = tokio::time::sleep_until(abort_at.unwrap_or_else(Instant::now)), if abort_at.is_some() => {
                    warn!(plan = %plan.id(), in_flight = inflight.len(), "Cancellation grace elapsed, aborting steps");
                    inflight.abort_all();
                    abort_at = None;
                }
                joined = inflight.join_next_with_id() => match joined {
                    Some(Ok((id, (i, attempt)))) => {
                        tasks.remove(&id);
                        state.complete(i, attempt)?;
                        if !cancelled {
                            state.skip_dependents(i)?;
                        }
                    }
                    Some(Err(e)) => {
                        let Some((i, spawned_at)) = tasks.remove(&e.id()) else { continue };
                        let failure = if e.is_cancelled() {
                            FailureDetail::new(ReasonCode::Cancelled, "aborted after the cancellation grace period")
                        } else {
                            FailureDetail::new(ReasonCode::Internal, format!("step task panicked: {e}"))
                        };
                        state.settle_after_abort(i, spawned_at, failure)?;
                        if !cancelled {
                            state.skip_dependents(i)?;
                        }
                    }
                    None => {}
                },
            }
        }

        let status = run_status(plan, &state.results, cancelled);
        let ended_at = Utc::now();
        let summary = summarize(plan, &state.results, status, ended_at - started_at);
        info!(plan = %plan.id(), status = %status, "Plan finished");

        Ok(ExecutionReport {
            plan_id: plan.id(),
            status,
            trace: state.trace,
            summary,
            started_at,
            ended_at,
        })
    }
}

impl RunState<'_> {
    /// Failure for a step whose task was aborted or panicked. The step is
    /// still `running`, or `proposed` if it was building.
    fn settle_after_abort(
        &mut self,
        i: usize,
        started_at: DateTime<Utc>,
        failure: FailureDetail,
    ) -> ForemanResult<()> {
        self.advance(i, &[StepEvent::Fail])?;
        let step = &self.plan.steps()[i];
        let result = StepResult {
            step_id: step.id.clone(),
            capability: step.binding.capability_name().to_string(),
            status: self.status[i],
            output: None,
            failure: Some(failure),
            started_at,
            ended_at: Utc::now(),
            retries: 0,
        };
        self.record(i, result);
        Ok(())
    }
}

/// Input object for `step`, with step-output references replaced by the
/// referenced values.
fn resolve_inputs(
    step: &Step,
    results: &[Option<StepResult>],
    index: &HashMap<&str, usize>,
) -> Result<Value, FailureDetail> {
    let mut input = serde_json::Map::new();
    for (name, binding) in &step.inputs {
        let value = match binding {
            InputBinding::Literal { value } => value.clone(),
            InputBinding::StepOutput { step: source, pointer } => {
                let output = index
                    .get(source.as_str())
                    .and_then(|&j| results[j].as_ref())
                    .and_then(|r| r.output.as_ref())
                    .ok_or_else(|| {
                        FailureDetail::new(
                            ReasonCode::InvalidInput,
                            format!("input '{name}': step '{source}' has no output"),
                        )
                    })?;
                match pointer {
                    Some(p) => output.pointer(p).cloned().ok_or_else(|| {
                        FailureDetail::new(
                            ReasonCode::InvalidInput,
                            format!("input '{name}': output of '{source}' has nothing at '{p}'"),
                        )
                    })?,
                    None => output.clone(),
                }
            }
        };
        input.insert(name.clone(), value);
    }
    Ok(Value::Object(input))
}

/// Run status from per-step results.
pub fn run_status(plan: &Plan, results: &[Option<StepResult>], cancelled: bool) -> RunStatus {
    let succeeded = |r: &Option<StepResult>| r.as_ref().is_some_and(StepResult::succeeded);
    if results.iter().all(succeeded) {
        return RunStatus::Succeeded;
    }
    if cancelled {
        return RunStatus::Cancelled;
    }
    let goals = crate::graph::goal_steps(plan.steps());
    let any_goal_done = plan
        .steps()
        .iter()
        .zip(results)
        .any(|(s, r)| goals.contains(&s.id) && succeeded(r));
    if any_goal_done {
        RunStatus::Partial
    } else {
        RunStatus::Failed
    }
}

fn summarize(
    plan: &Plan,
    results: &[Option<StepResult>],
    status: RunStatus,
    elapsed: chrono::Duration,
) -> String {
    let ok = results.iter().flatten().filter(|r| r.succeeded()).count();
    let secs = elapsed.num_milliseconds() as f64 / 1000.0;
    let mut lines = vec![format!(
        "Run {status} in {secs:.1}s: {ok}/{} steps succeeded.",
        plan.len()
    )];
    for (step, result) in plan.steps().iter().zip(results) {
        let Some(result) = result else { continue };
        let detail = match (&result.output, &result.failure) {
            (Some(output), _) => {
                let text = match output {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                truncate_chars(&text, OUTPUT_PREVIEW_CHARS)
            }
            (None, Some(failure)) => failure.to_string(),
            (None, None) => String::new(),
        };
        let label = if step.description.is_empty() {
            result.capability.clone()
        } else {
            step.description.clone()
        };
        lines.push(format!("- {} [{}] {label}: {detail}", step.id, result.status));
    }
    lines.join("\n")
}
