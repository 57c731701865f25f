use crate::config::MinionConfig;
use crate::record::{MinionRecord, MinionStatus};
use crate::store::{MinionLogEntry, MinionStore};
use crate::transition;
use async_trait::async_trait;
use chrono::Utc;
use foreman_core::{FailureDetail, ForemanError, ForemanResult, ReasonCode};
use foreman_orchestrator::{ExecutionReport, Orchestrator, RunStatus, StepStatus, Task};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How one invocation of the wrapped pipeline ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub succeeded: bool,
    pub summary: String,
    /// Set when the run did not succeed.
    pub failure: Option<FailureDetail>,
}

impl JobOutcome {
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            summary: summary.into(),
            failure: None,
        }
    }

    pub fn failed(failure: FailureDetail) -> Self {
        Self {
            succeeded: false,
            summary: failure.message.clone(),
            failure: Some(failure),
        }
    }

    /// Only a fully succeeded run counts as success. The failure reason is
    /// the first failed step's, falling back to the run summary.
    pub fn from_report(report: &ExecutionReport) -> Self {
        if report.status == RunStatus::Succeeded {
            return Self::success(report.summary.clone());
        }
        let failure = report
            .trace
            .iter()
            .filter(|r| r.status == StepStatus::Failed)
            .find_map(|r| r.failure.clone())
            .unwrap_or_else(|| {
                let code = match report.status {
                    RunStatus::Cancelled => ReasonCode::Cancelled,
                    _ => ReasonCode::StepExecutionFailed,
                };
                FailureDetail::new(code, format!("Run {}", report.status))
            });
        Self {
            succeeded: false,
            summary: report.summary.clone(),
            failure: Some(failure),
        }
    }
}

/// The unit of work a minion repeats.
#[async_trait]
pub trait PipelineJob: Send + Sync {
    async fn execute(&self, task: &str, cancel: CancellationToken) -> JobOutcome;
}

#[async_trait]
impl PipelineJob for Orchestrator {
    async fn execute(&self, task: &str, cancel: CancellationToken) -> JobOutcome {
        match self.run(Task::new(task), cancel).await {
            Ok(outcome) => JobOutcome::from_report(&outcome.report),
            Err(e) => JobOutcome::failed(e.to_failure()),
        }
    }
}

/// Worker side of a fired minion: runs the job while heart-beating and
/// writes the finishing transition.
pub struct MinionRunner {
    store: Arc<MinionStore>,
    config: MinionConfig,
}

impl MinionRunner {
    pub fn new(store: Arc<MinionStore>, config: MinionConfig) -> Self {
        Self { store, config }
    }

    /// Run fire `fire_seq` of minion `id`, which must already be claimed by
    /// the scheduler. A kill observed at a heartbeat cancels the job.
    pub async fn run(&self, id: &str, fire_seq: u64, job: &dyn PipelineJob) -> ForemanResult<MinionRecord> {
        let pid = std::process::id();
        let record = self
            .store
            .update(id, |r| transition::attach(r, fire_seq, pid, Utc::now()).map(Some))
            .await?;
        info!(minion = %id, fire_seq, pid, task = %record.task, "Minion run started");
        self.log(id, fire_seq, "started", Some(record.task.clone())).await;

        let cancel = CancellationToken::new();
        let stop = CancellationToken::new();
        let beats = tokio::spawn(heartbeat_loop(
            self.store.clone(),
            id.to_string(),
            fire_seq,
            self.config.heartbeat(),
            cancel.clone(),
            stop.clone(),
        ));

        let outcome = job.execute(&record.task, cancel.clone()).await;
        stop.cancel();
        if let Err(e) = beats.await {
            warn!(minion = %id, error = %e, "Heartbeat task ended abnormally");
        }

        let failure = if outcome.succeeded {
            None
        } else {
            Some(
                outcome
                    .failure
                    .clone()
                    .unwrap_or_else(|| FailureDetail::new(ReasonCode::StepExecutionFailed, &outcome.summary)),
            )
        };
        let updated = self
            .store
            .update(id, |r| match transition::finish(r, fire_seq, failure, Utc::now()) {
                Ok(next) => Ok(Some(next)),
                // Killed, or expired and re-armed while we ran.
                Err(ForemanError::InvalidTransition { .. } | ForemanError::ClaimConflict(_)) => {
                    warn!(minion = %r.id, status = %r.status, "Run finished after losing its claim");
                    Ok(None)
                }
                Err(e) => Err(e),
            })
            .await;

        let event = if outcome.succeeded { "succeeded" } else { "failed" };
        let finished = match updated {
            Ok(record) => {
                self.log(id, fire_seq, event, Some(outcome.summary.clone())).await;
                record
            }
            Err(ForemanError::MinionNotFound(_)) => {
                warn!(minion = %id, "Run finished after the minion was purged");
                self.store.archived(id).await?
            }
            Err(e) => return Err(e),
        };
        info!(
            minion = %id,
            fire_seq,
            outcome = event,
            status = %finished.status,
            runs = %finished.runs_label(),
            "Minion run finished"
        );
        Ok(finished)
    }

    async fn log(&self, id: &str, fire_seq: u64, event: &str, detail: Option<String>) {
        let entry = MinionLogEntry {
            at: Utc::now(),
            fire_seq,
            event: event.to_string(),
            detail,
        };
        if let Err(e) = self.store.append_log(id, &entry).await {
            warn!(minion = %id, error = %e, "Could not append minion transcript");
        }
    }
}

/// Consecutive failed heartbeats after which the run is abandoned.
const MAX_HEARTBEAT_FAILURES: u32 = 3;

async fn heartbeat_loop(
    store: Arc<MinionStore>,
    id: String,
    fire_seq: u64,
    every: Duration,
    cancel: CancellationToken,
    stop: CancellationToken,
) {
    let mut failures = 0;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
        let result = store
            .update(&id, |r| match transition::heartbeat(r, fire_seq, Utc::now()) {
                Ok(next) => Ok(Some(next)),
                Err(ForemanError::InvalidTransition { .. } | ForemanError::ClaimConflict(_)) => Ok(None),
                Err(e) => Err(e),
            })
            .await;
        match result {
            Ok(record) => {
                failures = 0;
                let ours = record.status == MinionStatus::Running
                    && record.claim.as_ref().is_some_and(|c| c.fire_seq == fire_seq);
                if !ours {
                    info!(minion = %id, status = %record.status, "Run no longer claimed, cancelling");
                    cancel.cancel();
                    return;
                }
            }
            Err(ForemanError::MinionNotFound(_)) => {
                info!(minion = %id, "Minion purged, cancelling");
                cancel.cancel();
                return;
            }
            Err(e) => {
                failures += 1;
                warn!(minion = %id, error = %e, failures, "Heartbeat failed");
                if failures >= MAX_HEARTBEAT_FAILURES {
                    warn!(minion = %id, "Heartbeats keep failing, cancelling");
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}
