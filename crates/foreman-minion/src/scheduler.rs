use crate::config::MinionConfig;
use crate::launcher::Launcher;
use crate::record::{MinionRecord, MinionStatus};
use crate::store::MinionStore;
use crate::transition;
use chrono::{DateTime, Utc};
use foreman_core::{FailureDetail, ForemanError, ForemanResult, ReasonCode};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What one poll changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    /// `(minion id, fire sequence)` for every minion this poll fired.
    pub fired: Vec<(String, u64)>,
    /// Running minions failed for missing heartbeats.
    pub expired: Vec<String>,
    /// Pending minions closed because they can never fire again.
    pub retired: Vec<String>,
}

/// Polls the minion store, firing due minions and failing silent ones.
///
/// Any number of schedulers may poll the same store: each transition is
/// applied with a compare-and-swap, so a due minion is fired by exactly one
/// of them.
pub struct Scheduler {
    store: Arc<MinionStore>,
    launcher: Arc<dyn Launcher>,
    config: MinionConfig,
}

impl Scheduler {
    pub fn new(store: Arc<MinionStore>, launcher: Arc<dyn Launcher>, config: MinionConfig) -> Self {
        Self {
            store,
            launcher,
            config,
        }
    }

    /// Run one pass over every minion as of `now`.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> ForemanResult<PollReport> {
        let mut report = PollReport::default();
        for record in self.store.list().await? {
            let id = record.id.clone();
            let result = match record.status {
                MinionStatus::Running => self.check_liveness(&record, now, &mut report).await,
                MinionStatus::Pending if record.is_due(now) => self.fire(&record, now, &mut report).await,
                MinionStatus::Pending => self.retire(&record, now, &mut report).await,
                _ => Ok(()),
            };
            match result {
                Ok(()) => {}
                Err(ForemanError::ClaimConflict(_)) => {
                    debug!(minion = %id, "Another scheduler changed the record first");
                }
                Err(e) => warn!(minion = %id, error = %e, "Scheduler could not update minion"),
            }
        }
        if !report.fired.is_empty() || !report.expired.is_empty() {
            info!(
                fired = report.fired.len(),
                expired = report.expired.len(),
                retired = report.retired.len(),
                "Scheduler poll finished"
            );
        }
        Ok(report)
    }

    /// Poll every `poll_interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> ForemanResult<()> {
        info!(interval_secs = self.config.poll_interval_secs, "Scheduler started");
        loop {
            if let Err(e) = self.poll_once(Utc::now()).await {
                error!(error = %e, "Scheduler poll failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
        info!("Scheduler stopped");
        Ok(())
    }

    async fn fire(&self, record: &MinionRecord, now: DateTime<Utc>, report: &mut PollReport) -> ForemanResult<()> {
        let fired = transition::fire(record, now, None)?;
        self.store.swap(record, &fired).await?;
        info!(minion = %record.id, fire_seq = fired.fire_seq, task = %record.task, "Minion fired");

        if let Err(e) = self.launcher.launch(&fired, fired.fire_seq).await {
            error!(minion = %record.id, error = %e, "Launch failed");
            let failure = FailureDetail::new(ReasonCode::Internal, format!("Worker did not start: {e}"));
            let seq = fired.fire_seq;
            self.store
                .update(&record.id, |r| transition::finish(r, seq, Some(failure), Utc::now()).map(Some))
                .await?;
            return Ok(());
        }
        report.fired.push((record.id.clone(), fired.fire_seq));
        Ok(())
    }

    async fn check_liveness(
        &self,
        record: &MinionRecord,
        now: DateTime<Utc>,
        report: &mut PollReport,
    ) -> ForemanResult<()> {
        let Some(expired) = transition::expire(record, self.config.liveness_timeout(), now)? else {
            return Ok(());
        };
        self.store.swap(record, &expired).await?;
        warn!(minion = %record.id, status = %expired.status, "Minion missed its heartbeat");
        report.expired.push(record.id.clone());
        Ok(())
    }

    async fn retire(&self, record: &MinionRecord, now: DateTime<Utc>, report: &mut PollReport) -> ForemanResult<()> {
        let Some(retired) = transition::retire(record, now) else {
            return Ok(());
        };
        self.store.swap(record, &retired).await?;
        info!(minion = %record.id, status = %retired.status, "Minion schedule exhausted");
        report.retired.push(record.id.clone());
        Ok(())
    }
}
