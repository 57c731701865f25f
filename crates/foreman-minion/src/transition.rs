//! Pure minion state transitions.
//!
//! Every function takes the current record and returns the next one with
//! `version` bumped, or `None` when the request is a no-op. Nothing here
//! touches the filesystem; [`crate::store::MinionStore`] persists the result
//! with a compare-and-swap on the version that was read.

use crate::record::{Claim, LastRun, MinionRecord, MinionStatus};
use chrono::{DateTime, Duration, Utc};
use foreman_core::{FailureDetail, ForemanError, ForemanResult, ReasonCode};

fn rejected(record: &MinionRecord, event: &str) -> ForemanError {
    ForemanError::InvalidTransition {
        from: record.status.to_string(),
        event: event.to_string(),
    }
}

fn next_version(record: &MinionRecord, now: DateTime<Utc>) -> MinionRecord {
    let mut next = record.clone();
    next.version += 1;
    next.updated_at = now;
    next
}

/// `pending -> running` for a due record. The new claim carries the next
/// fire sequence number.
pub fn fire(record: &MinionRecord, now: DateTime<Utc>, pid: Option<u32>) -> ForemanResult<MinionRecord> {
    if !record.is_due(now) {
        return Err(rejected(record, "fire"));
    }
    let mut next = next_version(record, now);
    next.fire_seq += 1;
    next.status = MinionStatus::Running;
    next.claim = Some(Claim {
        fire_seq: next.fire_seq,
        pid,
        heartbeat_at: now,
    });
    next.last_run = Some(LastRun {
        fire_seq: next.fire_seq,
        started_at: now,
        ended_at: None,
        succeeded: None,
    });
    Ok(next)
}

/// Record a heartbeat from the worker holding fire `fire_seq`.
pub fn heartbeat(record: &MinionRecord, fire_seq: u64, now: DateTime<Utc>) -> ForemanResult<MinionRecord> {
    check_claim(record, fire_seq, "heartbeat")?;
    let mut next = next_version(record, now);
    if let Some(claim) = next.claim.as_mut() {
        claim.heartbeat_at = now;
    }
    Ok(next)
}

/// Heartbeat that also records the worker's process id on the claim.
pub fn attach(record: &MinionRecord, fire_seq: u64, pid: u32, now: DateTime<Utc>) -> ForemanResult<MinionRecord> {
    let mut next = heartbeat(record, fire_seq, now)?;
    if let Some(claim) = next.claim.as_mut() {
        claim.pid = Some(pid);
    }
    Ok(next)
}

/// `running -> completed | failed`, then back to `pending` when the schedule
/// allows another run inside the window.
///
/// A failed run still counts toward `max_runs`.
pub fn finish(
    record: &MinionRecord,
    fire_seq: u64,
    failure: Option<FailureDetail>,
    now: DateTime<Utc>,
) -> ForemanResult<MinionRecord> {
    check_claim(record, fire_seq, "finish")?;
    settle(record, failure, now)
}

/// Fail a running record whose worker stopped heart-beating for longer than
/// `timeout`. Returns `None` while the claim is still live.
pub fn expire(record: &MinionRecord, timeout: Duration, now: DateTime<Utc>) -> ForemanResult<Option<MinionRecord>> {
    if record.status != MinionStatus::Running {
        return Ok(None);
    }
    let last_seen = record
        .claim
        .as_ref()
        .map(|c| c.heartbeat_at)
        .unwrap_or(record.updated_at);
    if now - last_seen <= timeout {
        return Ok(None);
    }
    let failure = FailureDetail::new(
        ReasonCode::MinionLivenessTimeout,
        format!(
            "No heartbeat for {}s (limit {}s)",
            (now - last_seen).num_seconds(),
            timeout.num_seconds()
        ),
    );
    settle(record, Some(failure), now).map(Some)
}

/// Close out a pending record that can never fire again because its runs are
/// used up or its window has ended.
pub fn retire(record: &MinionRecord, now: DateTime<Utc>) -> Option<MinionRecord> {
    if record.status != MinionStatus::Pending {
        return None;
    }
    if record.has_runs_remaining() && !record.window.has_ended(now) && record.next_run.is_some() {
        return None;
    }
    let mut next = next_version(record, now);
    next.status = terminal_status(record.last_run.as_ref());
    next.next_run = None;
    Some(next)
}

/// `* -> killed`. The schedule and next fire time are cleared so the record
/// never becomes pending again. Killing a terminal record is a no-op.
pub fn kill(record: &MinionRecord, now: DateTime<Utc>) -> Option<MinionRecord> {
    if record.status.is_terminal() {
        return None;
    }
    let mut next = next_version(record, now);
    next.status = MinionStatus::Killed;
    next.schedule = None;
    next.next_run = None;
    next.claim = None;
    if let Some(run) = next.last_run.as_mut().filter(|r| r.ended_at.is_none()) {
        run.ended_at = Some(now);
        run.succeeded = Some(false);
    }
    Some(next)
}

fn check_claim(record: &MinionRecord, fire_seq: u64, event: &str) -> ForemanResult<()> {
    if record.status != MinionStatus::Running {
        return Err(rejected(record, event));
    }
    match &record.claim {
        Some(claim) if claim.fire_seq == fire_seq => Ok(()),
        _ => Err(ForemanError::ClaimConflict(record.id.clone())),
    }
}

fn settle(record: &MinionRecord, failure: Option<FailureDetail>, now: DateTime<Utc>) -> ForemanResult<MinionRecord> {
    let mut next = next_version(record, now);
    next.run_count += 1;
    next.claim = None;
    if let Some(run) = next.last_run.as_mut() {
        run.ended_at = Some(now);
        run.succeeded = Some(failure.is_none());
    }
    if failure.is_some() {
        next.last_error = failure;
    }

    let next_fire = match &record.schedule {
        Some(recurrence) => recurrence.next_after(now)?,
        None => None,
    };
    let rearm = next_fire.filter(|t| next.has_runs_remaining() && !next.window.has_ended(*t));
    match rearm {
        Some(at) => {
            next.status = MinionStatus::Pending;
            next.next_run = Some(at);
        }
        None => {
            next.status = terminal_status(next.last_run.as_ref());
            next.next_run = None;
        }
    }
    Ok(next)
}

fn terminal_status(last_run: Option<&LastRun>) -> MinionStatus {
    match last_run.and_then(|r| r.succeeded) {
        Some(false) => MinionStatus::Failed,
        _ => MinionStatus::Completed,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::record::{MinionSpec, Recurrence};

    fn every_5m(max_runs: Option<u32>) -> MinionRecord {
        let mut spec = MinionSpec::new("poll the queue").every(Recurrence::interval("5m").unwrap());
        spec.max_runs = max_runs;
        MinionRecord::new(spec, Utc::now()).unwrap()
    }

    #[test]
    fn test_fire_claims_next_sequence() {
        let m = every_5m(None);
        let now = Utc::now();
        let fired = fire(&m, now, Some(42)).unwrap();
        assert_eq!(fired.status, MinionStatus::Running);
        assert_eq!(fired.version, m.version + 1);
        assert_eq!(fired.fire_seq, 1);
        assert_eq!(fired.claim.as_ref().unwrap().pid, Some(42));
        assert!(fire(&fired, now, None).is_err());
    }

    #[test]
    fn test_not_due_before_next_run() {
        let m = every_5m(None);
        let early = m.next_run.unwrap() - Duration::seconds(1);
        assert!(matches!(
            fire(&m, early, None),
            Err(ForemanError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_success_rearms_interval() {
        let m = every_5m(None);
        let now = Utc::now();
        let done = finish(&fire(&m, now, None).unwrap(), 1, None, now).unwrap();
        assert_eq!(done.status, MinionStatus::Pending);
        assert_eq!(done.run_count, 1);
        assert_eq!(done.next_run, Some(now + Duration::minutes(5)));
        assert!(done.claim.is_none());
        assert_eq!(done.last_run.as_ref().unwrap().succeeded, Some(true));
    }

    #[test]
    fn test_failure_does_not_stop_the_schedule() {
        let m = every_5m(None);
        let now = Utc::now();
        let failure = FailureDetail::new(ReasonCode::StepExecutionFailed, "boom");
        let done = finish(&fire(&m, now, None).unwrap(), 1, Some(failure), now).unwrap();
        assert_eq!(done.status, MinionStatus::Pending);
        assert_eq!(done.last_error.as_ref().unwrap().message, "boom");
    }

    #[test]
    fn test_one_shot_ends_terminal() {
        let m = MinionRecord::new(MinionSpec::new("once"), Utc::now()).unwrap();
        let now = Utc::now();
        let ok = finish(&fire(&m, now, None).unwrap(), 1, None, now).unwrap();
        assert_eq!(ok.status, MinionStatus::Completed);
        assert!(ok.next_run.is_none());

        let failure = FailureDetail::new(ReasonCode::Timeout, "slow");
        let bad = finish(&fire(&m, now, None).unwrap(), 1, Some(failure), now).unwrap();
        assert_eq!(bad.status, MinionStatus::Failed);
    }

    #[test]
    fn test_max_runs_exhausted_completes() {
        let mut m = every_5m(Some(3));
        let mut now = Utc::now();
        for seq in 1..=3 {
            let fired = fire(&m, now, None).unwrap();
            m = finish(&fired, seq, None, now).unwrap();
            now += Duration::minutes(5);
        }
        assert_eq!(m.status, MinionStatus::Completed);
        assert_eq!(m.run_count, 3);
        assert!(m.next_run.is_none());
        assert!(fire(&m, now + Duration::minutes(5), None).is_err());
    }

    #[test]
    fn test_window_end_stops_rearm() {
        let now = Utc::now();
        let m = MinionRecord::new(
            MinionSpec::new("t")
                .every(Recurrence::interval("1h").unwrap())
                .window(None, Some(now + Duration::minutes(30))),
            now,
        )
        .unwrap();
        let done = finish(&fire(&m, now, None).unwrap(), 1, None, now).unwrap();
        assert_eq!(done.status, MinionStatus::Completed);
    }

    #[test]
    fn test_stale_worker_cannot_finish() {
        let m = every_5m(None);
        let now = Utc::now();
        let fired = fire(&m, now, None).unwrap();
        assert!(matches!(
            finish(&fired, 7, None, now),
            Err(ForemanError::ClaimConflict(_))
        ));
        assert!(heartbeat(&fired, 7, now).is_err());
        let beat = heartbeat(&fired, 1, now + Duration::seconds(10)).unwrap();
        assert_eq!(beat.claim.unwrap().heartbeat_at, now + Duration::seconds(10));
    }

    #[test]
    fn test_kill_clears_schedule_and_is_idempotent() {
        let m = every_5m(None);
        let now = Utc::now();
        let running = fire(&m, now, None).unwrap();
        let killed = kill(&running, now).unwrap();
        assert_eq!(killed.status, MinionStatus::Killed);
        assert!(killed.schedule.is_none());
        assert!(killed.next_run.is_none());
        assert!(killed.claim.is_none());
        assert!(kill(&killed, now).is_none());
        assert!(fire(&killed, now + Duration::days(1), None).is_err());
        assert!(finish(&killed, 1, None, now).is_err());

        let once = MinionRecord::new(MinionSpec::new("x"), now).unwrap();
        let completed = finish(&fire(&once, now, None).unwrap(), 1, None, now).unwrap();
        assert_eq!(completed.status, MinionStatus::Completed);
        assert!(kill(&completed, now).is_none());
    }

    #[test]
    fn test_expire_silent_worker() {
        let m = every_5m(None);
        let now = Utc::now();
        let fired = fire(&m, now, None).unwrap();
        let limit = Duration::seconds(60);
        assert!(expire(&fired, limit, now + Duration::seconds(30)).unwrap().is_none());

        let expired = expire(&fired, limit, now + Duration::seconds(61)).unwrap().unwrap();
        assert_eq!(expired.status, MinionStatus::Pending);
        assert_eq!(expired.run_count, 1);
        assert_eq!(expired.last_error.unwrap().code, ReasonCode::MinionLivenessTimeout);
        assert_eq!(expired.last_run.unwrap().succeeded, Some(false));
    }

    #[test]
    fn test_retire_exhausted_pending() {
        let now = Utc::now();
        let mut m = every_5m(Some(1));
        assert!(retire(&m, now).is_none());
        m.run_count = 1;
        let retired = retire(&m, now).unwrap();
        assert_eq!(retired.status, MinionStatus::Completed);
        assert!(retired.next_run.is_none());
    }
}
