use chrono::{DateTime, Duration, Utc};
use foreman_core::{FailureDetail, ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Lifecycle status of a minion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Killed,
}

impl MinionStatus {
    /// `completed`, `failed` and `killed` are final unless the schedule re-arms
    /// the record, which only happens inside the finishing transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MinionStatus::Completed | MinionStatus::Failed | MinionStatus::Killed
        )
    }
}

impl fmt::Display for MinionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MinionStatus::Pending => "pending",
            MinionStatus::Running => "running",
            MinionStatus::Completed => "completed",
            MinionStatus::Failed => "failed",
            MinionStatus::Killed => "killed",
        };
        f.write_str(s)
    }
}

/// How a minion repeats. A record without one runs once.
///
/// Interval and cron schedules are mutually exclusive on a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    Interval { every_secs: u64 },
    Cron { expr: String },
}

impl Recurrence {
    /// Parse an interval such as `30s`, `5m`, `1h` or `2d`.
    pub fn interval(spec: &str) -> ForemanResult<Self> {
        Ok(Recurrence::Interval {
            every_secs: parse_interval(spec)?,
        })
    }

    /// Parse a cron expression. Five-field expressions get a leading seconds
    /// field of `0`.
    pub fn cron(expr: &str) -> ForemanResult<Self> {
        let expr = normalize_cron(expr)?;
        parse_cron(&expr)?;
        Ok(Recurrence::Cron { expr })
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> ForemanResult<Option<DateTime<Utc>>> {
        match self {
            Recurrence::Interval { every_secs } => {
                let secs = i64::try_from(*every_secs).map_err(|_| {
                    ForemanError::Config(format!("Interval of {every_secs}s is too large"))
                })?;
                Ok(after.checked_add_signed(Duration::seconds(secs)))
            }
            Recurrence::Cron { expr } => Ok(parse_cron(expr)?.after(&after).next()),
        }
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recurrence::Interval { every_secs } => write!(f, "every {}", format_interval(*every_secs)),
            Recurrence::Cron { expr } => write!(f, "cron {expr}"),
        }
    }
}

/// Optional bounds on when a minion may fire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl Window {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| at >= s) && self.end.map_or(true, |e| at <= e)
    }

    /// Whether the window closed before `at`.
    pub fn has_ended(&self, at: DateTime<Utc>) -> bool {
        self.end.is_some_and(|e| at > e)
    }
}

/// Timestamps and outcome of the most recent fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRun {
    pub fire_seq: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// `None` while the run is in flight.
    #[serde(default)]
    pub succeeded: Option<bool>,
}

/// Ownership of a running fire by one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub fire_seq: u64,
    #[serde(default)]
    pub pid: Option<u32>,
    pub heartbeat_at: DateTime<Utc>,
}

/// The persisted state of one minion, stored as `status.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinionRecord {
    pub id: String,
    pub task: String,
    /// Working directory for the run, when it differs from the workspace.
    #[serde(default)]
    pub folder: Option<PathBuf>,
    #[serde(default)]
    pub schedule: Option<Recurrence>,
    #[serde(default)]
    pub window: Window,
    #[serde(default)]
    pub max_runs: Option<u32>,
    #[serde(default)]
    pub run_count: u32,
    pub status: MinionStatus,
    /// Increases by one on every fire.
    #[serde(default)]
    pub fire_seq: u64,
    #[serde(default)]
    pub last_run: Option<LastRun>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claim: Option<Claim>,
    #[serde(default)]
    pub last_error: Option<FailureDetail>,
    /// Bumped by every transition; compare-and-swap writes check it.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for a new minion.
#[derive(Debug, Clone, Default)]
pub struct MinionSpec {
    pub task: String,
    pub folder: Option<PathBuf>,
    pub schedule: Option<Recurrence>,
    pub window: Window,
    pub max_runs: Option<u32>,
}

impl MinionSpec {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    pub fn every(mut self, recurrence: Recurrence) -> Self {
        self.schedule = Some(recurrence);
        self
    }

    pub fn window(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.window = Window { start, end };
        self
    }

    pub fn max_runs(mut self, max: u32) -> Self {
        self.max_runs = Some(max);
        self
    }
}

impl MinionRecord {
    /// Build a pending record from `spec`, due at the window start or `now`.
    pub fn new(spec: MinionSpec, now: DateTime<Utc>) -> ForemanResult<Self> {
        if spec.task.trim().is_empty() {
            return Err(ForemanError::Minion("Minion task is empty".into()));
        }
        if let (Some(start), Some(end)) = (spec.window.start, spec.window.end) {
            if end <= start {
                return Err(ForemanError::Minion(format!(
                    "Window end {end} is not after start {start}"
                )));
            }
        }
        if spec.max_runs == Some(0) {
            return Err(ForemanError::Minion("max_runs must be at least 1".into()));
        }

        let earliest = spec.window.start.map_or(now, |s| s.max(now));
        let next_run = match &spec.schedule {
            Some(cron @ Recurrence::Cron { .. }) => {
                cron.next_after(earliest - Duration::seconds(1))?
            }
            _ => Some(earliest),
        };

        Ok(Self {
            id: make_id(),
            task: spec.task,
            folder: spec.folder,
            schedule: spec.schedule,
            window: spec.window,
            max_runs: spec.max_runs,
            run_count: 0,
            status: MinionStatus::Pending,
            fire_seq: 0,
            last_run: None,
            next_run,
            claim: None,
            last_error: None,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn has_runs_remaining(&self) -> bool {
        self.max_runs.map_or(true, |max| self.run_count < max)
    }

    /// Pending, past its next fire time, with runs left and inside the window.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == MinionStatus::Pending
            && self.next_run.is_some_and(|t| now >= t)
            && self.has_runs_remaining()
            && self.window.contains(now)
    }

    /// `"2/3"` or `"2"` when unlimited.
    pub fn runs_label(&self) -> String {
        match self.max_runs {
            Some(max) => format!("{}/{max}", self.run_count),
            None => self.run_count.to_string(),
        }
    }

    pub fn schedule_label(&self) -> String {
        self.schedule
            .as_ref()
            .map_or_else(|| "once".to_string(), ToString::to_string)
    }
}

/// Twelve lowercase hex characters.
pub fn make_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Seconds in an interval string: a positive integer followed by `s`, `m`,
/// `h` or `d`. A bare integer means seconds.
pub fn parse_interval(spec: &str) -> ForemanResult<u64> {
    let spec = spec.trim();
    let invalid = || ForemanError::Config(format!("Invalid interval '{spec}', expected e.g. 30s, 5m, 1h, 2d"));
    let (digits, unit) = match spec.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&spec[..i], c.to_ascii_lowercase()),
        Some(_) => (spec, 's'),
        None => return Err(invalid()),
    };
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    let scale = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3_600,
        'd' => 86_400,
        _ => return Err(invalid()),
    };
    match n.checked_mul(scale) {
        Some(secs) if secs > 0 => Ok(secs),
        _ => Err(invalid()),
    }
}

/// Largest whole unit, e.g. `300` -> `5m`.
pub fn format_interval(secs: u64) -> String {
    for (scale, unit) in [(86_400, 'd'), (3_600, 'h'), (60, 'm')] {
        if secs >= scale && secs % scale == 0 {
            return format!("{}{unit}", secs / scale);
        }
    }
    format!("{secs}s")
}

/// Bring a cron expression to the six- or seven-field form the `cron` crate
/// expects.
pub fn normalize_cron(expr: &str) -> ForemanResult<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 | 7 => Ok(fields.join(" ")),
        n => Err(ForemanError::Config(format!(
            "Cron expression '{expr}' has {n} fields, expected 5 to 7"
        ))),
    }
}

fn parse_cron(expr: &str) -> ForemanResult<cron::Schedule> {
    cron::Schedule::from_str(expr)
        .map_err(|e| ForemanError::Config(format!("Invalid cron expression '{expr}': {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_make_id() {
        let a = make_id();
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, make_id());
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("30s").unwrap(), 30);
        assert_eq!(parse_interval("5m").unwrap(), 300);
        assert_eq!(parse_interval("1h").unwrap(), 3_600);
        assert_eq!(parse_interval("2D").unwrap(), 172_800);
        assert_eq!(parse_interval("90").unwrap(), 90);
        for bad in ["", "m", "0m", "5w", "-3s", "five minutes"] {
            assert!(parse_interval(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_format_interval() {
        assert_eq!(format_interval(300), "5m");
        assert_eq!(format_interval(7_200), "2h");
        assert_eq!(format_interval(90), "90s");
        assert_eq!(format_interval(86_400), "1d");
    }

    #[test]
    fn test_cron_normalization() {
        assert_eq!(normalize_cron("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize_cron("0 0 * * * *").unwrap(), "0 0 * * * *");
        assert!(normalize_cron("* *").is_err());
        assert!(Recurrence::cron("not a cron at all").is_err());
    }

    #[test]
    fn test_next_after() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 2, 30).unwrap();
        let every = Recurrence::interval("5m").unwrap();
        assert_eq!(every.next_after(t).unwrap(), Some(t + Duration::minutes(5)));

        let cron = Recurrence::cron("*/5 * * * *").unwrap();
        assert_eq!(
            cron.next_after(t).unwrap(),
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 5, 0).unwrap())
        );
    }

    #[test]
    fn test_runs_remaining() {
        let now = Utc::now();
        let mut m = MinionRecord::new(MinionSpec::new("t"), now).unwrap();
        assert!(m.has_runs_remaining());
        m.max_runs = Some(3);
        m.run_count = 2;
        assert!(m.has_runs_remaining());
        m.run_count = 3;
        assert!(!m.has_runs_remaining());
        assert_eq!(m.runs_label(), "3/3");
    }

    #[test]
    fn test_window() {
        let now = Utc::now();
        let hour = Duration::hours(1);
        assert!(Window::default().contains(now));
        assert!(!Window { start: Some(now + hour), end: None }.contains(now));
        assert!(!Window { start: None, end: Some(now - hour) }.contains(now));
        assert!(Window { start: Some(now - hour), end: Some(now + hour) }.contains(now));
        assert!(Window { start: None, end: Some(now - hour) }.has_ended(now));
    }

    #[test]
    fn test_new_record_is_due_at_window_start() {
        let now = Utc::now();
        let start = now + Duration::hours(1);
        let m = MinionRecord::new(
            MinionSpec::new("check mail").every(Recurrence::interval("1h").unwrap()).window(Some(start), None),
            now,
        )
        .unwrap();
        assert_eq!(m.status, MinionStatus::Pending);
        assert_eq!(m.next_run, Some(start));
        assert!(!m.is_due(now));
        assert!(m.is_due(start));
        assert_eq!(m.schedule_label(), "every 1h");
    }

    #[test]
    fn test_new_record_rejects_bad_specs() {
        let now = Utc::now();
        assert!(MinionRecord::new(MinionSpec::new("  "), now).is_err());
        assert!(MinionRecord::new(MinionSpec::new("t").max_runs(0), now).is_err());
        assert!(MinionRecord::new(MinionSpec::new("t").window(Some(now), Some(now)), now).is_err());
    }

    #[test]
    fn test_status_json() {
        let m = MinionRecord::new(
            MinionSpec::new("check email").every(Recurrence::interval("1h").unwrap()),
            Utc::now(),
        )
        .unwrap();
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["schedule"]["kind"], "interval");
        assert_eq!(json["schedule"]["every_secs"], 3_600);
        let back: MinionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }
}
