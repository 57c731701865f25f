use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_LIVENESS_SECS: u64 = 30 * 86_400;

/// Timing knobs shared by the scheduler and the worker runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinionConfig {
    /// Seconds between scheduler polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// A running minion without a heartbeat for this long is failed.
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,
    /// Interval between worker heartbeats, in milliseconds.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Age after which a leftover `status.lock` is broken.
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_liveness_timeout_secs() -> u64 {
    300
}

fn default_heartbeat_ms() -> u64 {
    15_000
}

fn default_lock_stale_secs() -> u64 {
    30
}

impl Default for MinionConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
            heartbeat_ms: default_heartbeat_ms(),
            lock_stale_secs: default_lock_stale_secs(),
        }
    }
}

impl MinionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn liveness_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.liveness_timeout_secs.min(MAX_LIVENESS_SECS) as i64)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(1))
    }

    pub fn lock_stale(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }
}
