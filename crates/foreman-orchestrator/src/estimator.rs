use foreman_core::fs::write_atomic_async;
use foreman_core::{ForemanError, ForemanResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// Samples kept per capability.
const MAX_SAMPLES: usize = 50;

#[derive(Debug, Default, Serialize, Deserialize)]
struct History {
    #[serde(default)]
    durations: BTreeMap<String, Vec<f64>>,
}

/// Average historical duration per capability, used for plan ETAs.
#[derive(Debug, Default)]
pub struct TimeEstimator {
    history: Mutex<History>,
}

impl TimeEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load history from `path`. A missing or unreadable file starts empty.
    pub async fn load(path: &Path) -> Self {
        let history = match tokio::fs::read_to_string(path).await {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt duration history");
                History::default()
            }),
            Err(_) => History::default(),
        };
        Self {
            history: Mutex::new(history),
        }
    }

    pub async fn save(&self, path: &Path) -> ForemanResult<()> {
        let json = {
            let history = self.history.lock();
            serde_json::to_vec_pretty(&*history).map_err(ForemanError::from)?
        };
        write_atomic_async(path, json).await
    }

    pub fn record(&self, capability: &str, secs: f64) {
        if !secs.is_finite() || secs < 0.0 {
            return;
        }
        let mut history = self.history.lock();
        let samples = history.durations.entry(capability.to_string()).or_default();
        samples.push(secs);
        if samples.len() > MAX_SAMPLES {
            let excess = samples.len() - MAX_SAMPLES;
            samples.drain(..excess);
        }
    }

    pub fn estimate(&self, capability: &str) -> Option<f64> {
        let history = self.history.lock();
        let samples = history.durations.get(capability)?;
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    /// Sum of the known averages, or `None` when no capability has history.
    pub fn estimate_plan<'a>(&self, capabilities: impl IntoIterator<Item = &'a str>) -> Option<f64> {
        let known: Vec<f64> = capabilities
            .into_iter()
            .filter_map(|c| self.estimate(c))
            .collect();
        if known.is_empty() {
            None
        } else {
            Some(known.iter().sum())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_average_and_plan_sum() {
        let est = TimeEstimator::new();
        est.record("fetch", 2.0);
        est.record("fetch", 4.0);
        est.record("render", 1.0);
        assert_eq!(est.estimate("fetch"), Some(3.0));
        assert_eq!(est.estimate("unknown"), None);
        assert_eq!(est.estimate_plan(["fetch", "render", "unknown"]), Some(4.0));
        assert_eq!(est.estimate_plan(["unknown"]), None);
    }

    #[test]
    fn test_sample_window() {
        let est = TimeEstimator::new();
        for _ in 0..MAX_SAMPLES {
            est.record("x", 10.0);
        }
        est.record("x", 10.0 + MAX_SAMPLES as f64);
        let avg = est.estimate("x").unwrap();
        assert!(avg > 10.0);
        est.record("x", f64::NAN);
        assert_eq!(est.estimate("x"), Some(avg));
    }

    #[tokio::test]
    async fn test_persistence() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("durations.json");
        let est = TimeEstimator::load(&path).await;
        est.record("fetch", 1.5);
        est.save(&path).await.unwrap();

        let reloaded = TimeEstimator::load(&path).await;
        assert_eq!(reloaded.estimate("fetch"), Some(1.5));
    }
}
