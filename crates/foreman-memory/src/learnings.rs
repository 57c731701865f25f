use chrono::{DateTime, Utc};
use foreman_core::fs::{append_jsonl, read_jsonl};
use foreman_core::text::{jaccard, overlap_score, slugify};
use foreman_core::ForemanResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Default word-set similarity at or above which a learning is a duplicate.
pub const DEFAULT_DEDUP_THRESHOLD: f32 = 0.8;

const TOPIC_SLUG_WORDS: usize = 6;

/// A persisted insight derived from a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Learning {
    pub topic: String,
    pub insight: String,
    #[serde(default)]
    pub source_task: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Learning {
    pub fn new(topic: impl Into<String>, insight: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            insight: insight.into(),
            source_task: None,
            created_at: Utc::now(),
        }
    }

    pub fn from_task(mut self, task_id: impl Into<String>) -> Self {
        self.source_task = Some(task_id.into());
        self
    }
}

/// A learning with its relevance to a query.
#[derive(Debug, Clone)]
pub struct ScoredLearning {
    pub learning: Learning,
    pub score: f32,
}

/// Learnings on disk, one JSONL file per topic slug, in insertion order.
pub struct LearningStore {
    root: PathBuf,
    dedup_threshold: f32,
    write_lock: Mutex<()>,
}

impl LearningStore {
    pub async fn new(root: impl Into<PathBuf>) -> ForemanResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            dedup_threshold: DEFAULT_DEDUP_THRESHOLD,
            write_lock: Mutex::new(()),
        })
    }

    pub fn with_dedup_threshold(mut self, threshold: f32) -> Self {
        self.dedup_threshold = threshold;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File-name key for a topic.
    pub fn topic_slug(topic: &str) -> String {
        slugify(topic, TOPIC_SLUG_WORDS)
    }

    fn topic_path(&self, topic: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", Self::topic_slug(topic)))
    }

    /// Append `learning` unless a near-identical insight already exists under
    /// the same topic. Returns whether it was stored.
    pub async fn record(&self, learning: Learning) -> ForemanResult<bool> {
        let path = self.topic_path(&learning.topic);
        let _guard = self.write_lock.lock().await;

        let existing: Vec<Learning> = read_jsonl(&path).await?;
        if let Some(dup) = existing
            .iter()
            .find(|l| jaccard(&l.insight, &learning.insight) >= self.dedup_threshold)
        {
            debug!(topic = %learning.topic, existing = %dup.insight, "Skipping duplicate learning");
            return Ok(false);
        }

        append_jsonl(&path, &learning).await?;
        info!(topic = %learning.topic, "Recorded learning");
        Ok(true)
    }

    /// Learnings under `topic`, oldest first.
    pub async fn by_topic(&self, topic: &str) -> ForemanResult<Vec<Learning>> {
        read_jsonl(&self.topic_path(topic)).await
    }

    /// Every learning, grouped by topic slug in name order.
    pub async fn all(&self) -> ForemanResult<Vec<Learning>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "jsonl") {
                files.push(path);
            }
        }
        files.sort();

        let mut out = Vec::new();
        for file in files {
            out.extend(read_jsonl::<Learning>(&file).await?);
        }
        Ok(out)
    }

    /// Learnings sharing words with `query`, best first. Equal scores keep
    /// the newer learning first.
    pub async fn relevant(&self, query: &str, limit: usize) -> ForemanResult<Vec<ScoredLearning>> {
        let mut scored: Vec<ScoredLearning> = self
            .all()
            .await?
            .into_iter()
            .filter_map(|learning| {
                let text = format!("{} {}", learning.topic, learning.insight);
                let score = overlap_score(query, &text);
                (score > 0.0).then_some(ScoredLearning { learning, score })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.learning.created_at.cmp(&a.learning.created_at))
        });
        scored.truncate(limit);
        Ok(scored)
    }
}
