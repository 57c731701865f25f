use crate::transcript::{TranscriptEntry, TranscriptEvent};
use chrono::{DateTime, Utc};
use foreman_core::fs::{append_jsonl_line, read_jsonl, write_atomic_async};
use foreman_core::text::truncate_chars;
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

const INDEX_FILE: &str = "index.json";
const META_FILE: &str = "meta.json";
const TRANSCRIPT_FILE: &str = "transcript.jsonl";
const SUMMARY_FILE: &str = "summary.md";
const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

/// Per-session metadata, stored as `meta.json` and mirrored in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub task: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub summary_preview: Option<String>,
}

/// A session with its summary, when one was written.
#[derive(Debug, Clone)]
pub struct SessionDetail {
    pub meta: SessionMeta,
    pub summary: Option<String>,
}

/// File-backed session history:
///
/// ```text
/// <root>/index.json
/// <root>/<id>/meta.json
/// <root>/<id>/transcript.jsonl
/// <root>/<id>/summary.md
/// ```
pub struct SessionStore {
    root: PathBuf,
    index_lock: Mutex<()>,
}

impl SessionStore {
    pub async fn new(root: impl Into<PathBuf>) -> ForemanResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            index_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    async fn read_index(&self) -> ForemanResult<Vec<SessionMeta>> {
        let path = self.root.join(INDEX_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|e| ForemanError::Session(format!("Failed to parse session index: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_index(&self, index: &[SessionMeta]) -> ForemanResult<()> {
        let json = serde_json::to_vec_pretty(index)?;
        write_atomic_async(&self.root.join(INDEX_FILE), json).await
    }

    async fn write_meta(&self, meta: &SessionMeta) -> ForemanResult<()> {
        let json = serde_json::to_vec_pretty(meta)?;
        write_atomic_async(&self.session_dir(&meta.id).join(META_FILE), json).await
    }

    async fn read_meta(&self, id: &str) -> ForemanResult<Option<SessionMeta>> {
        match tokio::fs::read_to_string(self.session_dir(id).join(META_FILE)).await {
            Ok(data) => Ok(Some(serde_json::from_str(&data).map_err(|e| {
                ForemanError::Session(format!("Failed to parse session {id}: {e}"))
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Open a new running session for `task` and return its id.
    pub async fn start(&self, task: &str) -> ForemanResult<String> {
        let id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let meta = SessionMeta {
            id: id.clone(),
            task: task.to_string(),
            status: SessionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            summary_preview: None,
        };
        tokio::fs::create_dir_all(self.session_dir(&id)).await?;
        self.write_meta(&meta).await?;
        self.append(
            &id,
            TranscriptEvent::Task {
                content: task.to_string(),
            },
        )
        .await?;

        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        index.push(meta);
        self.write_index(&index).await?;

        info!(session = %id, "Session started");
        Ok(id)
    }

    /// Append an event to the transcript of a started session.
    pub async fn append(&self, id: &str, event: TranscriptEvent) -> ForemanResult<()> {
        let path = self.session_dir(id).join(TRANSCRIPT_FILE);
        append_jsonl_line(&path, &TranscriptEntry::now(event)).await?;
        debug!(session = %id, "Transcript entry appended");
        Ok(())
    }

    /// Mark a session completed and write its summary.
    pub async fn complete(&self, id: &str, summary: &str) -> ForemanResult<()> {
        write_atomic_async(
            &self.session_dir(id).join(SUMMARY_FILE),
            summary.as_bytes().to_vec(),
        )
        .await?;
        self.append(
            id,
            TranscriptEvent::Complete {
                summary: summary.to_string(),
            },
        )
        .await?;
        self.finish(id, SessionStatus::Completed, Some(truncate_chars(summary, PREVIEW_CHARS)))
            .await
    }

    /// Mark a session failed.
    pub async fn fail(&self, id: &str, error: &str) -> ForemanResult<()> {
        self.append(
            id,
            TranscriptEvent::Failed {
                error: error.to_string(),
            },
        )
        .await?;
        self.finish(id, SessionStatus::Failed, None).await
    }

    async fn finish(
        &self,
        id: &str,
        status: SessionStatus,
        preview: Option<String>,
    ) -> ForemanResult<()> {
        let now = Utc::now();
        let mut meta = self
            .read_meta(id)
            .await?
            .ok_or_else(|| ForemanError::Session(format!("Unknown session {id}")))?;
        meta.status = status;
        meta.completed_at = Some(now);
        meta.summary_preview = preview;
        self.write_meta(&meta).await?;

        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        match index.iter_mut().find(|m| m.id == id) {
            Some(entry) => *entry = meta,
            None => index.push(meta),
        }
        self.write_index(&index).await?;
        info!(session = %id, status = ?status, "Session finished");
        Ok(())
    }

    /// Most recent sessions first.
    pub async fn list(&self, limit: usize) -> ForemanResult<Vec<SessionMeta>> {
        let mut index = self.read_index().await?;
        index.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        index.truncate(limit);
        Ok(index)
    }

    pub async fn get(&self, id: &str) -> ForemanResult<Option<SessionDetail>> {
        let Some(meta) = self.read_meta(id).await? else {
            return Ok(None);
        };
        let summary = tokio::fs::read_to_string(self.session_dir(id).join(SUMMARY_FILE))
            .await
            .ok();
        Ok(Some(SessionDetail { meta, summary }))
    }

    pub async fn transcript(&self, id: &str) -> ForemanResult<Vec<TranscriptEntry>> {
        read_jsonl(&self.session_dir(id).join(TRANSCRIPT_FILE)).await
    }

    /// Summaries of the most recently completed sessions, newest first.
    pub async fn recent_summaries(&self, limit: usize) -> ForemanResult<Vec<(SessionMeta, String)>> {
        let mut completed: Vec<SessionMeta> = self
            .read_index()
            .await?
            .into_iter()
            .filter(|m| m.status == SessionStatus::Completed)
            .collect();
        completed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));

        let mut out = Vec::new();
        for meta in completed.into_iter().take(limit) {
            let path = self.session_dir(&meta.id).join(SUMMARY_FILE);
            if let Ok(summary) = tokio::fs::read_to_string(&path).await {
                out.push((meta, summary));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_session_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path()).await.unwrap();

        let id = store.start("collect weather").await.unwrap();
        assert_eq!(id.len(), 12);
        store.complete(&id, "Fetched weather for Lima.").await.unwrap();

        let detail = store.get(&id).await.unwrap().unwrap();
        assert_eq!(detail.meta.status, SessionStatus::Completed);
        assert!(detail.meta.completed_at.is_some());
        assert_eq!(detail.summary.as_deref(), Some("Fetched weather for Lima."));

        let transcript = store.transcript(&id).await.unwrap();
        assert_eq!(transcript.len(), 2);
        assert!(matches!(transcript[0].event, TranscriptEvent::Task { .. }));
        assert!(matches!(transcript[1].event, TranscriptEvent::Complete { .. }));
    }

    #[tokio::test]
    async fn test_append_needs_a_started_session() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path()).await.unwrap();
        let event = TranscriptEvent::Failed { error: "late".into() };
        assert!(store.append("gone", event).await.is_err());
        assert!(!store.session_dir("gone").exists());
    }

    #[tokio::test]
    async fn test_recent_summaries_only_completed() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path()).await.unwrap();

        let a = store.start("first").await.unwrap();
        store.complete(&a, "first done").await.unwrap();
        let b = store.start("second").await.unwrap();
        store.fail(&b, "boom").await.unwrap();
        let c = store.start("third").await.unwrap();
        store.complete(&c, "third done").await.unwrap();

        let recent = store.recent_summaries(3).await.unwrap();
        let texts: Vec<&str> = recent.iter().map(|(_, s)| s.as_str()).collect();
        assert_eq!(texts, vec!["third done", "first done"]);

        let listed = store.list(10).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].task, "third");
        assert_eq!(
            listed.iter().find(|m| m.id == b).unwrap().status,
            SessionStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path()).await.unwrap();
        assert!(store.get("missing").await.unwrap().is_none());
        assert!(store.complete("missing", "x").await.is_err());
    }
}
