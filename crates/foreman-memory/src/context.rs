use crate::facts::ProjectFacts;
use crate::learnings::LearningStore;
use crate::session::SessionStore;
use foreman_core::text::{overlap_score, truncate_chars};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a snippet came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnippetSource {
    Session,
    Learning,
    ProjectFact,
}

/// One piece of recalled context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    pub source: SnippetSource,
    pub label: String,
    pub content: String,
    /// Relevance to the task in `[0.0, 1.0]`.
    pub relevance: f32,
}

/// Bounded, relevance-ordered context for a single task. Built fresh for
/// each task and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryContext {
    snippets: Vec<Snippet>,
}

impl MemoryContext {
    pub fn snippets(&self) -> &[Snippet] {
        &self.snippets
    }

    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }

    /// Characters of snippet content held.
    pub fn total_chars(&self) -> usize {
        self.snippets.iter().map(|s| s.content.chars().count()).sum()
    }

    /// Markdown for the planner prompt, one section per source.
    pub fn render(&self) -> String {
        let sections = [
            (SnippetSource::Session, "## Recent Activity"),
            (SnippetSource::Learning, "## Relevant Learnings"),
            (SnippetSource::ProjectFact, "## Project Facts"),
        ];
        let mut out = Vec::new();
        for (source, heading) in sections {
            let body: Vec<String> = self
                .snippets
                .iter()
                .filter(|s| s.source == source)
                .map(|s| format!("### {}\n{}", s.label, s.content))
                .collect();
            if !body.is_empty() {
                out.push(format!("{heading}\n{}", body.join("\n")));
            }
        }
        out.join("\n\n")
    }
}

/// Limits for context assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_learnings")]
    pub max_learnings: usize,
    #[serde(default = "default_summary_chars")]
    pub summary_chars: usize,
}

fn default_max_chars() -> usize {
    6_000
}
fn default_max_sessions() -> usize {
    3
}
fn default_max_learnings() -> usize {
    5
}
fn default_summary_chars() -> usize {
    300
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            max_sessions: default_max_sessions(),
            max_learnings: default_max_learnings(),
            summary_chars: default_summary_chars(),
        }
    }
}

/// Smallest remainder worth filling with a truncated snippet.
const MIN_TRUNCATED_CHARS: usize = 80;

/// Recent sessions always carry at least this relevance.
const RECENCY_FLOOR: f32 = 0.1;

/// Gathers session summaries, learnings and project facts for a task.
///
/// Every source is optional. A source that fails to read is logged and left
/// out; assembly itself never fails.
#[derive(Default)]
pub struct ContextAssembler {
    sessions: Option<Arc<SessionStore>>,
    learnings: Option<Arc<LearningStore>>,
    facts: Option<ProjectFacts>,
    config: ContextConfig,
}

impl ContextAssembler {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_learnings(mut self, learnings: Arc<LearningStore>) -> Self {
        self.learnings = Some(learnings);
        self
    }

    pub fn with_facts(mut self, facts: ProjectFacts) -> Self {
        self.facts = Some(facts);
        self
    }

    pub async fn assemble(&self, task: &str) -> MemoryContext {
        let mut candidates = Vec::new();

        if let Some(sessions) = &self.sessions {
            match sessions.recent_summaries(self.config.max_sessions).await {
                Ok(recent) => {
                    for (meta, summary) in recent {
                        let relevance = overlap_score(task, &format!("{} {summary}", meta.task))
                            .max(RECENCY_FLOOR);
                        candidates.push(Snippet {
                            source: SnippetSource::Session,
                            label: meta.task,
                            content: truncate_chars(summary.trim(), self.config.summary_chars),
                            relevance,
                        });
                    }
                }
                Err(e) => warn!(error = %e, "Could not read session summaries"),
            }
        }

        if let Some(learnings) = &self.learnings {
            match learnings.relevant(task, self.config.max_learnings).await {
                Ok(hits) => candidates.extend(hits.into_iter().map(|hit| Snippet {
                    source: SnippetSource::Learning,
                    label: hit.learning.topic,
                    content: hit.learning.insight,
                    relevance: hit.score,
                })),
                Err(e) => warn!(error = %e, "Could not read learnings"),
            }
        }

        if let Some(facts) = &self.facts {
            match facts.load().await {
                Ok(facts) => candidates.extend(facts.into_iter().map(|fact| {
                    let relevance = overlap_score(task, &fact.content);
                    Snippet {
                        source: SnippetSource::ProjectFact,
                        label: fact.name,
                        content: fact.content,
                        relevance,
                    }
                })),
                Err(e) => warn!(error = %e, "Could not read project facts"),
            }
        }

        let context = select(candidates, self.config.max_chars);
        debug!(
            snippets = context.snippets.len(),
            chars = context.total_chars(),
            "Assembled memory context"
        );
        context
    }
}

/// Highest relevance first (stable), within a character budget.
fn select(mut candidates: Vec<Snippet>, max_chars: usize) -> MemoryContext {
    candidates.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));

    let mut remaining = max_chars;
    let mut snippets = Vec::new();
    for mut snippet in candidates {
        let len = snippet.content.chars().count();
        if len <= remaining {
            remaining -= len;
            snippets.push(snippet);
        } else if remaining >= MIN_TRUNCATED_CHARS {
            snippet.content = truncate_chars(&snippet.content, remaining);
            remaining = 0;
            snippets.push(snippet);
        }
    }
    MemoryContext { snippets }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::learnings::Learning;

    fn snippet(source: SnippetSource, content: &str, relevance: f32) -> Snippet {
        Snippet {
            source,
            label: "l".into(),
            content: content.into(),
            relevance,
        }
    }

    #[test]
    fn test_select_orders_and_bounds() {
        let ctx = select(
            vec![
                snippet(SnippetSource::ProjectFact, &"f".repeat(50), 0.2),
                snippet(SnippetSource::Learning, &"l".repeat(50), 0.9),
                snippet(SnippetSource::Session, &"s".repeat(500), 0.5),
            ],
            200,
        );
        let sources: Vec<SnippetSource> = ctx.snippets().iter().map(|s| s.source).collect();
        assert_eq!(sources, vec![SnippetSource::Learning, SnippetSource::Session]);
        assert!(ctx.total_chars() <= 200);
        assert!(ctx.snippets()[1].content.ends_with("..."));
    }

    #[test]
    fn test_render_groups_by_source() {
        let ctx = select(
            vec![
                snippet(SnippetSource::Learning, "use metric", 0.9),
                snippet(SnippetSource::Session, "fetched weather", 0.5),
            ],
            1000,
        );
        let text = ctx.render();
        let recent = text.find("## Recent Activity").unwrap();
        let learned = text.find("## Relevant Learnings").unwrap();
        assert!(recent < learned);
        assert!(!text.contains("## Project Facts"));
    }

    #[tokio::test]
    async fn test_assemble_from_all_sources() {
        let tmp = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::new(tmp.path().join("sessions")).await.unwrap());
        let id = sessions.start("weather for Lima").await.unwrap();
        sessions.complete(&id, "Reported weather for Lima").await.unwrap();

        let learnings = Arc::new(LearningStore::new(tmp.path().join("learnings")).await.unwrap());
        learnings
            .record(Learning::new("weather", "The weather API wants ISO country codes"))
            .await
            .unwrap();

        std::fs::create_dir_all(tmp.path().join("context")).unwrap();
        std::fs::write(tmp.path().join("context/units.md"), "Weather is reported in Celsius").unwrap();

        let assembler = ContextAssembler::new(ContextConfig::default())
            .with_sessions(sessions)
            .with_learnings(learnings)
            .with_facts(ProjectFacts::new(tmp.path().join("context")));
        let ctx = assembler.assemble("weather in Lima").await;

        assert_eq!(ctx.snippets().len(), 3);
        assert!(ctx.render().contains("ISO country codes"));
    }

    #[tokio::test]
    async fn test_empty_assembler() {
        let ctx = ContextAssembler::default().assemble("anything").await;
        assert!(ctx.is_empty());
        assert_eq!(ctx.render(), "");
    }
}
