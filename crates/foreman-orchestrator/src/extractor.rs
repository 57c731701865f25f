use crate::types::{ExecutionReport, Plan, StepStatus, Task};
use foreman_llm::{LlmClient, LlmRequest};
use foreman_memory::{Learning, LearningStore};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

const EXTRACT_PROMPT: &str = "\
Read the report of a finished task run and write down what is worth \
remembering for future runs. Answer with a JSON array only, each item of the \
form {\"topic\": \"short_snake_case_topic\", \"insight\": \"one to three \
sentences\"}. Answer [] when nothing is worth keeping.";

#[derive(Debug, Deserialize)]
struct Candidate {
    topic: String,
    #[serde(alias = "content")]
    insight: String,
}

/// Derives learnings from finished runs and stores the new ones.
pub struct LearningsExtractor {
    llm: Option<LlmClient>,
    store: Arc<LearningStore>,
}

impl LearningsExtractor {
    pub fn new(store: Arc<LearningStore>) -> Self {
        Self { llm: None, store }
    }

    /// Also ask the model for insights, not only failure notes.
    pub fn with_llm(mut self, llm: LlmClient) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Extract and record learnings for a finished run. Returns the learnings
    /// that were new. Never fails: problems are logged and skipped.
    pub async fn extract(&self, task: &Task, plan: &Plan, report: &ExecutionReport) -> Vec<Learning> {
        if !report.is_complete(plan) {
            warn!(plan = %plan.id(), "Trace incomplete, skipping learning extraction");
            return Vec::new();
        }

        let mut candidates = self.ask_model(report).await;
        candidates.extend(failure_notes(report));

        let mut recorded = Vec::new();
        for candidate in candidates {
            if candidate.topic.trim().is_empty() || candidate.insight.trim().is_empty() {
                continue;
            }
            let learning = Learning::new(candidate.topic.trim(), candidate.insight.trim())
                .from_task(task.id.to_string());
            match self.store.record(learning.clone()).await {
                Ok(true) => recorded.push(learning),
                Ok(false) => {}
                Err(e) => warn!(topic = %learning.topic, error = %e, "Could not record learning"),
            }
        }
        info!(task = %task.id, recorded = recorded.len(), "Learning extraction finished");
        recorded
    }

    async fn ask_model(&self, report: &ExecutionReport) -> Vec<Candidate> {
        let Some(llm) = &self.llm else {
            return Vec::new();
        };
        let mut request = LlmRequest::new(EXTRACT_PROMPT).user(report.summary.clone());
        request.max_tokens = Some(2_048);

        match llm.complete(&request).await {
            Ok(response) => match parse_candidates(response.content_text()) {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!(error = %e, "Model learnings were not a JSON array");
                    Vec::new()
                }
            },
            Err(e) => {
                warn!(error = %e, "Learning extraction request failed");
                Vec::new()
            }
        }
    }
}

/// One note per failed step, keyed by the capability that failed.
fn failure_notes(report: &ExecutionReport) -> Vec<Candidate> {
    report
        .trace
        .iter()
        .filter(|r| r.status == StepStatus::Failed)
        .filter_map(|r| {
            let failure = r.failure.as_ref()?;
            Some(Candidate {
                topic: r.capability.clone(),
                insight: format!(
                    "{} failed with {}: {}",
                    r.capability, failure.code, failure.message
                ),
            })
        })
        .collect()
}

/// JSON array of candidates, optionally wrapped in a Markdown fence.
fn parse_candidates(text: &str) -> Result<Vec<Candidate>, serde_json::Error> {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```") {
        body = rest.split_once('\n').map_or("", |(_, after)| after);
        body = body.rsplit_once("```").map_or(body, |(before, _)| before).trim();
    }
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let items: Vec<serde_json::Value> = serde_json::from_str(body)?;
    // Items missing a field are dropped rather than failing the batch.
    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<Candidate>(item) {
            Ok(c) => Some(c),
            Err(e) => {
                debug!(error = %e, "Skipping malformed learning");
                None
            }
        })
        .collect())
}
