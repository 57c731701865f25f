use crate::capability::{
    CapabilityDescriptor, CapabilitySpec, Provenance, SourceArtifact, ValidationState,
};
use crate::registry::{CapabilityRegistry, RegisterMode};
use crate::script::{source_digest, ScriptCapability};
use crate::store::CapabilityStore;
use crate::resources::Resource;
use crate::validator::{uses_llm, ScriptValidator, ValidationError, ValidationStage};
use chrono::Utc;
use foreman_core::{FailureDetail, ForemanError, ForemanResult};
use foreman_llm::{LlmClient, LlmRequest};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;
use tracing::{info, warn};

const SYSTEM_PROMPT: &str = "You write small, self-contained Rhai scripts. \
The script must define exactly one entry point `fn run(input)` that receives an \
object map and returns an object map matching the requested output schema. \
There is no filesystem, network or module access; `eval`, `import` and `export` \
are forbidden. Reply with a single ```rhai fenced code block and nothing else.";

const LLM_HINT: &str = "\n\nWhen the task needs judgement or language understanding, the \
script may call `llm_complete(prompt)` or `llm_complete(system, prompt)`; both return \
the model's reply as a string.";

/// Builder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Extra attempts after the first failed candidate.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    2
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

/// Synthesizes, validates and registers capabilities the planner could not bind.
pub struct CapabilityBuilder {
    registry: Arc<CapabilityRegistry>,
    llm: LlmClient,
    validator: ScriptValidator,
    store: Option<CapabilityStore>,
    config: BuilderConfig,
}

impl CapabilityBuilder {
    pub fn new(registry: Arc<CapabilityRegistry>, llm: LlmClient, validator: ScriptValidator) -> Self {
        Self {
            registry,
            llm,
            validator,
            store: None,
            config: BuilderConfig::default(),
        }
    }

    /// Persist built capabilities (valid and rejected) under `store`.
    pub fn with_store(mut self, store: CapabilityStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_config(mut self, config: BuilderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Build `spec` and register the result.
    ///
    /// Holds the registry's per-name lock for the whole build. If a valid
    /// capability appears under the name while waiting for the lock, it is
    /// returned without asking the model.
    pub async fn build(&self, spec: &CapabilitySpec) -> ForemanResult<CapabilityDescriptor> {
        let lock = self.registry.name_lock(&spec.name);
        let _guard = lock.lock().await;

        if let Some(existing) = self.registry.descriptor(&spec.name) {
            if existing.is_valid() {
                info!(capability = %spec.name, "Capability already built");
                return Ok(existing);
            }
        }

        let attempts = self.config.max_retries + 1;
        let mut last: Option<(String, ValidationError)> = None;

        for attempt in 1..=attempts {
            info!(capability = %spec.name, attempt, "Building capability");
            let request = build_request(spec, last.as_ref(), self.validator.runtime().has_llm());
            let response = self.llm.complete(&request).await.map_err(|e| {
                ForemanError::CapabilityBuildFailed {
                    name: spec.name.clone(),
                    reason: e.to_string(),
                }
            })?;

            let Some(source) = extract_code(response.content_text()) else {
                let err = ValidationError::new(ValidationStage::Extract, "no code block in reply");
                warn!(capability = %spec.name, attempt, error = %err, "Rejected candidate");
                last = Some((response.content_text().to_string(), err));
                continue;
            };

            let validator = self.validator.clone();
            let candidate_spec = spec.clone();
            let candidate = source.clone();
            let checked = tokio::task::spawn_blocking(move || {
                validator.validate(&candidate, &candidate_spec)
            })
            .await
            .map_err(|e| ForemanError::Capability(format!("validation task aborted: {e}")))?;

            match checked {
                Ok(ast) => return self.admit(spec, source, ast).await,
                Err(err) => {
                    warn!(capability = %spec.name, attempt, error = %err, "Rejected candidate");
                    last = Some((source, err));
                }
            }
        }

        let reason = last
            .as_ref()
            .map(|(_, e)| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        if let Some((source, _)) = last {
            self.persist_rejected(spec, &source).await;
        }
        warn!(capability = %spec.name, attempts, reason = %reason, "Capability build failed");
        Err(ForemanError::CapabilityBuildFailed {
            name: spec.name.clone(),
            reason,
        })
    }

    async fn admit(
        &self,
        spec: &CapabilitySpec,
        source: String,
        ast: rhai::AST,
    ) -> ForemanResult<CapabilityDescriptor> {
        let path = match &self.store {
            Some(store) => Some(store.script_path(&spec.name)?),
            None => None,
        };
        let mut descriptor = generated_descriptor(spec, &source, ValidationState::Valid);
        descriptor.source = SourceArtifact::Script {
            path,
            sha256: source_digest(&source),
        };

        let capability = ScriptCapability::new(descriptor, ast, self.validator.runtime().clone());
        let registered = self
            .registry
            .register(Arc::new(capability), RegisterMode::Create)?;

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&registered, &source).await {
                warn!(capability = %spec.name, error = %e, "Failed to persist capability");
            }
        }
        info!(capability = %spec.name, sha256 = %source_digest(&source), "Capability built");
        Ok(registered)
    }

    async fn persist_rejected(&self, spec: &CapabilitySpec, source: &str) {
        let Some(store) = &self.store else { return };
        let descriptor = generated_descriptor(spec, source, ValidationState::Invalid);
        if let Err(e) = store.save_rejected(&descriptor, source).await {
            warn!(capability = %spec.name, error = %e, "Failed to persist rejected candidate");
        }
    }
}

fn generated_descriptor(
    spec: &CapabilitySpec,
    source: &str,
    validation: ValidationState,
) -> CapabilityDescriptor {
    CapabilityDescriptor {
        name: spec.name.clone(),
        description: spec.description.clone(),
        input_schema: spec.input_schema.clone(),
        output_schema: spec.output_schema.clone(),
        validation,
        source: SourceArtifact::Script {
            path: None,
            sha256: source_digest(source),
        },
        provenance: Provenance::Generated,
        version: 1,
        idempotent: spec.idempotent,
        resources: if uses_llm(source) { vec![Resource::Llm] } else { Vec::new() },
        created_at: Utc::now(),
    }
}

fn build_request(
    spec: &CapabilitySpec,
    last: Option<&(String, ValidationError)>,
    llm_available: bool,
) -> LlmRequest {
    let mut prompt = format!(
        "Write the capability `{}`.\n\nDescription: {}\n\nInput schema:\n{}\n\nOutput schema:\n{}",
        spec.name,
        spec.description,
        pretty(&spec.input_schema),
        pretty(&spec.output_schema),
    );
    if let Some(input) = &spec.smoke_input {
        prompt.push_str(&format!("\n\nExample input:\n{}", pretty(input)));
    }
    if let Some((source, err)) = last {
        prompt.push_str(&format!(
            "\n\nYour previous attempt was rejected ({err}).\nPrevious attempt:\n```rhai\n{source}\n```\nFix the problem."
        ));
    }
    let system = if llm_available {
        format!("{SYSTEM_PROMPT}{LLM_HINT}")
    } else {
        SYSTEM_PROMPT.to_string()
    };
    LlmRequest::new(system).user(prompt)
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn fence_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n(.*?)```").ok())
        .as_ref()
}

/// Pull script source out of a model reply: the first fenced block, or the
/// whole reply when it has no fence but defines `run`.
pub fn extract_code(reply: &str) -> Option<String> {
    if let Some(caps) = fence_pattern().and_then(|re| re.captures(reply)) {
        let code = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        return (!code.is_empty()).then(|| code.to_string());
    }
    let trimmed = reply.trim();
    trimmed.contains("fn run").then(|| trimmed.to_string())
}

type BuildOutcome = Result<CapabilityDescriptor, FailureDetail>;

/// One orchestration run's view of the builder.
///
/// Concurrent `ensure` calls for the same name share a single build and its
/// outcome, including a failure, for the lifetime of the session.
pub struct BuildSession {
    builder: Arc<CapabilityBuilder>,
    inflight: parking_lot::Mutex<HashMap<String, Arc<OnceCell<BuildOutcome>>>>,
}

impl BuildSession {
    pub fn new(builder: Arc<CapabilityBuilder>) -> Self {
        Self {
            builder,
            inflight: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// A valid descriptor for `spec.name`, building it at most once per session.
    pub async fn ensure(&self, spec: &CapabilitySpec) -> BuildOutcome {
        let cell = self
            .inflight
            .lock()
            .entry(spec.name.clone())
            .or_default()
            .clone();

        cell.get_or_init(|| async {
            match self.builder.registry().descriptor(&spec.name) {
                Some(d) if d.is_valid() => Ok(d),
                _ => self.builder.build(spec).await.map_err(|e| e.to_failure()),
            }
        })
        .await
        .clone()
    }
}
