use crate::capability::{Capability, CapabilityDescriptor, CapabilityFailure, FailureKind};
use crate::resources::Resource;
use async_trait::async_trait;
use foreman_llm::{LlmClient, LlmRequest};
use rhai::{Dynamic, Engine, EvalAltResult, Position, Scope, AST};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Keywords a generated script may not use.
pub const DISALLOWED_SYMBOLS: &[&str] = &["eval", "import", "export"];

/// Entry point every capability script must define.
pub const ENTRY_POINT: &str = "run";

/// Host function through which scripts reach the language model.
pub const LLM_FUNCTION: &str = "llm_complete";

const TERMINATED_TIMEOUT: &str = "timeout";

const SCRIPT_LLM_SYSTEM: &str = "You are called from inside an automated capability. \
Answer the request directly and concisely, with no preamble.";

/// Resource limits applied to every script evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLimits {
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,
    #[serde(default = "default_max_collection")]
    pub max_array_size: usize,
    #[serde(default = "default_max_collection")]
    pub max_map_size: usize,
    #[serde(default = "default_max_call_levels")]
    pub max_call_levels: usize,
}

fn default_max_operations() -> u64 {
    1_000_000
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_max_string_size() -> usize {
    1_000_000
}
fn default_max_collection() -> usize {
    10_000
}
fn default_max_call_levels() -> usize {
    64
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            timeout_ms: default_timeout_ms(),
            max_string_size: default_max_string_size(),
            max_array_size: default_max_collection(),
            max_map_size: default_max_collection(),
            max_call_levels: default_max_call_levels(),
        }
    }
}

/// Model access handed to scripts that declare [`Resource::Llm`].
///
/// Scripts run on blocking threads, so calls are driven to completion on
/// the owning runtime through `handle`.
#[derive(Clone)]
pub struct ScriptLlm {
    client: LlmClient,
    handle: tokio::runtime::Handle,
}

impl ScriptLlm {
    pub fn new(client: LlmClient, handle: tokio::runtime::Handle) -> Self {
        Self { client, handle }
    }

    /// Bound to the runtime the caller is on.
    pub fn current(client: LlmClient) -> Self {
        Self::new(client, tokio::runtime::Handle::current())
    }

    fn complete(&self, system: &str, prompt: &str, deadline: Instant) -> Result<String, Box<EvalAltResult>> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(terminated());
        }
        let request = LlmRequest::new(system).user(prompt);
        let call = tokio::time::timeout(remaining, self.client.complete(&request));
        match self.handle.block_on(call) {
            Ok(Ok(response)) => Ok(response.content_text().to_string()),
            Ok(Err(e)) => Err(format!("{LLM_FUNCTION} failed: {e}").into()),
            Err(_) => Err(terminated()),
        }
    }
}

impl std::fmt::Debug for ScriptLlm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptLlm").finish_non_exhaustive()
    }
}

fn terminated() -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorTerminated(
        Dynamic::from(TERMINATED_TIMEOUT.to_string()),
        Position::NONE,
    ))
}

/// Sandboxed Rhai runtime for generated capabilities.
///
/// Scripts get no filesystem, network or module access. Each evaluation runs
/// on a fresh engine with operation, size and wall-clock limits, so a bad
/// script fails its own call and nothing else. Scripts allowed to use the
/// model additionally see `llm_complete(prompt)` and
/// `llm_complete(system, prompt)`, which count against the same wall clock.
#[derive(Debug, Clone, Default)]
pub struct ScriptRuntime {
    limits: SandboxLimits,
    llm: Option<ScriptLlm>,
}

impl ScriptRuntime {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits, llm: None }
    }

    pub fn with_llm(mut self, llm: ScriptLlm) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    fn engine(&self) -> Engine {
        let mut engine = Engine::new();

        engine.set_max_operations(self.limits.max_operations);
        engine.set_max_string_size(self.limits.max_string_size);
        engine.set_max_array_size(self.limits.max_array_size);
        engine.set_max_map_size(self.limits.max_map_size);
        engine.set_max_call_levels(self.limits.max_call_levels);
        engine.set_max_expr_depths(64, 64);

        engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
        for symbol in DISALLOWED_SYMBOLS {
            engine.disable_symbol(*symbol);
        }

        engine.on_print(|text| debug!(target: "foreman::script", "{text}"));
        engine.on_debug(|text, _source, pos| {
            debug!(target: "foreman::script", position = %pos, "{text}");
        });

        engine
    }

    fn register_llm(&self, engine: &mut Engine, deadline: Instant) {
        let llm = self.llm.clone();
        engine.register_fn(LLM_FUNCTION, move |prompt: &str| -> Result<String, Box<EvalAltResult>> {
            match &llm {
                Some(llm) => llm.complete(SCRIPT_LLM_SYSTEM, prompt, deadline),
                None => Err(format!("{LLM_FUNCTION}: no language model configured").into()),
            }
        });
        let llm = self.llm.clone();
        engine.register_fn(
            LLM_FUNCTION,
            move |system: &str, prompt: &str| -> Result<String, Box<EvalAltResult>> {
                match &llm {
                    Some(llm) => llm.complete(system, prompt, deadline),
                    None => Err(format!("{LLM_FUNCTION}: no language model configured").into()),
                }
            },
        );
    }

    /// Compile a script in an isolated engine.
    pub fn compile(&self, source: &str) -> Result<AST, String> {
        self.engine()
            .compile(source)
            .map_err(|e| format!("Compilation error: {e}"))
    }

    /// Call the script's `run(input)` function with a JSON input.
    pub fn call_run(
        &self,
        ast: &AST,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value, CapabilityFailure> {
        self.call(ast, input, false)
    }

    /// Like [`call_run`](Self::call_run), with `llm_complete` available.
    /// Must be called off the async runtime, as model calls block.
    pub fn call_run_with_llm(
        &self,
        ast: &AST,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value, CapabilityFailure> {
        self.call(ast, input, true)
    }

    fn call(
        &self,
        ast: &AST,
        input: &serde_json::Value,
        allow_llm: bool,
    ) -> Result<serde_json::Value, CapabilityFailure> {
        let mut engine = self.engine();
        let started = Instant::now();
        let timeout = Duration::from_millis(self.limits.timeout_ms);
        if allow_llm {
            self.register_llm(&mut engine, started + timeout);
        }
        engine.on_progress(move |_| {
            if started.elapsed() > timeout {
                Some(Dynamic::from(TERMINATED_TIMEOUT.to_string()))
            } else {
                None
            }
        });

        let arg = rhai::serde::to_dynamic(input).map_err(|e| {
            CapabilityFailure::invalid_input(format!("input is not representable: {e}"))
        })?;

        let result = engine.call_fn::<Dynamic>(&mut Scope::new(), ast, ENTRY_POINT, (arg,));
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Script call finished");

        match result {
            Ok(value) => rhai::serde::from_dynamic::<serde_json::Value>(&value).map_err(|e| {
                CapabilityFailure::new(
                    FailureKind::InvalidOutput,
                    format!("result is not JSON-representable: {e}"),
                )
            }),
            Err(err) => Err(classify(*err, timeout)),
        }
    }
}

fn classify(err: EvalAltResult, timeout: Duration) -> CapabilityFailure {
    match root_cause(&err) {
        EvalAltResult::ErrorTerminated(reason, _) => {
            warn!(reason = %reason, "Script terminated");
            CapabilityFailure::new(
                FailureKind::Timeout,
                format!("script exceeded {}ms", timeout.as_millis()),
            )
        }
        EvalAltResult::ErrorTooManyOperations(_) => {
            CapabilityFailure::runtime("script exceeded its operation budget")
        }
        _ => CapabilityFailure::runtime(format!("Runtime error: {err}")),
    }
}

/// Errors raised inside `run` arrive wrapped once per script call frame.
fn root_cause(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => root_cause(inner),
        other => other,
    }
}

/// Hex-encoded SHA-256 of a script's source.
pub fn source_digest(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

/// A capability backed by a compiled script.
pub struct ScriptCapability {
    descriptor: CapabilityDescriptor,
    ast: Arc<AST>,
    runtime: Arc<ScriptRuntime>,
    uses_llm: bool,
}

impl ScriptCapability {
    /// Model access is only wired in when the descriptor declares
    /// [`Resource::Llm`], which the registry checks against its grant.
    pub fn new(descriptor: CapabilityDescriptor, ast: AST, runtime: Arc<ScriptRuntime>) -> Self {
        let uses_llm = descriptor.resources.contains(&Resource::Llm);
        Self {
            descriptor,
            ast: Arc::new(ast),
            runtime,
            uses_llm,
        }
    }
}

#[async_trait]
impl Capability for ScriptCapability {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn invoke(
        &self,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, CapabilityFailure> {
        let ast = self.ast.clone();
        let runtime = self.runtime.clone();
        let uses_llm = self.uses_llm;
        tokio::task::spawn_blocking(move || runtime.call(&ast, &input, uses_llm))
            .await
            .map_err(|e| CapabilityFailure::runtime(format!("script task aborted: {e}")))?
    }
}
