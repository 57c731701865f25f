use foreman_llm::{LlmProvider, ModelConfig};
use foreman_memory::ContextConfig;
use foreman_minion::MinionConfig;
use foreman_orchestrator::{ExecutorConfig, PlannerConfig};
use foreman_skills::{BuilderConfig, Resource, ResourceGrant, SandboxLimits, ScriptConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming the LLM program, overriding `[llm]`.
pub const LLM_COMMAND_ENV: &str = "FOREMAN_LLM_COMMAND";

/// Contents of `foreman.toml`. Every section is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct ForemanConfig {
    /// Root of sessions, capabilities, learnings and minions.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    #[serde(default)]
    pub log_json: bool,
    #[serde(default)]
    pub llm: Option<ModelConfig>,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub builder: BuilderConfig,
    #[serde(default)]
    pub sandbox: SandboxLimits,
    #[serde(default)]
    pub memory: ContextConfig,
    #[serde(default)]
    pub minion: MinionConfig,
    /// Resources capabilities may touch. Unset grants everything.
    #[serde(default)]
    pub resources: Option<Vec<Resource>>,
    /// Hand-written scripts to load at startup.
    #[serde(default)]
    pub capabilities: Vec<ScriptConfig>,
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".foreman")
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            log_json: false,
            llm: None,
            planner: PlannerConfig::default(),
            executor: ExecutorConfig::default(),
            builder: BuilderConfig::default(),
            sandbox: SandboxLimits::default(),
            memory: ContextConfig::default(),
            minion: MinionConfig::default(),
            resources: None,
            capabilities: Vec::new(),
        }
    }
}

impl ForemanConfig {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read `path`, falling back to defaults when it does not exist.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::parse(&text)
                .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {e}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read config file '{}': {e}",
                path.display()
            )),
        }
    }

    /// Apply `FOREMAN_LLM_COMMAND` when set.
    pub fn apply_env(mut self, llm_command: Option<String>) -> Self {
        let Some(command) = llm_command.filter(|c| !c.trim().is_empty()) else {
            return self;
        };
        let program: Vec<String> = command.split_whitespace().map(String::from).collect();
        self.llm = Some(match self.llm.take() {
            Some(mut llm) => {
                llm.provider = LlmProvider::Command;
                llm.command = program;
                llm
            }
            None => ModelConfig::command(program),
        });
        self
    }

    pub fn model(&self) -> anyhow::Result<ModelConfig> {
        self.llm.clone().ok_or_else(|| {
            anyhow::anyhow!("No language model configured: add an [llm] section or set {LLM_COMMAND_ENV}")
        })
    }

    pub fn grant(&self) -> ResourceGrant {
        match &self.resources {
            None => ResourceGrant::allow_all(),
            Some(resources) => {
                let mut grant = ResourceGrant::new();
                for resource in resources {
                    grant.grant(resource.clone());
                }
                grant
            }
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.workspace.join("sessions")
    }

    pub fn capabilities_dir(&self) -> PathBuf {
        self.workspace.join("capabilities")
    }

    pub fn learnings_dir(&self) -> PathBuf {
        self.workspace.join("learnings")
    }

    pub fn context_dir(&self) -> PathBuf {
        self.workspace.join("context")
    }

    pub fn minions_dir(&self) -> PathBuf {
        self.workspace.join("minions")
    }

    pub fn estimates_path(&self) -> PathBuf {
        self.workspace.join("estimates.json")
    }
}
