//! `foreman` command-line entry point.

mod config;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use config::{ForemanConfig, LLM_COMMAND_ENV};
use foreman_builtins::{register_builtins, WorkspaceRoot};
use foreman_core::text::truncate_chars;
use foreman_llm::LlmClient;
use foreman_memory::{ContextAssembler, LearningStore, ProjectFacts, SessionStore};
use foreman_minion::{
    MinionRunner, MinionSpec, MinionStore, ProcessLauncher, Recurrence, Scheduler,
};
use foreman_orchestrator::{
    Executor, LearningsExtractor, Orchestrator, Planner, RunEvent, RunStatus, Task,
    TimeEstimator,
};
use foreman_skills::{
    CapabilityBuilder, CapabilityLoader, CapabilityRegistry, CapabilityStore, ScriptLlm,
    ScriptRuntime, ScriptValidator,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "foreman", about = "Foreman: plans, builds and runs tasks with reusable capabilities")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "foreman.toml", global = true)]
    config: PathBuf,

    /// Workspace directory (overrides config)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and execute a task
    Run {
        /// What to do, in plain language
        task: String,
        /// Structured hint as key=value (value parsed as JSON when possible)
        #[arg(long = "hint", value_parser = parse_hint)]
        hints: Vec<(String, Value)>,
        /// Maximum concurrent steps (overrides config)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Manage background minions
    Minion {
        #[command(subcommand)]
        action: MinionAction,
    },
    /// Fire due minions and fail silent ones
    Scheduler {
        /// Poll once and exit
        #[arg(long)]
        once: bool,
    },
    /// Inspect capabilities
    Skills {
        #[command(subcommand)]
        action: ListAction,
    },
    /// Inspect recorded learnings
    Learnings {
        /// Only this topic
        #[arg(long)]
        topic: Option<String>,
    },
    /// Inspect past sessions
    Sessions {
        /// How many to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Show one session's summary and transcript
        #[arg(long)]
        show: Option<String>,
    },
}

#[derive(Subcommand)]
enum ListAction {
    /// List registered capabilities
    List,
}

#[derive(Subcommand)]
enum MinionAction {
    /// Create a minion
    Create {
        /// Task the minion runs
        task: String,
        /// Repeat interval, e.g. 30s, 5m, 1h, 2d
        #[arg(long, conflicts_with = "cron")]
        every: Option<String>,
        /// Cron expression (5, 6 or 7 fields)
        #[arg(long)]
        cron: Option<String>,
        /// Do not fire before this time (RFC 3339 or YYYY-MM-DDTHH:MM[:SS], UTC)
        #[arg(long, value_parser = parse_time)]
        start: Option<DateTime<Utc>>,
        /// Do not fire after this time
        #[arg(long, value_parser = parse_time)]
        end: Option<DateTime<Utc>>,
        /// Stop after this many runs
        #[arg(long)]
        max_runs: Option<u32>,
        /// Working directory for the runs
        #[arg(long)]
        folder: Option<PathBuf>,
    },
    /// List minions
    List,
    /// Kill a minion
    Kill {
        id: String,
        /// Also move its directory to the archive
        #[arg(long)]
        purge: bool,
    },
    /// Execute one claimed fire of a minion (started by the scheduler)
    Run {
        id: String,
        #[arg(long)]
        fire: u64,
    },
}

fn parse_hint(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(t.and_utc());
        }
    }
    Err(format!("invalid time '{raw}'"))
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = ForemanConfig::load(&cli.config)
        .await?
        .apply_env(std::env::var(LLM_COMMAND_ENV).ok());
    if let Some(ws) = &cli.workspace {
        config.workspace = ws.clone();
    }
    init_logging(cli.json_logs || config.log_json);

    let config_dir = cli
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    match cli.command {
        Commands::Run {
            task,
            hints,
            workers,
        } => {
            if let Some(workers) = workers {
                config.executor.max_workers = workers.max(1);
            }
            let mut task = Task::new(task);
            for (key, value) in hints {
                task = task.with_hint(key, value);
            }
            let orchestrator =
                build_orchestrator(&config, &config_dir, config.sessions_dir(), &std::env::current_dir()?)
                    .await?;
            run_task(orchestrator, task).await
        }
        Commands::Minion { action } => minion_command(&config, &config_dir, action).await,
        Commands::Scheduler { once } => {
            let store = Arc::new(minion_store(&config).await?);
            let launcher = ProcessLauncher::current_exe(config.minions_dir())?
                .with_config(std::path::absolute(&cli.config)?)
                .with_workspace(std::path::absolute(&config.workspace)?);
            let scheduler = Scheduler::new(store, Arc::new(launcher), config.minion.clone());
            if once {
                let report = scheduler.poll_once(Utc::now()).await?;
                for (id, seq) in &report.fired {
                    println!("fired {id} (#{seq})");
                }
                for id in &report.expired {
                    println!("expired {id}");
                }
                for id in &report.retired {
                    println!("retired {id}");
                }
                Ok(())
            } else {
                let cancel = cancel_on_ctrl_c();
                scheduler.run(cancel).await?;
                Ok(())
            }
        }
        Commands::Skills {
            action: ListAction::List,
        } => {
            let (registry, _) = build_registry(&config, &config_dir, &std::env::current_dir()?, None).await?;
            for d in registry.list() {
                println!(
                    "{:<24} v{:<3} {:<10} {}",
                    d.name,
                    d.version,
                    format!("{:?}", d.provenance).to_lowercase(),
                    d.description
                );
            }
            Ok(())
        }
        Commands::Learnings { topic } => {
            let store = LearningStore::new(config.learnings_dir()).await?;
            let learnings = match topic {
                Some(topic) => store.by_topic(&topic).await?,
                None => store.all().await?,
            };
            if learnings.is_empty() {
                println!("No learnings recorded.");
            }
            for l in learnings {
                println!("[{}] {}", l.topic, l.insight);
            }
            Ok(())
        }
        Commands::Sessions { limit, show } => {
            let store = SessionStore::new(config.sessions_dir()).await?;
            match show {
                Some(id) => {
                    let detail = store
                        .get(&id)
                        .await?
                        .with_context(|| format!("session '{id}' not found"))?;
                    println!("{} [{:?}] {}", detail.meta.id, detail.meta.status, detail.meta.task);
                    for entry in store.transcript(&id).await? {
                        println!("  {}", serde_json::to_string(&entry)?);
                    }
                    if let Some(summary) = detail.summary {
                        println!("\n{summary}");
                    }
                }
                None => {
                    for meta in store.list(limit).await? {
                        println!(
                            "{}  {:<9} {}  {}",
                            meta.id,
                            format!("{:?}", meta.status).to_lowercase(),
                            meta.started_at.format("%Y-%m-%d %H:%M"),
                            truncate_chars(&meta.task, 60)
                        );
                    }
                }
            }
            Ok(())
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            token.cancel();
        }
    });
    cancel
}

async fn minion_store(config: &ForemanConfig) -> anyhow::Result<MinionStore> {
    Ok(MinionStore::new(config.minions_dir())
        .await?
        .with_lock_stale(config.minion.lock_stale()))
}

async fn minion_command(
    config: &ForemanConfig,
    config_dir: &Path,
    action: MinionAction,
) -> anyhow::Result<()> {
    let store = Arc::new(minion_store(config).await?);
    match action {
        MinionAction::Create {
            task,
            every,
            cron,
            start,
            end,
            max_runs,
            folder,
        } => {
            let mut spec = MinionSpec::new(task).window(start, end);
            spec.max_runs = max_runs;
            spec.folder = folder;
            spec.schedule = match (every, cron) {
                (Some(every), _) => Some(Recurrence::interval(&every)?),
                (None, Some(cron)) => Some(Recurrence::cron(&cron)?),
                (None, None) => None,
            };
            let record = store.create(spec).await?;
            println!("Created minion {} ({})", record.id, record.schedule_label());
            if let Some(next) = record.next_run {
                println!("First run at {}", next.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
        MinionAction::List => {
            let records = store.list().await?;
            if records.is_empty() {
                println!("No minions.");
            }
            for r in records {
                let next = r
                    .next_run
                    .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
                println!(
                    "{}  {:<40}  {:<9}  {:>7}  {:<16}  {}",
                    r.id,
                    truncate_chars(&r.task, 40),
                    r.status.to_string(),
                    r.runs_label(),
                    r.schedule_label(),
                    next
                );
            }
        }
        MinionAction::Kill { id, purge } => {
            if purge {
                let archived = store.purge(&id).await?;
                println!("Killed {id} and archived it to {}", archived.display());
            } else {
                let record = store.kill(&id).await?;
                println!("{id} is {}", record.status);
            }
        }
        MinionAction::Run { id, fire } => {
            let record = store.get(&id).await?;
            let project = match &record.folder {
                Some(folder) => folder.clone(),
                None => std::env::current_dir()?,
            };
            let orchestrator = build_orchestrator(config, config_dir, store.sessions_dir(&id), &project).await?;
            let runner = MinionRunner::new(store.clone(), config.minion.clone());
            let finished = runner.run(&id, fire, &orchestrator).await?;
            println!("{id} is {} ({} runs)", finished.status, finished.runs_label());
        }
    }
    Ok(())
}

/// Registry with builtins, stored generated capabilities and configured scripts.
/// With `llm`, scripts declaring the `llm` resource may call the model.
async fn build_registry(
    config: &ForemanConfig,
    config_dir: &Path,
    project: &Path,
    llm: Option<LlmClient>,
) -> anyhow::Result<(Arc<CapabilityRegistry>, Arc<ScriptRuntime>)> {
    let registry = Arc::new(CapabilityRegistry::with_grant(config.grant()));
    let builtins = register_builtins(&registry, WorkspaceRoot::new(project))?;
    info!(count = builtins, "Built-in capabilities registered");

    let mut runtime = ScriptRuntime::new(config.sandbox.clone());
    if let Some(llm) = llm {
        runtime = runtime.with_llm(ScriptLlm::current(llm));
    }
    let runtime = Arc::new(runtime);
    let loader = CapabilityLoader::new(ScriptValidator::new(runtime.clone()));
    loader
        .load_store(&CapabilityStore::new(config.capabilities_dir()), &registry)
        .await?;
    if !config.capabilities.is_empty() {
        let loaded = loader.load_configured(&config.capabilities, config_dir, &registry);
        info!(count = loaded, "Configured capabilities loaded");
    }
    Ok((registry, runtime))
}

async fn build_orchestrator(
    config: &ForemanConfig,
    config_dir: &Path,
    sessions_dir: PathBuf,
    project: &Path,
) -> anyhow::Result<Orchestrator> {
    let llm = LlmClient::new(config.model()?);
    let (registry, runtime) = build_registry(config, config_dir, project, Some(llm.clone())).await?;

    let builder = CapabilityBuilder::new(registry.clone(), llm.clone(), ScriptValidator::new(runtime))
        .with_store(CapabilityStore::new(config.capabilities_dir()))
        .with_config(config.builder.clone());
    let executor = Executor::new(registry.clone(), config.executor.clone()).with_builder(Arc::new(builder));
    let planner = Planner::new(llm.clone(), registry).with_config(config.planner.clone());

    let sessions = Arc::new(SessionStore::new(sessions_dir).await?);
    let learnings = Arc::new(LearningStore::new(config.learnings_dir()).await?);
    let assembler = ContextAssembler::new(config.memory.clone())
        .with_sessions(sessions.clone())
        .with_learnings(learnings.clone())
        .with_facts(ProjectFacts::new(config.context_dir()));

    let estimates = config.estimates_path();
    let estimator = Arc::new(TimeEstimator::load(&estimates).await);

    Ok(Orchestrator::new(planner, executor)
        .with_context(assembler)
        .with_sessions(sessions)
        .with_extractor(LearningsExtractor::new(learnings).with_llm(llm))
        .with_estimator(estimator, Some(estimates)))
}

async fn run_task(orchestrator: Orchestrator, task: Task) -> anyhow::Result<()> {
    let mut events = orchestrator.events().subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if !matches!(event, RunEvent::Finished { .. }) {
                        println!("{}", event.line());
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event printer fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let result = orchestrator.run(task, cancel_on_ctrl_c()).await;
    drop(orchestrator);
    if let Err(e) = printer.await {
        warn!(error = %e, "Event printer stopped");
    }

    let outcome = result?;
    println!("\n{}", outcome.report.summary);
    for learning in &outcome.learnings {
        println!("learned [{}] {}", learning.topic, learning.insight);
    }
    match outcome.report.status {
        RunStatus::Succeeded | RunStatus::Partial => Ok(()),
        status => anyhow::bail!("run {status}"),
    }
}
