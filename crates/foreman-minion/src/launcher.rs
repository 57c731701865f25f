use crate::record::MinionRecord;
use async_trait::async_trait;
use foreman_core::{ForemanError, ForemanResult};
use std::path::PathBuf;
use std::process::Stdio;
use tracing::info;

/// Starts the worker for a fired minion.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start running fire `fire_seq` of `record`. Returns once the worker has
    /// been started, not when it finishes.
    async fn launch(&self, record: &MinionRecord, fire_seq: u64) -> ForemanResult<()>;
}

/// Spawns `<program> [--config <file>] [--workspace <dir>] minion run <id> --fire <seq>` as a
/// detached process with its output appended to the minion's `worker.log`.
pub struct ProcessLauncher {
    program: PathBuf,
    config: Option<PathBuf>,
    workspace: Option<PathBuf>,
    minions_root: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, minions_root: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config: None,
            workspace: None,
            minions_root: minions_root.into(),
        }
    }

    /// Launch the current executable.
    pub fn current_exe(minions_root: impl Into<PathBuf>) -> ForemanResult<Self> {
        Ok(Self::new(std::env::current_exe()?, minions_root))
    }

    pub fn with_config(mut self, config: impl Into<PathBuf>) -> Self {
        self.config = Some(config.into());
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    fn args(&self, id: &str, fire_seq: u64) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.display().to_string());
        }
        if let Some(ws) = &self.workspace {
            args.push("--workspace".to_string());
            args.push(ws.display().to_string());
        }
        args.extend([
            "minion".to_string(),
            "run".to_string(),
            id.to_string(),
            "--fire".to_string(),
            fire_seq.to_string(),
        ]);
        args
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, record: &MinionRecord, fire_seq: u64) -> ForemanResult<()> {
        let dir = self.minions_root.join(&record.id);
        tokio::fs::create_dir_all(&dir).await?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("worker.log"))?;
        let err_log = log.try_clone()?;

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(self.args(&record.id, fire_seq))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log));
        if let Some(folder) = &record.folder {
            cmd.current_dir(folder);
        }
        let child = cmd.spawn().map_err(|e| {
            ForemanError::Minion(format!(
                "Failed to start worker {}: {e}",
                self.program.display()
            ))
        })?;
        info!(minion = %record.id, fire_seq, pid = ?child.id(), "Worker launched");
        Ok(())
    }
}
