//! Process spawning seam.
//!
//! [`ProcessSpawner`] is the adapter interface between the worker pool and
//! whatever agent binary actually runs tasks. [`AgentSpawner`] is the
//! production implementation: it launches the configured command with the
//! task's working directory, pipes all three stdio streams, writes the
//! prompt to stdin, and closes it so the agent starts processing.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::warn;

use foreman_db::{Error, Result};

/// A freshly spawned worker process with piped stdout/stderr.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub pid: u32,
    pub child: Child,
}

/// Adapter interface for launching agent subprocesses.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Spawn an agent for `task_id` with the given prompt.
    ///
    /// Implementations must pipe stdout and stderr so the pool can capture
    /// them, and should deliver the prompt before returning.
    async fn spawn(
        &self,
        prompt: &str,
        working_directory: Option<&Path>,
        task_id: &str,
    ) -> Result<SpawnedProcess>;
}

/// Spawner that runs a configured agent command.
#[derive(Debug, Clone)]
pub struct AgentSpawner {
    program: String,
    args: Vec<String>,
}

impl AgentSpawner {
    /// Create a spawner for `program` invoked with `args` before the
    /// prompt is written to its stdin.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl ProcessSpawner for AgentSpawner {
    async fn spawn(
        &self,
        prompt: &str,
        working_directory: Option<&Path>,
        task_id: &str,
    ) -> Result<SpawnedProcess> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("FOREMAN_TASK_ID", task_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // An agent must not outlive its pool record.
            .kill_on_drop(true);

        if let Some(dir) = working_directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::spawn_failed(format!(
                "failed to spawn agent binary '{}': {e}",
                self.program
            ))
            .with_ctx("task_id", task_id)
        })?;

        let pid = child
            .id()
            .ok_or_else(|| Error::spawn_failed("spawned process has no pid"))?;

        // The agent reads its prompt from stdin; closing the handle signals
        // end of input.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!(task_id, error = %e, "failed to write prompt to agent stdin");
            }
            drop(stdin);
        }

        Ok(SpawnedProcess { pid, child })
    }
}

/// Spawner used by tests: runs a shell script path as the agent binary.
#[derive(Debug, Clone)]
pub struct ScriptSpawner {
    script: PathBuf,
}

impl ScriptSpawner {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

#[async_trait]
impl ProcessSpawner for ScriptSpawner {
    async fn spawn(
        &self,
        prompt: &str,
        working_directory: Option<&Path>,
        task_id: &str,
    ) -> Result<SpawnedProcess> {
        AgentSpawner::new(self.script.display().to_string(), Vec::new())
            .spawn(prompt, working_directory, task_id)
            .await
    }
}
