//! Configuration file management for the foreman daemon.
//!
//! A TOML config file at `~/.config/foreman/config.toml` (XDG layout)
//! carries the operational knobs; the database location is resolved
//! separately by `foreman-db` from its environment variables. Every field
//! has a default so a missing file means a default daemon.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub tasks: TaskSection,
    #[serde(default)]
    pub spawn: SpawnSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Agent binary launched for each task.
    pub program: String,
    /// Arguments passed before the prompt is written to stdin.
    pub args: Vec<String>,
    /// Maximum number of concurrent workers.
    pub max_workers: usize,
    /// Soft-to-hard kill grace period in milliseconds.
    pub kill_grace_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec!["-p".to_string()],
            max_workers: 4,
            kill_grace_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSection {
    /// Default per-task timeout in milliseconds; absent means no timeout.
    pub default_timeout_ms: Option<i64>,
    /// Default per-task output-buffer cap in bytes.
    pub default_max_output_buffer: Option<i64>,
    /// Give every task a worktree unless it says otherwise.
    pub use_worktree_by_default: bool,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            default_max_output_buffer: None,
            use_worktree_by_default: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnSection {
    /// Minimum gap between two worker spawns in milliseconds.
    pub min_spawn_delay_ms: u64,
    /// Deferral while resources are constrained, in milliseconds.
    pub spawn_backoff_ms: u64,
}

impl Default for SpawnSection {
    fn default() -> Self {
        Self {
            min_spawn_delay_ms: 50,
            spawn_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Seconds between due-schedule polls.
    pub poll_interval_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
        }
    }
}

impl ConfigFile {
    pub fn min_spawn_delay(&self) -> Duration {
        Duration::from_millis(self.spawn.min_spawn_delay_ms)
    }

    pub fn spawn_backoff(&self) -> Duration {
        Duration::from_millis(self.spawn.spawn_backoff_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.worker.kill_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.poll_interval_secs)
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the foreman config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/foreman` or
/// `~/.config/foreman`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("foreman");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("foreman")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load the config file, falling back to defaults when it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    let path = config_path();
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}
