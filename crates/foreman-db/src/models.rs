//! Domain model: tasks, dependency edges, checkpoints, schedules, and the
//! enums that constrain them.
//!
//! Entities are constructed once and treated as frozen; "edits" go through
//! [`TaskPatch`] and produce a fresh row. Every enum round-trips through its
//! `Display`/`FromStr` pair, which is also the storage encoding.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(EnumParseError::new("task status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Priority tier. `P0` is the highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
}

impl Priority {
    /// Index into priority-ordered structures: 0 for the highest tier.
    pub fn index(self) -> usize {
        match self {
            Self::P0 => 0,
            Self::P1 => 1,
            Self::P2 => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = EnumParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "P0" => Ok(Self::P0),
            "P1" => Ok(Self::P1),
            "P2" => Ok(Self::P2),
            other => Err(EnumParseError::new("priority", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Terminal state recorded against a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyResolution {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for DependencyResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for DependencyResolution {
    type Err = EnumParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(EnumParseError::new("dependency resolution", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Kind of terminal snapshot a checkpoint records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for CheckpointType {
    type Err = EnumParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(EnumParseError::new("checkpoint type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Which stream a captured output chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        };
        f.write_str(s)
    }
}

impl FromStr for OutputStream {
    type Err = EnumParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            other => Err(EnumParseError::new("output stream", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Kind of schedule: repeating cron expression or a single shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Cron,
    Once,
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cron => "cron",
            Self::Once => "once",
        };
        f.write_str(s)
    }
}

impl FromStr for ScheduleType {
    type Err = EnumParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cron" => Ok(Self::Cron),
            "once" => Ok(Self::Once),
            other => Err(EnumParseError::new("schedule type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Lifecycle status of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
    Expired,
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl FromStr for ScheduleStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(EnumParseError::new("schedule status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// What to do with runs that were missed while the daemon was down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissedRunPolicy {
    Skip,
    Catchup,
    Fail,
}

impl fmt::Display for MissedRunPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Skip => "skip",
            Self::Catchup => "catchup",
            Self::Fail => "fail",
        };
        f.write_str(s)
    }
}

impl FromStr for MissedRunPolicy {
    type Err = EnumParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::Skip),
            "catchup" => Ok(Self::Catchup),
            "fail" => Ok(Self::Fail),
            other => Err(EnumParseError::new("missed run policy", other)),
        }
    }
}

/// Error returned when parsing an invalid enum string.
#[derive(Debug, Clone)]
pub struct EnumParseError {
    what: &'static str,
    value: String,
}

impl EnumParseError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.what, self.value)
    }
}

impl std::error::Error for EnumParseError {}

impl From<EnumParseError> for Error {
    fn from(err: EnumParseError) -> Self {
        Error::system(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Per-task git-worktree configuration block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeConfig {
    pub enabled: bool,
    /// Branch the worktree is created from. `None` means the repository's
    /// current HEAD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
}

/// Snapshot of a working directory's git state at checkpoint time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitState {
    pub branch: String,
    pub commit: String,
    pub dirty_files: Vec<String>,
}

/// A unit of delegated work.
///
/// The id is an opaque UUID-shaped string, treated only for equality.
/// `depends_on` records the edges requested at delegation time; the
/// operational truth lives in the `task_dependencies` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub prompt: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub working_directory: Option<String>,
    /// Milliseconds; `None` or 0 means no timeout.
    pub timeout_ms: Option<i64>,
    /// Per-task output-buffer ceiling in bytes.
    pub max_output_buffer: Option<i64>,
    pub worktree: Option<WorktreeConfig>,
    /// Root ancestor of the retry chain.
    pub parent_task_id: Option<String>,
    /// Immediate predecessor in the retry chain.
    pub retry_of: Option<String>,
    pub retry_count: i64,
    /// Task whose checkpoint enriches this task's prompt once it terminates.
    pub continue_from: Option<String>,
    pub depends_on: Vec<String>,
    pub worker_id: Option<String>,
    pub exit_code: Option<i64>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a fresh queued task with a generated id.
    pub fn new(prompt: impl Into<String>, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            priority,
            status: TaskStatus::Queued,
            working_directory: None,
            timeout_ms: None,
            max_output_buffer: None,
            worktree: None,
            parent_task_id: None,
            retry_of: None,
            retry_count: 0,
            continue_from: None,
            depends_on: Vec::new(),
            worker_id: None,
            exit_code: None,
            duration_ms: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Check the structural invariants a task must satisfy before it is
    /// persisted or emitted.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(Error::invalid_operation("task prompt must not be empty"));
        }
        if let Some(dir) = &self.working_directory {
            if !std::path::Path::new(dir).is_absolute() {
                return Err(Error::invalid_operation(format!(
                    "working directory must be an absolute path: {dir}"
                )));
            }
        }
        if self.depends_on.iter().any(|dep| dep == &self.id) {
            return Err(Error::invalid_operation("task cannot depend on itself"));
        }
        if let Some(cf) = &self.continue_from {
            if !self.depends_on.contains(cf) {
                return Err(Error::invalid_operation(
                    "continue_from must be one of the task's dependencies",
                ));
            }
        }
        if let (Some(started), Some(completed)) = (self.started_at, self.completed_at) {
            if started > completed {
                return Err(Error::invalid_operation(
                    "started_at must not be after completed_at",
                ));
            }
        }
        if self.status.is_terminal() && self.completed_at.is_none() {
            return Err(Error::invalid_operation(format!(
                "terminal task must carry completed_at (status {})",
                self.status
            )));
        }
        Ok(())
    }
}

/// Field-wise patch applied by `TaskRepository::update`.
///
/// `Some(inner)` sets the column; `None` leaves it untouched. Nullable
/// columns use a nested `Option` so they can be explicitly cleared.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub prompt: Option<String>,
    pub worker_id: Option<Option<String>>,
    pub exit_code: Option<Option<i64>>,
    pub duration_ms: Option<Option<i64>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub working_directory: Option<Option<String>>,
}

// ---------------------------------------------------------------------------

/// A directed edge in the dependency DAG: `task_id` depends on
/// `depends_on_task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDependency {
    pub id: i64,
    pub task_id: String,
    pub depends_on_task_id: String,
    pub resolution: DependencyResolution,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------

/// Append-only terminal-state snapshot of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    pub id: i64,
    pub task_id: String,
    pub checkpoint_type: CheckpointType,
    pub output_summary: Option<String>,
    pub error_summary: Option<String>,
    pub git_state: Option<GitState>,
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Checkpoint fields supplied by the caller; id and timestamp are assigned
/// on insert.
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub task_id: String,
    pub checkpoint_type: CheckpointType,
    pub output_summary: Option<String>,
    pub error_summary: Option<String>,
    pub git_state: Option<GitState>,
    pub context: Option<String>,
}

// ---------------------------------------------------------------------------

/// The task fields a schedule stamps out on each run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub prompt: String,
    #[serde(default = "TaskTemplate::default_priority")]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_buffer: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeConfig>,
}

impl TaskTemplate {
    fn default_priority() -> Priority {
        Priority::P1
    }
}

/// A persistent schedule that materializes tasks from its template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub template: TaskTemplate,
    pub schedule_type: ScheduleType,
    pub cron_expression: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timezone: String,
    pub missed_run_policy: MissedRunPolicy,
    pub status: ScheduleStatus,
    pub max_runs: Option<i64>,
    pub run_count: i64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Build a cron schedule with defaults.
    pub fn cron(name: impl Into<String>, expression: impl Into<String>, template: TaskTemplate) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            template,
            schedule_type: ScheduleType::Cron,
            cron_expression: Some(expression.into()),
            scheduled_at: None,
            timezone: "UTC".to_string(),
            missed_run_policy: MissedRunPolicy::Skip,
            status: ScheduleStatus::Active,
            max_runs: None,
            run_count: 0,
            next_run_at: None,
            last_run_at: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build a one-shot schedule due at `at`.
    pub fn once(name: impl Into<String>, at: DateTime<Utc>, template: TaskTemplate) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            template,
            schedule_type: ScheduleType::Once,
            cron_expression: None,
            scheduled_at: Some(at),
            timezone: "UTC".to_string(),
            missed_run_policy: MissedRunPolicy::Skip,
            status: ScheduleStatus::Active,
            max_runs: Some(1),
            run_count: 0,
            next_run_at: Some(at),
            last_run_at: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One row of schedule execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleExecution {
    pub id: i64,
    pub schedule_id: String,
    pub task_id: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// One persisted chunk of captured worker output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutputChunk {
    pub id: i64,
    pub task_id: String,
    pub stream: OutputStream,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
