//! Task manager: the public façade that turns external commands into
//! events.
//!
//! This is the only component that translates wire-level requests
//! (delegate, status, logs, cancel, retry, resume) into bus traffic.

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use foreman_db::models::{Priority, Task, TaskCheckpoint, WorktreeConfig};
use foreman_db::repo::{CheckpointRepository, TaskRepository};
use foreman_db::{Error, Result};

use crate::bus::{Event, EventBus, Query, QueryReply};
use crate::capture::TaskLogs;

/// Defaults applied to delegation requests that omit the field.
#[derive(Debug, Clone, Default)]
pub struct TaskDefaults {
    pub timeout_ms: Option<i64>,
    pub max_output_buffer: Option<i64>,
    pub use_worktree_by_default: bool,
}

/// An incoming request to delegate work.
#[derive(Debug, Clone, Deserialize)]
pub struct DelegateRequest {
    pub prompt: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<i64>,
    #[serde(default)]
    pub max_output_buffer: Option<i64>,
    #[serde(default)]
    pub worktree: Option<WorktreeConfig>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub continue_from: Option<String>,
}

/// Request to resume a terminal task from its latest checkpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ResumeRequest {
    pub task_id: String,
    #[serde(default)]
    pub additional_context: Option<String>,
}

pub struct TaskManager {
    bus: Arc<EventBus>,
    tasks: TaskRepository,
    checkpoints: Option<CheckpointRepository>,
    defaults: TaskDefaults,
}

impl TaskManager {
    pub fn new(
        bus: Arc<EventBus>,
        tasks: TaskRepository,
        checkpoints: Option<CheckpointRepository>,
        defaults: TaskDefaults,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            tasks,
            checkpoints,
            defaults,
        })
    }

    /// Delegate a new task: normalize defaults, construct the frozen task,
    /// persist it, and announce `TaskDelegated`.
    ///
    /// A delegation whose dependency batch is rejected returns that error;
    /// the task is left in storage marked failed.
    pub async fn delegate(&self, request: DelegateRequest) -> Result<Task> {
        let mut depends_on = request.depends_on;

        if let Some(continue_from) = &request.continue_from {
            // The referenced task must exist before it can gate this one.
            self.bus
                .request(Query::TaskStatus {
                    task_id: Some(continue_from.clone()),
                })
                .await?;
            if !depends_on.contains(continue_from) {
                depends_on.push(continue_from.clone());
            }
        }

        let mut task = Task::new(request.prompt, request.priority.unwrap_or(Priority::P1));
        task.working_directory = request.working_directory;
        task.timeout_ms = request.timeout_ms.or(self.defaults.timeout_ms);
        task.max_output_buffer = request
            .max_output_buffer
            .or(self.defaults.max_output_buffer);
        task.worktree = request.worktree.or_else(|| {
            self.defaults.use_worktree_by_default.then(|| WorktreeConfig {
                enabled: true,
                base_branch: None,
            })
        });
        task.continue_from = request.continue_from;
        task.depends_on = depends_on;
        task.validate()?;

        self.tasks.save(&task).await?;
        info!(task_id = %task.id, priority = %task.priority, "task delegated");
        self.bus
            .emit(Event::TaskDelegated { task: task.clone() })
            .await?;
        Ok(task)
    }

    /// One task by id, or every task when `task_id` is `None`.
    pub async fn get_status(&self, task_id: Option<String>) -> Result<Vec<Task>> {
        match self.bus.request(Query::TaskStatus { task_id }).await? {
            QueryReply::Tasks(tasks) => Ok(tasks),
            _ => Err(Error::system("unexpected reply to TaskStatusQuery")),
        }
    }

    pub async fn get_logs(&self, task_id: String, tail: Option<usize>) -> Result<TaskLogs> {
        match self.bus.request(Query::TaskLogs { task_id, tail }).await? {
            QueryReply::Logs(logs) => Ok(logs),
            _ => Err(Error::system("unexpected reply to TaskLogsQuery")),
        }
    }

    /// Request cancellation. The error surface is the cancellation
    /// handlers': `TaskCannotCancel` for terminal tasks, `TaskNotFound`
    /// for unknown ids.
    pub async fn cancel(&self, task_id: String, reason: Option<String>) -> Result<()> {
        self.bus
            .emit(Event::TaskCancellationRequested { task_id, reason })
            .await
    }

    /// Clone a terminal task into a fresh delegation carrying retry-chain
    /// metadata.
    pub async fn retry(&self, task_id: &str) -> Result<Task> {
        let original = self
            .tasks
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| Error::task_not_found(task_id))?;
        if !original.status.is_terminal() {
            return Err(Error::invalid_operation(format!(
                "cannot retry task {task_id} in status {}",
                original.status
            )));
        }

        let task = self.clone_for_rerun(&original, original.prompt.clone());
        task.validate()?;
        self.tasks.save(&task).await?;
        info!(task_id = %task.id, retry_of = %original.id, retry = task.retry_count, "task retried");
        self.bus
            .emit(Event::TaskDelegated { task: task.clone() })
            .await?;
        Ok(task)
    }

    /// Like retry, but prepends a context block built from the latest
    /// checkpoint (and any caller-supplied context) to the prompt.
    pub async fn resume(&self, request: ResumeRequest) -> Result<Task> {
        let original = self
            .tasks
            .find_by_id(&request.task_id)
            .await?
            .ok_or_else(|| Error::task_not_found(&request.task_id))?;
        if !original.status.is_terminal() {
            return Err(Error::invalid_operation(format!(
                "cannot resume task {} in status {}",
                request.task_id, original.status
            )));
        }

        let checkpoint = match &self.checkpoints {
            Some(repo) => repo.find_latest(&original.id).await?,
            None => None,
        };
        let checkpoint_used = checkpoint.is_some();
        let prompt = build_resume_prompt(
            &original.prompt,
            checkpoint.as_ref(),
            request.additional_context.as_deref(),
        );

        let task = self.clone_for_rerun(&original, prompt);
        task.validate()?;
        self.tasks.save(&task).await?;
        info!(task_id = %task.id, resumed_from = %original.id, checkpoint_used, "task resumed");
        self.bus
            .emit(Event::TaskDelegated { task: task.clone() })
            .await?;
        self.bus
            .emit(Event::TaskResumed {
                original_task_id: original.id.clone(),
                checkpoint_used,
            })
            .await?;
        Ok(task)
    }

    fn clone_for_rerun(&self, original: &Task, prompt: String) -> Task {
        let mut task = Task::new(prompt, original.priority);
        task.working_directory = original.working_directory.clone();
        task.timeout_ms = original.timeout_ms;
        task.max_output_buffer = original.max_output_buffer;
        task.worktree = original.worktree.clone();
        task.depends_on = original.depends_on.clone();
        task.continue_from = original.continue_from.clone();
        task.parent_task_id = Some(
            original
                .parent_task_id
                .clone()
                .unwrap_or_else(|| original.id.clone()),
        );
        task.retry_of = Some(original.id.clone());
        task.retry_count = original.retry_count + 1;
        task
    }
}

fn build_resume_prompt(
    original_prompt: &str,
    checkpoint: Option<&TaskCheckpoint>,
    additional_context: Option<&str>,
) -> String {
    let mut sections = vec!["PREVIOUS TASK CONTEXT:".to_string()];
    if let Some(checkpoint) = checkpoint {
        sections.push(format!("Outcome: {}", checkpoint.checkpoint_type));
        if let Some(output) = &checkpoint.output_summary {
            sections.push(format!("Output: {output}"));
        }
        if let Some(error) = &checkpoint.error_summary {
            sections.push(format!("Error: {error}"));
        }
        if let Some(git) = &checkpoint.git_state {
            sections.push(format!("git: {}@{}", git.branch, git.commit));
        }
    }
    if let Some(context) = additional_context {
        sections.push(format!("Additional context: {context}"));
    }
    sections.push(String::new());
    sections.push(original_prompt.to_string());
    sections.join("\n")
}
