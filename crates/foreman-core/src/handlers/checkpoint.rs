//! Checkpoint handler: captures a terminal-state snapshot of every task
//! that completes, fails, or is cancelled.
//!
//! The snapshot carries the output and error tails (last 2000 characters),
//! the git state of the task's working directory when it has one, and the
//! cancellation reason where applicable. Git capture is tolerant: any
//! failure just produces a checkpoint without git data.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use foreman_db::models::{CheckpointType, NewCheckpoint, OutputStream, Task};
use foreman_db::repo::{CheckpointRepository, TaskRepository};
use foreman_db::Result;

use crate::bus::{Event, EventBus, EventKind};
use crate::capture::OutputCapture;
use crate::worktree::{self, WorktreeManager};

/// Summaries keep the last 2000 characters.
pub const SUMMARY_MAX_CHARS: usize = 2000;

pub struct CheckpointHandler {
    bus: Arc<EventBus>,
    tasks: TaskRepository,
    checkpoints: CheckpointRepository,
    capture: Arc<OutputCapture>,
    worktrees: Option<Arc<WorktreeManager>>,
}

impl CheckpointHandler {
    pub fn register(
        bus: Arc<EventBus>,
        tasks: TaskRepository,
        checkpoints: CheckpointRepository,
        capture: Arc<OutputCapture>,
        worktrees: Option<Arc<WorktreeManager>>,
    ) -> Result<Arc<Self>> {
        let handler = Arc::new(Self {
            bus,
            tasks,
            checkpoints,
            capture,
            worktrees,
        });

        for kind in [
            EventKind::TaskCompleted,
            EventKind::TaskFailed,
            EventKind::TaskCancelled,
        ] {
            let handler_ref = Arc::clone(&handler);
            handler.bus.subscribe(kind, move |event| {
                let handler_ref = Arc::clone(&handler_ref);
                Box::pin(async move { handler_ref.on_terminal(event).await })
            })?;
        }

        Ok(handler)
    }

    async fn on_terminal(&self, event: Event) -> Result<()> {
        let (task_id, checkpoint_type, event_error, reason) = match event {
            Event::TaskCompleted { task_id, .. } => {
                (task_id, CheckpointType::Completed, None, None)
            }
            Event::TaskFailed { task_id, error, .. } => {
                (task_id, CheckpointType::Failed, error, None)
            }
            Event::TaskCancelled { task_id, reason } => {
                (task_id, CheckpointType::Cancelled, None, reason)
            }
            _ => return Ok(()),
        };

        let Some(task) = self.tasks.find_by_id(&task_id).await? else {
            warn!(task_id, "skipping checkpoint for unknown task");
            return Ok(());
        };

        let output_summary = self
            .capture
            .tail_chars(&task_id, OutputStream::Stdout, SUMMARY_MAX_CHARS)
            .await;
        let stderr_tail = self
            .capture
            .tail_chars(&task_id, OutputStream::Stderr, SUMMARY_MAX_CHARS)
            .await;

        // Failed tasks prefer stderr over the event's error message;
        // cancelled tasks record the cancellation reason.
        let error_summary = match checkpoint_type {
            CheckpointType::Failed => stderr_tail
                .filter(|s| !s.trim().is_empty())
                .or(event_error)
                .map(|s| truncate_tail(&s, SUMMARY_MAX_CHARS)),
            CheckpointType::Cancelled => reason.clone(),
            CheckpointType::Completed => None,
        };

        let git_state = task.working_directory.as_ref().and_then(|dir| {
            match worktree::git_state(Path::new(dir)) {
                Ok(state) => Some(state),
                Err(err) => {
                    debug!(task_id = %task.id, error = %err, "git state capture failed, proceeding without");
                    None
                }
            }
        });

        if checkpoint_type == CheckpointType::Completed {
            self.commit_worktree(&task);
        }

        let stored = self
            .checkpoints
            .save(NewCheckpoint {
                task_id: task_id.clone(),
                checkpoint_type,
                output_summary: output_summary.map(|s| truncate_tail(&s, SUMMARY_MAX_CHARS)),
                error_summary,
                git_state,
                context: reason,
            })
            .await?;

        debug!(task_id, checkpoint_id = stored.id, "checkpoint created");
        self.bus
            .emit(Event::CheckpointCreated {
                task_id,
                checkpoint: stored,
            })
            .await?;
        Ok(())
    }

    /// Commit isolated work so the task's branch outlives the worktree.
    /// Best-effort.
    fn commit_worktree(&self, task: &Task) {
        let Some(manager) = &self.worktrees else { return };
        let enabled = task.worktree.as_ref().is_some_and(|w| w.enabled);
        let Some(dir) = &task.working_directory else {
            return;
        };
        if !enabled {
            return;
        }
        match manager.complete_task(task, Path::new(dir)) {
            Ok(true) => debug!(task_id = %task.id, "worktree work committed"),
            Ok(false) => debug!(task_id = %task.id, "worktree had no changes to commit"),
            Err(err) => warn!(task_id = %task.id, error = %err, "failed to commit worktree work"),
        }
    }
}

/// Keep the last `max_chars` characters.
fn truncate_tail(s: &str, max_chars: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    let skip = chars.len().saturating_sub(max_chars);
    chars[skip..].iter().collect()
}
