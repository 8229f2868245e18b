//! Recovery manager: startup reconciliation of persisted state against the
//! fact that no workers survived the restart.
//!
//! Queued rows re-enter the in-memory queue; running rows are either
//! re-queued or, when strictly older than the staleness threshold, marked
//! failed with exit code -1. Individual failures are logged and recovery
//! continues; only a failure to load the task lists aborts.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use foreman_db::models::{TaskPatch, TaskStatus};
use foreman_db::repo::TaskRepository;
use foreman_db::Result;

use crate::bus::{Event, EventBus};
use crate::queue::PriorityQueue;

/// Running tasks strictly older than this are marked failed.
pub const STALE_RUNNING_MINUTES: i64 = 30;
/// Terminal tasks older than this are removed at startup.
pub const RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    pub tasks_recovered: usize,
    pub tasks_marked_failed: usize,
}

pub struct RecoveryManager {
    bus: Arc<EventBus>,
    tasks: TaskRepository,
    queue: Arc<PriorityQueue>,
}

impl RecoveryManager {
    pub fn new(bus: Arc<EventBus>, tasks: TaskRepository, queue: Arc<PriorityQueue>) -> Self {
        Self { bus, tasks, queue }
    }

    /// Run recovery once. Called during boot, before the wire server
    /// accepts requests.
    pub async fn run(&self) -> Result<RecoveryStats> {
        if let Err(err) = self.bus.emit(Event::RecoveryStarted).await {
            warn!(error = %err, "RecoveryStarted handling failed");
        }

        match self.tasks.cleanup_old_tasks(Duration::days(RETENTION_DAYS)).await {
            Ok(removed) => {
                if !removed.is_empty() {
                    info!(count = removed.len(), "removed old terminal tasks");
                }
                for task_id in removed {
                    if let Err(err) = self.bus.emit(Event::TaskDeleted { task_id }).await {
                        warn!(error = %err, "TaskDeleted handling failed");
                    }
                }
            }
            Err(err) => warn!(error = %err, "old-task cleanup failed, continuing recovery"),
        }

        let mut stats = RecoveryStats {
            tasks_recovered: 0,
            tasks_marked_failed: 0,
        };

        // Queued rows: rebuild the in-memory queue.
        let queued = self.tasks.find_by_status(TaskStatus::Queued).await?;
        for task in queued {
            if self.queue.contains(&task.id) {
                continue;
            }
            let task_id = task.id.clone();
            match self.requeue(task).await {
                Ok(()) => stats.tasks_recovered += 1,
                Err(err) => warn!(task_id = %task_id, error = %err, "failed to re-enqueue queued task"),
            }
        }

        // Running rows: no worker can still be alive. Stale ones failed;
        // the rest go back in line.
        let threshold = Duration::minutes(STALE_RUNNING_MINUTES);
        let now = Utc::now();
        let running = self.tasks.find_by_status(TaskStatus::Running).await?;
        for task in running {
            let age = now - task.started_at.unwrap_or(task.created_at);
            let task_id = task.id.clone();
            // Strictly greater than the threshold: a task at exactly the
            // boundary is re-queued.
            if age > threshold {
                match self.mark_failed(&task_id).await {
                    Ok(()) => stats.tasks_marked_failed += 1,
                    Err(err) => {
                        warn!(task_id = %task_id, error = %err, "failed to mark stale task failed")
                    }
                }
            } else {
                match self.reset_and_requeue(task).await {
                    Ok(()) => stats.tasks_recovered += 1,
                    Err(err) => {
                        warn!(task_id = %task_id, error = %err, "failed to re-enqueue running task")
                    }
                }
            }
        }

        info!(
            recovered = stats.tasks_recovered,
            marked_failed = stats.tasks_marked_failed,
            "recovery completed"
        );
        if let Err(err) = self
            .bus
            .emit(Event::RecoveryCompleted {
                tasks_recovered: stats.tasks_recovered,
                tasks_marked_failed: stats.tasks_marked_failed,
            })
            .await
        {
            warn!(error = %err, "RecoveryCompleted handling failed");
        }

        Ok(stats)
    }

    async fn requeue(&self, task: foreman_db::models::Task) -> Result<()> {
        self.queue.enqueue(task.clone())?;
        self.bus.emit(Event::TaskQueued { task }).await?;
        Ok(())
    }

    async fn reset_and_requeue(&self, task: foreman_db::models::Task) -> Result<()> {
        let task = self
            .tasks
            .update(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Queued),
                    worker_id: Some(None),
                    started_at: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        self.requeue(task).await
    }

    async fn mark_failed(&self, task_id: &str) -> Result<()> {
        self.tasks
            .update(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Failed),
                    exit_code: Some(Some(-1)),
                    completed_at: Some(Some(Utc::now())),
                    worker_id: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}
