//! Status handler: the single writer for lifecycle-driven task status
//! transitions, and the responder for status and log queries.
//!
//! Subscribed first on every lifecycle event so that later subscribers
//! (checkpoints, dependency resolution) observe the already-updated row.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use foreman_db::models::{OutputStream, TaskPatch, TaskStatus};
use foreman_db::repo::{TaskOutputRepository, TaskRepository};
use foreman_db::{Error, Result};

use crate::bus::{Event, EventBus, EventKind, Query, QueryKind, QueryReply};
use crate::capture::{OutputCapture, TaskLogs};

pub struct StatusHandler {
    tasks: TaskRepository,
    capture: Arc<OutputCapture>,
    output_repo: TaskOutputRepository,
}

impl StatusHandler {
    pub fn register(
        bus: &Arc<EventBus>,
        tasks: TaskRepository,
        capture: Arc<OutputCapture>,
        output_repo: TaskOutputRepository,
    ) -> Result<Arc<Self>> {
        let handler = Arc::new(Self {
            tasks,
            capture,
            output_repo,
        });

        let kinds = [
            EventKind::TaskStarting,
            EventKind::TaskStarted,
            EventKind::TaskCompleted,
            EventKind::TaskFailed,
            EventKind::TaskTimeout,
            EventKind::TaskCancelled,
        ];
        for kind in kinds {
            let handler_ref = Arc::clone(&handler);
            bus.subscribe(kind, move |event| {
                let handler_ref = Arc::clone(&handler_ref);
                Box::pin(async move { handler_ref.on_event(event).await })
            })?;
        }

        {
            let handler_ref = Arc::clone(&handler);
            bus.respond(QueryKind::TaskStatus, move |query| {
                let handler_ref = Arc::clone(&handler_ref);
                Box::pin(async move {
                    let Query::TaskStatus { task_id } = query else {
                        return Err(Error::system("unexpected query routed to TaskStatus"));
                    };
                    handler_ref.status(task_id).await
                })
            })?;
        }
        {
            let handler_ref = Arc::clone(&handler);
            bus.respond(QueryKind::TaskLogs, move |query| {
                let handler_ref = Arc::clone(&handler_ref);
                Box::pin(async move {
                    let Query::TaskLogs { task_id, tail } = query else {
                        return Err(Error::system("unexpected query routed to TaskLogs"));
                    };
                    handler_ref.logs(&task_id, tail).await
                })
            })?;
        }

        Ok(handler)
    }

    async fn on_event(&self, event: Event) -> Result<()> {
        match event {
            Event::TaskStarting { task } => self.on_task_starting(&task.id).await,
            Event::TaskStarted { task_id, worker_id } => {
                self.tasks
                    .update(
                        &task_id,
                        TaskPatch {
                            worker_id: Some(Some(worker_id)),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            }
            Event::TaskCompleted {
                task_id,
                exit_code,
                duration_ms,
            } => {
                self.finish(&task_id, TaskStatus::Completed, Some(exit_code), Some(duration_ms))
                    .await
            }
            Event::TaskFailed {
                task_id, exit_code, ..
            } => {
                self.finish(&task_id, TaskStatus::Failed, Some(exit_code), None)
                    .await
            }
            Event::TaskTimeout { task_id, .. } => {
                self.finish(&task_id, TaskStatus::Failed, None, None).await
            }
            Event::TaskCancelled { task_id, .. } => {
                self.finish(&task_id, TaskStatus::Cancelled, None, None).await
            }
            other => {
                warn!(event = ?other.kind(), "status handler received unexpected event");
                Ok(())
            }
        }
    }

    /// `TaskStarting` moves queued -> running before the process exists. A
    /// failure here aborts the spawn in the worker handler.
    async fn on_task_starting(&self, task_id: &str) -> Result<()> {
        let task = self
            .tasks
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| Error::task_not_found(task_id))?;
        if task.status != TaskStatus::Queued {
            return Err(Error::invalid_operation(format!(
                "task {task_id} cannot start from status {}",
                task.status
            )));
        }
        self.tasks
            .update(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Running),
                    started_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn finish(
        &self,
        task_id: &str,
        status: TaskStatus,
        exit_code: Option<i64>,
        duration_ms: Option<i64>,
    ) -> Result<()> {
        let current = self.tasks.find_by_id(task_id).await?;
        let Some(current) = current else {
            warn!(task_id, "terminal event for unknown task");
            return Ok(());
        };
        if current.status.is_terminal() {
            // Late duplicate (e.g. kill racing a natural exit); first
            // writer wins.
            return Ok(());
        }

        let duration_ms = duration_ms.or_else(|| {
            current
                .started_at
                .map(|started| (Utc::now() - started).num_milliseconds().max(0))
        });

        self.tasks
            .update(
                task_id,
                TaskPatch {
                    status: Some(status),
                    exit_code: Some(exit_code),
                    duration_ms: Some(duration_ms),
                    completed_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn status(&self, task_id: Option<String>) -> Result<QueryReply> {
        match task_id {
            Some(id) => {
                let task = self
                    .tasks
                    .find_by_id(&id)
                    .await?
                    .ok_or_else(|| Error::task_not_found(&id))?;
                Ok(QueryReply::Tasks(vec![task]))
            }
            None => Ok(QueryReply::Tasks(self.tasks.find_all().await?)),
        }
    }

    /// Serve logs from the live capture when present, falling back to the
    /// persisted output rows after a restart.
    async fn logs(&self, task_id: &str, tail: Option<usize>) -> Result<QueryReply> {
        if let Some(logs) = self.capture.get_output(task_id, tail).await {
            return Ok(QueryReply::Logs(logs));
        }

        if self.tasks.find_by_id(task_id).await?.is_none() {
            return Err(Error::task_not_found(task_id));
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        match tail {
            Some(n) => {
                let n = n as i64;
                for chunk in self
                    .output_repo
                    .fetch_tail(task_id, OutputStream::Stdout, n)
                    .await?
                {
                    stdout.push(chunk.content);
                }
                for chunk in self
                    .output_repo
                    .fetch_tail(task_id, OutputStream::Stderr, n)
                    .await?
                {
                    stderr.push(chunk.content);
                }
            }
            None => {
                for chunk in self.output_repo.fetch(task_id).await? {
                    match chunk.stream {
                        OutputStream::Stdout => stdout.push(chunk.content),
                        OutputStream::Stderr => stderr.push(chunk.content),
                    }
                }
            }
        }

        Ok(QueryReply::Logs(TaskLogs {
            task_id: task_id.to_string(),
            stdout,
            stderr,
            stdout_path: None,
            stderr_path: None,
        }))
    }
}
