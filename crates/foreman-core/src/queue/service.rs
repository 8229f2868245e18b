//! Queue service: the bus-facing owner of the priority queue.
//!
//! Enqueues on `TaskQueued`, re-enters unblocked and requeued tasks into
//! the queue path, marks tasks failed when their dependency batch is
//! rejected, and answers `NextTaskQuery`. Dequeued ids are re-validated
//! against storage so the queue can never hand out a task that is no
//! longer `queued`.

use std::sync::Arc;

use tracing::{debug, warn};

use foreman_db::Result;
use foreman_db::models::{Task, TaskPatch, TaskStatus};
use foreman_db::repo::{DependencyRepository, TaskRepository};

use crate::bus::{Event, EventBus, EventKind, Query, QueryKind, QueryReply};
use crate::queue::PriorityQueue;

pub struct QueueService {
    bus: Arc<EventBus>,
    queue: Arc<PriorityQueue>,
    tasks: TaskRepository,
    deps: DependencyRepository,
}

impl QueueService {
    /// Construct the service and wire it onto the bus: subscriptions for
    /// the queue-path events plus the `NextTaskQuery` responder.
    ///
    /// Must be registered after the dependency handler so its
    /// `TaskDelegated` subscriber observes persisted (or rejected) edges.
    pub fn register(
        bus: Arc<EventBus>,
        queue: Arc<PriorityQueue>,
        tasks: TaskRepository,
        deps: DependencyRepository,
    ) -> Result<Arc<Self>> {
        let service = Arc::new(Self {
            bus,
            queue,
            tasks,
            deps,
        });

        let bus = Arc::clone(&service.bus);

        {
            let service = Arc::clone(&service);
            bus.subscribe(EventKind::TaskDelegated, move |event| {
                let service = Arc::clone(&service);
                Box::pin(async move {
                    if let Event::TaskDelegated { task } = event {
                        service.on_task_delegated(&task.id).await?;
                    }
                    Ok(())
                })
            })?;
        }
        {
            let service = Arc::clone(&service);
            bus.subscribe(EventKind::TaskQueued, move |event| {
                let service = Arc::clone(&service);
                Box::pin(async move {
                    if let Event::TaskQueued { task } = event {
                        service.on_task_queued(task).await?;
                    }
                    Ok(())
                })
            })?;
        }
        {
            let service = Arc::clone(&service);
            bus.subscribe(EventKind::TaskUnblocked, move |event| {
                let service = Arc::clone(&service);
                Box::pin(async move {
                    if let Event::TaskUnblocked { task, .. } = event {
                        service.on_task_unblocked(task).await?;
                    }
                    Ok(())
                })
            })?;
        }
        {
            let service = Arc::clone(&service);
            bus.subscribe(EventKind::RequeueTask, move |event| {
                let service = Arc::clone(&service);
                Box::pin(async move {
                    if let Event::RequeueTask { task } = event {
                        service.on_requeue(task).await?;
                    }
                    Ok(())
                })
            })?;
        }
        {
            let service = Arc::clone(&service);
            bus.subscribe(EventKind::TaskDependencyFailed, move |event| {
                let service = Arc::clone(&service);
                Box::pin(async move {
                    if let Event::TaskDependencyFailed { task_id, error, .. } = event {
                        service.on_dependency_failed(&task_id, &error).await?;
                    }
                    Ok(())
                })
            })?;
        }
        {
            let service = Arc::clone(&service);
            bus.subscribe(EventKind::TaskDeleted, move |event| {
                let service = Arc::clone(&service);
                Box::pin(async move {
                    if let Event::TaskDeleted { task_id } = event {
                        service.queue.remove(&task_id);
                    }
                    Ok(())
                })
            })?;
        }
        {
            let service = Arc::clone(&service);
            bus.respond(QueryKind::NextTask, move |query| {
                let service = Arc::clone(&service);
                Box::pin(async move {
                    debug_assert!(matches!(query, Query::NextTask));
                    let next = service.next_task().await?;
                    Ok(QueryReply::NextTask(next))
                })
            })?;
        }

        Ok(service)
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    /// A freshly delegated task enters the queue path iff the dependency
    /// handler left it runnable: still `queued` in storage and with no
    /// pending edges.
    async fn on_task_delegated(&self, task_id: &str) -> Result<()> {
        let Some(task) = self.tasks.find_by_id(task_id).await? else {
            warn!(task_id, "delegated task not found in storage");
            return Ok(());
        };
        if task.status != TaskStatus::Queued {
            // Dependency validation rejected the delegation.
            return Ok(());
        }
        if self.deps.is_blocked(task_id).await? {
            debug!(task_id, "task blocked on dependencies, not enqueued");
            return Ok(());
        }
        if self.queue.enqueue(task.clone())? {
            self.bus.emit(Event::TaskQueued { task }).await?;
        }
        Ok(())
    }

    async fn on_task_queued(&self, task: Task) -> Result<()> {
        if task.status != TaskStatus::Queued {
            warn!(task_id = %task.id, status = %task.status, "refusing to enqueue non-queued task");
            return Ok(());
        }
        let task_id = task.id.clone();
        if self.queue.enqueue(task)? {
            debug!(task_id = %task_id, queued = self.queue.size(), "task enqueued");
        }
        Ok(())
    }

    /// An unblocked task re-enters the queue path: enqueue it and announce
    /// `TaskQueued` so the worker handler wakes up.
    async fn on_task_unblocked(&self, task: Task) -> Result<()> {
        if task.status != TaskStatus::Queued {
            warn!(
                task_id = %task.id,
                status = %task.status,
                "unblocked task is no longer queued, skipping"
            );
            return Ok(());
        }
        if self.queue.enqueue(task.clone())? {
            self.bus.emit(Event::TaskQueued { task }).await?;
        }
        Ok(())
    }

    /// A task bounced back from the spawn path: restore `queued` status,
    /// put it back in line, and announce it.
    async fn on_requeue(&self, task: Task) -> Result<()> {
        let Some(current) = self.tasks.find_by_id(&task.id).await? else {
            warn!(task_id = %task.id, "requeue for unknown task");
            return Ok(());
        };
        if current.status.is_terminal() {
            warn!(
                task_id = %current.id,
                status = %current.status,
                "refusing to requeue terminal task"
            );
            return Ok(());
        }
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
        if self.queue.enqueue(task.clone())? {
            self.bus.emit(Event::TaskQueued { task }).await?;
        }
        Ok(())
    }

    /// Dependency validation rejected the delegation: the task can never
    /// become runnable, so it is marked failed.
    async fn on_dependency_failed(&self, task_id: &str, error: &str) -> Result<()> {
        warn!(task_id, error, "dependency batch rejected, failing task");
        self.queue.remove(task_id);
        self.tasks
            .update(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Failed),
                    completed_at: Some(Some(chrono::Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Pop until a task that is still `queued` in storage turns up. Stale
    /// entries (cancelled or deleted while queued) are dropped.
    async fn next_task(&self) -> Result<Option<Task>> {
        while let Some(candidate) = self.queue.dequeue() {
            match self.tasks.find_by_id(&candidate.id).await? {
                Some(task) if task.status == TaskStatus::Queued => return Ok(Some(task)),
                Some(task) => {
                    debug!(
                        task_id = %task.id,
                        status = %task.status,
                        "dropping stale queue entry"
                    );
                }
                None => {
                    debug!(task_id = %candidate.id, "dropping queue entry for deleted task");
                }
            }
        }
        Ok(None)
    }
}
