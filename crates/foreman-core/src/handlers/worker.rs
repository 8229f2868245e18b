//! Worker handler: turns queue activity into spawned workers.
//!
//! Two pieces of defensive machinery guard the spawn path. A minimum
//! inter-spawn delay prevents fork-storms after a mass re-queue (resource
//! probes cannot observe a spike caused by the spawn itself), and a
//! backoff defers the whole attempt while admission control says no,
//! without consuming a task from the queue.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use foreman_db::models::{TaskPatch, TaskStatus};
use foreman_db::repo::TaskRepository;
use foreman_db::{Error, ErrorCode, Result};

use crate::bus::{Event, EventBus, EventKind, Query, QueryReply};
use crate::capture::OutputCapture;
use crate::pool::WorkerPool;
use crate::queue::PriorityQueue;
use crate::worktree::WorktreeManager;

/// Default minimum gap between two spawns.
pub const DEFAULT_MIN_SPAWN_DELAY: Duration = Duration::from_millis(50);
/// Default deferral while resources are constrained.
pub const DEFAULT_SPAWN_BACKOFF: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct WorkerHandlerConfig {
    pub min_spawn_delay: Duration,
    pub spawn_backoff: Duration,
}

impl Default for WorkerHandlerConfig {
    fn default() -> Self {
        Self {
            min_spawn_delay: DEFAULT_MIN_SPAWN_DELAY,
            spawn_backoff: DEFAULT_SPAWN_BACKOFF,
        }
    }
}

pub struct WorkerHandler {
    bus: Arc<EventBus>,
    pool: Arc<WorkerPool>,
    queue: Arc<PriorityQueue>,
    tasks: TaskRepository,
    capture: Arc<OutputCapture>,
    worktrees: Option<Arc<WorktreeManager>>,
    config: WorkerHandlerConfig,
    last_spawn_at: Mutex<Option<Instant>>,
    rerun_pending: AtomicBool,
    /// Self-handle for deferred re-runs of the spawn attempt.
    weak_self: Weak<WorkerHandler>,
}

impl WorkerHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        bus: Arc<EventBus>,
        pool: Arc<WorkerPool>,
        queue: Arc<PriorityQueue>,
        tasks: TaskRepository,
        capture: Arc<OutputCapture>,
        worktrees: Option<Arc<WorktreeManager>>,
        config: WorkerHandlerConfig,
    ) -> Result<Arc<Self>> {
        let handler = Arc::new_cyclic(|weak_self| Self {
            bus,
            pool,
            queue,
            tasks,
            capture,
            worktrees,
            config,
            last_spawn_at: Mutex::new(None),
            rerun_pending: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        });

        {
            let handler_ref = Arc::clone(&handler);
            handler.bus.subscribe(EventKind::TaskQueued, move |_| {
                let handler_ref = Arc::clone(&handler_ref);
                Box::pin(async move { handler_ref.maybe_spawn().await })
            })?;
        }
        {
            let handler_ref = Arc::clone(&handler);
            handler
                .bus
                .subscribe(EventKind::TaskCancellationRequested, move |event| {
                    let handler_ref = Arc::clone(&handler_ref);
                    Box::pin(async move {
                        if let Event::TaskCancellationRequested { task_id, reason } = event {
                            handler_ref.on_cancellation_requested(&task_id, reason).await?;
                        }
                        Ok(())
                    })
                })?;
        }

        Ok(handler)
    }

    /// Try to start the next queued task, deferring when the spawn window
    /// or admission control says to wait.
    pub async fn maybe_spawn(&self) -> Result<()> {
        // Spawn-burst protection: respect the minimum inter-spawn gap.
        let remaining = {
            let last = self.last_spawn_at.lock().expect("spawn clock poisoned");
            last.and_then(|at| self.config.min_spawn_delay.checked_sub(at.elapsed()))
        };
        if let Some(remaining) = remaining {
            self.defer(remaining);
            return Ok(());
        }

        // Backoff without consuming a task while resources are constrained.
        let admitted = match self.pool_monitor_admits().await {
            Ok(admitted) => admitted,
            Err(err) => {
                warn!(error = %err, "resource probe failed, backing off");
                self.defer(self.config.spawn_backoff);
                return Ok(());
            }
        };
        if !admitted {
            debug!("resources constrained, deferring spawn");
            self.defer(self.config.spawn_backoff);
            return Ok(());
        }

        let QueryReply::NextTask(next) = self.bus.request(Query::NextTask).await? else {
            return Err(Error::system("unexpected reply to NextTaskQuery"));
        };
        let Some(mut task) = next else {
            return Ok(());
        };

        // Worktree isolation happens before the task is marked running so
        // the spawned process sees its isolated working directory.
        if let Err(err) = self.prepare_worktree(&mut task).await {
            warn!(task_id = %task.id, error = %err, "worktree creation failed, requeueing");
            self.bus.emit(Event::RequeueTask { task }).await?;
            self.defer(self.config.spawn_backoff);
            return Ok(());
        }

        self.capture
            .configure_task(&task.id, task.max_output_buffer.map(|v| v as u64))
            .await;

        if let Err(err) = self.bus.emit(Event::TaskStarting { task: task.clone() }).await {
            warn!(task_id = %task.id, error = %err, "TaskStarting rejected, requeueing");
            self.bus.emit(Event::RequeueTask { task }).await?;
            return Ok(());
        }

        match self.pool.spawn(&task).await {
            Ok(info) => {
                *self.last_spawn_at.lock().expect("spawn clock poisoned") = Some(Instant::now());
                let (spawned, started) = tokio::join!(
                    self.bus.emit(Event::WorkerSpawned {
                        worker_id: info.worker_id.clone(),
                        task_id: task.id.clone(),
                        pid: info.pid,
                    }),
                    self.bus.emit(Event::TaskStarted {
                        task_id: task.id.clone(),
                        worker_id: info.worker_id.clone(),
                    }),
                );
                if let Err(err) = spawned.and(started) {
                    warn!(task_id = %task.id, error = %err, "post-spawn event handling failed");
                }
                info!(task_id = %task.id, worker_id = %info.worker_id, "task started");
                // The queue may hold more runnable work; check again after
                // the spawn window passes.
                self.defer(self.config.min_spawn_delay);
            }
            Err(err) if err.code == ErrorCode::InsufficientResources => {
                debug!(task_id = %task.id, "admission revoked at spawn time, requeueing");
                self.bus.emit(Event::RequeueTask { task }).await?;
                self.defer(self.config.spawn_backoff);
            }
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "worker spawn failed");
                self.bus
                    .emit(Event::TaskFailed {
                        task_id: task.id.clone(),
                        exit_code: 1,
                        error: Some(err.to_string()),
                    })
                    .await?;
            }
        }
        Ok(())
    }

    async fn pool_monitor_admits(&self) -> Result<bool> {
        // The pool re-checks admission at spawn time; this early probe
        // avoids dequeuing a task that would bounce straight back.
        self.pool_monitor().can_spawn_worker().await
    }

    fn pool_monitor(&self) -> &Arc<dyn crate::monitor::ResourceMonitor> {
        self.pool.monitor()
    }

    /// Schedule a deferred re-run of `maybe_spawn`, coalescing with any
    /// deferral already pending.
    fn defer(&self, delay: Duration) {
        if self
            .rerun_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let Some(handler) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handler.rerun_pending.store(false, Ordering::SeqCst);
            if let Err(err) = handler.maybe_spawn().await {
                warn!(error = %err, "deferred spawn attempt failed");
            }
        });
    }

    /// Create an isolated worktree for tasks that request one, pointing the
    /// task's working directory at it.
    async fn prepare_worktree(&self, task: &mut foreman_db::models::Task) -> Result<()> {
        let Some(manager) = &self.worktrees else {
            return Ok(());
        };
        let Some(config) = &task.worktree else {
            return Ok(());
        };
        if !config.enabled {
            return Ok(());
        }
        let Some(repo_dir) = task.working_directory.clone() else {
            return Ok(());
        };

        let info = manager.create_worktree(task, Path::new(&repo_dir))?;
        let updated = self
            .tasks
            .update(
                &task.id,
                TaskPatch {
                    working_directory: Some(Some(info.path.display().to_string())),
                    ..Default::default()
                },
            )
            .await?;
        *task = updated;
        Ok(())
    }

    /// Cancellation triage.
    ///
    /// Terminal tasks refuse with `TaskCannotCancel`; running tasks get
    /// their worker killed; queued tasks are removed from the queue and
    /// cancelled directly (the queue is the single writer for that case).
    async fn on_cancellation_requested(
        &self,
        task_id: &str,
        reason: Option<String>,
    ) -> Result<()> {
        let task = self
            .tasks
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| Error::task_not_found(task_id))?;

        match task.status {
            status if status.is_terminal() => Err(Error::cannot_cancel(task_id, status)),
            TaskStatus::Running => {
                let worker = self
                    .pool
                    .worker_for_task(task_id)
                    .await
                    .ok_or_else(|| Error::worker_not_found(task_id))?;
                self.pool
                    .kill(&worker.worker_id, reason.as_deref().unwrap_or("cancelled"))
                    .await?;
                self.bus
                    .emit(Event::TaskCancelled {
                        task_id: task_id.to_string(),
                        reason,
                    })
                    .await?;
                Ok(())
            }
            _ => {
                self.queue.remove(task_id);
                self.bus
                    .emit(Event::TaskCancelled {
                        task_id: task_id.to_string(),
                        reason,
                    })
                    .await?;
                Ok(())
            }
        }
    }
}
