//! Worker pool: owns every in-flight agent subprocess.
//!
//! Each spawned worker gets a shepherd task that pumps stdout/stderr into
//! the output capture (persisting chunks best-effort), enforces the
//! per-task timeout, reaps the process on exit, and reports the terminal
//! event. Kill goes soft-terminate first, then hard after a grace period.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use foreman_db::models::{OutputStream, Task};
use foreman_db::repo::TaskOutputRepository;
use foreman_db::{Error, Result};

use crate::bus::{Event, EventBus};
use crate::capture::OutputCapture;
use crate::monitor::ResourceMonitor;
use crate::spawn::ProcessSpawner;

/// Default soft-to-hard kill grace period.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Public projection of a worker record, without the process handle.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub task_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

struct WorkerEntry {
    info: WorkerInfo,
    child: Child,
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<String, WorkerEntry>,
    by_task: HashMap<String, String>,
}

impl Registry {
    /// Remove and return the entry for `worker_id`, clearing both indexes.
    fn take(&mut self, worker_id: &str) -> Option<WorkerEntry> {
        let entry = self.by_id.remove(worker_id)?;
        self.by_task.remove(&entry.info.task_id);
        Some(entry)
    }
}

pub struct WorkerPool {
    bus: Arc<EventBus>,
    spawner: Arc<dyn ProcessSpawner>,
    monitor: Arc<dyn ResourceMonitor>,
    capture: Arc<OutputCapture>,
    output_repo: TaskOutputRepository,
    registry: Mutex<Registry>,
    kill_grace: Duration,
    /// Self-handle so shepherd tasks can outlive the `spawn` call.
    weak_self: Weak<WorkerPool>,
}

impl WorkerPool {
    pub fn new(
        bus: Arc<EventBus>,
        spawner: Arc<dyn ProcessSpawner>,
        monitor: Arc<dyn ResourceMonitor>,
        capture: Arc<OutputCapture>,
        output_repo: TaskOutputRepository,
        kill_grace: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            bus,
            spawner,
            monitor,
            capture,
            output_repo,
            registry: Mutex::new(Registry::default()),
            kill_grace,
            weak_self: weak_self.clone(),
        })
    }

    /// Spawn a worker for the task.
    ///
    /// Admission control runs first; a refused spawn costs nothing. On
    /// success the worker record is registered and a shepherd task takes
    /// over the process's lifetime.
    pub async fn spawn(&self, task: &Task) -> Result<WorkerInfo> {
        if !self.monitor.can_spawn_worker().await? {
            return Err(Error::insufficient_resources(
                "host resources do not admit another worker",
            )
            .with_ctx("task_id", &task.id));
        }

        let working_dir = task.working_directory.as_ref().map(std::path::Path::new);
        let mut spawned = self
            .spawner
            .spawn(&task.prompt, working_dir, &task.id)
            .await?;

        let info = WorkerInfo {
            worker_id: format!("worker-{}", spawned.pid),
            task_id: task.id.clone(),
            pid: spawned.pid,
            started_at: Utc::now(),
        };

        let stdout = spawned.child.stdout.take();
        let stderr = spawned.child.stderr.take();

        {
            let mut registry = self.registry.lock().await;
            registry.by_task.insert(task.id.clone(), info.worker_id.clone());
            registry.by_id.insert(
                info.worker_id.clone(),
                WorkerEntry {
                    info: info.clone(),
                    child: spawned.child,
                },
            );
        }
        self.monitor.worker_started();

        let timeout_ms = task.timeout_ms.filter(|t| *t > 0);
        let pool = self
            .weak_self
            .upgrade()
            .ok_or_else(|| Error::system("worker pool is shutting down"))?;
        let shepherd_info = info.clone();
        tokio::spawn(async move {
            pool.run_worker(shepherd_info, timeout_ms, stdout, stderr)
                .await;
        });

        info!(
            worker_id = %info.worker_id,
            task_id = %info.task_id,
            pid = info.pid,
            "worker spawned"
        );
        Ok(info)
    }

    /// Shepherd one worker: pump its streams, watch the timeout, reap the
    /// exit, and emit the terminal event.
    async fn run_worker(
        self: Arc<Self>,
        info: WorkerInfo,
        timeout_ms: Option<i64>,
        stdout: Option<tokio::process::ChildStdout>,
        stderr: Option<tokio::process::ChildStderr>,
    ) {
        let io = async {
            tokio::join!(
                self.pump(&info.task_id, OutputStream::Stdout, stdout),
                self.pump(&info.task_id, OutputStream::Stderr, stderr),
            );
        };
        tokio::pin!(io);

        let timed_out = match timeout_ms {
            Some(ms) => {
                let deadline = Duration::from_millis(ms as u64);
                tokio::select! {
                    _ = &mut io => false,
                    _ = tokio::time::sleep(deadline) => true,
                }
            }
            None => {
                io.await;
                false
            }
        };

        if timed_out {
            self.handle_timeout(&info, timeout_ms.unwrap_or(0)).await;
            return;
        }

        // Streams hit EOF; reap the process unless a kill got there first.
        let entry = self.registry.lock().await.take(&info.worker_id);
        let Some(mut entry) = entry else {
            debug!(worker_id = %info.worker_id, "worker already removed, skipping exit handling");
            return;
        };

        let status = entry.child.wait().await;
        self.monitor.worker_stopped();
        let duration_ms = (Utc::now() - entry.info.started_at)
            .num_milliseconds()
            .max(0);

        let event = match status {
            Ok(status) => {
                let exit_code = i64::from(status.code().unwrap_or(-1));
                if exit_code == 0 {
                    Event::TaskCompleted {
                        task_id: info.task_id.clone(),
                        exit_code,
                        duration_ms,
                    }
                } else {
                    Event::TaskFailed {
                        task_id: info.task_id.clone(),
                        exit_code,
                        error: None,
                    }
                }
            }
            Err(err) => Event::TaskFailed {
                task_id: info.task_id.clone(),
                exit_code: -1,
                error: Some(format!("failed to reap worker process: {err}")),
            },
        };

        if let Err(err) = self.bus.emit(event).await {
            error!(
                worker_id = %info.worker_id,
                task_id = %info.task_id,
                error = %err,
                "terminal event handling failed"
            );
        }
    }

    /// Copy one stream into the capture, persisting each accepted chunk
    /// best-effort.
    async fn pump<R>(&self, task_id: &str, stream: OutputStream, reader: Option<R>)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let Some(mut reader) = reader else { return };
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = &buf[..n];
                    match self.capture.capture(task_id, stream, chunk).await {
                        Ok(()) => {
                            let text = String::from_utf8_lossy(chunk);
                            if let Err(err) =
                                self.output_repo.append(task_id, stream, &text).await
                            {
                                warn!(
                                    task_id,
                                    stream = %stream,
                                    error = %err,
                                    "failed to persist output chunk (best-effort)"
                                );
                            }
                        }
                        Err(err) => {
                            warn!(task_id, stream = %stream, error = %err, "output chunk dropped");
                        }
                    }
                }
                Err(err) => {
                    warn!(task_id, stream = %stream, error = %err, "error reading worker stream");
                    break;
                }
            }
        }
    }

    /// The per-task timer fired: kill the process and report `TaskTimeout`.
    async fn handle_timeout(&self, info: &WorkerInfo, timeout_ms: i64) {
        let entry = self.registry.lock().await.take(&info.worker_id);
        let Some(entry) = entry else { return };

        warn!(
            worker_id = %info.worker_id,
            task_id = %info.task_id,
            timeout_ms,
            "task timed out, killing worker"
        );
        if let Err(err) = self.terminate(entry.child, entry.info.pid).await {
            warn!(worker_id = %info.worker_id, error = %err, "failed to kill timed-out worker");
        }
        self.monitor.worker_stopped();

        if let Err(err) = self
            .bus
            .emit(Event::TaskTimeout {
                task_id: info.task_id.clone(),
                timeout_ms,
            })
            .await
        {
            error!(task_id = %info.task_id, error = %err, "timeout event handling failed");
        }
    }

    /// Kill one worker: soft-terminate, grace period, hard kill. Emits
    /// `WorkerKilled` on success.
    pub async fn kill(&self, worker_id: &str, reason: &str) -> Result<()> {
        let entry = self
            .registry
            .lock()
            .await
            .take(worker_id)
            .ok_or_else(|| Error::worker_not_found(worker_id))?;

        let task_id = entry.info.task_id.clone();
        let pid = entry.info.pid;
        self.terminate(entry.child, pid).await?;
        self.monitor.worker_stopped();

        info!(worker_id, task_id = %task_id, reason, "worker killed");
        if let Err(err) = self
            .bus
            .emit(Event::WorkerKilled {
                worker_id: worker_id.to_string(),
                task_id,
                reason: reason.to_string(),
            })
            .await
        {
            warn!(worker_id, error = %err, "WorkerKilled handling failed");
        }
        Ok(())
    }

    /// Kill every worker concurrently. Always succeeds; individual
    /// failures are logged.
    pub async fn kill_all(&self, reason: &str) -> Result<()> {
        let entries: Vec<WorkerEntry> = {
            let mut registry = self.registry.lock().await;
            registry.by_task.clear();
            registry.by_id.drain().map(|(_, entry)| entry).collect()
        };

        let kills = entries.into_iter().map(|entry| {
            let reason = reason.to_string();
            async move {
                let worker_id = entry.info.worker_id.clone();
                let task_id = entry.info.task_id.clone();
                let pid = entry.info.pid;
                if let Err(err) = self.terminate(entry.child, pid).await {
                    warn!(worker_id = %worker_id, error = %err, "failed to kill worker");
                }
                self.monitor.worker_stopped();
                if let Err(err) = self
                    .bus
                    .emit(Event::WorkerKilled {
                        worker_id: worker_id.clone(),
                        task_id,
                        reason,
                    })
                    .await
                {
                    warn!(worker_id = %worker_id, error = %err, "WorkerKilled handling failed");
                }
            }
        });
        futures::future::join_all(kills).await;
        Ok(())
    }

    /// Soft-terminate, wait out the grace period, then hard-kill.
    async fn terminate(&self, mut child: Child, pid: u32) -> Result<()> {
        #[cfg(unix)]
        {
            // SAFETY: pid belongs to a child this pool spawned.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                debug!(pid, "SIGTERM failed, process may have already exited");
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(_status)) => Ok(()),
            _ => {
                debug!(pid, "worker survived soft-terminate, sending hard kill");
                child.kill().await.map_err(|e| {
                    Error::new(
                        foreman_db::ErrorCode::ProcessKillFailed,
                        format!("failed to hard-kill pid {pid}: {e}"),
                    )
                })
            }
        }
    }

    /// The admission-control monitor this pool consults.
    pub fn monitor(&self) -> &Arc<dyn ResourceMonitor> {
        &self.monitor
    }

    /// Worker record for a task, if one is live.
    pub async fn worker_for_task(&self, task_id: &str) -> Option<WorkerInfo> {
        let registry = self.registry.lock().await;
        let worker_id = registry.by_task.get(task_id)?;
        registry.by_id.get(worker_id).map(|e| e.info.clone())
    }

    pub async fn worker_count(&self) -> usize {
        self.registry.lock().await.by_id.len()
    }

    pub async fn workers(&self) -> Vec<WorkerInfo> {
        self.registry
            .lock()
            .await
            .by_id
            .values()
            .map(|e| e.info.clone())
            .collect()
    }
}
