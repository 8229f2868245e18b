//! Shared wiring for lifecycle integration tests: a fully assembled daemon
//! core driven by a fake agent shell script instead of a real agent binary.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use foreman_db::models::TaskStatus;
use foreman_db::repo::{
    CheckpointRepository, DependencyRepository, TaskOutputRepository, TaskRepository,
};
use foreman_test_utils::{TestDb, create_test_db};

use foreman_core::bus::{Event, EventBus, EventKind};
use foreman_core::capture::{CaptureConfig, OutputCapture};
use foreman_core::handlers::dependency::DependencyHandlerConfig;
use foreman_core::handlers::worker::WorkerHandlerConfig;
use foreman_core::handlers::{
    CheckpointHandler, DependencyHandler, StatusHandler, WorkerHandler,
};
use foreman_core::manager::{TaskDefaults, TaskManager};
use foreman_core::monitor::WorkerSlotMonitor;
use foreman_core::pool::WorkerPool;
use foreman_core::queue::{PriorityQueue, QueueService};
use foreman_core::recovery::RecoveryManager;
use foreman_core::spawn::ScriptSpawner;

/// An event observed on the bus, stamped at receipt.
#[derive(Clone)]
pub struct RecordedEvent {
    pub at: Instant,
    pub event: Event,
}

pub struct TestDaemon {
    pub db: TestDb,
    pub bus: Arc<EventBus>,
    pub queue: Arc<PriorityQueue>,
    pub tasks: TaskRepository,
    pub deps: DependencyRepository,
    pub checkpoints: CheckpointRepository,
    pub manager: Arc<TaskManager>,
    pub pool: Arc<WorkerPool>,
    pub dependency_handler: Arc<DependencyHandler>,
    pub events: Arc<Mutex<Vec<RecordedEvent>>>,
    _spill_dir: tempfile::TempDir,
}

pub struct DaemonOptions {
    pub script: PathBuf,
    pub max_workers: usize,
    pub min_spawn_delay: Duration,
    pub spawn_backoff: Duration,
    pub kill_grace: Duration,
}

impl DaemonOptions {
    pub fn with_script(script: PathBuf) -> Self {
        Self {
            script,
            max_workers: 4,
            min_spawn_delay: Duration::ZERO,
            spawn_backoff: Duration::from_millis(50),
            kill_grace: Duration::from_millis(500),
        }
    }
}

const RECORDED_KINDS: &[EventKind] = &[
    EventKind::TaskQueued,
    EventKind::TaskUnblocked,
    EventKind::TaskDependencyAdded,
    EventKind::TaskDependencyFailed,
    EventKind::TaskDependencyResolved,
    EventKind::WorkerSpawned,
    EventKind::WorkerKilled,
    EventKind::TaskStarted,
    EventKind::TaskCompleted,
    EventKind::TaskFailed,
    EventKind::TaskCancelled,
    EventKind::TaskTimeout,
    EventKind::CheckpointCreated,
    EventKind::RecoveryStarted,
    EventKind::RecoveryCompleted,
    EventKind::TaskResumed,
];

/// Assemble the full daemon core in boot order: status, checkpoint,
/// dependency, queue, worker.
pub async fn build_daemon(options: DaemonOptions) -> TestDaemon {
    let db = create_test_db().await;
    let pool_handle = db.pool().clone();

    let tasks = TaskRepository::new(pool_handle.clone());
    let deps = DependencyRepository::new(pool_handle.clone());
    let checkpoints = CheckpointRepository::new(pool_handle.clone());
    let output_repo = TaskOutputRepository::new(pool_handle.clone());

    let bus = Arc::new(EventBus::default());
    let spill_dir = tempfile::tempdir().expect("spill dir");
    let capture = Arc::new(OutputCapture::new(CaptureConfig {
        spill_dir: spill_dir.path().to_path_buf(),
        ..Default::default()
    }));
    let queue = Arc::new(PriorityQueue::new());
    let monitor = Arc::new(WorkerSlotMonitor::new(options.max_workers));
    let spawner = Arc::new(ScriptSpawner::new(options.script.clone()));

    let worker_pool = WorkerPool::new(
        Arc::clone(&bus),
        spawner,
        monitor,
        Arc::clone(&capture),
        output_repo.clone(),
        options.kill_grace,
    );

    let events: Arc<Mutex<Vec<RecordedEvent>>> = Arc::new(Mutex::new(Vec::new()));
    for kind in RECORDED_KINDS {
        let events = Arc::clone(&events);
        bus.subscribe(*kind, move |event| {
            let events = Arc::clone(&events);
            Box::pin(async move {
                events.lock().unwrap().push(RecordedEvent {
                    at: Instant::now(),
                    event,
                });
                Ok(())
            })
        })
        .expect("recorder subscription");
    }

    StatusHandler::register(&bus, tasks.clone(), Arc::clone(&capture), output_repo.clone())
        .expect("status handler");
    CheckpointHandler::register(
        Arc::clone(&bus),
        tasks.clone(),
        checkpoints.clone(),
        Arc::clone(&capture),
        None,
    )
    .expect("checkpoint handler");
    let dependency_handler = DependencyHandler::register(
        Arc::clone(&bus),
        deps.clone(),
        tasks.clone(),
        Some(checkpoints.clone()),
        DependencyHandlerConfig {
            enrich_timeout: Duration::from_millis(500),
            ..Default::default()
        },
    )
    .await
    .expect("dependency handler");
    QueueService::register(
        Arc::clone(&bus),
        Arc::clone(&queue),
        tasks.clone(),
        deps.clone(),
    )
    .expect("queue service");
    WorkerHandler::register(
        Arc::clone(&bus),
        Arc::clone(&worker_pool),
        Arc::clone(&queue),
        tasks.clone(),
        Arc::clone(&capture),
        None,
        WorkerHandlerConfig {
            min_spawn_delay: options.min_spawn_delay,
            spawn_backoff: options.spawn_backoff,
        },
    )
    .expect("worker handler");

    let manager = TaskManager::new(
        Arc::clone(&bus),
        tasks.clone(),
        Some(checkpoints.clone()),
        TaskDefaults::default(),
    );

    TestDaemon {
        db,
        bus,
        queue,
        tasks,
        deps,
        checkpoints,
        manager,
        pool: worker_pool,
        dependency_handler,
        events,
        _spill_dir: spill_dir,
    }
}

impl TestDaemon {
    pub fn recovery(&self) -> RecoveryManager {
        RecoveryManager::new(
            Arc::clone(&self.bus),
            self.tasks.clone(),
            Arc::clone(&self.queue),
        )
    }

    /// Snapshot of recorded events matching `kind`.
    pub fn events_of(&self, kind: EventKind) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.event.kind() == kind)
            .cloned()
            .collect()
    }

    /// Poll until the task reaches `status`, panicking after `timeout`.
    pub async fn wait_for_status(&self, task_id: &str, status: TaskStatus, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let task = self
                .tasks
                .find_by_id(task_id)
                .await
                .expect("find should succeed");
            if let Some(task) = task {
                if task.status == status {
                    return;
                }
                if Instant::now() > deadline {
                    panic!(
                        "task {task_id} never reached {status}; stuck at {}",
                        task.status
                    );
                }
            } else if Instant::now() > deadline {
                panic!("task {task_id} never appeared");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until `predicate` holds, panicking after `timeout`.
    pub async fn wait_until<F>(&self, mut predicate: F, timeout: Duration, what: &str)
    where
        F: FnMut(&TestDaemon) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while !predicate(self) {
            if Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Write an executable shell script into `dir`.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("make script executable");
    path
}

/// A well-behaved fake agent: echoes a line and exits cleanly.
#[cfg(unix)]
pub fn quick_agent(dir: &Path) -> PathBuf {
    write_script(dir, "quick_agent.sh", "#!/bin/sh\necho \"done: $FOREMAN_TASK_ID\"\nexit 0\n")
}

/// A fake agent that never finishes on its own.
#[cfg(unix)]
pub fn hanging_agent(dir: &Path) -> PathBuf {
    write_script(dir, "hanging_agent.sh", "#!/bin/sh\nexec sleep 3600\n")
}

/// A fake agent that fails with a message on stderr.
#[cfg(unix)]
pub fn failing_agent(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "failing_agent.sh",
        "#!/bin/sh\necho 'something broke' >&2\nexit 3\n",
    )
}
