//! Boot sequence: assemble the core components in dependency order and
//! register every handler before any request can arrive.
//!
//! Registration order is load-bearing. On lifecycle events the status
//! handler must write first, the checkpoint handler second (so a
//! checkpoint exists when the dependency handler probes for one), and the
//! dependency handler third; on `TaskQueued` the queue service must
//! enqueue before the worker handler asks for the next task.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use foreman_core::bus::{BusConfig, EventBus};
use foreman_core::capture::{CaptureConfig, OutputCapture};
use foreman_core::handlers::dependency::DependencyHandlerConfig;
use foreman_core::handlers::worker::WorkerHandlerConfig;
use foreman_core::handlers::{CheckpointHandler, DependencyHandler, StatusHandler, WorkerHandler};
use foreman_core::manager::{TaskDefaults, TaskManager};
use foreman_core::monitor::WorkerSlotMonitor;
use foreman_core::pool::WorkerPool;
use foreman_core::queue::{PriorityQueue, QueueService};
use foreman_core::recovery::RecoveryManager;
use foreman_core::schedule::{ScheduleEngine, ScheduleEngineConfig};
use foreman_core::spawn::AgentSpawner;
use foreman_core::worktree::WorktreeManager;
use foreman_db::config::DbConfig;
use foreman_db::repo::{
    CheckpointRepository, DependencyRepository, ScheduleRepository, TaskOutputRepository,
    TaskRepository,
};

use crate::config::ConfigFile;

/// A fully wired daemon core.
pub struct Daemon {
    pub bus: Arc<EventBus>,
    pub manager: Arc<TaskManager>,
    pub pool: Arc<WorkerPool>,
    pub recovery: RecoveryManager,
    pub schedule_engine: Arc<ScheduleEngine>,
    pub shutdown: CancellationToken,
}

pub async fn build_daemon(
    config: &ConfigFile,
    db_config: &DbConfig,
    db_pool: SqlitePool,
) -> Result<Daemon> {
    let tasks = TaskRepository::new(db_pool.clone());
    let deps = DependencyRepository::new(db_pool.clone());
    let checkpoints = CheckpointRepository::new(db_pool.clone());
    let schedules = ScheduleRepository::new(db_pool.clone());
    let output_repo = TaskOutputRepository::new(db_pool);

    let bus = Arc::new(EventBus::new(BusConfig::default()));
    let queue = Arc::new(PriorityQueue::new());
    let capture = Arc::new(OutputCapture::new(CaptureConfig {
        spill_dir: db_config.data_dir().join("output"),
        ..Default::default()
    }));
    let worktrees = Arc::new(WorktreeManager::new(db_config.data_dir().join("worktrees")));
    let monitor = Arc::new(WorkerSlotMonitor::new(config.worker.max_workers));
    let spawner = Arc::new(AgentSpawner::new(
        config.worker.program.clone(),
        config.worker.args.clone(),
    ));

    let pool = WorkerPool::new(
        Arc::clone(&bus),
        spawner,
        monitor,
        Arc::clone(&capture),
        output_repo.clone(),
        config.kill_grace(),
    );

    StatusHandler::register(&bus, tasks.clone(), Arc::clone(&capture), output_repo)
        .context("failed to register status handler")?;
    CheckpointHandler::register(
        Arc::clone(&bus),
        tasks.clone(),
        checkpoints.clone(),
        Arc::clone(&capture),
        Some(Arc::clone(&worktrees)),
    )
    .context("failed to register checkpoint handler")?;
    DependencyHandler::register(
        Arc::clone(&bus),
        deps.clone(),
        tasks.clone(),
        Some(checkpoints.clone()),
        DependencyHandlerConfig::default(),
    )
    .await
    .context("failed to register dependency handler")?;
    QueueService::register(
        Arc::clone(&bus),
        Arc::clone(&queue),
        tasks.clone(),
        deps,
    )
    .context("failed to register queue service")?;
    WorkerHandler::register(
        Arc::clone(&bus),
        Arc::clone(&pool),
        Arc::clone(&queue),
        tasks.clone(),
        Arc::clone(&capture),
        Some(worktrees),
        WorkerHandlerConfig {
            min_spawn_delay: config.min_spawn_delay(),
            spawn_backoff: config.spawn_backoff(),
        },
    )
    .context("failed to register worker handler")?;

    let manager = TaskManager::new(
        Arc::clone(&bus),
        tasks.clone(),
        Some(checkpoints),
        TaskDefaults {
            timeout_ms: config.tasks.default_timeout_ms,
            max_output_buffer: config.tasks.default_max_output_buffer,
            use_worktree_by_default: config.tasks.use_worktree_by_default,
        },
    );

    let recovery = RecoveryManager::new(Arc::clone(&bus), tasks, Arc::clone(&queue));

    let shutdown = CancellationToken::new();
    let schedule_engine = ScheduleEngine::new(
        schedules,
        Arc::clone(&manager),
        ScheduleEngineConfig {
            poll_interval: config.poll_interval(),
            ..Default::default()
        },
        shutdown.clone(),
    );

    Ok(Daemon {
        bus,
        manager,
        pool,
        recovery,
        schedule_engine,
        shutdown,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::server::dispatch;

    fn fake_agent(dir: &std::path::Path) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake_agent.sh");
        std::fs::write(&path, "#!/bin/sh\necho ran\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn test_daemon(dir: &std::path::Path) -> (Daemon, foreman_test_utils::TestDb) {
        let db = foreman_test_utils::create_test_db().await;
        let mut config = ConfigFile::default();
        config.worker.program = fake_agent(dir).display().to_string();
        config.worker.args = Vec::new();
        config.spawn.min_spawn_delay_ms = 0;

        let db_config = DbConfig::new(dir.join("unused.db"));
        let daemon = build_daemon(&config, &db_config, db.pool().clone())
            .await
            .expect("daemon should build");
        (daemon, db)
    }

    #[tokio::test]
    async fn delegate_status_and_logs_round_trip_over_dispatch() {
        let tmp = tempfile::tempdir().unwrap();
        let (daemon, _db) = test_daemon(tmp.path()).await;

        let value = dispatch(
            &daemon.manager,
            "delegate",
            serde_json::json!({"prompt": "do a thing", "priority": "P0"}),
        )
        .await
        .expect("delegate should succeed");
        let task_id = value["id"].as_str().unwrap().to_string();
        assert_eq!(value["status"], "queued");
        assert_eq!(value["priority"], "P0");

        // Wait for the fake agent to finish.
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let status = dispatch(
                &daemon.manager,
                "status",
                serde_json::json!({"task_id": task_id}),
            )
            .await
            .expect("status should succeed");
            if status["status"] == "completed" {
                assert_eq!(status["exit_code"], 0);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "task never completed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let logs = dispatch(
            &daemon.manager,
            "logs",
            serde_json::json!({"task_id": task_id}),
        )
        .await
        .expect("logs should succeed");
        let stdout: Vec<String> =
            serde_json::from_value(logs["stdout"].clone()).expect("stdout array");
        assert!(stdout.concat().contains("ran"));
    }

    #[tokio::test]
    async fn unknown_method_and_bad_params_are_invalid_operations() {
        let tmp = tempfile::tempdir().unwrap();
        let (daemon, _db) = test_daemon(tmp.path()).await;

        let err = dispatch(&daemon.manager, "frobnicate", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, foreman_db::ErrorCode::InvalidOperation);

        let err = dispatch(&daemon.manager, "delegate", serde_json::json!({"nope": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.code, foreman_db::ErrorCode::InvalidOperation);
    }

    #[tokio::test]
    async fn status_of_unknown_task_is_task_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let (daemon, _db) = test_daemon(tmp.path()).await;

        let err = dispatch(
            &daemon.manager,
            "status",
            serde_json::json!({"task_id": "ghost"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, foreman_db::ErrorCode::TaskNotFound);
    }
}
