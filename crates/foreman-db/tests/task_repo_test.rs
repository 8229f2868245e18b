//! Integration tests for the task repository.

use chrono::{Duration, Utc};

use foreman_db::models::{Priority, Task, TaskPatch, TaskStatus, WorktreeConfig};
use foreman_db::repo::TaskRepository;
use foreman_test_utils::create_test_db;

fn sample_task() -> Task {
    let mut task = Task::new("refactor the parser", Priority::P1);
    task.working_directory = Some("/srv/project".to_string());
    task.timeout_ms = Some(60_000);
    task.max_output_buffer = Some(1024 * 1024);
    task.worktree = Some(WorktreeConfig {
        enabled: true,
        base_branch: Some("main".to_string()),
    });
    task
}

#[tokio::test]
async fn save_and_find_round_trip() {
    let db = create_test_db().await;
    let repo = TaskRepository::new(db.pool().clone());

    let mut task = sample_task();
    task.depends_on = vec!["dep-1".to_string(), "dep-2".to_string()];

    repo.save(&task).await.expect("save should succeed");
    let loaded = repo
        .find_by_id(&task.id)
        .await
        .expect("find should succeed")
        .expect("task should exist");

    assert_eq!(loaded.id, task.id);
    assert_eq!(loaded.prompt, task.prompt);
    assert_eq!(loaded.priority, task.priority);
    assert_eq!(loaded.status, TaskStatus::Queued);
    assert_eq!(loaded.working_directory, task.working_directory);
    assert_eq!(loaded.timeout_ms, task.timeout_ms);
    assert_eq!(loaded.max_output_buffer, task.max_output_buffer);
    assert_eq!(loaded.worktree, task.worktree);
    assert_eq!(loaded.depends_on, task.depends_on);
    assert_eq!(loaded.retry_count, 0);
}

#[tokio::test]
async fn save_is_an_upsert() {
    let db = create_test_db().await;
    let repo = TaskRepository::new(db.pool().clone());

    let mut task = sample_task();
    repo.save(&task).await.unwrap();

    task.prompt = "refactor the lexer instead".to_string();
    repo.save(&task).await.expect("second save should replace");

    let loaded = repo.find_by_id(&task.id).await.unwrap().unwrap();
    assert_eq!(loaded.prompt, "refactor the lexer instead");

    let all = repo.find_all().await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn find_by_missing_id_returns_none() {
    let db = create_test_db().await;
    let repo = TaskRepository::new(db.pool().clone());
    assert!(repo.find_by_id("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn find_by_status_filters() {
    let db = create_test_db().await;
    let repo = TaskRepository::new(db.pool().clone());

    let queued = sample_task();
    let mut failed = sample_task();
    failed.status = TaskStatus::Failed;
    failed.completed_at = Some(Utc::now());
    repo.save(&queued).await.unwrap();
    repo.save(&failed).await.unwrap();

    let queued_rows = repo.find_by_status(TaskStatus::Queued).await.unwrap();
    assert_eq!(queued_rows.len(), 1);
    assert_eq!(queued_rows[0].id, queued.id);

    let failed_rows = repo.find_by_status(TaskStatus::Failed).await.unwrap();
    assert_eq!(failed_rows.len(), 1);
    assert_eq!(failed_rows[0].id, failed.id);
}

#[tokio::test]
async fn update_applies_patch_and_bumps_updated_at() {
    let db = create_test_db().await;
    let repo = TaskRepository::new(db.pool().clone());

    let task = sample_task();
    repo.save(&task).await.unwrap();

    let started = Utc::now();
    let updated = repo
        .update(
            &task.id,
            TaskPatch {
                status: Some(TaskStatus::Running),
                worker_id: Some(Some("worker-42".to_string())),
                started_at: Some(Some(started)),
                ..Default::default()
            },
        )
        .await
        .expect("update should succeed");

    assert_eq!(updated.status, TaskStatus::Running);
    assert_eq!(updated.worker_id.as_deref(), Some("worker-42"));
    assert!(updated.updated_at >= task.updated_at);

    let loaded = repo.find_by_id(&task.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::Running);
}

#[tokio::test]
async fn update_missing_task_is_task_not_found() {
    let db = create_test_db().await;
    let repo = TaskRepository::new(db.pool().clone());

    let err = repo
        .update("ghost", TaskPatch::default())
        .await
        .expect_err("should fail");
    assert_eq!(err.code, foreman_db::ErrorCode::TaskNotFound);
}

#[tokio::test]
async fn update_can_clear_nullable_fields() {
    let db = create_test_db().await;
    let repo = TaskRepository::new(db.pool().clone());

    let mut task = sample_task();
    task.worker_id = Some("worker-1".to_string());
    repo.save(&task).await.unwrap();

    let updated = repo
        .update(
            &task.id,
            TaskPatch {
                worker_id: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(updated.worker_id.is_none());
}

#[tokio::test]
async fn delete_removes_the_row() {
    let db = create_test_db().await;
    let repo = TaskRepository::new(db.pool().clone());

    let task = sample_task();
    repo.save(&task).await.unwrap();

    assert!(repo.delete(&task.id).await.unwrap());
    assert!(!repo.delete(&task.id).await.unwrap());
    assert!(repo.find_by_id(&task.id).await.unwrap().is_none());
}

#[tokio::test]
async fn cleanup_removes_only_old_terminal_tasks() {
    let db = create_test_db().await;
    let repo = TaskRepository::new(db.pool().clone());

    let mut old_done = sample_task();
    old_done.status = TaskStatus::Completed;
    old_done.completed_at = Some(Utc::now() - Duration::days(10));

    let mut fresh_done = sample_task();
    fresh_done.status = TaskStatus::Completed;
    fresh_done.completed_at = Some(Utc::now() - Duration::hours(1));

    let still_queued = sample_task();

    repo.save(&old_done).await.unwrap();
    repo.save(&fresh_done).await.unwrap();
    repo.save(&still_queued).await.unwrap();

    let removed = repo.cleanup_old_tasks(Duration::days(7)).await.unwrap();
    assert_eq!(removed, vec![old_done.id.clone()]);

    assert!(repo.find_by_id(&old_done.id).await.unwrap().is_none());
    assert!(repo.find_by_id(&fresh_done.id).await.unwrap().is_some());
    assert!(repo.find_by_id(&still_queued.id).await.unwrap().is_some());
}
