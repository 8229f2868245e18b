//! Integration tests for the schedule repository.

use chrono::{Duration, Utc};

use foreman_db::models::{Schedule, ScheduleStatus, TaskTemplate};
use foreman_db::repo::ScheduleRepository;
use foreman_test_utils::create_test_db;

fn template() -> TaskTemplate {
    TaskTemplate {
        prompt: "run nightly maintenance".to_string(),
        priority: foreman_db::models::Priority::P2,
        working_directory: None,
        timeout_ms: Some(300_000),
        max_output_buffer: None,
        worktree: None,
    }
}

#[tokio::test]
async fn save_and_find_round_trip() {
    let db = create_test_db().await;
    let repo = ScheduleRepository::new(db.pool().clone());

    let mut schedule = Schedule::cron("nightly", "0 0 3 * * *", template());
    schedule.timezone = "Europe/Berlin".to_string();
    schedule.next_run_at = Some(Utc::now() + Duration::hours(1));
    repo.save(&schedule).await.expect("save should succeed");

    let loaded = repo
        .find_by_id(&schedule.id)
        .await
        .unwrap()
        .expect("should exist");
    assert_eq!(loaded.name, "nightly");
    assert_eq!(loaded.template, schedule.template);
    assert_eq!(loaded.timezone, "Europe/Berlin");
    assert_eq!(loaded.cron_expression.as_deref(), Some("0 0 3 * * *"));
    assert_eq!(loaded.status, ScheduleStatus::Active);
}

#[tokio::test]
async fn find_due_returns_only_due_active_schedules_in_order() {
    let db = create_test_db().await;
    let repo = ScheduleRepository::new(db.pool().clone());
    let now = Utc::now();

    let mut due_late = Schedule::cron("due-late", "0 0 * * * *", template());
    due_late.next_run_at = Some(now - Duration::minutes(1));
    let mut due_early = Schedule::cron("due-early", "0 0 * * * *", template());
    due_early.next_run_at = Some(now - Duration::minutes(10));
    let mut future = Schedule::cron("future", "0 0 * * * *", template());
    future.next_run_at = Some(now + Duration::hours(1));
    let mut paused = Schedule::cron("paused", "0 0 * * * *", template());
    paused.next_run_at = Some(now - Duration::minutes(5));
    paused.status = ScheduleStatus::Paused;

    for s in [&due_late, &due_early, &future, &paused] {
        repo.save(s).await.unwrap();
    }

    let due = repo.find_due(now).await.unwrap();
    let names: Vec<&str> = due.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["due-early", "due-late"]);
}

#[tokio::test]
async fn update_persists_run_bookkeeping() {
    let db = create_test_db().await;
    let repo = ScheduleRepository::new(db.pool().clone());

    let mut schedule = Schedule::once("one-shot", Utc::now(), template());
    repo.save(&schedule).await.unwrap();

    schedule.run_count = 1;
    schedule.last_run_at = Some(Utc::now());
    schedule.status = ScheduleStatus::Completed;
    schedule.next_run_at = None;
    repo.update(&schedule).await.expect("update should succeed");

    let loaded = repo.find_by_id(&schedule.id).await.unwrap().unwrap();
    assert_eq!(loaded.run_count, 1);
    assert_eq!(loaded.status, ScheduleStatus::Completed);
    assert!(loaded.next_run_at.is_none());
}

#[tokio::test]
async fn update_unknown_schedule_fails() {
    let db = create_test_db().await;
    let repo = ScheduleRepository::new(db.pool().clone());

    let schedule = Schedule::cron("ghost", "0 0 * * * *", template());
    let err = repo.update(&schedule).await.unwrap_err();
    assert_eq!(err.code, foreman_db::ErrorCode::InvalidOperation);
}

#[tokio::test]
async fn find_all_paginates() {
    let db = create_test_db().await;
    let repo = ScheduleRepository::new(db.pool().clone());

    for i in 0..5 {
        repo.save(&Schedule::cron(format!("s{i}"), "0 0 * * * *", template()))
            .await
            .unwrap();
    }

    assert_eq!(repo.count().await.unwrap(), 5);
    let page = repo.find_all(2, 2).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].name, "s2");
}

#[tokio::test]
async fn execution_history_is_recorded_newest_first() {
    let db = create_test_db().await;
    let repo = ScheduleRepository::new(db.pool().clone());

    let schedule = Schedule::cron("with-history", "0 0 * * * *", template());
    repo.save(&schedule).await.unwrap();

    repo.record_execution(&schedule.id, Some("task-1"), "dispatched", None)
        .await
        .unwrap();
    repo.record_execution(&schedule.id, None, "error", Some("delegate failed"))
        .await
        .unwrap();

    let history = repo.get_execution_history(&schedule.id, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, "error");
    assert_eq!(history[0].error.as_deref(), Some("delegate failed"));
    assert_eq!(history[1].task_id.as_deref(), Some("task-1"));
}

#[tokio::test]
async fn delete_removes_schedule_and_history() {
    let db = create_test_db().await;
    let repo = ScheduleRepository::new(db.pool().clone());

    let schedule = Schedule::cron("doomed", "0 0 * * * *", template());
    repo.save(&schedule).await.unwrap();
    repo.record_execution(&schedule.id, None, "dispatched", None)
        .await
        .unwrap();

    assert!(repo.delete(&schedule.id).await.unwrap());
    assert!(repo.find_by_id(&schedule.id).await.unwrap().is_none());
    assert!(
        repo.get_execution_history(&schedule.id, 10)
            .await
            .unwrap()
            .is_empty()
    );
}
