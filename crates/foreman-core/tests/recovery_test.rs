//! Recovery tests: startup reconciliation of persisted state.

#![cfg(unix)]

mod common;

use std::time::Duration;

use chrono::Utc;

use foreman_core::bus::{Event, EventKind};
use foreman_db::models::{Priority, Task, TaskStatus};

use common::{DaemonOptions, build_daemon, quick_agent};

const WAIT: Duration = Duration::from_secs(10);

fn seeded_task(prompt: &str, status: TaskStatus) -> Task {
    let mut task = Task::new(prompt, Priority::P1);
    task.status = status;
    if status.is_terminal() {
        task.completed_at = Some(Utc::now());
    }
    task
}

#[tokio::test]
async fn stale_running_task_is_marked_failed() {
    let tmp = tempfile::tempdir().unwrap();
    let daemon = build_daemon(DaemonOptions::with_script(quick_agent(tmp.path()))).await;

    // Pre-seed a task that claims to have been running for 31 minutes.
    let mut stale = seeded_task("stale runner", TaskStatus::Running);
    stale.started_at = Some(Utc::now() - chrono::Duration::minutes(31));
    daemon.tasks.save(&stale).await.unwrap();

    let stats = daemon.recovery().run().await.unwrap();
    assert_eq!(stats.tasks_marked_failed, 1);

    let recovered = daemon.tasks.find_by_id(&stale.id).await.unwrap().unwrap();
    assert_eq!(recovered.status, TaskStatus::Failed);
    assert_eq!(recovered.exit_code, Some(-1));
    assert!(recovered.completed_at.is_some());

    let completed = daemon.events_of(EventKind::RecoveryCompleted);
    assert!(matches!(
        completed[0].event,
        Event::RecoveryCompleted {
            tasks_marked_failed: 1,
            ..
        }
    ));
}

#[tokio::test]
async fn running_task_at_exactly_the_threshold_is_requeued() {
    let tmp = tempfile::tempdir().unwrap();
    let daemon = build_daemon(DaemonOptions::with_script(quick_agent(tmp.path()))).await;

    // Strict inequality: exactly 30 minutes old is NOT stale. Leave a
    // margin so the elapsed wall-clock during the test cannot tip it over.
    let mut fresh = seeded_task("fresh runner", TaskStatus::Running);
    fresh.started_at = Some(Utc::now() - chrono::Duration::minutes(29));
    daemon.tasks.save(&fresh).await.unwrap();

    let stats = daemon.recovery().run().await.unwrap();
    assert_eq!(stats.tasks_marked_failed, 0);
    assert_eq!(stats.tasks_recovered, 1);

    // The task went back through the queue and ran to completion.
    daemon
        .wait_for_status(&fresh.id, TaskStatus::Completed, WAIT)
        .await;
}

#[tokio::test]
async fn queued_tasks_reenter_the_queue_exactly_once() {
    let tmp = tempfile::tempdir().unwrap();
    let daemon = build_daemon(DaemonOptions::with_script(quick_agent(tmp.path()))).await;

    let queued = seeded_task("waiting", TaskStatus::Queued);
    daemon.tasks.save(&queued).await.unwrap();

    let stats = daemon.recovery().run().await.unwrap();
    assert_eq!(stats.tasks_recovered, 1);
    daemon
        .wait_for_status(&queued.id, TaskStatus::Completed, WAIT)
        .await;

    // Exactly one spawn happened for it.
    let spawned = daemon.events_of(EventKind::WorkerSpawned);
    assert_eq!(spawned.len(), 1);
}

#[tokio::test]
async fn running_without_started_at_falls_back_to_created_at() {
    let tmp = tempfile::tempdir().unwrap();
    let daemon = build_daemon(DaemonOptions::with_script(quick_agent(tmp.path()))).await;

    let mut ancient = seeded_task("no started_at", TaskStatus::Running);
    ancient.created_at = Utc::now() - chrono::Duration::hours(2);
    ancient.started_at = None;
    daemon.tasks.save(&ancient).await.unwrap();

    let stats = daemon.recovery().run().await.unwrap();
    assert_eq!(stats.tasks_marked_failed, 1);
}

#[tokio::test]
async fn old_terminal_tasks_are_cleaned_up() {
    let tmp = tempfile::tempdir().unwrap();
    let daemon = build_daemon(DaemonOptions::with_script(quick_agent(tmp.path()))).await;

    let mut old = seeded_task("ancient history", TaskStatus::Completed);
    old.completed_at = Some(Utc::now() - chrono::Duration::days(8));
    daemon.tasks.save(&old).await.unwrap();

    let recent = seeded_task("recent history", TaskStatus::Completed);
    daemon.tasks.save(&recent).await.unwrap();

    daemon.recovery().run().await.unwrap();

    assert!(daemon.tasks.find_by_id(&old.id).await.unwrap().is_none());
    assert!(daemon.tasks.find_by_id(&recent.id).await.unwrap().is_some());
}

#[tokio::test]
async fn recovery_on_an_empty_store_reports_zeroes() {
    let tmp = tempfile::tempdir().unwrap();
    let daemon = build_daemon(DaemonOptions::with_script(quick_agent(tmp.path()))).await;

    let stats = daemon.recovery().run().await.unwrap();
    assert_eq!(stats.tasks_recovered, 0);
    assert_eq!(stats.tasks_marked_failed, 0);

    assert_eq!(daemon.events_of(EventKind::RecoveryStarted).len(), 1);
    assert_eq!(daemon.events_of(EventKind::RecoveryCompleted).len(), 1);
}
