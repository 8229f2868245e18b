//! Dependency validation tests: cycle rejection, atomic batch adds, and
//! the chain-depth bound.

#![cfg(unix)]

mod common;

use std::time::Duration;

use foreman_core::bus::EventKind;
use foreman_core::manager::DelegateRequest;
use foreman_db::ErrorCode;
use foreman_db::models::{Priority, TaskStatus};

use common::{DaemonOptions, build_daemon, hanging_agent, write_script};

const WAIT: Duration = Duration::from_secs(10);

fn request(prompt: &str, depends_on: Vec<String>) -> DelegateRequest {
    DelegateRequest {
        prompt: prompt.to_string(),
        priority: Some(Priority::P1),
        working_directory: None,
        timeout_ms: None,
        max_output_buffer: None,
        worktree: None,
        depends_on,
        continue_from: None,
    }
}

#[tokio::test]
async fn unknown_dependency_rejects_the_whole_batch() {
    let tmp = tempfile::tempdir().unwrap();
    let daemon = build_daemon(DaemonOptions::with_script(hanging_agent(tmp.path()))).await;

    let a = daemon.manager.delegate(request("A", vec![])).await.unwrap();
    daemon.manager.cancel(a.id.clone(), None).await.ok();

    let err = daemon
        .manager
        .delegate(request("B", vec![a.id.clone(), "ghost".to_string()]))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::TaskNotFound);

    // No edge row survived and no TaskDependencyAdded fired.
    assert!(daemon.deps.find_all_unbounded().await.unwrap().is_empty());
    assert!(daemon.events_of(EventKind::TaskDependencyAdded).is_empty());
    assert_eq!(daemon.events_of(EventKind::TaskDependencyFailed).len(), 1);
}

#[tokio::test]
async fn rejected_delegation_marks_the_task_failed() {
    let tmp = tempfile::tempdir().unwrap();
    let daemon = build_daemon(DaemonOptions::with_script(hanging_agent(tmp.path()))).await;

    let err = daemon
        .manager
        .delegate(request("orphan", vec!["ghost".to_string()]))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::TaskNotFound);

    // The task row exists but is failed, and it never entered the queue.
    let all = daemon.tasks.find_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, TaskStatus::Failed);
    assert!(daemon.queue.is_empty());
}

#[tokio::test]
async fn cycle_is_rejected_with_no_rows_and_no_events() {
    // Use hanging workers so the chain stays pending while we probe.
    let tmp = tempfile::tempdir().unwrap();
    let daemon = build_daemon(DaemonOptions::with_script(hanging_agent(tmp.path()))).await;

    let x = daemon.manager.delegate(request("X", vec![])).await.unwrap();
    let y = daemon
        .manager
        .delegate(request("Y", vec![x.id.clone()]))
        .await
        .unwrap();
    let z = daemon
        .manager
        .delegate(request("Z", vec![y.id.clone()]))
        .await
        .unwrap();

    // A fresh task depending on the chain tail is fine.
    let w = daemon
        .manager
        .delegate(request("W", vec![z.id.clone()]))
        .await
        .unwrap();
    assert!(!daemon.events_of(EventKind::TaskDependencyAdded).is_empty());

    // The honest cycle: an edge from X back onto the chain that already
    // descends from X, injected the way an internal caller would.
    assert!(daemon.dependency_handler.would_create_cycle(&x.id, &z.id).await);
    let edges_before = daemon.deps.find_all_unbounded().await.unwrap().len();
    let added_before = daemon.events_of(EventKind::TaskDependencyAdded).len();

    let mut cyclic = x.clone();
    cyclic.depends_on = vec![z.id.clone()];
    let err = daemon
        .bus
        .emit(foreman_core::bus::Event::TaskDelegated { task: cyclic })
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidOperation);
    assert!(err.message.contains("would create cycle"));

    // No row inserted, no TaskDependencyAdded emitted.
    assert_eq!(
        daemon.deps.find_all_unbounded().await.unwrap().len(),
        edges_before
    );
    assert_eq!(
        daemon.events_of(EventKind::TaskDependencyAdded).len(),
        added_before
    );

    // Chain depths reported by the live graph.
    assert_eq!(daemon.dependency_handler.max_depth(&x.id).await, 0);
    assert_eq!(daemon.dependency_handler.max_depth(&w.id).await, 3);

    for task in [&x, &y, &z, &w] {
        daemon.manager.cancel(task.id.clone(), None).await.ok();
    }
}

#[tokio::test]
async fn chain_depth_grows_with_each_link_and_stays_bounded() {
    let tmp = tempfile::tempdir().unwrap();
    // Agents that hang keep every task pending, so the chain builds up.
    let daemon = build_daemon(DaemonOptions::with_script(hanging_agent(tmp.path()))).await;

    let mut previous = daemon.manager.delegate(request("root", vec![])).await.unwrap();
    for i in 0..5 {
        previous = daemon
            .manager
            .delegate(request(&format!("link {i}"), vec![previous.id.clone()]))
            .await
            .unwrap();
    }
    assert_eq!(daemon.dependency_handler.max_depth(&previous.id).await, 5);

    // Every persisted edge stays under the configured chain-depth cap.
    for edge in daemon.deps.find_all_unbounded().await.unwrap() {
        let depth = daemon.dependency_handler.max_depth(&edge.task_id).await;
        assert!(depth <= foreman_core::handlers::dependency::MAX_DEPENDENCY_CHAIN_DEPTH);
    }
}

#[tokio::test]
async fn dependent_of_failed_dependency_still_unblocks() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), "fail_fast.sh", "#!/bin/sh\nexit 9\n");
    let daemon = build_daemon(DaemonOptions::with_script(script)).await;

    let a = daemon.manager.delegate(request("A", vec![])).await.unwrap();
    let b = daemon
        .manager
        .delegate(request("B", vec![a.id.clone()]))
        .await
        .unwrap();

    daemon.wait_for_status(&a.id, TaskStatus::Failed, WAIT).await;
    // B unblocks once A resolves (failed counts as resolved) and then runs
    // and fails itself.
    daemon.wait_for_status(&b.id, TaskStatus::Failed, WAIT).await;

    let edges = daemon.deps.get_dependencies(&b.id).await.unwrap();
    assert_eq!(
        edges[0].resolution,
        foreman_db::models::DependencyResolution::Failed
    );
}

#[tokio::test]
async fn dependency_on_an_already_completed_task_resolves_immediately() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), "ok.sh", "#!/bin/sh\nexit 0\n");
    let daemon = build_daemon(DaemonOptions::with_script(script)).await;

    let a = daemon.manager.delegate(request("A", vec![])).await.unwrap();
    daemon.wait_for_status(&a.id, TaskStatus::Completed, WAIT).await;

    // A is already terminal when B's edge lands; B must not wait forever.
    let b = daemon
        .manager
        .delegate(request("B", vec![a.id.clone()]))
        .await
        .unwrap();
    daemon.wait_for_status(&b.id, TaskStatus::Completed, WAIT).await;
}
