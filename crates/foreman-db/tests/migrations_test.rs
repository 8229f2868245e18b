//! Integration tests for the migration runner and connection pool.

use sqlx::Row;

use foreman_db::migrations;
use foreman_test_utils::create_test_db;

/// Expected tables created by the full migration list.
const EXPECTED_TABLES: &[&str] = &[
    "schedule_executions",
    "schedules",
    "schema_migrations",
    "task_checkpoints",
    "task_dependencies",
    "task_output",
    "tasks",
];

#[tokio::test]
async fn migrations_create_all_tables() {
    let db = create_test_db().await;

    let rows = sqlx::query(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
         ORDER BY name",
    )
    .fetch_all(db.pool())
    .await
    .expect("should list tables");

    let names: Vec<String> = rows
        .iter()
        .map(|row| row.get::<String, _>("name"))
        .collect();
    assert_eq!(names, EXPECTED_TABLES);
}

#[tokio::test]
async fn every_version_is_recorded_with_description() {
    let db = create_test_db().await;

    let rows = sqlx::query("SELECT version, description FROM schema_migrations ORDER BY version")
        .fetch_all(db.pool())
        .await
        .expect("should read schema_migrations");

    assert_eq!(rows.len(), migrations::MIGRATIONS.len());
    for (row, migration) in rows.iter().zip(migrations::MIGRATIONS) {
        assert_eq!(row.get::<i64, _>("version"), migration.version);
        assert_eq!(row.get::<String, _>("description"), migration.description);
    }
}

#[tokio::test]
async fn rerunning_migrations_is_a_noop() {
    let db = create_test_db().await;

    migrations::run_migrations(db.pool())
        .await
        .expect("second run should succeed");

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
        .fetch_one(db.pool())
        .await
        .expect("should count");
    assert_eq!(count, migrations::MIGRATIONS.len() as i64);
}

#[tokio::test]
async fn status_check_constraint_is_enforced() {
    let db = create_test_db().await;

    let result = sqlx::query(
        "INSERT INTO tasks (id, prompt, status, created_at, updated_at) \
         VALUES ('t1', 'p', 'sleeping', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
    )
    .execute(db.pool())
    .await;
    assert!(result.is_err(), "unknown status must violate the CHECK");
}

#[tokio::test]
async fn priority_check_constraint_is_enforced() {
    let db = create_test_db().await;

    let result = sqlx::query(
        "INSERT INTO tasks (id, prompt, priority, created_at, updated_at) \
         VALUES ('t1', 'p', 'P9', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
    )
    .execute(db.pool())
    .await;
    assert!(result.is_err(), "unknown priority must violate the CHECK");
}

#[tokio::test]
async fn deleting_a_task_cascades_to_dependent_rows() {
    let db = create_test_db().await;

    sqlx::query(
        "INSERT INTO tasks (id, prompt, created_at, updated_at) \
         VALUES ('a', 'p', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z'), \
                ('b', 'p', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
    )
    .execute(db.pool())
    .await
    .expect("seed tasks");

    sqlx::query(
        "INSERT INTO task_dependencies (task_id, depends_on_task_id, created_at) \
         VALUES ('b', 'a', '2026-01-01T00:00:00Z')",
    )
    .execute(db.pool())
    .await
    .expect("seed edge");

    sqlx::query(
        "INSERT INTO task_output (task_id, stream, content, created_at) \
         VALUES ('a', 'stdout', 'hello', '2026-01-01T00:00:00Z')",
    )
    .execute(db.pool())
    .await
    .expect("seed output");

    sqlx::query("DELETE FROM tasks WHERE id = 'a'")
        .execute(db.pool())
        .await
        .expect("delete task");

    let edges: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_dependencies")
        .fetch_one(db.pool())
        .await
        .unwrap();
    let output: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_output")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(edges, 0, "dependency edge should cascade");
    assert_eq!(output, 0, "output rows should cascade");
}
