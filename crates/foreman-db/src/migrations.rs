//! Versioned schema migrations.
//!
//! `schema_migrations(version, applied_at, description)` is the single
//! source of truth. Every version is declared in [`MIGRATIONS`]; at startup
//! the runner reads `MAX(version)` and applies each newer migration inside a
//! transaction that also inserts its own row. A failing migration aborts
//! startup.

use sqlx::SqlitePool;
use tracing::info;

use crate::error::Result;

/// One schema version: the DDL plus its bookkeeping row.
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

/// Ordered list of every schema version. Statements use `IF NOT EXISTS` so
/// each migration is idempotent relative to a fresh store.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create tasks table",
        sql: "\
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    prompt TEXT NOT NULL CHECK (length(prompt) > 0),
    priority TEXT NOT NULL DEFAULT 'P1' CHECK (priority IN ('P0', 'P1', 'P2')),
    status TEXT NOT NULL DEFAULT 'queued'
        CHECK (status IN ('queued', 'running', 'completed', 'failed', 'cancelled')),
    working_directory TEXT,
    timeout_ms INTEGER,
    max_output_buffer INTEGER,
    worktree TEXT,
    parent_task_id TEXT,
    retry_of TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    continue_from TEXT,
    depends_on TEXT,
    worker_id TEXT,
    exit_code INTEGER,
    duration_ms INTEGER,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status);
CREATE INDEX IF NOT EXISTS idx_tasks_completed_at ON tasks (completed_at);
",
    },
    Migration {
        version: 2,
        description: "create task_dependencies table",
        sql: "\
CREATE TABLE IF NOT EXISTS task_dependencies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
    depends_on_task_id TEXT NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
    resolution TEXT NOT NULL DEFAULT 'pending'
        CHECK (resolution IN ('pending', 'completed', 'failed', 'cancelled')),
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    UNIQUE (task_id, depends_on_task_id)
);
CREATE INDEX IF NOT EXISTS idx_task_dependencies_task
    ON task_dependencies (task_id);
CREATE INDEX IF NOT EXISTS idx_task_dependencies_depends_on
    ON task_dependencies (depends_on_task_id);
",
    },
    Migration {
        version: 3,
        description: "create task_checkpoints table",
        sql: "\
CREATE TABLE IF NOT EXISTS task_checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
    checkpoint_type TEXT NOT NULL
        CHECK (checkpoint_type IN ('completed', 'failed', 'cancelled')),
    output_summary TEXT,
    error_summary TEXT,
    git_branch TEXT,
    git_commit TEXT,
    dirty_files TEXT,
    context TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_checkpoints_task
    ON task_checkpoints (task_id);
",
    },
    Migration {
        version: 4,
        description: "create task_output table",
        sql: "\
CREATE TABLE IF NOT EXISTS task_output (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
    stream TEXT NOT NULL CHECK (stream IN ('stdout', 'stderr')),
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_output_task ON task_output (task_id);
",
    },
    Migration {
        version: 5,
        description: "create schedules and schedule_executions tables",
        sql: "\
CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    template TEXT NOT NULL,
    schedule_type TEXT NOT NULL CHECK (schedule_type IN ('cron', 'once')),
    cron_expression TEXT,
    scheduled_at TEXT,
    timezone TEXT NOT NULL DEFAULT 'UTC',
    missed_run_policy TEXT NOT NULL DEFAULT 'skip'
        CHECK (missed_run_policy IN ('skip', 'catchup', 'fail')),
    status TEXT NOT NULL DEFAULT 'active'
        CHECK (status IN ('active', 'paused', 'completed', 'cancelled', 'expired')),
    max_runs INTEGER,
    run_count INTEGER NOT NULL DEFAULT 0,
    next_run_at TEXT,
    last_run_at TEXT,
    expires_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_schedules_status_next_run
    ON schedules (status, next_run_at);
CREATE TABLE IF NOT EXISTS schedule_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_id TEXT NOT NULL REFERENCES schedules (id) ON DELETE CASCADE,
    task_id TEXT,
    status TEXT NOT NULL,
    error TEXT,
    executed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_schedule_executions_schedule
    ON schedule_executions (schedule_id);
",
    },
];

/// Apply every migration newer than the recorded `MAX(version)`.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL,
            description TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    let current = current.unwrap_or(0);

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
        sqlx::query(
            "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
        )
        .bind(migration.version)
        .bind(chrono::Utc::now())
        .bind(migration.description)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(
            version = migration.version,
            description = migration.description,
            "applied migration"
        );
    }

    Ok(())
}

/// Highest schema version this build knows about.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_strictly_increasing() {
        let mut previous = 0;
        for m in MIGRATIONS {
            assert!(
                m.version > previous,
                "migration versions must strictly increase: {} after {}",
                m.version,
                previous
            );
            previous = m.version;
        }
    }

    #[test]
    fn latest_version_matches_last_entry() {
        assert_eq!(latest_version(), MIGRATIONS.last().unwrap().version);
    }
}
