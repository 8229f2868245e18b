//! Task repository: upsert, lookup, patch-update, delete, and retention
//! cleanup for the `tasks` table.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::models::{Task, TaskPatch, TaskStatus, WorktreeConfig};

use super::{decode_json_list, decode_json_opt};

#[derive(Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the task row, keyed on id.
    pub async fn save(&self, task: &Task) -> Result<()> {
        let worktree = task
            .worktree
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let depends_on = if task.depends_on.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&task.depends_on)?)
        };

        sqlx::query(
            "INSERT INTO tasks (
                id, prompt, priority, status, working_directory, timeout_ms,
                max_output_buffer, worktree, parent_task_id, retry_of,
                retry_count, continue_from, depends_on, worker_id, exit_code,
                duration_ms, created_at, started_at, completed_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                prompt = excluded.prompt,
                priority = excluded.priority,
                status = excluded.status,
                working_directory = excluded.working_directory,
                timeout_ms = excluded.timeout_ms,
                max_output_buffer = excluded.max_output_buffer,
                worktree = excluded.worktree,
                parent_task_id = excluded.parent_task_id,
                retry_of = excluded.retry_of,
                retry_count = excluded.retry_count,
                continue_from = excluded.continue_from,
                depends_on = excluded.depends_on,
                worker_id = excluded.worker_id,
                exit_code = excluded.exit_code,
                duration_ms = excluded.duration_ms,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                updated_at = excluded.updated_at",
        )
        .bind(&task.id)
        .bind(&task.prompt)
        .bind(task.priority.to_string())
        .bind(task.status.to_string())
        .bind(&task.working_directory)
        .bind(task.timeout_ms)
        .bind(task.max_output_buffer)
        .bind(worktree)
        .bind(&task.parent_task_id)
        .bind(&task.retry_of)
        .bind(task.retry_count)
        .bind(&task.continue_from)
        .bind(depends_on)
        .bind(&task.worker_id)
        .bind(task.exit_code)
        .bind(task.duration_ms)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn find_all(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = ? ORDER BY created_at ASC")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Read-modify-write under one transaction: fetch the row, apply the
    /// patch, write the result back, and return the updated task.
    pub async fn update(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::task_not_found(id))?;
        let mut task = task_from_row(&row)?;

        if let Some(status) = patch.status {
            task.status = status;
        }
        if let Some(prompt) = patch.prompt {
            task.prompt = prompt;
        }
        if let Some(worker_id) = patch.worker_id {
            task.worker_id = worker_id;
        }
        if let Some(exit_code) = patch.exit_code {
            task.exit_code = exit_code;
        }
        if let Some(duration_ms) = patch.duration_ms {
            task.duration_ms = duration_ms;
        }
        if let Some(started_at) = patch.started_at {
            task.started_at = started_at;
        }
        if let Some(completed_at) = patch.completed_at {
            task.completed_at = completed_at;
        }
        if let Some(working_directory) = patch.working_directory {
            task.working_directory = working_directory;
        }
        task.updated_at = Utc::now();

        sqlx::query(
            "UPDATE tasks SET
                prompt = ?, status = ?, worker_id = ?, exit_code = ?,
                duration_ms = ?, started_at = ?, completed_at = ?,
                working_directory = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&task.prompt)
        .bind(task.status.to_string())
        .bind(&task.worker_id)
        .bind(task.exit_code)
        .bind(task.duration_ms)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(&task.working_directory)
        .bind(task.updated_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(task)
    }

    /// Delete a task row. Dependent rows cascade. Returns whether a row was
    /// removed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove terminal tasks whose `completed_at` is older than the cutoff.
    /// Returns the ids of the removed rows so in-memory mirrors can be
    /// invalidated.
    pub async fn cleanup_old_tasks(&self, older_than: Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now() - older_than;
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM tasks
             WHERE status IN ('completed', 'failed', 'cancelled')
               AND completed_at IS NOT NULL AND completed_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        if ids.is_empty() {
            return Ok(ids);
        }

        sqlx::query(
            "DELETE FROM tasks
             WHERE status IN ('completed', 'failed', 'cancelled')
               AND completed_at IS NOT NULL AND completed_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(ids)
    }
}

/// Decode one `tasks` row. Enum and timestamp columns are strict; JSON
/// columns are lenient.
pub(crate) fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let id: String = row.try_get("id").map_err(Error::from)?;
    let worktree: Option<WorktreeConfig> =
        decode_json_opt(row.try_get("worktree").map_err(Error::from)?, "worktree", &id);
    let depends_on =
        decode_json_list(row.try_get("depends_on").map_err(Error::from)?, "depends_on", &id);

    let priority: String = row.try_get("priority").map_err(Error::from)?;
    let status: String = row.try_get("status").map_err(Error::from)?;

    Ok(Task {
        prompt: row.try_get("prompt").map_err(Error::from)?,
        priority: priority.parse()?,
        status: status.parse()?,
        working_directory: row.try_get("working_directory").map_err(Error::from)?,
        timeout_ms: row.try_get("timeout_ms").map_err(Error::from)?,
        max_output_buffer: row.try_get("max_output_buffer").map_err(Error::from)?,
        worktree,
        parent_task_id: row.try_get("parent_task_id").map_err(Error::from)?,
        retry_of: row.try_get("retry_of").map_err(Error::from)?,
        retry_count: row.try_get("retry_count").map_err(Error::from)?,
        continue_from: row.try_get("continue_from").map_err(Error::from)?,
        depends_on,
        worker_id: row.try_get("worker_id").map_err(Error::from)?,
        exit_code: row.try_get("exit_code").map_err(Error::from)?,
        duration_ms: row.try_get("duration_ms").map_err(Error::from)?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(Error::from)?,
        started_at: row.try_get("started_at").map_err(Error::from)?,
        completed_at: row.try_get("completed_at").map_err(Error::from)?,
        updated_at: row
            .try_get::<DateTime<Utc>, _>("updated_at")
            .map_err(Error::from)?,
        id,
    })
}
