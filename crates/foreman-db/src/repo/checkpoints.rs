//! Checkpoint repository: append-only snapshots in `task_checkpoints`.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::models::{GitState, NewCheckpoint, TaskCheckpoint};

use super::decode_json_list;

/// Default page size for `find_all`.
pub const DEFAULT_CHECKPOINT_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct CheckpointRepository {
    pool: SqlitePool,
}

impl CheckpointRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a checkpoint and return the stored row.
    pub async fn save(&self, checkpoint: NewCheckpoint) -> Result<TaskCheckpoint> {
        let now = Utc::now();
        let (git_branch, git_commit, dirty_files) = match &checkpoint.git_state {
            Some(state) => (
                Some(state.branch.clone()),
                Some(state.commit.clone()),
                Some(serde_json::to_string(&state.dirty_files)?),
            ),
            None => (None, None, None),
        };

        let result = sqlx::query(
            "INSERT INTO task_checkpoints (
                task_id, checkpoint_type, output_summary, error_summary,
                git_branch, git_commit, dirty_files, context, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.task_id)
        .bind(checkpoint.checkpoint_type.to_string())
        .bind(&checkpoint.output_summary)
        .bind(&checkpoint.error_summary)
        .bind(git_branch)
        .bind(git_commit)
        .bind(dirty_files)
        .bind(&checkpoint.context)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(TaskCheckpoint {
            id: result.last_insert_rowid(),
            task_id: checkpoint.task_id,
            checkpoint_type: checkpoint.checkpoint_type,
            output_summary: checkpoint.output_summary,
            error_summary: checkpoint.error_summary,
            git_state: checkpoint.git_state,
            context: checkpoint.context,
            created_at: now,
        })
    }

    /// The most recent checkpoint for a task, if any.
    pub async fn find_latest(&self, task_id: &str) -> Result<Option<TaskCheckpoint>> {
        let row = sqlx::query(
            "SELECT * FROM task_checkpoints WHERE task_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    /// Checkpoints for a task, newest first, bounded by `limit`.
    pub async fn find_all(&self, task_id: &str, limit: i64) -> Result<Vec<TaskCheckpoint>> {
        let rows = sqlx::query(
            "SELECT * FROM task_checkpoints WHERE task_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(task_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    pub async fn delete_by_task(&self, task_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM task_checkpoints WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<TaskCheckpoint> {
    let id: i64 = row.try_get("id").map_err(Error::from)?;
    let checkpoint_type: String = row.try_get("checkpoint_type").map_err(Error::from)?;

    let git_branch: Option<String> = row.try_get("git_branch").map_err(Error::from)?;
    let git_commit: Option<String> = row.try_get("git_commit").map_err(Error::from)?;
    let git_state = match (git_branch, git_commit) {
        (Some(branch), Some(commit)) => Some(GitState {
            branch,
            commit,
            dirty_files: decode_json_list(
                row.try_get("dirty_files").map_err(Error::from)?,
                "dirty_files",
                &id.to_string(),
            ),
        }),
        _ => None,
    };

    Ok(TaskCheckpoint {
        id,
        task_id: row.try_get("task_id").map_err(Error::from)?,
        checkpoint_type: checkpoint_type.parse()?,
        output_summary: row.try_get("output_summary").map_err(Error::from)?,
        error_summary: row.try_get("error_summary").map_err(Error::from)?,
        git_state,
        context: row.try_get("context").map_err(Error::from)?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(Error::from)?,
    })
}
