//! Task output repository: persisted worker output chunks.
//!
//! The in-memory capture serves live reads; these rows let `logs` answer
//! after a daemon restart. Writers insert best-effort and tolerate loss.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::models::{OutputStream, TaskOutputChunk};

#[derive(Clone)]
pub struct TaskOutputRepository {
    pool: SqlitePool,
}

impl TaskOutputRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one chunk for a task's stream.
    pub async fn append(
        &self,
        task_id: &str,
        stream: OutputStream,
        content: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_output (task_id, stream, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(stream.to_string())
        .bind(content)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All chunks for a task in insertion order.
    pub async fn fetch(&self, task_id: &str) -> Result<Vec<TaskOutputChunk>> {
        let rows = sqlx::query("SELECT * FROM task_output WHERE task_id = ? ORDER BY id ASC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    /// The last `tail` chunks of one stream, oldest first.
    pub async fn fetch_tail(
        &self,
        task_id: &str,
        stream: OutputStream,
        tail: i64,
    ) -> Result<Vec<TaskOutputChunk>> {
        let mut rows: Vec<TaskOutputChunk> = sqlx::query(
            "SELECT * FROM task_output WHERE task_id = ? AND stream = ?
             ORDER BY id DESC LIMIT ?",
        )
        .bind(task_id)
        .bind(stream.to_string())
        .bind(tail)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(chunk_from_row)
        .collect::<Result<_>>()?;
        rows.reverse();
        Ok(rows)
    }

    pub async fn delete_by_task(&self, task_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM task_output WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn chunk_from_row(row: &SqliteRow) -> Result<TaskOutputChunk> {
    let stream: String = row.try_get("stream").map_err(Error::from)?;
    Ok(TaskOutputChunk {
        id: row.try_get("id").map_err(Error::from)?,
        task_id: row.try_get("task_id").map_err(Error::from)?,
        stream: stream.parse()?,
        content: row.try_get("content").map_err(Error::from)?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(Error::from)?,
    })
}
