//! Dependency repository: the `task_dependencies` table.
//!
//! Cycle and depth checks live with the in-memory graph in the handler
//! layer; this repository enforces the storage-level invariants (both
//! endpoints exist, per-task cap, no duplicate edge) and guarantees that a
//! batch insert is all-or-nothing.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::models::{DependencyResolution, TaskDependency};

/// Default per-task dependency cap.
pub const MAX_DEPENDENCIES_PER_TASK: usize = 100;

#[derive(Clone)]
pub struct DependencyRepository {
    pool: SqlitePool,
    max_per_task: usize,
}

impl DependencyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_per_task: MAX_DEPENDENCIES_PER_TASK,
        }
    }

    pub fn with_max_per_task(pool: SqlitePool, max_per_task: usize) -> Self {
        Self { pool, max_per_task }
    }

    /// Insert a batch of edges for `task_id` inside one transaction.
    ///
    /// Validation order: non-empty batch, task exists, cap respected, each
    /// dependency exists, no duplicate edge. Any failure rolls back the
    /// whole batch; on success every inserted row is returned with its
    /// generated id.
    pub async fn add_dependencies(
        &self,
        task_id: &str,
        dep_ids: &[String],
    ) -> Result<Vec<TaskDependency>> {
        if dep_ids.is_empty() {
            return Err(Error::invalid_operation("empty dependency batch"));
        }

        let mut tx = self.pool.begin().await?;

        let task_exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;
        if task_exists.is_none() {
            return Err(Error::task_not_found(task_id));
        }

        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM task_dependencies WHERE task_id = ?")
                .bind(task_id)
                .fetch_one(&mut *tx)
                .await?;
        if existing as usize + dep_ids.len() > self.max_per_task {
            return Err(Error::invalid_operation(format!(
                "task {task_id} would exceed the dependency cap of {}",
                self.max_per_task
            ))
            .with_ctx("existing", existing)
            .with_ctx("requested", dep_ids.len()));
        }

        let now = Utc::now();
        let mut inserted = Vec::with_capacity(dep_ids.len());
        for dep_id in dep_ids {
            if dep_id == task_id {
                return Err(Error::invalid_operation(format!(
                    "task {task_id} cannot depend on itself"
                )));
            }

            let dep_exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM tasks WHERE id = ?")
                .bind(dep_id)
                .fetch_optional(&mut *tx)
                .await?;
            if dep_exists.is_none() {
                return Err(Error::task_not_found(dep_id));
            }

            let duplicate: Option<i64> = sqlx::query_scalar(
                "SELECT 1 FROM task_dependencies WHERE task_id = ? AND depends_on_task_id = ?",
            )
            .bind(task_id)
            .bind(dep_id)
            .fetch_optional(&mut *tx)
            .await?;
            if duplicate.is_some() {
                return Err(Error::invalid_operation(format!(
                    "dependency ({task_id} -> {dep_id}) already exists"
                )));
            }

            let result = sqlx::query(
                "INSERT INTO task_dependencies (task_id, depends_on_task_id, resolution, created_at)
                 VALUES (?, ?, 'pending', ?)",
            )
            .bind(task_id)
            .bind(dep_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            inserted.push(TaskDependency {
                id: result.last_insert_rowid(),
                task_id: task_id.to_string(),
                depends_on_task_id: dep_id.clone(),
                resolution: DependencyResolution::Pending,
                created_at: now,
                resolved_at: None,
            });
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Direct edges where `task_id` is the dependent.
    pub async fn get_dependencies(&self, task_id: &str) -> Result<Vec<TaskDependency>> {
        let rows = sqlx::query("SELECT * FROM task_dependencies WHERE task_id = ? ORDER BY id ASC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(dependency_from_row).collect()
    }

    /// Direct edges where `task_id` is the dependency target.
    pub async fn get_dependents(&self, task_id: &str) -> Result<Vec<TaskDependency>> {
        let rows = sqlx::query(
            "SELECT * FROM task_dependencies WHERE depends_on_task_id = ? ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(dependency_from_row).collect()
    }

    /// One UPDATE that moves every pending edge pointing at
    /// `completed_task_id` to `resolution`. Returns the change count, which
    /// makes repeat calls idempotent.
    pub async fn resolve_dependencies_batch(
        &self,
        completed_task_id: &str,
        resolution: DependencyResolution,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE task_dependencies SET resolution = ?, resolved_at = ?
             WHERE depends_on_task_id = ? AND resolution = 'pending'",
        )
        .bind(resolution.to_string())
        .bind(Utc::now())
        .bind(completed_task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Resolve a single pending edge. Used when a dependency target is
    /// already terminal at the moment the edge is added.
    pub async fn resolve_edge(
        &self,
        task_id: &str,
        depends_on_task_id: &str,
        resolution: DependencyResolution,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE task_dependencies SET resolution = ?, resolved_at = ?
             WHERE task_id = ? AND depends_on_task_id = ? AND resolution = 'pending'",
        )
        .bind(resolution.to_string())
        .bind(Utc::now())
        .bind(task_id)
        .bind(depends_on_task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// A task is blocked iff it has at least one pending dependency.
    pub async fn is_blocked(&self, task_id: &str) -> Result<bool> {
        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM task_dependencies
             WHERE task_id = ? AND resolution = 'pending'",
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(pending > 0)
    }

    /// Full table scan, named so callers acknowledge it. Used only by the
    /// graph initializer at startup.
    pub async fn find_all_unbounded(&self) -> Result<Vec<TaskDependency>> {
        let rows = sqlx::query("SELECT * FROM task_dependencies ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(dependency_from_row).collect()
    }

    /// Remove every edge where `task_id` is either endpoint.
    pub async fn delete_dependencies(&self, task_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM task_dependencies WHERE task_id = ? OR depends_on_task_id = ?",
        )
        .bind(task_id)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn dependency_from_row(row: &SqliteRow) -> Result<TaskDependency> {
    let resolution: String = row.try_get("resolution").map_err(Error::from)?;
    Ok(TaskDependency {
        id: row.try_get("id").map_err(Error::from)?,
        task_id: row.try_get("task_id").map_err(Error::from)?,
        depends_on_task_id: row.try_get("depends_on_task_id").map_err(Error::from)?,
        resolution: resolution.parse()?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(Error::from)?,
        resolved_at: row.try_get("resolved_at").map_err(Error::from)?,
    })
}
