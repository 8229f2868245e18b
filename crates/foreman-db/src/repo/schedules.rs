//! Schedule repository: the `schedules` and `schedule_executions` tables.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::models::{Schedule, ScheduleExecution, ScheduleStatus};

#[derive(Clone)]
pub struct ScheduleRepository {
    pool: SqlitePool,
}

impl ScheduleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save(&self, schedule: &Schedule) -> Result<()> {
        sqlx::query(
            "INSERT INTO schedules (
                id, name, template, schedule_type, cron_expression, scheduled_at,
                timezone, missed_run_policy, status, max_runs, run_count,
                next_run_at, last_run_at, expires_at, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&schedule.id)
        .bind(&schedule.name)
        .bind(serde_json::to_string(&schedule.template)?)
        .bind(schedule.schedule_type.to_string())
        .bind(&schedule.cron_expression)
        .bind(schedule.scheduled_at)
        .bind(&schedule.timezone)
        .bind(schedule.missed_run_policy.to_string())
        .bind(schedule.status.to_string())
        .bind(schedule.max_runs)
        .bind(schedule.run_count)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(schedule.expires_at)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Full-row update keyed on id.
    pub async fn update(&self, schedule: &Schedule) -> Result<()> {
        let result = sqlx::query(
            "UPDATE schedules SET
                name = ?, template = ?, schedule_type = ?, cron_expression = ?,
                scheduled_at = ?, timezone = ?, missed_run_policy = ?, status = ?,
                max_runs = ?, run_count = ?, next_run_at = ?, last_run_at = ?,
                expires_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&schedule.name)
        .bind(serde_json::to_string(&schedule.template)?)
        .bind(schedule.schedule_type.to_string())
        .bind(&schedule.cron_expression)
        .bind(schedule.scheduled_at)
        .bind(&schedule.timezone)
        .bind(schedule.missed_run_policy.to_string())
        .bind(schedule.status.to_string())
        .bind(schedule.max_runs)
        .bind(schedule.run_count)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(schedule.expires_at)
        .bind(Utc::now())
        .bind(&schedule.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::invalid_operation(format!(
                "schedule {} not found",
                schedule.id
            )));
        }
        Ok(())
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Schedule>> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    pub async fn find_all(&self, limit: i64, offset: i64) -> Result<Vec<Schedule>> {
        let rows =
            sqlx::query("SELECT * FROM schedules ORDER BY created_at ASC LIMIT ? OFFSET ?")
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    pub async fn find_by_status(&self, status: ScheduleStatus) -> Result<Vec<Schedule>> {
        let rows = sqlx::query("SELECT * FROM schedules WHERE status = ? ORDER BY created_at ASC")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    /// Active schedules whose `next_run_at` is due, soonest first.
    pub async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(
            "SELECT * FROM schedules
             WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= ?
             ORDER BY next_run_at ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schedules")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Append one execution-history row.
    pub async fn record_execution(
        &self,
        schedule_id: &str,
        task_id: Option<&str>,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO schedule_executions (schedule_id, task_id, status, error, executed_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(schedule_id)
        .bind(task_id)
        .bind(status)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_execution_history(
        &self,
        schedule_id: &str,
        limit: i64,
    ) -> Result<Vec<ScheduleExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM schedule_executions WHERE schedule_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(schedule_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ScheduleExecution {
                    id: row.try_get("id").map_err(Error::from)?,
                    schedule_id: row.try_get("schedule_id").map_err(Error::from)?,
                    task_id: row.try_get("task_id").map_err(Error::from)?,
                    status: row.try_get("status").map_err(Error::from)?,
                    error: row.try_get("error").map_err(Error::from)?,
                    executed_at: row
                        .try_get::<DateTime<Utc>, _>("executed_at")
                        .map_err(Error::from)?,
                })
            })
            .collect()
    }
}

fn schedule_from_row(row: &SqliteRow) -> Result<Schedule> {
    let template: String = row.try_get("template").map_err(Error::from)?;
    let schedule_type: String = row.try_get("schedule_type").map_err(Error::from)?;
    let missed_run_policy: String = row.try_get("missed_run_policy").map_err(Error::from)?;
    let status: String = row.try_get("status").map_err(Error::from)?;

    Ok(Schedule {
        id: row.try_get("id").map_err(Error::from)?,
        name: row.try_get("name").map_err(Error::from)?,
        template: serde_json::from_str(&template)?,
        schedule_type: schedule_type.parse()?,
        cron_expression: row.try_get("cron_expression").map_err(Error::from)?,
        scheduled_at: row.try_get("scheduled_at").map_err(Error::from)?,
        timezone: row.try_get("timezone").map_err(Error::from)?,
        missed_run_policy: missed_run_policy.parse()?,
        status: status.parse()?,
        max_runs: row.try_get("max_runs").map_err(Error::from)?,
        run_count: row.try_get("run_count").map_err(Error::from)?,
        next_run_at: row.try_get("next_run_at").map_err(Error::from)?,
        last_run_at: row.try_get("last_run_at").map_err(Error::from)?,
        expires_at: row.try_get("expires_at").map_err(Error::from)?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(Error::from)?,
        updated_at: row
            .try_get::<DateTime<Utc>, _>("updated_at")
            .map_err(Error::from)?,
    })
}
