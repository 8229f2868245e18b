//! Connection pool for the embedded SQLite store.
//!
//! WAL journaling is requested at connect time with a fallback to the
//! default rollback journal where WAL is unavailable (some CI filesystems).
//! `synchronous = NORMAL` and `foreign_keys = ON` always apply.

use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::{info, warn};

use crate::config::DbConfig;
use crate::error::{Error, Result};
use crate::migrations;

/// Create a connection pool with sensible defaults.
///
/// The parent directory is created if missing. WAL is attempted first; on
/// failure the pool is rebuilt with the default journal mode.
pub async fn create_pool(config: &DbConfig) -> Result<SqlitePool> {
    std::fs::create_dir_all(config.data_dir()).map_err(|e| {
        Error::system(format!(
            "failed to create data directory {}: {e}",
            config.data_dir().display()
        ))
    })?;

    match connect(config, SqliteJournalMode::Wal).await {
        Ok(pool) => Ok(pool),
        Err(err) => {
            warn!(
                error = %err,
                "WAL journal mode unavailable, falling back to default journal"
            );
            connect(config, SqliteJournalMode::Delete).await
        }
    }
}

async fn connect(config: &DbConfig, journal_mode: SqliteJournalMode) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(&config.database_path)
        .create_if_missing(true)
        .journal_mode(journal_mode)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .map_err(|e| {
            Error::system(format!(
                "failed to open database at {}: {e}",
                config.database_path.display()
            ))
        })?;

    // Force the journal-mode pragma to take effect now rather than on first
    // statement, so WAL failures surface at startup.
    sqlx::query("SELECT 1").execute(&pool).await?;

    Ok(pool)
}

/// Create an in-memory pool for unit tests.
///
/// A single connection keeps the shared `:memory:` database alive for the
/// pool's lifetime.
pub async fn create_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(Error::from)?
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Run all pending migrations against the pool.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    migrations::run_migrations(pool).await?;
    info!(
        schema_version = migrations::latest_version(),
        "migrations applied"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pool_runs_migrations() {
        let pool = create_memory_pool().await.expect("pool should open");
        run_migrations(&pool).await.expect("migrations should run");

        let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .expect("should read version");
        assert_eq!(version, migrations::latest_version());
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = create_memory_pool().await.expect("pool should open");
        run_migrations(&pool).await.expect("first run");
        run_migrations(&pool).await.expect("second run is a no-op");

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .expect("should count rows");
        assert_eq!(rows, migrations::MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let pool = create_memory_pool().await.expect("pool should open");
        run_migrations(&pool).await.expect("migrations should run");

        let result = sqlx::query(
            "INSERT INTO task_dependencies (task_id, depends_on_task_id, created_at) \
             VALUES ('ghost', 'phantom', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await;
        assert!(result.is_err(), "orphan edge insert must fail");
    }
}
