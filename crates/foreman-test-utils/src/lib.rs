//! Shared test utilities for foreman integration tests.
//!
//! Each test gets its own SQLite database file inside a fresh temporary
//! directory, with all migrations applied. Dropping the returned [`TestDb`]
//! removes the directory and everything in it.

use sqlx::SqlitePool;
use tempfile::TempDir;

use foreman_db::config::DbConfig;
use foreman_db::pool;

/// A migrated, isolated test database.
///
/// Keep the value alive for the duration of the test; the temp directory is
/// removed on drop.
pub struct TestDb {
    pub pool: SqlitePool,
    /// Held to keep the backing directory alive.
    _dir: TempDir,
}

impl TestDb {
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Create a temporary database with migrations applied.
pub async fn create_test_db() -> TestDb {
    let dir = TempDir::new().expect("failed to create temp dir for test db");
    let unique = uuid::Uuid::new_v4().simple().to_string();
    let config = DbConfig::new(dir.path().join(format!("foreman-test-{unique}.db")));

    let pool = pool::create_pool(&config)
        .await
        .expect("failed to open test database");
    pool::run_migrations(&pool)
        .await
        .expect("migrations should succeed");

    TestDb { pool, _dir: dir }
}
