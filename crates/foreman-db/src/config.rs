//! Database location resolution.
//!
//! The store is a single SQLite file. Default location:
//! `$HOME/.foreman/foreman.db` on POSIX, `%APPDATA%/foreman/foreman.db` on
//! Windows. Overridable via `FOREMAN_DATA_DIR` (directory, fixed file name)
//! or `FOREMAN_DATABASE_PATH` (full file path); both must be absolute and
//! must not contain `..` components, otherwise startup is refused.

use std::env;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable naming a directory for the database file.
pub const DATA_DIR_ENV: &str = "FOREMAN_DATA_DIR";
/// Environment variable naming the database file itself.
pub const DATABASE_PATH_ENV: &str = "FOREMAN_DATABASE_PATH";
/// Fixed database file name inside the data directory.
pub const DATABASE_FILE_NAME: &str = "foreman.db";

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Absolute path to the SQLite database file.
    pub database_path: PathBuf,
}

impl DbConfig {
    /// Build a config from an explicit path (useful for tests and CLI flags).
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    /// Resolve the database path from the environment.
    ///
    /// Priority: `FOREMAN_DATABASE_PATH` > `FOREMAN_DATA_DIR` joined with the
    /// fixed file name > the platform default directory.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = env::var(DATABASE_PATH_ENV) {
            let path = PathBuf::from(path);
            validate_override(DATABASE_PATH_ENV, &path)?;
            return Ok(Self::new(path));
        }
        if let Ok(dir) = env::var(DATA_DIR_ENV) {
            let dir = PathBuf::from(dir);
            validate_override(DATA_DIR_ENV, &dir)?;
            return Ok(Self::new(dir.join(DATABASE_FILE_NAME)));
        }
        Ok(Self::new(default_data_dir().join(DATABASE_FILE_NAME)))
    }

    /// Directory containing the database file.
    pub fn data_dir(&self) -> &Path {
        self.database_path.parent().unwrap_or(Path::new("."))
    }
}

/// Platform default data directory.
///
/// POSIX: `$HOME/.foreman`. Windows: the roaming app-data directory joined
/// with `foreman`.
pub fn default_data_dir() -> PathBuf {
    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("foreman")
    }
    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".foreman")
    }
}

fn validate_override(var: &str, path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(Error::invalid_operation(format!(
            "{var} must be an absolute path, got {}",
            path.display()
        )));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(Error::invalid_operation(format!(
            "{var} must not contain '..' components, got {}",
            path.display()
        )));
    }
    Ok(())
}
