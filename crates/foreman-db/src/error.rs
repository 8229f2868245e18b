//! The daemon-wide error taxonomy.
//!
//! Every fallible operation in the workspace returns [`Result`]: either a
//! success value or an [`Error`] carrying one of the closed [`ErrorCode`]
//! variants, a human-readable message, and optional key-value context.
//! Lower-layer failures are converted at the repository boundary; nothing
//! panics across component boundaries.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of error kinds understood by every component and by wire
/// clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    TaskNotFound,
    InvalidOperation,
    TaskCannotCancel,
    QueueFull,
    WorkerNotFound,
    WorkerSpawnFailed,
    ProcessKillFailed,
    InsufficientResources,
    TaskTimeout,
    SystemError,
    ResourceMonitoringFailed,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskNotFound => "task_not_found",
            Self::InvalidOperation => "invalid_operation",
            Self::TaskCannotCancel => "task_cannot_cancel",
            Self::QueueFull => "queue_full",
            Self::WorkerNotFound => "worker_not_found",
            Self::WorkerSpawnFailed => "worker_spawn_failed",
            Self::ProcessKillFailed => "process_kill_failed",
            Self::InsufficientResources => "insufficient_resources",
            Self::TaskTimeout => "task_timeout",
            Self::SystemError => "system_error",
            Self::ResourceMonitoringFailed => "resource_monitoring_failed",
        };
        f.write_str(s)
    }
}

/// A structured error: code, message, and optional key-value context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<(String, String)>,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: Vec::new(),
        }
    }

    /// Attach a key-value pair to the error context.
    pub fn with_ctx(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.context.push((key.into(), value.to_string()));
        self
    }

    pub fn task_not_found(task_id: &str) -> Self {
        Self::new(ErrorCode::TaskNotFound, format!("task {task_id} not found"))
            .with_ctx("task_id", task_id)
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidOperation, message)
    }

    pub fn cannot_cancel(task_id: &str, status: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::TaskCannotCancel,
            format!("task {task_id} cannot be cancelled in status {status}"),
        )
        .with_ctx("task_id", task_id)
    }

    pub fn worker_not_found(id: &str) -> Self {
        Self::new(ErrorCode::WorkerNotFound, format!("no live worker for {id}"))
    }

    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::WorkerSpawnFailed, message)
    }

    pub fn insufficient_resources(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InsufficientResources, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SystemError, message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Boundary conversion for database failures.
///
/// Uniqueness violations become `InvalidOperation`, foreign-key misses and
/// absent rows become `TaskNotFound`, everything else is `SystemError` with
/// the original message preserved.
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => {
                Self::new(ErrorCode::TaskNotFound, "row not found")
            }
            sqlx::Error::Database(db) => {
                let message = db.message().to_string();
                if message.contains("UNIQUE constraint failed") {
                    Self::new(ErrorCode::InvalidOperation, message)
                } else if message.contains("FOREIGN KEY constraint failed") {
                    Self::new(ErrorCode::TaskNotFound, message)
                } else {
                    Self::new(ErrorCode::SystemError, message)
                }
            }
            _ => Self::new(ErrorCode::SystemError, err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::SystemError, err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorCode::SystemError, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let err = Error::new(ErrorCode::QueueFull, "queue capacity exceeded");
        assert_eq!(err.to_string(), "queue_full: queue capacity exceeded");
    }

    #[test]
    fn context_accumulates() {
        let err = Error::system("boom")
            .with_ctx("task_id", "t-1")
            .with_ctx("attempt", 3);
        assert_eq!(err.context.len(), 2);
        assert_eq!(err.context[1], ("attempt".to_string(), "3".to_string()));
    }

    #[test]
    fn row_not_found_maps_to_task_not_found() {
        let err: Error = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code, ErrorCode::TaskNotFound);
    }

    #[test]
    fn serializes_as_snake_case() {
        let err = Error::new(ErrorCode::InsufficientResources, "cpu saturated");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "insufficient_resources");
    }
}
