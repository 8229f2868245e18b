//! Repositories: one narrow persistence interface per entity.
//!
//! Repositories are the only writers of the store. Multi-step updates run
//! inside transactions; JSON-encoded columns are decoded at this boundary,
//! with malformed JSON treated as absence and logged rather than failing
//! the read.

pub mod checkpoints;
pub mod dependencies;
pub mod schedules;
pub mod task_output;
pub mod tasks;

pub use checkpoints::CheckpointRepository;
pub use dependencies::DependencyRepository;
pub use schedules::ScheduleRepository;
pub use task_output::TaskOutputRepository;
pub use tasks::TaskRepository;

use serde::de::DeserializeOwned;
use tracing::warn;

/// Decode an optional JSON column leniently: `None`, empty, or malformed
/// content all decode to `None`, malformed content with a warning.
pub(crate) fn decode_json_opt<T: DeserializeOwned>(
    raw: Option<String>,
    column: &str,
    row_id: &str,
) -> Option<T> {
    let raw = raw?;
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(column, row_id, error = %err, "malformed JSON column, treating as absent");
            None
        }
    }
}

/// Decode an optional JSON list column leniently; absence and malformed
/// content both decode to an empty list.
pub(crate) fn decode_json_list(raw: Option<String>, column: &str, row_id: &str) -> Vec<String> {
    decode_json_opt(raw, column, row_id).unwrap_or_default()
}
