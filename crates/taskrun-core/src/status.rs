//! Status enum for task records.

use serde::{Deserialize, Serialize};

/// Status of a task record in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Task created (or continued) and waiting for its next invocation.
    #[default]
    Pending,
    /// An invocation of the task is in progress.
    Running,
    /// Task completed successfully.
    Success,
    /// Task failed.
    Failure,
    /// Task was aborted by an external request.
    Aborted,
}

impl TaskStatus {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Aborted)
    }
}
