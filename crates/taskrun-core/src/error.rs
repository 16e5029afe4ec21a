//! Core domain errors.

use thiserror::Error;

use crate::TaskStatus;

/// Core domain errors for TaskRun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid state transition.
    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: TaskStatus, to: TaskStatus },
}
