//! TaskRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - A task store or backing database
//! - A host runtime or dispatcher
//! - Async execution
//!
//! All types here describe a resumable task: its persisted record, the
//! checkpoint carried between invocations and the outcome of one invocation.

pub mod checkpoint;
pub mod error;
pub mod health;
pub mod ids;
pub mod response;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use checkpoint::{Checkpoint, CheckpointError};
pub use error::CoreError;
pub use health::{ClusterHealth, HealthSnapshot};
pub use ids::{DefinitionId, TaskId};
pub use response::{
    ContinueOptions, InvocationResponse, ResponseError, ResponseStatus, TaskResult,
    MAX_WAIT_SECONDS,
};
pub use status::TaskStatus;
pub use task::{CreateTaskParams, TaskRecord, TaskUpdate};
