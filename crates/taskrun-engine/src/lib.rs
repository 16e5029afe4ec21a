//! TaskRun continuation engine.
//!
//! Runs task definitions whose total work exceeds a single execution window.
//! Each invocation reads a checkpoint from the task record, does a bounded
//! amount of work while polling cooperative abort/timeout signals and returns a
//! [`TaskResult`](taskrun_core::TaskResult). A dispatcher persists the result
//! and re-invokes the task until it reaches a terminal state.
//!
//! - [`runner`] drives one invocation of a [`TaskDefinition`].
//! - [`health`] gates bulk work on a dependency's health.
//! - [`coordinator`] fans a task out into child tasks and reconciles them.
//! - [`dispatch`] is an in-process dispatcher used by tests and the CLI.

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod health;
pub mod runner;
pub mod signal;
pub mod store;
pub mod tasks;

pub use config::{BudgetPolicy, DispatcherConfig};
pub use coordinator::{
    ControllerInput, ControllerOutput, ImportFile, ImportFromUrlController, ModelRegistry,
    StaticModelRegistry, IMPORT_FROM_URL_CONTROLLER,
};
pub use dispatch::{ContinueHook, DispatchError, LocalDispatcher};
pub use health::{HealthGate, HealthGateConfig, HealthGateError, HealthObserver, HealthSource};
pub use runner::{RunnerError, TaskContext, TaskDefinition, TaskRunner, WorkError};
pub use signal::{AbortSignal, CountdownBudget, Deadline, TimeBudget};
pub use store::{InMemoryTaskStore, ListTasksParams, ListTasksResponse, StoreError, TaskStore};
