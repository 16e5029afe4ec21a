//! Task record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CoreError, DefinitionId, ResponseError, TaskId, TaskStatus};

/// Tenant assigned to tasks created without an explicit scope.
pub const DEFAULT_TENANT: &str = "root";

/// Locale assigned to tasks created without an explicit scope.
pub const DEFAULT_LOCALE: &str = "en-US";

/// A persisted, schedulable unit of resumable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// Unique task identifier.
    pub id: TaskId,

    /// Definition whose work function runs this task.
    pub definition_id: DefinitionId,

    /// Coordinator that dispatched this task, if any.
    pub parent_id: Option<TaskId>,

    /// Human-readable name.
    pub name: String,

    /// Current task status.
    pub status: TaskStatus,

    /// Checkpoint handed to the next invocation.
    pub input: Value,

    /// Output of a successful task.
    pub output: Option<Value>,

    /// Error of a failed task.
    pub error: Option<ResponseError>,

    /// Number of invocations started so far.
    pub iterations: u32,

    /// Advisory wait requested by the last Continue.
    pub delay_seconds: Option<u64>,

    pub tenant: String,
    pub locale: String,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// When the task was last changed.
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a new PENDING record from creation parameters.
    pub fn new(params: CreateTaskParams) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            definition_id: params.definition_id,
            parent_id: params.parent_id,
            name: params.name,
            status: TaskStatus::Pending,
            input: params.input,
            output: None,
            error: None,
            iterations: 0,
            delay_seconds: None,
            tenant: params.tenant,
            locale: params.locale,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a partial update.
    ///
    /// Terminal records are immutable, so any update to one is rejected.
    pub fn apply(&mut self, update: TaskUpdate) -> Result<(), CoreError> {
        if self.is_terminal() {
            return Err(CoreError::InvalidStateTransition {
                from: self.status,
                to: update.status.unwrap_or(self.status),
            });
        }

        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(input) = update.input {
            self.input = input;
        }
        if let Some(output) = update.output {
            self.output = Some(output);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        if let Some(iterations) = update.iterations {
            self.iterations = iterations;
        }
        if let Some(delay) = update.delay_seconds {
            self.delay_seconds = delay;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Parameters for creating a task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskParams {
    pub definition_id: DefinitionId,
    pub name: String,
    pub input: Value,
    pub parent_id: Option<TaskId>,
    pub tenant: String,
    pub locale: String,
}

impl CreateTaskParams {
    /// Create parameters scoped to the default tenant and locale.
    pub fn new(
        definition_id: impl Into<DefinitionId>,
        name: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            definition_id: definition_id.into(),
            name: name.into(),
            input,
            parent_id: None,
            tenant: DEFAULT_TENANT.to_string(),
            locale: DEFAULT_LOCALE.to_string(),
        }
    }

    /// Builder method to link the task to a parent.
    pub fn with_parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Builder method to set the tenant and locale scope.
    pub fn with_scope(mut self, tenant: impl Into<String>, locale: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self.locale = locale.into();
        self
    }
}

/// Partial update of a task record. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<ResponseError>,
    pub iterations: Option<u32>,
    /// `Some(None)` clears a previously requested delay.
    pub delay_seconds: Option<Option<u64>>,
}

impl TaskUpdate {
    /// Update that only changes the status.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}
