//! Outcome of a single task invocation.
//!
//! A work function returns exactly one [`TaskResult`]: `Done` and `Error`
//! finish the task, `Aborted` records an observed cancellation, and `Continue`
//! asks the dispatcher to invoke the same task again with a new checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::{CheckpointError, DefinitionId, TaskId, TaskRecord};

/// 355 days in seconds. Upper bound of a Continue's requested wait.
pub const MAX_WAIT_SECONDS: u64 = 30_672_000;

/// Code used for errors that carry no code of their own.
pub const UNKNOWN_ERROR_CODE: &str = "UNKNOWN_ERROR";

/// Structured error reported by a failed invocation.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ResponseError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    /// Create an error with a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Builder method to attach diagnostic data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Extract the properties of an arbitrary error.
    ///
    /// A `ResponseError` anywhere in the source chain is returned as-is.
    /// Otherwise the error's message becomes the message and the messages of
    /// its sources are kept under `data.trace`.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut current = Some(err);
        while let Some(e) = current {
            if let Some(response_error) = e.downcast_ref::<ResponseError>() {
                return response_error.clone();
            }
            current = e.source();
        }

        let mut trace = Vec::new();
        let mut source = err.source();
        while let Some(e) = source {
            trace.push(Value::String(e.to_string()));
            source = e.source();
        }

        let error = Self::new(UNKNOWN_ERROR_CODE, err.to_string());
        if trace.is_empty() {
            error
        } else {
            error.with_data(json!({ "trace": trace }))
        }
    }

    /// Echo the checkpoint that produced this error under `data.input`.
    ///
    /// Existing `input` data is never overwritten.
    pub fn with_input(mut self, input: &Value) -> Self {
        match self.data.take() {
            None => {
                self.data = Some(json!({ "input": input }));
            }
            Some(Value::Object(mut map)) => {
                map.entry("input").or_insert_with(|| input.clone());
                self.data = Some(Value::Object(map));
            }
            Some(other) => {
                let mut map = Map::new();
                map.insert("details".to_string(), other);
                map.insert("input".to_string(), input.clone());
                self.data = Some(Value::Object(map));
            }
        }
        self
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for ResponseError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::from_error(err.as_ref())
    }
}

impl From<CheckpointError> for ResponseError {
    fn from(err: CheckpointError) -> Self {
        Self::new("INVALID_CHECKPOINT", err.to_string())
    }
}

/// How long the dispatcher should wait before the next invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum ContinueOptions {
    /// Use the dispatcher's default re-poll cadence.
    #[default]
    Default,
    /// Wait a relative, possibly fractional, number of seconds.
    Seconds(f64),
    /// Wait until an absolute point in time.
    Until(DateTime<Utc>),
}

impl ContinueOptions {
    /// Normalize to a single wait in whole seconds.
    ///
    /// Waits under one second collapse to `None`; waits above
    /// [`MAX_WAIT_SECONDS`] are capped at it.
    pub fn wait_seconds(&self, now: DateTime<Utc>) -> Option<u64> {
        let seconds = match *self {
            Self::Default => return None,
            Self::Seconds(seconds) => seconds,
            Self::Until(date) => (date - now).num_milliseconds() as f64 / 1000.0,
        };
        if seconds.is_nan() || seconds < 1.0 {
            return None;
        }
        Some((seconds as u64).min(MAX_WAIT_SECONDS))
    }
}

/// Status of an invocation as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Done,
    Continue,
    Error,
    Aborted,
}

/// Outcome of one invocation, generic over the checkpoint `I` and output `O`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult<I, O> {
    /// Terminal success.
    Done { message: Option<String>, output: O },
    /// Re-invoke the same task with `input` as its checkpoint.
    Continue {
        input: I,
        wait_seconds: Option<u64>,
    },
    /// Terminal failure.
    Error(ResponseError),
    /// Terminal, an abort request was observed.
    Aborted,
}

impl<I, O: Default> TaskResult<I, O> {
    /// Finish the task. A missing output defaults to `O::default()`.
    pub fn done(message: Option<String>, output: Option<O>) -> Self {
        Self::Done {
            message,
            output: output.unwrap_or_default(),
        }
    }
}

impl<I, O> TaskResult<I, O> {
    /// Request another invocation with `input` as the new checkpoint.
    pub fn continue_with(input: I, options: ContinueOptions) -> Self {
        Self::Continue {
            input,
            wait_seconds: options.wait_seconds(Utc::now()),
        }
    }

    /// Fail the task.
    pub fn error(err: impl Into<ResponseError>) -> Self {
        Self::Error(err.into())
    }

    /// Report an observed abort.
    pub fn aborted() -> Self {
        Self::Aborted
    }

    /// Status reported to the dispatcher.
    pub fn status(&self) -> ResponseStatus {
        match self {
            Self::Done { .. } => ResponseStatus::Done,
            Self::Continue { .. } => ResponseStatus::Continue,
            Self::Error(_) => ResponseStatus::Error,
            Self::Aborted => ResponseStatus::Aborted,
        }
    }

    /// Returns true unless the result is a Continue.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Continue { .. })
    }

    /// Convert the checkpoint and output types, short-circuiting on failure.
    pub fn try_map<J, P, E>(
        self,
        map_input: impl FnOnce(I) -> Result<J, E>,
        map_output: impl FnOnce(O) -> Result<P, E>,
    ) -> Result<TaskResult<J, P>, E> {
        Ok(match self {
            Self::Done { message, output } => TaskResult::Done {
                message,
                output: map_output(output)?,
            },
            Self::Continue {
                input,
                wait_seconds,
            } => TaskResult::Continue {
                input: map_input(input)?,
                wait_seconds,
            },
            Self::Error(err) => TaskResult::Error(err),
            Self::Aborted => TaskResult::Aborted,
        })
    }
}

/// Result of one invocation as handed to the dispatcher.
///
/// Serializes to the dispatcher wire schema:
/// `{status, tenant, locale, webinyTaskId, webinyTaskDefinitionId, message?,
/// output?, input?, delay?, error?}`.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResponse {
    pub task_id: TaskId,
    pub definition_id: DefinitionId,
    pub tenant: String,
    pub locale: String,
    pub result: TaskResult<Value, Value>,
}

impl InvocationResponse {
    /// Wrap a result with the identity and scope of the task that produced it.
    pub fn new(task: &TaskRecord, result: TaskResult<Value, Value>) -> Self {
        Self {
            task_id: task.id.clone(),
            definition_id: task.definition_id.clone(),
            tenant: task.tenant.clone(),
            locale: task.locale.clone(),
            result,
        }
    }

    pub fn status(&self) -> ResponseStatus {
        self.result.status()
    }

    /// Advisory delay in seconds; `-1` means the default re-poll cadence.
    pub fn delay(&self) -> Option<i64> {
        match &self.result {
            TaskResult::Continue { wait_seconds, .. } => {
                Some(wait_seconds.map(|s| s as i64).unwrap_or(-1))
            }
            _ => None,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse<'a> {
    status: ResponseStatus,
    tenant: &'a str,
    locale: &'a str,
    webiny_task_id: &'a TaskId,
    webiny_task_definition_id: &'a DefinitionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delay: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ResponseError>,
}

impl Serialize for InvocationResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut wire = WireResponse {
            status: self.status(),
            tenant: &self.tenant,
            locale: &self.locale,
            webiny_task_id: &self.task_id,
            webiny_task_definition_id: &self.definition_id,
            message: None,
            output: None,
            input: None,
            delay: self.delay(),
            error: None,
        };
        match &self.result {
            TaskResult::Done { message, output } => {
                wire.message = message.as_deref();
                wire.output = Some(output);
            }
            TaskResult::Continue { input, .. } => wire.input = Some(input),
            TaskResult::Error(err) => wire.error = Some(err),
            TaskResult::Aborted => {}
        }
        wire.serialize(serializer)
    }
}
