//! Task runner - drives one invocation of a task definition.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument, Span};

use taskrun_core::{
    Checkpoint, CheckpointError, CreateTaskParams, DefinitionId, InvocationResponse,
    ResponseError, TaskId, TaskRecord, TaskResult, TaskStatus, TaskUpdate,
};

use crate::signal::{AbortSignal, TimeBudget};
use crate::store::{ListTasksParams, StoreError, TaskStore};

/// Error type returned by work functions.
pub type WorkError = Box<dyn std::error::Error + Send + Sync>;

/// Code reported when a work function panics.
pub const TASK_PANICKED_CODE: &str = "TASK_PANICKED";

/// A kind of resumable task.
#[async_trait]
pub trait TaskDefinition: Send + Sync + 'static {
    /// Checkpoint carried between invocations.
    type Input: Checkpoint;

    /// Output of a successful task.
    type Output: Serialize + Default + Send;

    /// Identifier task records use to refer to this definition.
    fn id(&self) -> DefinitionId;

    /// Do a bounded amount of work starting from `input`.
    ///
    /// Implementations must poll [`TaskContext::is_aborted`] and
    /// [`TaskContext::is_close_to_timeout`] at every iteration boundary. On
    /// abort they return `Aborted` without further side effects; close to the
    /// timeout they return `Continue` with exactly the progress made so far.
    async fn run(
        &self,
        ctx: &TaskContext,
        input: Self::Input,
    ) -> Result<TaskResult<Self::Input, Self::Output>, WorkError>;
}

/// Everything a work function may use during one invocation.
pub struct TaskContext {
    task: TaskRecord,
    store: Arc<dyn TaskStore>,
    abort: AbortSignal,
    budget: Arc<dyn TimeBudget>,
    span: Span,
}

impl TaskContext {
    /// The task being run, as it was when the invocation started.
    pub fn task(&self) -> &TaskRecord {
        &self.task
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    pub fn is_close_to_timeout(&self) -> bool {
        self.budget.is_close_to_timeout()
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// Span scoping all log output of this invocation.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Create a child task linked to this task and sharing its scope.
    pub async fn create_child(
        &self,
        definition_id: impl Into<DefinitionId>,
        name: impl Into<String>,
        input: Value,
    ) -> Result<TaskRecord, StoreError> {
        let params = CreateTaskParams::new(definition_id, name, input)
            .with_parent(self.task.id.clone())
            .with_scope(self.task.tenant.clone(), self.task.locale.clone());
        self.store.create_task(params).await
    }

    /// List every child of this task, fetching `page_size` records per call.
    pub async fn list_children(&self, page_size: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let page_size = page_size.max(1);
        let mut children = Vec::new();
        loop {
            let params = ListTasksParams::children_of(self.task.id.clone(), page_size)
                .with_offset(children.len());
            let page = self.store.list_tasks(params).await?.items;
            let last_page = page.len() < page_size;
            children.extend(page);
            if last_page {
                return Ok(children);
            }
        }
    }
}

/// Runner errors. These concern the invocation itself, not the work done.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {id} is already terminal ({status:?})")]
    AlreadyTerminal { id: TaskId, status: TaskStatus },

    #[error("Task {id} belongs to definition '{actual}', not '{expected}'")]
    DefinitionMismatch {
        id: TaskId,
        expected: DefinitionId,
        actual: DefinitionId,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Runs single invocations of task definitions.
#[derive(Clone)]
pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
}

impl TaskRunner {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Run one invocation of `definition` for `task_id`.
    ///
    /// Marks the record RUNNING and returns the outcome. Persisting the outcome
    /// and deciding whether to invoke again is up to the dispatcher.
    pub async fn run<D: TaskDefinition>(
        &self,
        definition: &D,
        task_id: &TaskId,
        abort: AbortSignal,
        budget: Arc<dyn TimeBudget>,
    ) -> Result<InvocationResponse, RunnerError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| RunnerError::TaskNotFound(task_id.clone()))?;

        if task.is_terminal() {
            return Err(RunnerError::AlreadyTerminal {
                id: task.id,
                status: task.status,
            });
        }
        let expected = definition.id();
        if task.definition_id != expected {
            return Err(RunnerError::DefinitionMismatch {
                id: task.id,
                expected,
                actual: task.definition_id,
            });
        }

        let task = self
            .store
            .update_task(
                task_id,
                TaskUpdate {
                    status: Some(TaskStatus::Running),
                    iterations: Some(task.iterations + 1),
                    ..TaskUpdate::default()
                },
            )
            .await?;

        let span = info_span!(
            "task_invocation",
            task_id = %task.id,
            definition_id = %task.definition_id,
            iteration = task.iterations
        );
        span.in_scope(|| info!("Starting task invocation"));

        let input = task.input.clone();
        let ctx = TaskContext {
            task,
            store: self.store.clone(),
            abort,
            budget,
            span: span.clone(),
        };

        let result = if ctx.is_aborted() {
            TaskResult::Aborted
        } else {
            Self::invoke(definition, &ctx)
                .instrument(span.clone())
                .await
        };

        let result = match result {
            TaskResult::Error(err) => TaskResult::Error(err.with_input(&input)),
            // An abort observed after the work function returned still wins
            // over a request to continue.
            TaskResult::Continue { .. } if ctx.is_aborted() => TaskResult::Aborted,
            other => other,
        };

        span.in_scope(|| match &result {
            TaskResult::Error(err) => {
                warn!(code = %err.code, message = %err.message, "Task invocation failed")
            }
            other => info!(status = ?other.status(), "Task invocation finished"),
        });

        Ok(InvocationResponse::new(&ctx.task, result))
    }

    async fn invoke<D: TaskDefinition>(
        definition: &D,
        ctx: &TaskContext,
    ) -> TaskResult<Value, Value> {
        let input = match D::Input::from_checkpoint(&ctx.task.input) {
            Ok(input) => input,
            Err(e) => return TaskResult::error(e),
        };

        let outcome = AssertUnwindSafe(definition.run(ctx, input))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return TaskResult::error(e),
            Err(panic) => {
                return TaskResult::error(ResponseError::new(
                    TASK_PANICKED_CODE,
                    panic_message(panic.as_ref()),
                ))
            }
        };

        result
            .try_map(
                |input| input.to_checkpoint(),
                |output| serde_json::to_value(output).map_err(CheckpointError::Encode),
            )
            .unwrap_or_else(|e| TaskResult::error(e))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "Task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{CountdownBudget, Deadline};
    use crate::store::InMemoryTaskStore;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Mutex;
    use taskrun_core::ResponseStatus;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct CountInput {
        #[serde(default)]
        processed: u64,
        total: u64,
    }

    impl Checkpoint for CountInput {}

    #[derive(Debug, Default, Serialize)]
    struct CountOutput {
        processed: u64,
    }

    /// Processes units one by one, recording each processed unit.
    #[derive(Default)]
    struct Counter {
        processed: Mutex<Vec<u64>>,
        /// Abort this signal after processing the given unit.
        abort_after: Option<(u64, AbortSignal)>,
    }

    #[async_trait]
    impl TaskDefinition for Counter {
        type Input = CountInput;
        type Output = CountOutput;

        fn id(&self) -> DefinitionId {
            DefinitionId::new("counter")
        }

        async fn run(
            &self,
            ctx: &TaskContext,
            mut input: CountInput,
        ) -> Result<TaskResult<CountInput, CountOutput>, WorkError> {
            while input.processed < input.total {
                if ctx.is_aborted() {
                    return Ok(TaskResult::aborted());
                }
                if ctx.is_close_to_timeout() {
                    return Ok(TaskResult::continue_with(input, Default::default()));
                }
                self.processed.lock().unwrap().push(input.processed);
                if let Some((unit, signal)) = &self.abort_after {
                    if *unit == input.processed {
                        signal.abort();
                    }
                }
                input.processed += 1;
            }
            Ok(TaskResult::done(
                Some(format!("Processed {} units.", input.processed)),
                Some(CountOutput {
                    processed: input.processed,
                }),
            ))
        }
    }

    struct Failing;

    #[async_trait]
    impl TaskDefinition for Failing {
        type Input = CountInput;
        type Output = CountOutput;

        fn id(&self) -> DefinitionId {
            DefinitionId::new("counter")
        }

        async fn run(
            &self,
            _ctx: &TaskContext,
            input: CountInput,
        ) -> Result<TaskResult<CountInput, CountOutput>, WorkError> {
            if input.total == 0 {
                panic!("nothing to count");
            }
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into())
        }
    }

    async fn setup(input: Value) -> (Arc<InMemoryTaskStore>, TaskRunner, TaskId) {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = store
            .create_task(CreateTaskParams::new("counter", "Counter", input))
            .await
            .unwrap();
        let runner = TaskRunner::new(store.clone());
        (store, runner, task.id)
    }

    fn unbounded() -> Arc<dyn TimeBudget> {
        Arc::new(Deadline::unbounded())
    }

    #[tokio::test]
    async fn test_done_with_output() {
        let (store, runner, id) = setup(json!({"total": 3})).await;

        let response = runner
            .run(&Counter::default(), &id, AbortSignal::new(), unbounded())
            .await
            .unwrap();

        assert_eq!(
            response.result,
            TaskResult::Done {
                message: Some("Processed 3 units.".to_string()),
                output: json!({"processed": 3}),
            }
        );
        let task = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.iterations, 1);
    }

    #[tokio::test]
    async fn test_close_to_timeout_continues_with_progress() {
        let (_store, runner, id) = setup(json!({"total": 5})).await;
        let counter = Counter::default();

        let response = runner
            .run(&counter, &id, AbortSignal::new(), Arc::new(CountdownBudget::new(2)))
            .await
            .unwrap();

        assert_eq!(
            response.result,
            TaskResult::Continue {
                input: json!({"processed": 2, "total": 5, "version": 1}),
                wait_seconds: None,
            }
        );
        assert_eq!(*counter.processed.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_resuming_from_checkpoint_skips_processed_units() {
        let (_store, runner, id) =
            setup(json!({"processed": 3, "total": 5, "version": 1})).await;
        let counter = Counter::default();

        let response = runner
            .run(&counter, &id, AbortSignal::new(), unbounded())
            .await
            .unwrap();

        assert_eq!(response.status(), ResponseStatus::Done);
        assert_eq!(*counter.processed.lock().unwrap(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_abort_before_start_skips_work() {
        let (_store, runner, id) = setup(json!({"total": 5})).await;
        let counter = Counter::default();
        let abort = AbortSignal::new();
        abort.abort();

        let response = runner.run(&counter, &id, abort, unbounded()).await.unwrap();

        assert_eq!(response.result, TaskResult::Aborted);
        assert!(counter.processed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abort_during_work_stops_at_next_boundary() {
        let (_store, runner, id) = setup(json!({"total": 10})).await;
        let abort = AbortSignal::new();
        let counter = Counter {
            abort_after: Some((1, abort.clone())),
            ..Counter::default()
        };

        let response = runner.run(&counter, &id, abort, unbounded()).await.unwrap();

        assert_eq!(response.result, TaskResult::Aborted);
        assert_eq!(*counter.processed.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_work_error_becomes_error_with_input() {
        let (_store, runner, id) = setup(json!({"total": 1})).await;

        let response = runner
            .run(&Failing, &id, AbortSignal::new(), unbounded())
            .await
            .unwrap();

        match response.result {
            TaskResult::Error(err) => {
                assert_eq!(err.code, "UNKNOWN_ERROR");
                assert_eq!(err.message, "disk full");
                assert_eq!(err.data, Some(json!({"input": {"total": 1}})));
            }
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let (_store, runner, id) = setup(json!({"total": 0})).await;

        let response = runner
            .run(&Failing, &id, AbortSignal::new(), unbounded())
            .await
            .unwrap();

        match response.result {
            TaskResult::Error(err) => {
                assert_eq!(err.code, TASK_PANICKED_CODE);
                assert_eq!(err.message, "nothing to count");
            }
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_checkpoint() {
        let (_store, runner, id) = setup(json!({"total": 5, "version": 7})).await;

        let response = runner
            .run(&Counter::default(), &id, AbortSignal::new(), unbounded())
            .await
            .unwrap();

        match response.result {
            TaskResult::Error(err) => assert_eq!(err.code, "INVALID_CHECKPOINT"),
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminal_and_missing_tasks_are_not_run() {
        let (store, runner, id) = setup(json!({"total": 1})).await;
        store
            .update_task(&id, TaskUpdate::status(TaskStatus::Success))
            .await
            .unwrap();

        let err = runner
            .run(&Counter::default(), &id, AbortSignal::new(), unbounded())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::AlreadyTerminal { .. }));

        let err = runner
            .run(
                &Counter::default(),
                &TaskId::new("missing"),
                AbortSignal::new(),
                unbounded(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_children_share_parent_scope() {
        let store = Arc::new(InMemoryTaskStore::new());
        let parent = store
            .create_task(
                CreateTaskParams::new("counter", "Parent", json!({})).with_scope("acme", "de-DE"),
            )
            .await
            .unwrap();
        let ctx = TaskContext {
            task: parent.clone(),
            store: store.clone(),
            abort: AbortSignal::new(),
            budget: unbounded(),
            span: Span::none(),
        };

        let child = ctx.create_child("child", "Child", json!({"n": 1})).await.unwrap();
        assert_eq!(child.parent_id, Some(parent.id));
        assert_eq!(child.tenant, "acme");
        assert_eq!(child.locale, "de-DE");
        assert_eq!(ctx.list_children(10).await.unwrap(), vec![child]);
    }
}
