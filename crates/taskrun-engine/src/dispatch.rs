//! Local dispatcher - invokes tasks in-process and persists their results.
//!
//! Stands in for the external dispatcher in tests and the CLI. It records the
//! advisory delay of a Continue on the task record but re-invokes immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use taskrun_core::{
    CreateTaskParams, DefinitionId, InvocationResponse, TaskId, TaskRecord, TaskResult,
    TaskStatus, TaskUpdate,
};

use crate::config::DispatcherConfig;
use crate::runner::{RunnerError, TaskDefinition, TaskRunner};
use crate::signal::{AbortSignal, TimeBudget};
use crate::store::{StoreError, TaskStore};

/// Dispatcher errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No task definition registered for '{0}'")]
    UnknownDefinition(DefinitionId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {id} did not finish within {max} invocations")]
    IterationLimit { id: TaskId, max: u32 },

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Called after every Continue of [`LocalDispatcher::run_with_hook`].
#[async_trait]
pub trait ContinueHook: Send + Sync {
    async fn on_continue(
        &self,
        dispatcher: &LocalDispatcher,
        response: &InvocationResponse,
        iteration: u32,
    ) -> Result<(), DispatchError>;
}

struct NoopHook;

#[async_trait]
impl ContinueHook for NoopHook {
    async fn on_continue(
        &self,
        _dispatcher: &LocalDispatcher,
        _response: &InvocationResponse,
        _iteration: u32,
    ) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// Object-safe view of a [`TaskDefinition`].
#[async_trait]
trait RegisteredDefinition: Send + Sync {
    async fn invoke(
        &self,
        runner: &TaskRunner,
        task_id: &TaskId,
        abort: AbortSignal,
        budget: Arc<dyn TimeBudget>,
    ) -> Result<InvocationResponse, RunnerError>;
}

#[async_trait]
impl<D: TaskDefinition> RegisteredDefinition for D {
    async fn invoke(
        &self,
        runner: &TaskRunner,
        task_id: &TaskId,
        abort: AbortSignal,
        budget: Arc<dyn TimeBudget>,
    ) -> Result<InvocationResponse, RunnerError> {
        runner.run(self, task_id, abort, budget).await
    }
}

/// In-process dispatcher.
pub struct LocalDispatcher {
    store: Arc<dyn TaskStore>,
    runner: TaskRunner,
    config: DispatcherConfig,
    definitions: HashMap<DefinitionId, Arc<dyn RegisteredDefinition>>,
    /// Abort signals of tasks that have not reached a terminal state.
    aborts: Mutex<HashMap<TaskId, AbortSignal>>,
}

impl LocalDispatcher {
    pub fn new(store: Arc<dyn TaskStore>, config: DispatcherConfig) -> Self {
        Self {
            runner: TaskRunner::new(store.clone()),
            store,
            config,
            definitions: HashMap::new(),
            aborts: Mutex::new(HashMap::new()),
        }
    }

    /// Register a task definition under its id.
    pub fn register<D: TaskDefinition>(&mut self, definition: D) -> &mut Self {
        let id = definition.id();
        debug!(definition_id = %id, "Registering task definition");
        self.definitions.insert(id, Arc::new(definition));
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Create a PENDING task for a registered definition.
    pub async fn trigger(&self, params: CreateTaskParams) -> Result<TaskRecord, DispatchError> {
        if !self.definitions.contains_key(&params.definition_id) {
            return Err(DispatchError::UnknownDefinition(params.definition_id));
        }
        let task = self.store.create_task(params).await?;
        info!(
            task_id = %task.id,
            definition_id = %task.definition_id,
            "Task triggered"
        );
        Ok(task)
    }

    /// Run one invocation of a task and persist its result.
    pub async fn invoke(&self, task_id: &TaskId) -> Result<InvocationResponse, DispatchError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| DispatchError::TaskNotFound(task_id.clone()))?;
        let definition = self
            .definitions
            .get(&task.definition_id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownDefinition(task.definition_id.clone()))?;

        let response = match definition
            .invoke(
                &self.runner,
                task_id,
                self.abort_signal(task_id),
                self.config.budget.start(),
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.release_abort_signal(task_id);
                return Err(e.into());
            }
        };

        self.persist(&response).await?;
        if response.result.is_terminal() {
            self.release_abort_signal(task_id);
        }
        Ok(response)
    }

    /// Invoke a task until it reaches a terminal state.
    pub async fn run_to_completion(
        &self,
        task_id: &TaskId,
    ) -> Result<InvocationResponse, DispatchError> {
        self.run_with_hook(task_id, &NoopHook).await
    }

    /// Invoke a task until it reaches a terminal state, calling `hook` after
    /// every Continue.
    pub async fn run_with_hook(
        &self,
        task_id: &TaskId,
        hook: &dyn ContinueHook,
    ) -> Result<InvocationResponse, DispatchError> {
        for iteration in 1..=self.config.max_iterations {
            let response = self.invoke(task_id).await?;
            if response.result.is_terminal() {
                return Ok(response);
            }
            hook.on_continue(self, &response, iteration).await?;
        }

        warn!(
            task_id = %task_id,
            max_iterations = self.config.max_iterations,
            "Task did not finish within the iteration limit"
        );
        Err(DispatchError::IterationLimit {
            id: task_id.clone(),
            max: self.config.max_iterations,
        })
    }

    /// Request an abort.
    ///
    /// A running invocation observes it at its next poll boundary. A task that
    /// is waiting for its next invocation is marked ABORTED right away. Aborting
    /// a terminal task does nothing.
    pub async fn abort(&self, task_id: &TaskId) -> Result<(), DispatchError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| DispatchError::TaskNotFound(task_id.clone()))?;

        match task.status {
            TaskStatus::Running => self.abort_signal(task_id).abort(),
            TaskStatus::Pending => {
                self.store
                    .update_task(task_id, TaskUpdate::status(TaskStatus::Aborted))
                    .await?;
                self.release_abort_signal(task_id);
            }
            _ => {
                self.release_abort_signal(task_id);
                debug!(task_id = %task_id, status = ?task.status, "Task already terminal");
                return Ok(());
            }
        }
        info!(task_id = %task_id, status = ?task.status, "Abort requested");
        Ok(())
    }

    async fn persist(&self, response: &InvocationResponse) -> Result<TaskRecord, DispatchError> {
        let update = match &response.result {
            TaskResult::Done { output, .. } => TaskUpdate {
                status: Some(TaskStatus::Success),
                output: Some(output.clone()),
                delay_seconds: Some(None),
                ..TaskUpdate::default()
            },
            TaskResult::Continue {
                input,
                wait_seconds,
            } => TaskUpdate {
                status: Some(TaskStatus::Pending),
                input: Some(input.clone()),
                delay_seconds: Some(*wait_seconds),
                ..TaskUpdate::default()
            },
            TaskResult::Error(err) => TaskUpdate {
                status: Some(TaskStatus::Failure),
                error: Some(err.clone()),
                delay_seconds: Some(None),
                ..TaskUpdate::default()
            },
            TaskResult::Aborted => TaskUpdate {
                status: Some(TaskStatus::Aborted),
                delay_seconds: Some(None),
                ..TaskUpdate::default()
            },
        };
        Ok(self.store.update_task(&response.task_id, update).await?)
    }

    fn abort_signal(&self, task_id: &TaskId) -> AbortSignal {
        let mut aborts = self.aborts.lock().unwrap_or_else(|e| e.into_inner());
        aborts.entry(task_id.clone()).or_default().clone()
    }

    fn release_abort_signal(&self, task_id: &TaskId) {
        let mut aborts = self.aborts.lock().unwrap_or_else(|e| e.into_inner());
        aborts.remove(task_id);
    }

    #[cfg(test)]
    fn tracked_abort_signals(&self) -> usize {
        self.aborts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetPolicy;
    use crate::runner::{TaskContext, WorkError};
    use crate::store::InMemoryTaskStore;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use taskrun_core::{Checkpoint, ContinueOptions, ResponseStatus};

    #[derive(Debug, Serialize, Deserialize)]
    struct StepInput {
        #[serde(default)]
        step: u32,
        steps: u32,
    }

    impl Checkpoint for StepInput {}

    /// Advances one step per invocation and asks to be polled again in 5s.
    struct Stepper;

    #[async_trait]
    impl TaskDefinition for Stepper {
        type Input = StepInput;
        type Output = serde_json::Map<String, serde_json::Value>;

        fn id(&self) -> DefinitionId {
            DefinitionId::new("stepper")
        }

        async fn run(
            &self,
            ctx: &TaskContext,
            mut input: StepInput,
        ) -> Result<TaskResult<StepInput, Self::Output>, WorkError> {
            if ctx.is_aborted() {
                return Ok(TaskResult::aborted());
            }
            if input.step >= input.steps {
                return Ok(TaskResult::done(None, None));
            }
            input.step += 1;
            Ok(TaskResult::continue_with(input, ContinueOptions::Seconds(5.0)))
        }
    }

    fn dispatcher(max_iterations: u32) -> LocalDispatcher {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut dispatcher = LocalDispatcher::new(
            store,
            DispatcherConfig {
                max_iterations,
                budget: BudgetPolicy::Unbounded,
            },
        );
        dispatcher.register(Stepper);
        dispatcher
    }

    fn params(steps: u32) -> CreateTaskParams {
        CreateTaskParams::new("stepper", "Stepper", json!({ "steps": steps }))
    }

    #[tokio::test]
    async fn test_continue_reuses_same_record() {
        let dispatcher = dispatcher(10);
        let task = dispatcher.trigger(params(2)).await.unwrap();

        let response = dispatcher.invoke(&task.id).await.unwrap();
        assert_eq!(response.status(), ResponseStatus::Continue);
        assert_eq!(response.delay(), Some(5));

        let stored = dispatcher.store().get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.input, json!({"step": 1, "steps": 2, "version": 1}));
        assert_eq!(stored.delay_seconds, Some(5));
        assert_eq!(stored.iterations, 1);

        let response = dispatcher.run_to_completion(&task.id).await.unwrap();
        assert_eq!(response.status(), ResponseStatus::Done);
        assert_eq!(response.result, TaskResult::Done { message: None, output: json!({}) });

        let stored = dispatcher.store().get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Success);
        assert_eq!(stored.output, Some(json!({})));
        assert_eq!(stored.iterations, 3);
        assert_eq!(dispatcher.store().list_tasks(Default::default()).await.unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let dispatcher = dispatcher(2);
        let task = dispatcher.trigger(params(10)).await.unwrap();

        let err = dispatcher.run_to_completion(&task.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::IterationLimit { max: 2, .. }));
    }

    #[tokio::test]
    async fn test_unknown_definition() {
        let dispatcher = dispatcher(2);
        let err = dispatcher
            .trigger(CreateTaskParams::new("nope", "Nope", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownDefinition(_)));
    }

    #[tokio::test]
    async fn test_abort_pending_task() {
        let dispatcher = dispatcher(10);
        let task = dispatcher.trigger(params(3)).await.unwrap();
        dispatcher.invoke(&task.id).await.unwrap();

        dispatcher.abort(&task.id).await.unwrap();

        let stored = dispatcher.store().get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Aborted);
        // The checkpoint is left as it was before the abort.
        assert_eq!(stored.input["step"], 1);

        let err = dispatcher.invoke(&task.id).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Runner(RunnerError::AlreadyTerminal { .. })
        ));
    }

    struct AbortOnContinue;

    #[async_trait]
    impl ContinueHook for AbortOnContinue {
        async fn on_continue(
            &self,
            dispatcher: &LocalDispatcher,
            response: &InvocationResponse,
            _iteration: u32,
        ) -> Result<(), DispatchError> {
            dispatcher.abort_signal(&response.task_id).abort();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_abort_signal_wins_over_continue() {
        let dispatcher = dispatcher(10);
        let task = dispatcher.trigger(params(3)).await.unwrap();

        let response = dispatcher
            .run_with_hook(&task.id, &AbortOnContinue)
            .await
            .unwrap();

        assert_eq!(response.result, TaskResult::Aborted);
        let stored = dispatcher.store().get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Aborted);
        assert_eq!(stored.input["step"], 1);
    }

    #[tokio::test]
    async fn test_abort_does_not_track_settled_or_unknown_tasks() {
        let dispatcher = dispatcher(10);

        let err = dispatcher.abort(&TaskId::new("missing")).await.unwrap_err();
        assert!(matches!(err, DispatchError::TaskNotFound(_)));
        assert_eq!(dispatcher.tracked_abort_signals(), 0);

        let task = dispatcher.trigger(params(0)).await.unwrap();
        dispatcher.run_to_completion(&task.id).await.unwrap();
        dispatcher.abort(&task.id).await.unwrap();
        assert_eq!(dispatcher.tracked_abort_signals(), 0);

        let stored = dispatcher.store().get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Success);

        // A failed invocation does not leave its signal behind either.
        assert!(dispatcher.invoke(&task.id).await.is_err());
        assert_eq!(dispatcher.tracked_abort_signals(), 0);
    }

    #[tokio::test]
    async fn test_abort_running_task_is_observed_on_invoke() {
        let dispatcher = dispatcher(10);
        let task = dispatcher.trigger(params(3)).await.unwrap();
        dispatcher
            .store()
            .update_task(&task.id, TaskUpdate::status(TaskStatus::Running))
            .await
            .unwrap();

        dispatcher.abort(&task.id).await.unwrap();
        assert_eq!(dispatcher.tracked_abort_signals(), 1);

        let response = dispatcher.invoke(&task.id).await.unwrap();
        assert_eq!(response.result, TaskResult::Aborted);
        assert_eq!(dispatcher.tracked_abort_signals(), 0);
    }
}
