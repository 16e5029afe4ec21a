//! Task store - persistence for task records.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use taskrun_core::{CoreError, CreateTaskParams, TaskId, TaskRecord, TaskUpdate};

/// Default page size when listing tasks.
pub const DEFAULT_LIST_LIMIT: usize = 1000;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Filter for listing tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListTasksParams {
    /// Only tasks whose parent is this task.
    pub parent_id: Option<TaskId>,

    /// Maximum number of tasks returned.
    pub limit: usize,

    /// Number of matching tasks skipped, in creation order.
    pub offset: usize,
}

impl ListTasksParams {
    /// List the children of `parent_id`.
    pub fn children_of(parent_id: TaskId, limit: usize) -> Self {
        Self {
            parent_id: Some(parent_id),
            limit,
            offset: 0,
        }
    }

    /// Start the page after the first `offset` matching tasks.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

impl Default for ListTasksParams {
    fn default() -> Self {
        Self {
            parent_id: None,
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

/// A page of task records.
#[derive(Debug, Clone, Default)]
pub struct ListTasksResponse {
    pub items: Vec<TaskRecord>,
}

/// Persistence for task records.
///
/// Implementations must reject updates of terminal records, which
/// [`TaskRecord::apply`] already does.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a new PENDING task record.
    async fn create_task(&self, params: CreateTaskParams) -> Result<TaskRecord, StoreError>;

    /// Fetch a task record by id.
    async fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// List task records in creation order.
    async fn list_tasks(&self, params: ListTasksParams) -> Result<ListTasksResponse, StoreError>;

    /// Apply a partial update and return the updated record.
    async fn update_task(&self, id: &TaskId, update: TaskUpdate)
        -> Result<TaskRecord, StoreError>;
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, TaskRecord>,
    /// Creation order, used for listing.
    order: Vec<TaskId>,
}

/// In-memory task store.
#[derive(Default)]
pub struct InMemoryTaskStore {
    inner: RwLock<Inner>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored tasks.
    pub async fn task_count(&self) -> usize {
        self.inner.read().await.tasks.len()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, params: CreateTaskParams) -> Result<TaskRecord, StoreError> {
        let task = TaskRecord::new(params);
        let mut inner = self.inner.write().await;
        inner.order.push(task.id.clone());
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.inner.read().await.tasks.get(id).cloned())
    }

    async fn list_tasks(&self, params: ListTasksParams) -> Result<ListTasksResponse, StoreError> {
        let inner = self.inner.read().await;
        let items = inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .filter(|task| match &params.parent_id {
                Some(parent_id) => task.parent_id.as_ref() == Some(parent_id),
                None => true,
            })
            .skip(params.offset)
            .take(params.limit)
            .cloned()
            .collect();
        Ok(ListTasksResponse { items })
    }

    async fn update_task(
        &self,
        id: &TaskId,
        update: TaskUpdate,
    ) -> Result<TaskRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.clone()))?;
        task.apply(update)?;
        Ok(task.clone())
    }
}
