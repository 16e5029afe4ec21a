//! Bulk creation of mock entries, gated on the backing store's health.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use taskrun_core::{Checkpoint, ContinueOptions, DefinitionId, TaskResult};

use crate::health::{HealthGate, HealthGateError, TracingObserver};
use crate::runner::{TaskContext, TaskDefinition, WorkError};

pub const MOCK_DATA_CREATOR: &str = "mockDataCreator";

/// The health gate runs before every this many entries.
pub const HEALTH_CHECK_EVERY: u64 = 50;

/// Delay requested when the health gate times out.
pub const UNHEALTHY_RETRY_SECONDS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockDataInput {
    /// Entries created by previous invocations.
    #[serde(default)]
    pub created_amount: u64,
    pub total_amount: u64,
}

impl Checkpoint for MockDataInput {}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockDataOutput {
    pub created_amount: u64,
}

/// Destination of created entries.
#[async_trait]
pub trait EntryWriter: Send + Sync {
    async fn create_entry(&self, id: &str) -> Result<(), WorkError>;
}

/// Entry writer keeping ids in memory.
#[derive(Debug, Default)]
pub struct InMemoryEntryWriter {
    ids: Mutex<Vec<String>>,
    count: AtomicU64,
}

impl InMemoryEntryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn ids(&self) -> Vec<String> {
        self.ids.lock().map(|ids| ids.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EntryWriter for InMemoryEntryWriter {
    async fn create_entry(&self, id: &str) -> Result<(), WorkError> {
        self.ids
            .lock()
            .map_err(|_| "entry writer lock poisoned")?
            .push(id.to_string());
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Creates `totalAmount` entries, resuming from `createdAmount`.
pub struct MockDataCreator {
    writer: Arc<dyn EntryWriter>,
    health: HealthGate,
}

impl MockDataCreator {
    pub fn new(writer: Arc<dyn EntryWriter>, health: HealthGate) -> Self {
        Self { writer, health }
    }
}

#[async_trait]
impl TaskDefinition for MockDataCreator {
    type Input = MockDataInput;
    type Output = MockDataOutput;

    fn id(&self) -> DefinitionId {
        DefinitionId::new(MOCK_DATA_CREATOR)
    }

    async fn run(
        &self,
        ctx: &TaskContext,
        input: MockDataInput,
    ) -> Result<TaskResult<MockDataInput, MockDataOutput>, WorkError> {
        let observer = TracingObserver::new(ctx.span().clone());
        let mut created_amount = input.created_amount;

        while created_amount < input.total_amount {
            let checkpoint = MockDataInput {
                created_amount,
                ..input.clone()
            };
            if ctx.is_aborted() {
                return Ok(TaskResult::aborted());
            }
            if ctx.is_close_to_timeout() {
                return Ok(TaskResult::continue_with(checkpoint, ContinueOptions::Default));
            }

            if created_amount % HEALTH_CHECK_EVERY == 0 {
                match self
                    .health
                    .wait_with_abort(&observer, ctx.abort_signal())
                    .await
                {
                    Ok(_) => {}
                    Err(HealthGateError::Aborted { .. }) => return Ok(TaskResult::aborted()),
                    Err(HealthGateError::Timeout { .. }) => {
                        return Ok(TaskResult::continue_with(
                            checkpoint,
                            ContinueOptions::Seconds(UNHEALTHY_RETRY_SECONDS as f64),
                        ));
                    }
                }
            }

            let id = format!("{}{}", ctx.task().id, Uuid::new_v4().simple());
            self.writer.create_entry(&id).await?;
            created_amount += 1;
        }

        debug!(created_amount, "All entries created");
        Ok(TaskResult::done(
            Some(format!("Created {} records.", input.total_amount)),
            Some(MockDataOutput { created_amount }),
        ))
    }
}
