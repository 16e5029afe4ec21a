//! Import-from-URL coordinator.
//!
//! Fans a batch of validated files out into one child task per file, then
//! re-invokes itself until every child reached a terminal state and reports
//! the aggregated outcome.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use taskrun_core::{
    Checkpoint, ContinueOptions, DefinitionId, ResponseError, TaskId, TaskRecord, TaskResult,
    TaskStatus,
};

use crate::runner::{TaskContext, TaskDefinition, WorkError};
use crate::store::DEFAULT_LIST_LIMIT;

pub const IMPORT_FROM_URL_CONTROLLER: &str = "importFromUrlController";
pub const IMPORT_CONTENT_ENTRIES: &str = "importFromUrlContentEntries";
pub const IMPORT_ASSETS: &str = "importFromUrlAssets";

/// Step marking that children have been dispatched.
pub const DOWNLOAD_STEP: &str = "download";

pub const MISSING_MODEL_ID: &str = "MISSING_MODEL_ID";
pub const NO_FILES_FOUND: &str = "NO_FILES_FOUND";
pub const MODEL_NOT_FOUND: &str = "MODEL_NOT_FOUND";
pub const DUPLICATE_FILE: &str = "DUPLICATE_FILE";

/// Kind of an import file. Unrecognized kinds are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FileType {
    Entries,
    Assets,
    Other(String),
}

impl FileType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Entries => "entries",
            Self::Assets => "assets",
            Self::Other(other) => other,
        }
    }

    /// Definition handling files of this kind, if any.
    pub fn child_definition(&self) -> Option<&'static str> {
        match self {
            Self::Entries => Some(IMPORT_CONTENT_ENTRIES),
            Self::Assets => Some(IMPORT_ASSETS),
            Self::Other(_) => None,
        }
    }
}

impl From<String> for FileType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "entries" => Self::Entries,
            "assets" => Self::Assets,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for FileType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<FileType> for String {
    fn from(value: FileType) -> Self {
        match value {
            FileType::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file already validated by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportFile {
    pub key: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked: Option<bool>,
}

/// Identity of a file within one import: its type and key.
type FileIdentity = (FileType, String);

impl ImportFile {
    fn identity(&self) -> FileIdentity {
        (self.file_type.clone(), self.key.clone())
    }

    pub fn new(key: impl Into<String>, file_type: impl Into<FileType>) -> Self {
        Self {
            key: key.into(),
            file_type: file_type.into(),
            get: None,
            head: None,
            size: None,
            checksum: None,
            checked: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    pub triggered: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default)]
    pub files: Vec<ImportFile>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepState>,
}

impl ControllerInput {
    pub fn new(model_id: impl Into<String>, files: Vec<ImportFile>) -> Self {
        Self {
            model_id: Some(model_id.into()),
            files,
            steps: BTreeMap::new(),
        }
    }

    pub fn is_dispatched(&self) -> bool {
        self.steps
            .get(DOWNLOAD_STEP)
            .is_some_and(|step| step.triggered)
    }
}

impl Checkpoint for ControllerInput {}

/// Input of a child import task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildInput {
    pub model_id: String,
    pub file: ImportFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubUnitState {
    Pending,
    Invalid,
    Triggered,
    Success,
    Failure,
    Aborted,
}

impl SubUnitState {
    fn from_child(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending | TaskStatus::Running => Self::Triggered,
            TaskStatus::Success => Self::Success,
            TaskStatus::Failure => Self::Failure,
            TaskStatus::Aborted => Self::Aborted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOutcome {
    pub key: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub state: SubUnitState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// Aggregated outcome. `done`, `failed` and `aborted` hold child task ids,
/// `invalid` holds keys of files that were never dispatched.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerOutput {
    pub done: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub aborted: Vec<TaskId>,
    pub invalid: Vec<String>,
    pub files: Vec<FileOutcome>,
}

impl ControllerOutput {
    fn settled(&self) -> usize {
        self.done.len() + self.failed.len() + self.aborted.len() + self.invalid.len()
    }
}

/// Lookup of content models children import into.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    async fn model_exists(&self, model_id: &str) -> Result<bool, WorkError>;
}

/// Model registry over a fixed set of model ids.
#[derive(Debug, Default, Clone)]
pub struct StaticModelRegistry {
    models: HashSet<String>,
}

impl StaticModelRegistry {
    pub fn new<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            models: models.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ModelRegistry for StaticModelRegistry {
    async fn model_exists(&self, model_id: &str) -> Result<bool, WorkError> {
        Ok(self.models.contains(model_id))
    }
}

/// Coordinator of the import-from-URL child tasks.
pub struct ImportFromUrlController<R> {
    models: R,
    page_size: usize,
}

impl<R: ModelRegistry> ImportFromUrlController<R> {
    pub fn new(models: R) -> Self {
        Self {
            models,
            page_size: DEFAULT_LIST_LIMIT,
        }
    }

    /// Number of child records fetched per store call.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Fatal checks run before anything is dispatched.
    async fn validate(
        &self,
        input: &ControllerInput,
    ) -> Result<Result<String, ResponseError>, WorkError> {
        let Some(model_id) = input.model_id.as_deref().filter(|id| !id.is_empty()) else {
            return Ok(Err(ResponseError::new(
                MISSING_MODEL_ID,
                r#"Missing "modelId" in the input."#,
            )));
        };
        if input.files.is_empty() {
            return Ok(Err(ResponseError::new(
                NO_FILES_FOUND,
                "No files found in the provided data.",
            )));
        }
        let mut seen = HashSet::new();
        if let Some(file) = input.files.iter().find(|file| !seen.insert(file.identity())) {
            return Ok(Err(ResponseError::new(
                DUPLICATE_FILE,
                format!(
                    r#"File "{}" of type "{}" is listed more than once."#,
                    file.key, file.file_type
                ),
            )));
        }
        if !self.models.model_exists(model_id).await? {
            return Ok(Err(ResponseError::new(
                MODEL_NOT_FOUND,
                format!(r#"Model "{model_id}" not found."#),
            )));
        }
        Ok(Ok(model_id.to_string()))
    }

    /// Create a child for every recognized file that does not have one yet.
    ///
    /// Returns `Some` when the invocation has to stop before all children
    /// exist.
    async fn dispatch(
        &self,
        ctx: &TaskContext,
        input: &ControllerInput,
        model_id: &str,
        existing: &HashMap<FileIdentity, TaskRecord>,
    ) -> Result<Option<ControllerResult>, WorkError> {
        for file in &input.files {
            let Some(definition) = file.file_type.child_definition() else {
                continue;
            };
            if existing.contains_key(&file.identity()) {
                continue;
            }
            if ctx.is_aborted() {
                return Ok(Some(TaskResult::aborted()));
            }
            if ctx.is_close_to_timeout() {
                return Ok(Some(TaskResult::continue_with(
                    input.clone(),
                    ContinueOptions::Default,
                )));
            }

            let child_input = serde_json::to_value(ChildInput {
                model_id: model_id.to_string(),
                file: file.clone(),
            })?;
            let child = ctx
                .create_child(
                    definition,
                    format!("{} - {}", ctx.task().name, file.key),
                    child_input,
                )
                .await?;
            info!(
                child_id = %child.id,
                file = %file.key,
                file_type = %file.file_type,
                "Dispatched child task"
            );
        }
        Ok(None)
    }

    /// All children of this task keyed by the file they import.
    ///
    /// If a file somehow has several children, the earliest one counts.
    async fn children_by_file(
        &self,
        ctx: &TaskContext,
    ) -> Result<HashMap<FileIdentity, TaskRecord>, WorkError> {
        let mut by_file = HashMap::new();
        for child in ctx.list_children(self.page_size).await? {
            match serde_json::from_value::<ChildInput>(child.input.clone()) {
                Ok(child_input) => {
                    by_file.entry(child_input.file.identity()).or_insert(child);
                }
                Err(e) => {
                    warn!(child_id = %child.id, error = %e, "Ignoring child with unexpected input");
                }
            }
        }
        Ok(by_file)
    }
}

type ControllerResult = TaskResult<ControllerInput, ControllerOutput>;

fn reconcile(
    input: &ControllerInput,
    children: &HashMap<FileIdentity, TaskRecord>,
) -> ControllerOutput {
    let mut output = ControllerOutput::default();

    for file in &input.files {
        let child = children.get(&file.identity());
        let state = match (file.file_type.child_definition(), child) {
            (None, _) => {
                output.invalid.push(file.key.clone());
                SubUnitState::Invalid
            }
            (Some(_), None) => SubUnitState::Pending,
            (Some(_), Some(child)) => {
                let state = SubUnitState::from_child(child.status);
                match state {
                    SubUnitState::Success => output.done.push(child.id.clone()),
                    SubUnitState::Failure => output.failed.push(child.id.clone()),
                    SubUnitState::Aborted => output.aborted.push(child.id.clone()),
                    _ => {}
                }
                state
            }
        };
        output.files.push(FileOutcome {
            key: file.key.clone(),
            file_type: file.file_type.clone(),
            state,
            task_id: child.map(|child| child.id.clone()),
        });
    }

    output
}

#[async_trait]
impl<R: ModelRegistry + 'static> TaskDefinition for ImportFromUrlController<R> {
    type Input = ControllerInput;
    type Output = ControllerOutput;

    fn id(&self) -> DefinitionId {
        DefinitionId::new(IMPORT_FROM_URL_CONTROLLER)
    }

    async fn run(
        &self,
        ctx: &TaskContext,
        mut input: ControllerInput,
    ) -> Result<ControllerResult, WorkError> {
        if ctx.is_aborted() {
            return Ok(TaskResult::aborted());
        }

        if !input.is_dispatched() {
            let model_id = match self.validate(&input).await? {
                Ok(model_id) => model_id,
                Err(err) => return Ok(TaskResult::error(err)),
            };

            let existing = self.children_by_file(ctx).await?;
            if let Some(stopped) = self.dispatch(ctx, &input, &model_id, &existing).await? {
                return Ok(stopped);
            }

            input
                .steps
                .insert(DOWNLOAD_STEP.to_string(), StepState { triggered: true });
            return Ok(TaskResult::continue_with(input, ContinueOptions::Default));
        }

        let mut children = self.children_by_file(ctx).await?;
        let mut output = reconcile(&input, &children);

        // Children lost between invocations are dispatched again.
        if output.files.iter().any(|file| file.state == SubUnitState::Pending) {
            let model_id = input.model_id.clone().unwrap_or_default();
            if let Some(stopped) = self.dispatch(ctx, &input, &model_id, &children).await? {
                return Ok(stopped);
            }
            children = self.children_by_file(ctx).await?;
            output = reconcile(&input, &children);
        }

        debug!(
            settled = output.settled(),
            total = input.files.len(),
            "Reconciled child tasks"
        );
        if output.settled() < input.files.len() {
            return Ok(TaskResult::continue_with(input, ContinueOptions::Default));
        }

        info!(
            done = output.done.len(),
            failed = output.failed.len(),
            aborted = output.aborted.len(),
            invalid = output.invalid.len(),
            "All child tasks settled"
        );
        Ok(TaskResult::done(None, Some(output)))
    }
}
