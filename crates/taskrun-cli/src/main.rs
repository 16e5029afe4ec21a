//! TaskRun CLI - runs continuation tasks against an in-process dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use taskrun_core::{
    ClusterHealth, CreateTaskParams, HealthSnapshot, InvocationResponse, TaskRecord, TaskStatus,
    TaskUpdate,
};
use taskrun_engine::health::ScriptedHealthSource;
use taskrun_engine::tasks::{InMemoryEntryWriter, MockDataCreator, MOCK_DATA_CREATOR};
use taskrun_engine::{
    BudgetPolicy, ContinueHook, ControllerInput, DispatchError, DispatcherConfig, HealthGate,
    HealthGateConfig, ImportFile, ImportFromUrlController, InMemoryTaskStore, ListTasksParams,
    LocalDispatcher, StaticModelRegistry, TaskStore, IMPORT_FROM_URL_CONTROLLER,
};

/// TaskRun CLI - continuation engine playground
#[derive(Parser)]
#[command(name = "taskrun")]
#[command(about = "Run resumable tasks locally", long_about = None)]
struct Cli {
    /// Upper bound of invocations per task
    #[arg(long, default_value_t = 100)]
    max_iterations: u32,

    /// Print every intermediate response
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create mock entries in health-gated batches
    #[command(name = "mock-data")]
    MockData {
        /// Number of entries to create
        #[arg(short, long, default_value_t = 200)]
        total: u64,

        /// Entries created per invocation before checkpointing
        #[arg(short, long, default_value_t = 75)]
        units_per_invocation: u32,

        /// Number of unhealthy polls before the cluster turns green
        #[arg(long, default_value_t = 0)]
        unhealthy_polls: usize,
    },

    /// Fan an import out into child tasks and wait for them
    #[command(name = "import")]
    Import {
        /// Model the files are imported into
        #[arg(short, long)]
        model_id: Option<String>,

        /// Models known to the registry
        #[arg(long = "known-model")]
        known_models: Vec<String>,

        /// File to import as TYPE:KEY, e.g. entries:file-1.we.zip
        #[arg(short, long = "file", value_parser = parse_file)]
        files: Vec<ImportFile>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let printer = ResponsePrinter {
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::MockData {
            total,
            units_per_invocation,
            unhealthy_polls,
        } => {
            mock_data(
                cli.max_iterations,
                total,
                units_per_invocation,
                unhealthy_polls,
                &printer,
            )
            .await?;
        }
        Commands::Import {
            model_id,
            known_models,
            files,
        } => {
            import(cli.max_iterations, model_id, known_models, files, &printer).await?;
        }
    }

    Ok(())
}

async fn mock_data(
    max_iterations: u32,
    total: u64,
    units_per_invocation: u32,
    unhealthy_polls: usize,
    printer: &ResponsePrinter,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(InMemoryTaskStore::new());
    let writer = Arc::new(InMemoryEntryWriter::new());
    let source = ScriptedHealthSource::new(
        std::iter::repeat(HealthSnapshot::new(ClusterHealth::Red, 95.0, 40.0))
            .take(unhealthy_polls)
            .chain(std::iter::once(HealthSnapshot::green())),
    );
    let gate = HealthGate::new(
        Arc::new(source),
        HealthGateConfig {
            poll_interval_seconds: 1,
            ..HealthGateConfig::default()
        },
    );

    let mut dispatcher = LocalDispatcher::new(
        store.clone(),
        DispatcherConfig {
            max_iterations,
            budget: BudgetPolicy::Checks(units_per_invocation),
        },
    );
    dispatcher.register(MockDataCreator::new(writer.clone(), gate));

    let task = dispatcher
        .trigger(CreateTaskParams::new(
            MOCK_DATA_CREATOR,
            "Mock data creator",
            json!({ "totalAmount": total }),
        ))
        .await?;
    info!(task_id = %task.id, total, "Triggered mock data task");

    let response = dispatcher.run_with_hook(&task.id, printer).await?;
    printer.print(&response)?;

    println!("Entries created: {}", writer.count());
    print_tasks(store.as_ref()).await?;
    Ok(())
}

async fn import(
    max_iterations: u32,
    model_id: Option<String>,
    known_models: Vec<String>,
    files: Vec<ImportFile>,
    printer: &ResponsePrinter,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(InMemoryTaskStore::new());
    let mut dispatcher = LocalDispatcher::new(
        store.clone(),
        DispatcherConfig {
            max_iterations,
            ..DispatcherConfig::default()
        },
    );
    dispatcher.register(ImportFromUrlController::new(StaticModelRegistry::new(
        known_models,
    )));

    let input = ControllerInput {
        model_id,
        files,
        ..ControllerInput::default()
    };
    let task = dispatcher
        .trigger(CreateTaskParams::new(
            IMPORT_FROM_URL_CONTROLLER,
            "Import from URL Controller",
            serde_json::to_value(input)?,
        ))
        .await?;
    info!(task_id = %task.id, "Triggered import task");

    let hook = CompleteChildren { printer };
    let response = dispatcher.run_with_hook(&task.id, &hook).await?;
    printer.print(&response)?;

    print_tasks(store.as_ref()).await?;
    Ok(())
}

/// Prints intermediate responses when verbose.
struct ResponsePrinter {
    verbose: bool,
}

impl ResponsePrinter {
    fn print(&self, response: &InvocationResponse) -> Result<(), serde_json::Error> {
        println!("{}", serde_json::to_string_pretty(response)?);
        Ok(())
    }
}

#[async_trait]
impl ContinueHook for ResponsePrinter {
    async fn on_continue(
        &self,
        _dispatcher: &LocalDispatcher,
        response: &InvocationResponse,
        iteration: u32,
    ) -> Result<(), DispatchError> {
        if self.verbose {
            println!("Iteration {}:", iteration);
            if let Err(e) = self.print(response) {
                eprintln!("Failed to print response: {}", e);
            }
        }
        Ok(())
    }
}

/// Stands in for the child workers: marks every pending child SUCCESS.
struct CompleteChildren<'a> {
    printer: &'a ResponsePrinter,
}

#[async_trait]
impl ContinueHook for CompleteChildren<'_> {
    async fn on_continue(
        &self,
        dispatcher: &LocalDispatcher,
        response: &InvocationResponse,
        iteration: u32,
    ) -> Result<(), DispatchError> {
        self.printer
            .on_continue(dispatcher, response, iteration)
            .await?;

        let mut offset = 0;
        loop {
            let params = ListTasksParams::children_of(response.task_id.clone(), 1000)
                .with_offset(offset);
            let page = dispatcher.store().list_tasks(params).await?.items;
            if page.is_empty() {
                return Ok(());
            }
            offset += page.len();
            for child in page.iter().filter(|child| !child.is_terminal()) {
                dispatcher
                    .store()
                    .update_task(&child.id, TaskUpdate::status(TaskStatus::Success))
                    .await?;
            }
        }
    }
}

fn parse_file(value: &str) -> Result<ImportFile, String> {
    let (file_type, key) = value
        .split_once(':')
        .ok_or_else(|| format!("expected TYPE:KEY, got '{}'", value))?;
    if key.is_empty() {
        return Err(format!("missing file key in '{}'", value));
    }
    Ok(ImportFile::new(key, file_type))
}

async fn print_tasks(store: &dyn TaskStore) -> Result<(), Box<dyn std::error::Error>> {
    let tasks = store.list_tasks(ListTasksParams::default()).await?.items;

    println!("Tasks ({}):", tasks.len());
    println!(
        "{:<32}  {:<10}  {:<28}  {:<5}  {}",
        "ID", "STATUS", "DEFINITION", "ITER", "CREATED"
    );
    println!("{}", "-".repeat(100));

    for task in &tasks {
        print_task(task);
    }

    Ok(())
}

fn print_task(task: &TaskRecord) {
    println!(
        "{:<32}  {:<10}  {:<28}  {:<5}  {}",
        task.id,
        status_name(task.status),
        task.definition_id,
        task.iterations,
        task.created_at.format("%Y-%m-%d %H:%M:%S")
    );
}

fn status_name(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "PENDING",
        TaskStatus::Running => "RUNNING",
        TaskStatus::Success => "SUCCESS",
        TaskStatus::Failure => "FAILURE",
        TaskStatus::Aborted => "ABORTED",
    }
}
