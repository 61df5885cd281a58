use std::process::ExitCode;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use taskflow_core::config::EngineConfig;
use taskflow_core::logging::init_tracing;
use taskflow_core::models::{CoreError, Payload, ProjectId, TaskRecord, TaskType, WorkerKind};
use taskflow_core::orchestration::{
    Orchestrator, TaskLifecycleController, WorkflowError, WorkflowResult,
};
use taskflow_core::sqlite::SqliteStore;
use taskflow_core::worker::{FnWorker, Worker, WorkerError};
use thiserror::Error;

const USAGE: &str = "usage:
  taskflow run <db> <project> <mode> [json]
  taskflow tasks <db> <project> [limit]
  taskflow stats <db> <project>

modes: scan, enhance, add_modules, full";

const DEFAULT_LIST_LIMIT: usize = 20;

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to create tokio runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

#[derive(Debug, PartialEq)]
enum Command {
    Run {
        db: String,
        project: String,
        mode: TaskType,
        input: Option<String>,
    },
    Tasks {
        db: String,
        project: String,
        limit: usize,
    },
    Stats {
        db: String,
        project: String,
    },
}

#[derive(Serialize)]
struct TaskSummary<'a> {
    id: u64,
    parent_id: Option<u64>,
    task_type: &'a str,
    worker: &'a str,
    status: &'a str,
    retry_count: u32,
    error_message: Option<&'a str>,
}

impl<'a> From<&'a TaskRecord> for TaskSummary<'a> {
    fn from(task: &'a TaskRecord) -> Self {
        Self {
            id: task.id.0,
            parent_id: task.parent_id.map(|parent| parent.0),
            task_type: task.task_type.as_str(),
            worker: task.worker_kind.as_str(),
            status: task.status.as_str(),
            retry_count: task.metadata.retry_count,
            error_message: task.error_message.as_deref(),
        }
    }
}

fn main() -> ExitCode {
    init_tracing("warn");

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let result = parse_args(&args).and_then(|command| {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(execute(command))
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("taskflow: {error}");
            if matches!(error, CliError::Usage(_)) {
                eprintln!("\n{USAGE}");
            }
            ExitCode::FAILURE
        }
    }
}

fn parse_args(args: &[String]) -> Result<Command, CliError> {
    let Some((name, rest)) = args.split_first() else {
        return Err(CliError::Usage("missing command".to_string()));
    };

    match (name.as_str(), rest) {
        ("run", [db, project, mode]) | ("run", [db, project, mode, _]) => Ok(Command::Run {
            db: db.clone(),
            project: project.clone(),
            mode: mode
                .parse()
                .map_err(|_| CliError::Usage(format!("unknown mode '{mode}'")))?,
            input: rest.get(3).cloned(),
        }),
        ("tasks", [db, project]) => Ok(Command::Tasks {
            db: db.clone(),
            project: project.clone(),
            limit: DEFAULT_LIST_LIMIT,
        }),
        ("tasks", [db, project, limit]) => Ok(Command::Tasks {
            db: db.clone(),
            project: project.clone(),
            limit: limit
                .parse()
                .map_err(|_| CliError::Usage(format!("invalid limit '{limit}'")))?,
        }),
        ("stats", [db, project]) => Ok(Command::Stats {
            db: db.clone(),
            project: project.clone(),
        }),
        ("run" | "tasks" | "stats", _) => {
            Err(CliError::Usage(format!("wrong arguments for '{name}'")))
        }
        _ => Err(CliError::Usage(format!("unknown command '{name}'"))),
    }
}

async fn execute(command: Command) -> Result<(), CliError> {
    let db = match &command {
        Command::Run { db, .. } | Command::Tasks { db, .. } | Command::Stats { db, .. } => db,
    };
    let store = Arc::new(SqliteStore::new(db));
    store.migrate_to_latest()?;

    let controller = TaskLifecycleController::new(store, EngineConfig::from_env()?);
    controller.init().await?;

    let outcome = match command {
        Command::Run {
            project,
            mode,
            input,
            ..
        } => match run_workflow(&controller, project, mode, input).await {
            Ok(result) => print_json(&result),
            Err(CliError::Workflow(error)) => print_json(&json!({
                "root_id": error.root_id(),
                "error": error.to_string(),
                "completed": error.completed_stages(),
            }))
            .and(Err(error.into())),
            Err(error) => Err(error),
        },
        Command::Tasks { project, limit, .. } => {
            let tasks = controller
                .tasks_for_project(ProjectId::new(project), None, limit)
                .await?;
            print_json(&tasks.iter().map(TaskSummary::from).collect::<Vec<_>>())
        }
        Command::Stats { project, .. } => {
            let stats = controller.project_stats(ProjectId::new(project)).await?;
            print_json(&stats)
        }
    };

    controller.shutdown().await;
    outcome
}

async fn run_workflow(
    controller: &TaskLifecycleController,
    project: String,
    mode: TaskType,
    input: Option<String>,
) -> Result<WorkflowResult, CliError> {
    let input = match input {
        Some(raw) => Payload::from_json(&raw)?,
        None => Payload::empty(),
    };

    let orchestrator = Orchestrator::new(
        controller.clone(),
        vec![
            echo_worker(WorkerKind::Scanner),
            echo_worker(WorkerKind::Improver),
            echo_worker(WorkerKind::Generator),
        ],
    )?;

    orchestrator
        .run(ProjectId::from(project), mode, input)
        .await
        .map_err(|error| {
            tracing::error!(root_id = ?error.root_id(), "workflow failed: {error}");
            CliError::Workflow(error)
        })
}

/// Reports which stage ran and what it was handed.
fn echo_worker(kind: WorkerKind) -> Arc<dyn Worker> {
    Arc::new(FnWorker::new(kind, move |task: TaskRecord| async move {
        Ok::<_, WorkerError>(Payload::new(json!({
            "worker": kind.as_str(),
            "task_id": task.id,
            "received": task.input,
        })))
    }))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
