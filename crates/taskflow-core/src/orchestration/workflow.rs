use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::{
    CoreError, CoreErrorKind, NewTask, Payload, ProjectId, TaskId, TaskMetadata, TaskRecord,
    TaskStatus, TaskType, WorkerKind,
};
use crate::orchestration::OrchestrationResult;
use crate::orchestration::composer::{
    StageDescriptor, compose, merge_outputs, stage_input, stage_workers,
};
use crate::orchestration::lifecycle::TaskLifecycleController;
use crate::orchestration::supervisor::failure_kind;
use crate::worker::{CostModel, SizeCostModel, Worker, WorkerError};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StageOutcome {
    pub index: usize,
    pub worker: WorkerKind,
    pub task_id: TaskId,
    /// Attempts consumed, including the one that succeeded.
    pub attempts: u32,
    pub output: Payload,
    pub tokens_used: u64,
    pub cost_estimate: f64,
    pub duration_ms: Option<u64>,
}

impl StageOutcome {
    fn from_record(index: usize, record: TaskRecord) -> Self {
        Self {
            index,
            worker: record.worker_kind,
            task_id: record.id,
            attempts: record.metadata.retry_count + 1,
            output: record.output.unwrap_or_default(),
            tokens_used: record.metadata.tokens_used.unwrap_or(0),
            cost_estimate: record.metadata.cost_estimate.unwrap_or(0.0),
            duration_ms: record.metadata.actual_duration_ms,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkflowResult {
    pub root_id: TaskId,
    pub mode: TaskType,
    pub output: Payload,
    pub tokens_used: u64,
    pub cost_estimate: f64,
    pub stages: Vec<StageOutcome>,
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(
        "workflow '{root_id}' stage {stage_index} ({worker}) failed after {attempts} attempt(s): {message}"
    )]
    StageFailed {
        root_id: TaskId,
        stage_index: usize,
        worker: WorkerKind,
        task_id: TaskId,
        attempts: u32,
        /// `Worker` or `Timeout`.
        cause: CoreErrorKind,
        message: String,
        completed: Vec<StageOutcome>,
    },
    #[error("workflow '{root_id}' was cancelled")]
    Cancelled {
        root_id: TaskId,
        reason: Option<String>,
        completed: Vec<StageOutcome>,
    },
    #[error("workflow '{root_id}' ended as '{status}' outside the orchestrator: {message}")]
    Interrupted {
        root_id: TaskId,
        status: &'static str,
        message: String,
        completed: Vec<StageOutcome>,
    },
    #[error("workflow lifecycle error: {source}")]
    Lifecycle {
        root_id: Option<TaskId>,
        #[source]
        source: CoreError,
        completed: Vec<StageOutcome>,
    },
}

impl WorkflowError {
    pub fn root_id(&self) -> Option<TaskId> {
        match self {
            Self::StageFailed { root_id, .. }
            | Self::Cancelled { root_id, .. }
            | Self::Interrupted { root_id, .. } => Some(*root_id),
            Self::Lifecycle { root_id, .. } => *root_id,
        }
    }

    /// Stages that completed before the workflow stopped.
    pub fn completed_stages(&self) -> &[StageOutcome] {
        match self {
            Self::StageFailed { completed, .. }
            | Self::Cancelled { completed, .. }
            | Self::Interrupted { completed, .. }
            | Self::Lifecycle { completed, .. } => completed,
        }
    }

    fn lifecycle(root_id: Option<TaskId>, source: CoreError) -> Self {
        Self::Lifecycle {
            root_id,
            source,
            completed: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Snapshot of a workflow derived from its root and the root's children.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkflowStatus {
    pub root: TaskRecord,
    pub outcome: WorkflowOutcome,
    /// Every stage attempt in creation order, retries included.
    pub stages: Vec<TaskRecord>,
}

pub struct WorkflowHandle {
    root_id: TaskId,
    join: JoinHandle<Result<WorkflowResult, WorkflowError>>,
}

impl WorkflowHandle {
    pub fn root_id(&self) -> TaskId {
        self.root_id
    }

    pub async fn wait(self) -> Result<WorkflowResult, WorkflowError> {
        match self.join.await {
            Ok(result) => result,
            Err(join_error) => Err(WorkflowError::lifecycle(
                Some(self.root_id),
                CoreError::new(
                    CoreErrorKind::Internal,
                    format!("workflow loop did not finish: {join_error}"),
                )
                .for_task(self.root_id),
            )),
        }
    }
}

enum StageStop {
    Failed(TaskRecord),
    Cancelled,
    Lifecycle(CoreError),
}

/// Runs composed workflows: one root task per request and one child task
/// per stage attempt, strictly in stage order.
#[derive(Clone)]
pub struct Orchestrator {
    controller: TaskLifecycleController,
    workers: Arc<HashMap<WorkerKind, Arc<dyn Worker>>>,
    cost_model: Arc<dyn CostModel>,
}

impl Orchestrator {
    pub fn new(
        controller: TaskLifecycleController,
        workers: Vec<Arc<dyn Worker>>,
    ) -> OrchestrationResult<Self> {
        Self::with_cost_model(controller, workers, Arc::new(SizeCostModel::default()))
    }

    pub fn with_cost_model(
        controller: TaskLifecycleController,
        workers: Vec<Arc<dyn Worker>>,
        cost_model: Arc<dyn CostModel>,
    ) -> OrchestrationResult<Self> {
        let mut registry: HashMap<WorkerKind, Arc<dyn Worker>> = HashMap::new();
        for worker in workers {
            let kind = worker.kind();
            if kind == WorkerKind::Orchestrator {
                return Err(CoreError::new(
                    CoreErrorKind::InvalidInput,
                    "workflow roots are run by the orchestrator and cannot take a worker",
                )
                .for_worker(kind));
            }
            if registry.insert(kind, worker).is_some() {
                return Err(CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("worker '{kind}' is already registered"),
                )
                .for_worker(kind));
            }
        }

        Ok(Self {
            controller,
            workers: Arc::new(registry),
            cost_model,
        })
    }

    pub fn controller(&self) -> &TaskLifecycleController {
        &self.controller
    }

    pub fn registered_workers(&self) -> Vec<WorkerKind> {
        WorkerKind::ALL
            .iter()
            .copied()
            .filter(|kind| self.workers.contains_key(kind))
            .collect()
    }

    /// Creates and starts the workflow root, then drives its stages on a
    /// spawned task. The root id is available immediately for cancellation.
    pub async fn launch(
        &self,
        project_id: impl Into<ProjectId>,
        mode: TaskType,
        input: Payload,
    ) -> Result<WorkflowHandle, WorkflowError> {
        let root = self.begin(project_id.into(), mode, input.clone()).await?;
        let root_id = root.id;
        let orchestrator = self.clone();
        let join = tokio::spawn(async move { orchestrator.drive(root, input).await });
        Ok(WorkflowHandle { root_id, join })
    }

    pub async fn run(
        &self,
        project_id: impl Into<ProjectId>,
        mode: TaskType,
        input: Payload,
    ) -> Result<WorkflowResult, WorkflowError> {
        let root = self.begin(project_id.into(), mode, input.clone()).await?;
        self.drive(root, input).await
    }

    pub async fn cancel_workflow(
        &self,
        root_id: TaskId,
        reason: Option<String>,
    ) -> OrchestrationResult<Vec<TaskRecord>> {
        self.controller.cancel_tree(root_id, reason).await
    }

    pub async fn workflow_status(&self, root_id: TaskId) -> OrchestrationResult<WorkflowStatus> {
        let root = self
            .controller
            .get(root_id)
            .await?
            .ok_or_else(|| CoreError::not_found(root_id))?;
        if root.worker_kind != WorkerKind::Orchestrator {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("task '{root_id}' is not a workflow root"),
            )
            .for_task(root_id));
        }
        let stages = self.controller.children(root_id).await?;
        let outcome = match root.status {
            TaskStatus::Pending | TaskStatus::InProgress => WorkflowOutcome::Running,
            TaskStatus::Completed => WorkflowOutcome::Succeeded,
            TaskStatus::Failed => WorkflowOutcome::Failed,
            TaskStatus::Cancelled => WorkflowOutcome::Cancelled,
        };
        Ok(WorkflowStatus {
            root,
            outcome,
            stages,
        })
    }

    async fn begin(
        &self,
        project_id: ProjectId,
        mode: TaskType,
        input: Payload,
    ) -> Result<TaskRecord, WorkflowError> {
        if let Some(missing) = stage_workers(mode)
            .iter()
            .find(|kind| !self.workers.contains_key(*kind))
        {
            return Err(WorkflowError::lifecycle(
                None,
                CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("no worker registered for '{missing}' required by mode '{mode}'"),
                )
                .for_worker(*missing),
            ));
        }

        let config = self.controller.config();
        let metadata = TaskMetadata {
            priority: config.default_priority,
            estimated_duration_ms: Some(self.workflow_budget_ms(mode)),
            ..TaskMetadata::default()
        };
        let root = self
            .controller
            .create(NewTask::new(project_id, mode, WorkerKind::Orchestrator, input).metadata(metadata))
            .await
            .map_err(|error| WorkflowError::lifecycle(None, error))?;

        match self.controller.start(root.id).await {
            Ok(started) => {
                info!(
                    root_id = started.id.0,
                    project_id = %started.project_id,
                    mode = mode.as_str(),
                    "workflow started"
                );
                Ok(started)
            }
            Err(error) => {
                if let Err(cleanup) = self
                    .controller
                    .cancel(root.id, Some("workflow failed to start".to_string()))
                    .await
                {
                    warn!(
                        root_id = root.id.0,
                        error = %cleanup,
                        "failed to cancel workflow root that did not start"
                    );
                }
                Err(WorkflowError::lifecycle(Some(root.id), error))
            }
        }
    }

    /// Upper bound for the root's own timer: every stage attempt may run to
    /// its timeout and wait out a backoff.
    fn workflow_budget_ms(&self, mode: TaskType) -> u64 {
        let config = self.controller.config();
        let per_attempt = (config.task_timeout.as_millis() as u64)
            .saturating_add(config.retry_backoff.as_millis() as u64);
        let attempts = u64::from(config.max_retry_attempts).saturating_add(1);
        per_attempt
            .saturating_mul(attempts)
            .saturating_mul(stage_workers(mode).len() as u64)
    }

    async fn drive(&self, root: TaskRecord, input: Payload) -> Result<WorkflowResult, WorkflowError> {
        let root_id = root.id;
        let mode = root.task_type;
        let mut completed: Vec<StageOutcome> = Vec::new();

        for stage in compose(mode, root.metadata.priority) {
            if let Some(halted) = self.halted_root(root_id).await {
                return Err(halted_error(halted, completed));
            }

            let previous = completed
                .iter()
                .map(|outcome| (outcome.worker, outcome.output.clone()))
                .collect::<Vec<_>>();
            let new_task = NewTask::new(
                root.project_id.clone(),
                mode,
                stage.worker,
                stage_input(&input, &stage, &previous),
            )
            .parent(root_id)
            .metadata(TaskMetadata::with_priority(stage.priority));

            let outcome = match self.controller.create(new_task).await {
                Ok(task) => self.run_stage(&stage, task).await,
                Err(error) => Err(StageStop::Lifecycle(error)),
            };
            match outcome {
                Ok(outcome) => {
                    debug!(
                        root_id = root_id.0,
                        stage = stage.index,
                        worker = stage.worker.as_str(),
                        attempts = outcome.attempts,
                        "workflow stage completed"
                    );
                    completed.push(outcome);
                }
                Err(stop) => return Err(self.stop(root_id, &stage, stop, completed).await),
            }
        }

        self.finish(root_id, mode, completed).await
    }

    async fn run_stage(
        &self,
        stage: &StageDescriptor,
        mut task: TaskRecord,
    ) -> Result<StageOutcome, StageStop> {
        let Some(worker) = self.workers.get(&stage.worker).cloned() else {
            let error = CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("no worker registered for '{}'", stage.worker),
            )
            .for_worker(stage.worker);
            return Err(self.abandon(task.id, error).await);
        };

        loop {
            let started = match self.controller.start(task.id).await {
                Ok(started) => started,
                Err(error) => return Err(self.abandon(task.id, error).await),
            };
            self.dispatch(Arc::clone(&worker), started);

            let settled = self
                .controller
                .wait_for_terminal(task.id)
                .await
                .map_err(StageStop::Lifecycle)?;
            match settled.status {
                TaskStatus::Completed => return Ok(StageOutcome::from_record(stage.index, settled)),
                TaskStatus::Cancelled => return Err(StageStop::Cancelled),
                TaskStatus::Failed => {
                    let Some(ticket) = self.controller.take_pending_retry(settled.id).await else {
                        return Err(StageStop::Failed(settled));
                    };
                    match ticket.wait().await {
                        Ok(Some(next)) => task = next,
                        Ok(None) => return Err(StageStop::Failed(settled)),
                        Err(error) => return Err(StageStop::Lifecycle(error)),
                    }
                }
                TaskStatus::Pending | TaskStatus::InProgress => {
                    return Err(StageStop::Lifecycle(CoreError::new(
                        CoreErrorKind::Internal,
                        format!("task '{}' settled without a terminal status", settled.id),
                    )));
                }
            }
        }
    }

    /// Cancels a stage task that will never be started so it does not linger
    /// in the active registry after the workflow stops.
    async fn abandon(&self, task_id: TaskId, cause: CoreError) -> StageStop {
        let reason = format!("stage abandoned: {}", cause.message);
        match self.controller.cancel(task_id, Some(reason)).await {
            Ok(_) => {}
            Err(error) if error.kind == CoreErrorKind::InvalidTransition => {}
            Err(error) => warn!(
                task_id = task_id.0,
                error = %error,
                "failed to cancel abandoned stage task"
            ),
        }
        StageStop::Lifecycle(cause)
    }

    /// Runs the worker off the orchestration loop. Its result goes through
    /// the controller like any other signal, so a result arriving after a
    /// timeout or cancellation is rejected and dropped.
    fn dispatch(&self, worker: Arc<dyn Worker>, task: TaskRecord) {
        let controller = self.controller.clone();
        let cost_model = Arc::clone(&self.cost_model);
        tokio::spawn(async move {
            let task_id = task.id;
            let kind = task.worker_kind;
            let outcome = match tokio::spawn(worker.execute(task)).await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(WorkerError::new(format!(
                    "worker '{kind}' stopped unexpectedly: {join_error}"
                ))),
            };

            let recorded = match outcome {
                Ok(output) => {
                    let usage = cost_model.estimate(&output);
                    controller
                        .complete(task_id, output, Some(usage.tokens), Some(usage.cost))
                        .await
                        .map(|_| ())
                }
                Err(failure) => controller
                    .fail(task_id, failure.message, failure.stack)
                    .await
                    .map(|_| ()),
            };

            if let Err(error) = recorded {
                match error.kind {
                    CoreErrorKind::InvalidTransition | CoreErrorKind::Cancelled => debug!(
                        task_id = task_id.0,
                        worker = kind.as_str(),
                        error = %error,
                        "discarding late worker result"
                    ),
                    _ => error!(
                        task_id = task_id.0,
                        worker = kind.as_str(),
                        error = %error,
                        "failed to record worker result"
                    ),
                }
            }
        });
    }

    async fn finish(
        &self,
        root_id: TaskId,
        mode: TaskType,
        completed: Vec<StageOutcome>,
    ) -> Result<WorkflowResult, WorkflowError> {
        let outputs = completed
            .iter()
            .map(|outcome| (outcome.worker, outcome.output.clone()))
            .collect::<Vec<_>>();
        let output = merge_outputs(&outputs);
        let tokens_used: u64 = completed.iter().map(|outcome| outcome.tokens_used).sum();
        let cost_estimate: f64 = completed.iter().map(|outcome| outcome.cost_estimate).sum();

        match self
            .controller
            .complete(root_id, output.clone(), Some(tokens_used), Some(cost_estimate))
            .await
        {
            Ok(_) => {
                info!(
                    root_id = root_id.0,
                    mode = mode.as_str(),
                    tokens_used,
                    "workflow completed"
                );
                Ok(WorkflowResult {
                    root_id,
                    mode,
                    output,
                    tokens_used,
                    cost_estimate,
                    stages: completed,
                })
            }
            Err(error) => {
                if let Some(halted) = self.halted_root(root_id).await {
                    return Err(halted_error(halted, completed));
                }
                self.fail_root(root_id, error.to_string()).await;
                Err(WorkflowError::Lifecycle {
                    root_id: Some(root_id),
                    source: error,
                    completed,
                })
            }
        }
    }

    async fn stop(
        &self,
        root_id: TaskId,
        stage: &StageDescriptor,
        stop: StageStop,
        completed: Vec<StageOutcome>,
    ) -> WorkflowError {
        if let Some(halted) = self.halted_root(root_id).await {
            return halted_error(halted, completed);
        }

        match stop {
            StageStop::Failed(task) => {
                let failure = WorkflowError::StageFailed {
                    root_id,
                    stage_index: stage.index,
                    worker: stage.worker,
                    task_id: task.id,
                    attempts: task.metadata.retry_count + 1,
                    cause: failure_kind(&task),
                    message: task
                        .error_message
                        .unwrap_or_else(|| "stage failed".to_string()),
                    completed,
                };
                self.fail_root(root_id, failure.to_string()).await;
                failure
            }
            StageStop::Cancelled => {
                let reason = format!("stage {} ({}) was cancelled", stage.index, stage.worker);
                if let Err(error) = self
                    .controller
                    .cancel_tree(root_id, Some(reason.clone()))
                    .await
                {
                    warn!(root_id = root_id.0, error = %error, "failed to cancel workflow");
                }
                WorkflowError::Cancelled {
                    root_id,
                    reason: Some(reason),
                    completed,
                }
            }
            StageStop::Lifecycle(source) => {
                self.fail_root(root_id, source.to_string()).await;
                WorkflowError::Lifecycle {
                    root_id: Some(root_id),
                    source,
                    completed,
                }
            }
        }
    }

    /// The root record once something other than this loop settled it.
    async fn halted_root(&self, root_id: TaskId) -> Option<TaskRecord> {
        match self.controller.get(root_id).await {
            Ok(Some(root)) if root.status.is_terminal() => Some(root),
            Ok(_) => None,
            Err(error) => {
                warn!(root_id = root_id.0, error = %error, "failed to read workflow root");
                None
            }
        }
    }

    async fn fail_root(&self, root_id: TaskId, message: String) {
        if let Err(error) = self.controller.fail(root_id, message, None).await {
            warn!(root_id = root_id.0, error = %error, "failed to mark workflow root failed");
        }
    }
}

fn halted_error(root: TaskRecord, completed: Vec<StageOutcome>) -> WorkflowError {
    if root.status == TaskStatus::Cancelled {
        WorkflowError::Cancelled {
            root_id: root.id,
            reason: root.error_message,
            completed,
        }
    } else {
        WorkflowError::Interrupted {
            root_id: root.id,
            status: root.status.as_str(),
            message: root.error_message.unwrap_or_default(),
            completed,
        }
    }
}
