use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use taskflow_core::config::EngineConfig;
use taskflow_core::models::{
    CoreError, CoreErrorKind, Payload, ProjectId, ProjectStats, StatsDelta, TaskId, TaskRecord,
    TaskStatus, TaskType, TaskUpdate, WorkerKind,
};
use taskflow_core::orchestration::{
    Orchestrator, TIMEOUT_MESSAGE, TaskLifecycleController, WorkflowError, WorkflowOutcome,
};
use taskflow_core::persistence::{InMemoryTaskStore, PersistenceResult, TaskStore};
use taskflow_core::worker::{FnWorker, Worker, WorkerError};
use tokio::sync::Notify;

fn config() -> EngineConfig {
    EngineConfig {
        task_timeout: Duration::from_secs(30),
        retry_backoff: Duration::from_millis(100),
        ..EngineConfig::default()
    }
}

async fn controller(config: EngineConfig) -> TaskLifecycleController {
    let controller = TaskLifecycleController::new(Arc::new(InMemoryTaskStore::new()), config);
    controller.init().await.unwrap();
    controller
}

fn echo(kind: WorkerKind) -> Arc<dyn Worker> {
    Arc::new(FnWorker::new(kind, move |task: TaskRecord| async move {
        Ok::<_, WorkerError>(Payload::new(json!({
            "worker": kind.as_str(),
            "input": task.input.into_value(),
        })))
    }))
}

fn failing(kind: WorkerKind, calls: Arc<AtomicUsize>) -> Arc<dyn Worker> {
    Arc::new(FnWorker::new(kind, move |_task: TaskRecord| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<Payload, _>(
                WorkerError::new(format!("{kind} exploded")).with_stack("worker.rs:1"),
            )
        }
    }))
}

fn gated(kind: WorkerKind, gate: Arc<Notify>, entered: Arc<Notify>) -> Arc<dyn Worker> {
    Arc::new(FnWorker::new(kind, move |_task: TaskRecord| {
        let gate = gate.clone();
        let entered = entered.clone();
        async move {
            entered.notify_one();
            gate.notified().await;
            Ok::<_, WorkerError>(Payload::new(json!("late")))
        }
    }))
}

fn by_worker(stages: &[TaskRecord], kind: WorkerKind) -> Vec<&TaskRecord> {
    stages.iter().filter(|task| task.worker_kind == kind).collect()
}

#[tokio::test(start_paused = true)]
async fn scan_workflow_completes_single_stage() {
    let controller = controller(config()).await;
    let orchestrator = Orchestrator::new(
        controller.clone(),
        vec![
            echo(WorkerKind::Scanner),
            echo(WorkerKind::Improver),
            echo(WorkerKind::Generator),
        ],
    )
    .unwrap();

    let input = Payload::new(json!({"repo": "demo"}));
    let result = orchestrator
        .run("proj", TaskType::Scan, input.clone())
        .await
        .unwrap();

    assert_eq!(result.mode, TaskType::Scan);
    assert_eq!(result.stages.len(), 1);
    let stage = &result.stages[0];
    assert_eq!(stage.worker, WorkerKind::Scanner);
    assert_eq!(stage.attempts, 1);
    assert!(stage.tokens_used > 0);
    assert_eq!(
        result.output.as_value(),
        &json!({"worker": "scanner", "input": {"repo": "demo"}})
    );
    assert_eq!(result.tokens_used, stage.tokens_used);

    let root = controller.get(result.root_id).await.unwrap().unwrap();
    assert_eq!(root.status, TaskStatus::Completed);
    assert_eq!(root.worker_kind, WorkerKind::Orchestrator);
    assert_eq!(root.input, input);
    assert_eq!(root.output, Some(result.output.clone()));
    assert_eq!(root.metadata.tokens_used, Some(stage.tokens_used));

    let status = orchestrator.workflow_status(result.root_id).await.unwrap();
    assert_eq!(status.outcome, WorkflowOutcome::Succeeded);
    assert_eq!(status.stages.len(), 1);
    assert_eq!(status.stages[0].status, TaskStatus::Completed);
    assert_eq!(status.stages[0].parent_id, Some(result.root_id));

    // The root counts as a task but its tokens are already in the stage.
    let stats = controller.project_stats(ProjectId::new("proj")).await.unwrap();
    assert_eq!(stats.total_tasks, 2);
    assert_eq!(stats.successful_tasks, 2);
    assert_eq!(stats.total_tokens_used, stage.tokens_used);
}

#[tokio::test(start_paused = true)]
async fn later_stages_receive_earlier_outputs() {
    let controller = controller(config()).await;
    let orchestrator = Orchestrator::new(
        controller.clone(),
        vec![echo(WorkerKind::Scanner), echo(WorkerKind::Improver)],
    )
    .unwrap();

    let result = orchestrator
        .run("proj", TaskType::Enhance, Payload::new(json!("req")))
        .await
        .unwrap();

    let improver_input = json!({
        "request": "req",
        "previous": {"scanner": {"worker": "scanner", "input": "req"}},
    });
    assert_eq!(
        result.output.as_value(),
        &json!({
            "scanner": {"worker": "scanner", "input": "req"},
            "improver": {"worker": "improver", "input": improver_input},
        })
    );
    assert_eq!(
        result.tokens_used,
        result.stages.iter().map(|stage| stage.tokens_used).sum::<u64>()
    );
}

#[tokio::test(start_paused = true)]
async fn exhausted_stage_retries_fail_the_workflow() {
    let controller = controller(config()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let orchestrator = Orchestrator::new(
        controller.clone(),
        vec![
            echo(WorkerKind::Scanner),
            failing(WorkerKind::Improver, calls.clone()),
        ],
    )
    .unwrap();

    let error = orchestrator
        .run("proj", TaskType::Enhance, Payload::new(json!({})))
        .await
        .unwrap_err();

    let root_id = match &error {
        WorkflowError::StageFailed {
            root_id,
            stage_index,
            worker,
            attempts,
            cause,
            message,
            completed,
            ..
        } => {
            assert_eq!(*stage_index, 1);
            assert_eq!(*worker, WorkerKind::Improver);
            assert_eq!(*attempts, 3);
            assert_eq!(*cause, CoreErrorKind::Worker);
            assert_eq!(message, "improver exploded");
            assert_eq!(completed.len(), 1);
            assert_eq!(completed[0].worker, WorkerKind::Scanner);
            *root_id
        }
        other => panic!("expected stage failure, got {other:?}"),
    };
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let status = orchestrator.workflow_status(root_id).await.unwrap();
    assert_eq!(status.outcome, WorkflowOutcome::Failed);
    assert_eq!(status.root.status, TaskStatus::Failed);
    assert!(
        status
            .root
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("improver exploded")
    );

    let improvers = by_worker(&status.stages, WorkerKind::Improver);
    assert_eq!(improvers.len(), 3);
    assert_eq!(
        improvers
            .iter()
            .map(|task| task.metadata.retry_count)
            .collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(improvers.iter().all(|task| task.status == TaskStatus::Failed));
    assert!(controller.pending_retries().await.is_empty());
    assert!(controller.list_active().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelling_mid_stage_stops_the_workflow() {
    let controller = controller(config()).await;
    let gate = Arc::new(Notify::new());
    let entered = Arc::new(Notify::new());
    let orchestrator = Orchestrator::new(
        controller.clone(),
        vec![
            echo(WorkerKind::Scanner),
            gated(WorkerKind::Improver, gate.clone(), entered.clone()),
            echo(WorkerKind::Generator),
        ],
    )
    .unwrap();

    let handle = orchestrator
        .launch("proj", TaskType::Full, Payload::new(json!({})))
        .await
        .unwrap();
    let root_id = handle.root_id();
    entered.notified().await;

    let cancelled = orchestrator
        .cancel_workflow(root_id, Some("user abort".to_string()))
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 2);

    let error = handle.wait().await.unwrap_err();
    assert!(matches!(error, WorkflowError::Cancelled { .. }));
    assert_eq!(error.root_id(), Some(root_id));
    assert_eq!(error.completed_stages().len(), 1);

    // The improver finishes after cancellation; its result must be dropped.
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let status = orchestrator.workflow_status(root_id).await.unwrap();
    assert_eq!(status.outcome, WorkflowOutcome::Cancelled);
    assert_eq!(status.stages.len(), 2);
    assert_eq!(status.stages[0].status, TaskStatus::Completed);
    assert_eq!(status.stages[1].worker_kind, WorkerKind::Improver);
    assert_eq!(status.stages[1].status, TaskStatus::Cancelled);
    assert_eq!(status.stages[1].output, None);
    assert!(by_worker(&status.stages, WorkerKind::Generator).is_empty());
}

#[tokio::test(start_paused = true)]
async fn stalled_worker_times_out_inside_a_workflow() {
    let controller = controller(EngineConfig {
        task_timeout: Duration::from_millis(200),
        max_retry_attempts: 0,
        ..config()
    })
    .await;
    let stalled: Arc<dyn Worker> = Arc::new(FnWorker::new(
        WorkerKind::Generator,
        |_task: TaskRecord| async {
            std::future::pending::<()>().await;
            Ok::<_, WorkerError>(Payload::empty())
        },
    ));
    let orchestrator = Orchestrator::new(controller.clone(), vec![stalled]).unwrap();

    let error = orchestrator
        .run("proj", TaskType::AddModules, Payload::empty())
        .await
        .unwrap_err();
    match error {
        WorkflowError::StageFailed {
            worker,
            attempts,
            cause,
            message,
            ..
        } => {
            assert_eq!(worker, WorkerKind::Generator);
            assert_eq!(attempts, 1);
            assert_eq!(cause, CoreErrorKind::Timeout);
            assert_eq!(message, TIMEOUT_MESSAGE);
        }
        other => panic!("expected stage failure, got {other:?}"),
    }
}

#[tokio::test]
async fn worker_registry_rejects_duplicates_and_root_workers() {
    let controller = controller(config()).await;

    let error = match Orchestrator::new(
        controller.clone(),
        vec![echo(WorkerKind::Scanner), echo(WorkerKind::Scanner)],
    ) {
        Ok(_) => panic!("duplicate worker should be rejected"),
        Err(error) => error,
    };
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
    assert_eq!(error.worker, Some(WorkerKind::Scanner));

    assert!(Orchestrator::new(controller.clone(), vec![echo(WorkerKind::Orchestrator)]).is_err());

    let orchestrator =
        Orchestrator::new(controller.clone(), vec![echo(WorkerKind::Improver)]).unwrap();
    assert_eq!(orchestrator.registered_workers(), vec![WorkerKind::Improver]);
}

#[tokio::test]
async fn missing_worker_is_reported_before_any_task_is_created() {
    let controller = controller(config()).await;
    let orchestrator =
        Orchestrator::new(controller.clone(), vec![echo(WorkerKind::Scanner)]).unwrap();

    let error = orchestrator
        .run("proj", TaskType::Full, Payload::empty())
        .await
        .unwrap_err();
    match error {
        WorkflowError::Lifecycle {
            root_id, source, ..
        } => {
            assert_eq!(root_id, None);
            assert_eq!(source.kind, CoreErrorKind::InvalidInput);
            assert_eq!(source.worker, Some(WorkerKind::Improver));
        }
        other => panic!("expected lifecycle error, got {other:?}"),
    }
    assert!(
        controller
            .tasks_for_project(ProjectId::new("proj"), None, 10)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn status_of_a_stage_task_is_rejected() {
    let controller = controller(config()).await;
    let orchestrator =
        Orchestrator::new(controller.clone(), vec![echo(WorkerKind::Scanner)]).unwrap();
    let result = orchestrator
        .run("proj", TaskType::Scan, Payload::empty())
        .await
        .unwrap();

    let error = orchestrator
        .workflow_status(result.stages[0].task_id)
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
}

/// In-memory store whose `nth` update (1-based) fails as if the disk were full.
struct FailingUpdateStore {
    inner: InMemoryTaskStore,
    updates: AtomicUsize,
    nth: usize,
}

impl FailingUpdateStore {
    fn new(nth: usize) -> Self {
        Self {
            inner: InMemoryTaskStore::new(),
            updates: AtomicUsize::new(0),
            nth,
        }
    }
}

impl TaskStore for FailingUpdateStore {
    fn insert_task(&self, task: &TaskRecord) -> PersistenceResult<TaskRecord> {
        self.inner.insert_task(task)
    }

    fn update_task(&self, task_id: TaskId, update: &TaskUpdate) -> PersistenceResult<()> {
        if self.updates.fetch_add(1, Ordering::SeqCst) + 1 == self.nth {
            return Err(CoreError::new(CoreErrorKind::Persistence, "disk full"));
        }
        self.inner.update_task(task_id, update)
    }

    fn get_task(&self, task_id: TaskId) -> PersistenceResult<Option<TaskRecord>> {
        self.inner.get_task(task_id)
    }

    fn list_tasks_by_project(
        &self,
        project_id: &ProjectId,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> PersistenceResult<Vec<TaskRecord>> {
        self.inner.list_tasks_by_project(project_id, status, limit)
    }

    fn list_tasks_by_parent(&self, parent_id: TaskId) -> PersistenceResult<Vec<TaskRecord>> {
        self.inner.list_tasks_by_parent(parent_id)
    }

    fn increment_project_stats(
        &self,
        project_id: &ProjectId,
        delta: &StatsDelta,
    ) -> PersistenceResult<()> {
        self.inner.increment_project_stats(project_id, delta)
    }

    fn project_stats(&self, project_id: &ProjectId) -> PersistenceResult<ProjectStats> {
        self.inner.project_stats(project_id)
    }

    fn next_task_id(&self) -> PersistenceResult<u64> {
        self.inner.next_task_id()
    }
}

#[tokio::test(start_paused = true)]
async fn stage_that_cannot_start_is_cancelled_with_its_workflow() {
    // Update 1 starts the root; update 2 would start the scanner stage.
    let controller =
        TaskLifecycleController::new(Arc::new(FailingUpdateStore::new(2)), config());
    controller.init().await.unwrap();
    let orchestrator =
        Orchestrator::new(controller.clone(), vec![echo(WorkerKind::Scanner)]).unwrap();

    let error = orchestrator
        .run("proj", TaskType::Scan, Payload::empty())
        .await
        .unwrap_err();
    let root_id = match &error {
        WorkflowError::Lifecycle {
            root_id: Some(root_id),
            source,
            completed,
        } => {
            assert_eq!(source.kind, CoreErrorKind::Persistence);
            assert!(completed.is_empty());
            *root_id
        }
        other => panic!("expected lifecycle failure, got {other:?}"),
    };

    assert!(controller.list_active().await.is_empty());
    let status = orchestrator.workflow_status(root_id).await.unwrap();
    assert_eq!(status.outcome, WorkflowOutcome::Failed);
    assert_eq!(status.stages.len(), 1);
    assert_eq!(status.stages[0].worker_kind, WorkerKind::Scanner);
    assert_eq!(status.stages[0].status, TaskStatus::Cancelled);
    assert!(status.stages[0].started_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn root_that_cannot_start_is_cancelled() {
    let controller =
        TaskLifecycleController::new(Arc::new(FailingUpdateStore::new(1)), config());
    controller.init().await.unwrap();
    let orchestrator =
        Orchestrator::new(controller.clone(), vec![echo(WorkerKind::Scanner)]).unwrap();

    let error = orchestrator
        .run("proj", TaskType::Scan, Payload::empty())
        .await
        .unwrap_err();
    let Some(root_id) = error.root_id() else {
        panic!("expected a root id, got {error:?}");
    };
    assert!(matches!(error, WorkflowError::Lifecycle { .. }));

    assert!(controller.list_active().await.is_empty());
    let status = orchestrator.workflow_status(root_id).await.unwrap();
    assert_eq!(status.outcome, WorkflowOutcome::Cancelled);
    assert!(status.stages.is_empty());
}
