use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use taskflow_core::config::EngineConfig;
use taskflow_core::models::{
    CoreErrorKind, NewTask, Payload, ProjectId, StatsDelta, TaskId, TaskMetadata, TaskRecord,
    TaskStatus, TaskType, TaskUpdate, WorkerKind,
};
use taskflow_core::orchestration::TaskLifecycleController;
use taskflow_core::persistence::TaskStore;
use taskflow_core::sqlite::SqliteStore;

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("taskflow-{test_name}-{nanos}.sqlite3"))
}

fn migrated_store(test_name: &str) -> (PathBuf, SqliteStore) {
    let path = test_db_path(test_name);
    let store = SqliteStore::new(&path);
    store.migrate_to_latest().unwrap();
    (path, store)
}

fn record(id: u64, project: &str, parent_id: Option<u64>, created_ms: u64) -> TaskRecord {
    TaskRecord {
        id: TaskId(id),
        project_id: ProjectId::new(project),
        task_type: TaskType::Enhance,
        worker_kind: WorkerKind::Improver,
        status: TaskStatus::Pending,
        parent_id: parent_id.map(TaskId),
        input: Payload::new(json!({"files": ["a.rs", "b.rs"]})),
        output: None,
        metadata: TaskMetadata {
            priority: 3,
            retry_count: 1,
            estimated_duration_ms: Some(2_000),
            ..TaskMetadata::default()
        },
        created_at: UNIX_EPOCH + Duration::from_millis(created_ms),
        started_at: None,
        completed_at: None,
        error_message: None,
    }
}

#[test]
fn task_records_round_trip_through_sqlite() {
    let (path, store) = migrated_store("round-trip");
    let original = record(4, "proj", Some(1), 1_700_000_000_123);

    store.insert_task(&original).unwrap();
    assert_eq!(store.get_task(TaskId(4)).unwrap(), Some(original.clone()));
    assert_eq!(store.row_version(TaskId(4)).unwrap(), Some(1));

    let started_at = UNIX_EPOCH + Duration::from_millis(1_700_000_000_500);
    let completed_at = UNIX_EPOCH + Duration::from_millis(1_700_000_000_900);
    store
        .update_task(
            TaskId(4),
            &TaskUpdate {
                status: Some(TaskStatus::InProgress),
                started_at: Some(started_at),
                ..TaskUpdate::default()
            },
        )
        .unwrap();
    store
        .update_task(
            TaskId(4),
            &TaskUpdate {
                status: Some(TaskStatus::Completed),
                output: Some(Payload::new(json!({"patched": 2}))),
                completed_at: Some(completed_at),
                actual_duration_ms: Some(400),
                tokens_used: Some(12),
                cost_estimate: Some(0.25),
                ..TaskUpdate::default()
            },
        )
        .unwrap();

    let stored = store.get_task(TaskId(4)).unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.started_at, Some(started_at));
    assert_eq!(stored.completed_at, Some(completed_at));
    assert_eq!(stored.output, Some(Payload::new(json!({"patched": 2}))));
    assert_eq!(stored.metadata.actual_duration_ms, Some(400));
    assert_eq!(stored.metadata.tokens_used, Some(12));
    assert_eq!(stored.metadata.cost_estimate, Some(0.25));
    assert_eq!(stored.metadata.retry_count, 1);
    assert_eq!(stored.input, original.input);
    assert_eq!(store.row_version(TaskId(4)).unwrap(), Some(3));

    let _ = std::fs::remove_file(path);
}

#[test]
fn updating_an_unknown_task_is_a_persistence_error() {
    let (path, store) = migrated_store("unknown-update");
    let error = store
        .update_task(
            TaskId(99),
            &TaskUpdate {
                status: Some(TaskStatus::Cancelled),
                ..TaskUpdate::default()
            },
        )
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Persistence);

    let _ = std::fs::remove_file(path);
}

#[test]
fn duplicate_task_ids_are_rejected() {
    let (path, store) = migrated_store("duplicate-insert");
    store.insert_task(&record(1, "proj", None, 10)).unwrap();
    let error = store.insert_task(&record(1, "proj", None, 20)).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Persistence);

    let _ = std::fs::remove_file(path);
}

#[test]
fn project_listing_is_newest_first_and_filters_by_status() {
    let (path, store) = migrated_store("project-listing");
    store.insert_task(&record(1, "proj", None, 100)).unwrap();
    store.insert_task(&record(2, "proj", None, 300)).unwrap();
    store.insert_task(&record(3, "proj", None, 200)).unwrap();
    store.insert_task(&record(4, "other", None, 400)).unwrap();
    store
        .update_task(
            TaskId(3),
            &TaskUpdate {
                status: Some(TaskStatus::Cancelled),
                ..TaskUpdate::default()
            },
        )
        .unwrap();

    let project = ProjectId::new("proj");
    let ids = |tasks: Vec<TaskRecord>| tasks.into_iter().map(|task| task.id.0).collect::<Vec<_>>();

    assert_eq!(
        ids(store.list_tasks_by_project(&project, None, 10).unwrap()),
        vec![2, 3, 1]
    );
    assert_eq!(
        ids(store.list_tasks_by_project(&project, None, 2).unwrap()),
        vec![2, 3]
    );
    assert_eq!(
        ids(store
            .list_tasks_by_project(&project, Some(TaskStatus::Pending), 10)
            .unwrap()),
        vec![2, 1]
    );
    assert!(store.list_tasks_by_project(&project, None, 0).unwrap().is_empty());

    let _ = std::fs::remove_file(path);
}

#[test]
fn children_are_listed_in_creation_order() {
    let (path, store) = migrated_store("children");
    store.insert_task(&record(1, "proj", None, 100)).unwrap();
    store.insert_task(&record(3, "proj", Some(1), 300)).unwrap();
    store.insert_task(&record(2, "proj", Some(1), 200)).unwrap();
    store.insert_task(&record(4, "proj", Some(2), 400)).unwrap();

    let children = store.list_tasks_by_parent(TaskId(1)).unwrap();
    assert_eq!(
        children.iter().map(|task| task.id.0).collect::<Vec<_>>(),
        vec![2, 3]
    );
    assert_eq!(store.next_task_id().unwrap(), 5);

    let _ = std::fs::remove_file(path);
}

#[test]
fn project_stats_accumulate_across_connections() {
    let (path, store) = migrated_store("stats");
    let project = ProjectId::new("proj");
    assert_eq!(store.project_stats(&project).unwrap().total_tasks, 0);

    store
        .increment_project_stats(
            &project,
            &StatsDelta {
                tokens: 100,
                cost: 0.5,
                duration_ms: Some(200),
                succeeded: true,
            },
        )
        .unwrap();
    store
        .increment_project_stats(
            &project,
            &StatsDelta {
                tokens: 50,
                cost: 0.25,
                duration_ms: Some(400),
                succeeded: true,
            },
        )
        .unwrap();
    store
        .increment_project_stats(&project, &StatsDelta::default())
        .unwrap();

    let reopened = SqliteStore::new(&path);
    let stats = reopened.project_stats(&project).unwrap();
    assert_eq!(stats.total_tasks, 3);
    assert_eq!(stats.successful_tasks, 2);
    assert_eq!(stats.total_tokens_used, 150);
    assert!((stats.total_cost - 0.75).abs() < 1e-9);
    assert!((stats.avg_completion_time_ms - 300.0).abs() < 1e-9);

    let _ = std::fs::remove_file(path);
}

#[test]
fn operations_fail_before_migrations_are_applied() {
    let path = test_db_path("unmigrated");
    let store = SqliteStore::new(&path);
    let error = store.get_task(TaskId(1)).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Persistence);

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn controller_persists_every_transition_and_resumes_ids() {
    let (path, store) = migrated_store("controller");
    let store = Arc::new(store);

    let controller = TaskLifecycleController::new(store.clone(), EngineConfig::default());
    controller.init().await.unwrap();
    let task = controller
        .create(NewTask::new(
            "proj",
            TaskType::Scan,
            WorkerKind::Scanner,
            Payload::new(json!({"path": "."})),
        ))
        .await
        .unwrap();
    controller.start(task.id).await.unwrap();
    controller
        .complete(task.id, Payload::new(json!({"issues": 0})), Some(8), Some(0.01))
        .await
        .unwrap();

    let stored = store.get_task(task.id).unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.metadata.tokens_used, Some(8));
    assert_eq!(store.row_version(task.id).unwrap(), Some(3));
    assert_eq!(
        store.project_stats(&ProjectId::new("proj")).unwrap().successful_tasks,
        1
    );
    controller.shutdown().await;

    let restarted = TaskLifecycleController::new(store.clone(), EngineConfig::default());
    restarted.init().await.unwrap();
    let next = restarted
        .create(NewTask::new(
            "proj",
            TaskType::Scan,
            WorkerKind::Scanner,
            Payload::empty(),
        ))
        .await
        .unwrap();
    assert!(next.id > task.id);
    assert_eq!(
        restarted.get(task.id).await.unwrap().map(|task| task.status),
        Some(TaskStatus::Completed)
    );

    let _ = std::fs::remove_file(path);
}
