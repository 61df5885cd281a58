pub mod in_memory;

pub use in_memory::InMemoryTaskStore;

use crate::models::{
    CoreError, ProjectId, ProjectStats, StatsDelta, TaskId, TaskRecord, TaskStatus, TaskUpdate,
};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Durable home of task records and project counters. Each call is an
/// atomic single-row write or a consistent read.
pub trait TaskStore: Send + Sync {
    fn insert_task(&self, task: &TaskRecord) -> PersistenceResult<TaskRecord>;

    fn update_task(&self, task_id: TaskId, update: &TaskUpdate) -> PersistenceResult<()>;

    fn get_task(&self, task_id: TaskId) -> PersistenceResult<Option<TaskRecord>>;

    /// Most recent first.
    fn list_tasks_by_project(
        &self,
        project_id: &ProjectId,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> PersistenceResult<Vec<TaskRecord>>;

    /// Creation order.
    fn list_tasks_by_parent(&self, parent_id: TaskId) -> PersistenceResult<Vec<TaskRecord>>;

    fn increment_project_stats(
        &self,
        project_id: &ProjectId,
        delta: &StatsDelta,
    ) -> PersistenceResult<()>;

    fn project_stats(&self, project_id: &ProjectId) -> PersistenceResult<ProjectStats>;

    fn next_task_id(&self) -> PersistenceResult<u64>;
}
