use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::models::{
    CoreError, CoreErrorKind, ProjectId, ProjectStats, StatsDelta, TaskId, TaskRecord, TaskStatus,
    TaskUpdate,
};
use crate::persistence::{PersistenceResult, TaskStore};

#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    tasks: BTreeMap<TaskId, TaskRecord>,
    stats: HashMap<ProjectId, ProjectStats>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> PersistenceResult<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| {
            CoreError::new(CoreErrorKind::Persistence, "in-memory task store mutex poisoned")
        })
    }
}

impl TaskStore for InMemoryTaskStore {
    fn insert_task(&self, task: &TaskRecord) -> PersistenceResult<TaskRecord> {
        let mut state = self.lock_state()?;
        if state.tasks.contains_key(&task.id) {
            return Err(CoreError::new(
                CoreErrorKind::Persistence,
                format!("task id '{}' already exists", task.id),
            )
            .for_task(task.id));
        }
        state.tasks.insert(task.id, task.clone());
        Ok(task.clone())
    }

    fn update_task(&self, task_id: TaskId, update: &TaskUpdate) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        let task = state.tasks.get_mut(&task_id).ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::Persistence,
                "task id was not found for update",
            )
            .for_task(task_id)
        })?;
        update.apply_to(task);
        Ok(())
    }

    fn get_task(&self, task_id: TaskId) -> PersistenceResult<Option<TaskRecord>> {
        Ok(self.lock_state()?.tasks.get(&task_id).cloned())
    }

    fn list_tasks_by_project(
        &self,
        project_id: &ProjectId,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> PersistenceResult<Vec<TaskRecord>> {
        let state = self.lock_state()?;
        let mut tasks: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|task| &task.project_id == project_id)
            .filter(|task| status.is_none_or(|wanted| task.status == wanted))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        tasks.truncate(limit);
        Ok(tasks)
    }

    fn list_tasks_by_parent(&self, parent_id: TaskId) -> PersistenceResult<Vec<TaskRecord>> {
        let state = self.lock_state()?;
        Ok(state
            .tasks
            .values()
            .filter(|task| task.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }

    fn increment_project_stats(
        &self,
        project_id: &ProjectId,
        delta: &StatsDelta,
    ) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        state
            .stats
            .entry(project_id.clone())
            .or_insert_with(|| ProjectStats::empty(project_id.clone()))
            .apply(delta);
        Ok(())
    }

    fn project_stats(&self, project_id: &ProjectId) -> PersistenceResult<ProjectStats> {
        let state = self.lock_state()?;
        Ok(state
            .stats
            .get(project_id)
            .cloned()
            .unwrap_or_else(|| ProjectStats::empty(project_id.clone())))
    }

    fn next_task_id(&self) -> PersistenceResult<u64> {
        let state = self.lock_state()?;
        Ok(state
            .tasks
            .keys()
            .next_back()
            .map(|id| id.0.saturating_add(1))
            .unwrap_or(0))
    }
}
