use thiserror::Error;

use crate::models::{TaskId, TaskStatus, WorkerKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    NotFound,
    InvalidTransition,
    Persistence,
    Worker,
    Timeout,
    Cancelled,
    InvalidInput,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub task: Option<TaskId>,
    pub worker: Option<WorkerKind>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: None,
            worker: None,
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(task_id: TaskId) -> Self {
        Self {
            task: Some(task_id),
            worker: None,
            kind: CoreErrorKind::NotFound,
            message: format!("unknown task id '{task_id}'"),
        }
    }

    pub fn invalid_transition(task_id: TaskId, current: TaskStatus, desired: TaskStatus) -> Self {
        Self {
            task: Some(task_id),
            worker: None,
            kind: CoreErrorKind::InvalidTransition,
            message: format!(
                "task '{task_id}' cannot transition from '{}' to '{}'",
                current.as_str(),
                desired.as_str()
            ),
        }
    }

    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task = self.task.or(Some(task_id));
        self
    }

    pub fn for_worker(mut self, worker: WorkerKind) -> Self {
        self.worker = self.worker.or(Some(worker));
        self
    }
}
