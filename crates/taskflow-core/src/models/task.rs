use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::Payload;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Workflow mode a task instance belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Scan,
    Enhance,
    AddModules,
    Full,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::Scan,
        TaskType::Enhance,
        TaskType::AddModules,
        TaskType::Full,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Scan => "scan",
            TaskType::Enhance => "enhance",
            TaskType::AddModules => "add_modules",
            TaskType::Full => "full",
        }
    }
}

impl FromStr for TaskType {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == value)
            .ok_or(())
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Scanner,
    Improver,
    Generator,
    Orchestrator,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 4] = [
        WorkerKind::Scanner,
        WorkerKind::Improver,
        WorkerKind::Generator,
        WorkerKind::Orchestrator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerKind::Scanner => "scanner",
            WorkerKind::Improver => "improver",
            WorkerKind::Generator => "generator",
            WorkerKind::Orchestrator => "orchestrator",
        }
    }
}

impl FromStr for WorkerKind {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        WorkerKind::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == value)
            .ok_or(())
    }
}

impl Display for WorkerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Edges of the lifecycle state machine. Terminal states have none.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::InProgress, TaskStatus::Cancelled)
        )
    }
}

impl FromStr for TaskStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub priority: i32,
    pub retry_count: u32,
    pub estimated_duration_ms: Option<u64>,
    pub actual_duration_ms: Option<u64>,
    pub tokens_used: Option<u64>,
    pub cost_estimate: Option<f64>,
}

impl TaskMetadata {
    pub fn with_priority(priority: i32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub task_type: TaskType,
    pub worker_kind: WorkerKind,
    pub status: TaskStatus,
    pub parent_id: Option<TaskId>,
    pub input: Payload,
    pub output: Option<Payload>,
    pub metadata: TaskMetadata,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub error_message: Option<String>,
}

/// Arguments to `create`. Metadata falls back to the configured default
/// priority with a zero retry count.
#[derive(Clone, Debug, PartialEq)]
pub struct NewTask {
    pub project_id: ProjectId,
    pub task_type: TaskType,
    pub worker_kind: WorkerKind,
    pub input: Payload,
    pub parent_id: Option<TaskId>,
    pub metadata: Option<TaskMetadata>,
}

impl NewTask {
    pub fn new(
        project_id: impl Into<ProjectId>,
        task_type: TaskType,
        worker_kind: WorkerKind,
        input: Payload,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            task_type,
            worker_kind,
            input,
            parent_id: None,
            metadata: None,
        }
    }

    pub fn parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn metadata(mut self, metadata: TaskMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Partial update applied by `TaskStore::update_task`. `None` leaves the
/// stored column untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub output: Option<Payload>,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub error_message: Option<String>,
    pub actual_duration_ms: Option<u64>,
    pub tokens_used: Option<u64>,
    pub cost_estimate: Option<f64>,
}

impl TaskUpdate {
    pub fn apply_to(&self, task: &mut TaskRecord) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(output) = &self.output {
            task.output = Some(output.clone());
        }
        if let Some(started_at) = self.started_at {
            task.started_at = Some(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            task.completed_at = Some(completed_at);
        }
        if let Some(message) = &self.error_message {
            task.error_message = Some(message.clone());
        }
        if let Some(duration) = self.actual_duration_ms {
            task.metadata.actual_duration_ms = Some(duration);
        }
        if let Some(tokens) = self.tokens_used {
            task.metadata.tokens_used = Some(tokens);
        }
        if let Some(cost) = self.cost_estimate {
            task.metadata.cost_estimate = Some(cost);
        }
    }
}
