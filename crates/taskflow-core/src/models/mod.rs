pub mod error;
pub mod payload;
pub mod stats;
pub mod task;

pub use error::{CoreError, CoreErrorKind};
pub use payload::Payload;
pub use stats::{ProjectStats, StatsDelta};
pub use task::{
    NewTask, ProjectId, TaskId, TaskMetadata, TaskRecord, TaskStatus, TaskType, TaskUpdate,
    WorkerKind,
};
