pub mod composer;
pub mod lifecycle;
pub mod supervisor;
pub mod workflow;

pub use composer::{StageDescriptor, StageInput, compose, merge_outputs, stage_input};
pub use lifecycle::{ControllerPhase, TaskLifecycleController};
pub use supervisor::{
    FailureOutcome, PendingRetry, RetryDecision, RetryPolicy, RetryTicket, TIMEOUT_MESSAGE,
    failure_kind,
};
pub use workflow::{
    Orchestrator, StageOutcome, WorkflowError, WorkflowHandle, WorkflowOutcome, WorkflowResult,
    WorkflowStatus,
};

use crate::models::CoreError;

pub type OrchestrationResult<T> = Result<T, CoreError>;
