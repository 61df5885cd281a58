use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::models::{
    CoreError, CoreErrorKind, NewTask, ProjectId, TaskId, TaskMetadata, TaskRecord, WorkerKind,
};
use crate::orchestration::OrchestrationResult;
use crate::orchestration::lifecycle::TaskLifecycleController;

pub const TIMEOUT_MESSAGE: &str = "timed out";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_retry_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retry_attempts: config.max_retry_attempts,
            backoff: config.retry_backoff,
        }
    }

    /// Whether `failed` gets a retry sibling. Workflow roots are never
    /// retried; their stages are.
    pub fn decide(&self, failed: &TaskRecord, now: SystemTime) -> RetryDecision {
        if failed.worker_kind == WorkerKind::Orchestrator {
            return RetryDecision::NotEligible;
        }
        let retry_count = failed.metadata.retry_count;
        if retry_count < self.max_retry_attempts {
            RetryDecision::Scheduled {
                attempt: retry_count + 1,
                due_at: now + self.backoff,
            }
        } else {
            RetryDecision::Exhausted {
                attempts: retry_count + 1,
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RetryDecision {
    /// A sibling with `retry_count == attempt` will be created at `due_at`.
    Scheduled { attempt: u32, due_at: SystemTime },
    Exhausted { attempts: u32 },
    NotEligible,
}

/// Result of `fail`: the failed record plus what the supervisor decided.
#[derive(Clone, Debug, PartialEq)]
pub struct FailureOutcome {
    pub task: TaskRecord,
    pub retry: RetryDecision,
}

/// Observable view of a retry that has not been created yet.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingRetry {
    pub failed_task_id: TaskId,
    pub project_id: ProjectId,
    pub parent_id: Option<TaskId>,
    pub worker_kind: WorkerKind,
    pub attempt: u32,
    pub due_at: SystemTime,
}

type RetryResult = OrchestrationResult<TaskRecord>;

/// Claim on the sibling a scheduled retry will create.
#[derive(Debug)]
pub struct RetryTicket {
    pub failed_task_id: TaskId,
    pub attempt: u32,
    receiver: oneshot::Receiver<RetryResult>,
}

impl RetryTicket {
    /// Resolves to the created sibling, or `None` when the retry was
    /// cancelled before it fired.
    pub async fn wait(self) -> OrchestrationResult<Option<TaskRecord>> {
        match self.receiver.await {
            Ok(Ok(task)) => Ok(Some(task)),
            Ok(Err(error)) if error.kind == CoreErrorKind::Cancelled => Ok(None),
            Ok(Err(error)) => Err(error),
            Err(_) => Ok(None),
        }
    }
}

struct ScheduledRetry {
    info: PendingRetry,
    handle: AbortHandle,
    receiver: Option<oneshot::Receiver<RetryResult>>,
    fired: bool,
    sibling: Option<TaskId>,
}

/// Retries keyed by the failed task they replace.
///
/// An entry lives until its sibling is created and claimed, or until it is
/// cancelled. An entry that fired before being claimed keeps its result
/// only while the sibling it created is still active.
#[derive(Default)]
pub(crate) struct RetryQueue {
    entries: HashMap<TaskId, ScheduledRetry>,
    // sibling id -> failed task id, for fired entries nobody claimed
    unclaimed: HashMap<TaskId, TaskId>,
}

impl RetryQueue {
    pub(crate) fn pending(&self) -> Vec<PendingRetry> {
        let mut pending = self
            .entries
            .values()
            .filter(|entry| !entry.fired)
            .map(|entry| entry.info.clone())
            .collect::<Vec<_>>();
        pending.sort_by_key(|entry| entry.failed_task_id);
        pending
    }

    pub(crate) fn is_waiting(&self, failed_task_id: TaskId) -> bool {
        self.entries
            .get(&failed_task_id)
            .is_some_and(|entry| !entry.fired)
    }

    pub(crate) fn take(&mut self, failed_task_id: TaskId) -> Option<RetryTicket> {
        let entry = self.entries.get_mut(&failed_task_id)?;
        let receiver = entry.receiver.take()?;
        let ticket = RetryTicket {
            failed_task_id,
            attempt: entry.info.attempt,
            receiver,
        };
        if entry.fired {
            self.remove(failed_task_id);
        }
        Some(ticket)
    }

    /// Marks the entry fired. It is dropped at once when it was already
    /// claimed or created nothing, otherwise when `sibling` settles.
    pub(crate) fn mark_fired(&mut self, failed_task_id: TaskId, sibling: Option<TaskId>) {
        let Some(entry) = self.entries.get_mut(&failed_task_id) else {
            return;
        };
        entry.fired = true;
        match sibling {
            Some(sibling) if entry.receiver.is_some() => {
                entry.sibling = Some(sibling);
                self.unclaimed.insert(sibling, failed_task_id);
            }
            _ => {
                self.entries.remove(&failed_task_id);
            }
        }
    }

    /// Drops the unclaimed entry whose retry created `task_id`, now that
    /// `task_id` has left the active set.
    pub(crate) fn release_sibling(&mut self, task_id: TaskId) {
        if let Some(failed_task_id) = self.unclaimed.remove(&task_id) {
            self.entries.remove(&failed_task_id);
        }
    }

    pub(crate) fn cancel(&mut self, failed_task_id: TaskId) -> bool {
        match self.remove(failed_task_id) {
            Some(entry) => {
                entry.handle.abort();
                !entry.fired
            }
            None => false,
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.handle.abort();
        }
        self.unclaimed.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn remove(&mut self, failed_task_id: TaskId) -> Option<ScheduledRetry> {
        let entry = self.entries.remove(&failed_task_id)?;
        if let Some(sibling) = entry.sibling {
            self.unclaimed.remove(&sibling);
        }
        Some(entry)
    }
}

/// Arms the timeout for a task that just entered `in_progress`.
pub(crate) fn arm_timeout(
    controller: TaskLifecycleController,
    task_id: TaskId,
    after: Duration,
) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        match controller.expire(task_id).await {
            Ok(_) => warn!(
                task_id = task_id.0,
                timeout_ms = after.as_millis() as u64,
                "task timed out"
            ),
            Err(error) => debug!(
                task_id = task_id.0,
                error = %error,
                "timeout lost the race with another terminal transition"
            ),
        }
    })
    .abort_handle()
}

/// Spawns the delayed creation of `failed`'s retry sibling and records it in
/// `queue`.
pub(crate) fn schedule_retry(
    controller: TaskLifecycleController,
    queue: &mut RetryQueue,
    failed: &TaskRecord,
    attempt: u32,
    due_at: SystemTime,
    delay: Duration,
) {
    let failed_task_id = failed.id;
    let sibling = retry_sibling(failed, attempt);
    let (sender, receiver) = oneshot::channel();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let created = controller.create_retry(failed_task_id, sibling).await;
        if let Err(error) = &created {
            debug!(
                task_id = failed_task_id.0,
                error = %error,
                "retry was not created"
            );
        }
        let _ = sender.send(created);
    })
    .abort_handle();

    queue.entries.insert(
        failed_task_id,
        ScheduledRetry {
            info: PendingRetry {
                failed_task_id,
                project_id: failed.project_id.clone(),
                parent_id: failed.parent_id,
                worker_kind: failed.worker_kind,
                attempt,
                due_at,
            },
            handle,
            receiver: Some(receiver),
            fired: false,
            sibling: None,
        },
    );
}

/// Same parent, type, worker, input and priority as `failed`.
pub fn retry_sibling(failed: &TaskRecord, attempt: u32) -> NewTask {
    let mut sibling = NewTask::new(
        failed.project_id.clone(),
        failed.task_type,
        failed.worker_kind,
        failed.input.clone(),
    )
    .metadata(TaskMetadata {
        priority: failed.metadata.priority,
        retry_count: attempt,
        estimated_duration_ms: failed.metadata.estimated_duration_ms,
        ..TaskMetadata::default()
    });
    if let Some(parent_id) = failed.parent_id {
        sibling = sibling.parent(parent_id);
    }
    sibling
}

/// Why `failed` failed: `Timeout` when the supervisor's timer settled it,
/// otherwise an error reported by its worker.
pub fn failure_kind(failed: &TaskRecord) -> CoreErrorKind {
    if failed.error_message.as_deref() == Some(TIMEOUT_MESSAGE) {
        CoreErrorKind::Timeout
    } else {
        CoreErrorKind::Worker
    }
}

pub(crate) fn retry_cancelled(failed_task_id: TaskId) -> CoreError {
    CoreError::new(
        CoreErrorKind::Cancelled,
        format!("retry of task '{failed_task_id}' was cancelled"),
    )
    .for_task(failed_task_id)
}
