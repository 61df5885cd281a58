use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, TokioClock, millis_between};
use crate::config::EngineConfig;
use crate::models::{
    CoreError, CoreErrorKind, NewTask, Payload, ProjectId, ProjectStats, StatsDelta, TaskId,
    TaskMetadata, TaskRecord, TaskStatus, TaskUpdate, WorkerKind,
};
use crate::orchestration::OrchestrationResult;
use crate::orchestration::supervisor::{
    self, FailureOutcome, PendingRetry, RetryDecision, RetryPolicy, RetryQueue, RetryTicket,
    TIMEOUT_MESSAGE,
};
use crate::persistence::{PersistenceResult, TaskStore};

const DEFAULT_CANCEL_REASON: &str = "cancelled";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ControllerPhase {
    #[default]
    Created,
    Running,
    ShutDown,
}

/// Owns the in-memory registry of non-terminal tasks and drives every status
/// change through the store.
///
/// All transitions serialize on one registry lock which is held across the
/// store write, so the first terminal signal for a task wins and any later
/// one is rejected with `InvalidTransition`.
///
/// Holding the lock across store I/O also serializes unrelated tasks and
/// projects behind one write at a time, so transition throughput is bounded
/// by store latency. Reads that only need persisted records (`children`,
/// `tasks_for_project`, `project_stats`) do not take the lock.
#[derive(Clone)]
pub struct TaskLifecycleController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    store: Arc<dyn TaskStore>,
    config: EngineConfig,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    phase: ControllerPhase,
    next_task_id: u64,
    active: HashMap<TaskId, TaskRecord>,
    timers: HashMap<TaskId, AbortHandle>,
    completion_notifiers: HashMap<TaskId, Arc<Notify>>,
    retries: RetryQueue,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TimerDisposition {
    Abort,
    // The timer itself is settling the task and must not abort its own task.
    Detach,
}

impl TaskLifecycleController {
    pub fn new(store: Arc<dyn TaskStore>, config: EngineConfig) -> Self {
        Self::with_clock(store, config, Arc::new(TokioClock::new()))
    }

    pub fn with_clock(
        store: Arc<dyn TaskStore>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retry_policy = RetryPolicy::from_config(&config);
        Self {
            inner: Arc::new(ControllerInner {
                store,
                config,
                retry_policy,
                clock,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub async fn phase(&self) -> ControllerPhase {
        self.inner.state.lock().await.phase
    }

    /// Validates configuration and seeds id allocation past every persisted
    /// task. Calling it again while running is a no-op.
    pub async fn init(&self) -> OrchestrationResult<()> {
        self.inner.config.validate()?;
        let seed = self.with_store(|store| store.next_task_id()).await?;

        let mut state = self.inner.state.lock().await;
        if state.phase == ControllerPhase::ShutDown {
            return Err(shut_down_error());
        }
        state.next_task_id = state.next_task_id.max(seed);
        state.phase = ControllerPhase::Running;
        info!(
            next_task_id = state.next_task_id,
            max_retry_attempts = self.inner.config.max_retry_attempts,
            "task lifecycle controller initialized"
        );
        Ok(())
    }

    /// Cancels outstanding timers and retries. Records are left as persisted;
    /// callers blocked in `wait_for_terminal` are released with `Cancelled`.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        if state.phase == ControllerPhase::ShutDown {
            return;
        }
        state.phase = ControllerPhase::ShutDown;
        for (_, timer) in state.timers.drain() {
            timer.abort();
        }
        state.retries.cancel_all();
        for notify in state.completion_notifiers.values() {
            notify.notify_waiters();
        }
        info!(
            active_tasks = state.active.len(),
            "task lifecycle controller shut down"
        );
    }

    pub async fn create(&self, new_task: NewTask) -> OrchestrationResult<TaskRecord> {
        let mut state = self.inner.state.lock().await;
        self.create_locked(&mut state, new_task).await
    }

    pub async fn start(&self, task_id: TaskId) -> OrchestrationResult<TaskRecord> {
        let mut state = self.inner.state.lock().await;
        ensure_running(&state)?;
        let current = self
            .transition_source(&state, task_id, TaskStatus::InProgress)
            .await?;

        let update = TaskUpdate {
            status: Some(TaskStatus::InProgress),
            started_at: Some(self.inner.clock.now()),
            ..TaskUpdate::default()
        };
        let started = self.persist_update(current, update).await?;
        state.active.insert(task_id, started.clone());
        self.warn_if_over_capacity(&state, &started.project_id);

        let timeout = self.inner.config.timeout_for(&started);
        let timer = supervisor::arm_timeout(self.clone(), task_id, timeout);
        if let Some(previous) = state.timers.insert(task_id, timer) {
            previous.abort();
        }

        info!(
            task_id = task_id.0,
            worker = started.worker_kind.as_str(),
            timeout_ms = timeout.as_millis() as u64,
            "task started"
        );
        Ok(started)
    }

    pub async fn complete(
        &self,
        task_id: TaskId,
        output: Payload,
        tokens_used: Option<u64>,
        cost_estimate: Option<f64>,
    ) -> OrchestrationResult<TaskRecord> {
        let mut state = self.inner.state.lock().await;
        ensure_running(&state)?;
        let current = self
            .transition_source(&state, task_id, TaskStatus::Completed)
            .await?;

        let completed_at = self.inner.clock.now();
        let duration_ms = millis_between(
            current.started_at.unwrap_or(current.created_at),
            completed_at,
        );
        let update = TaskUpdate {
            status: Some(TaskStatus::Completed),
            output: Some(output),
            completed_at: Some(completed_at),
            actual_duration_ms: Some(duration_ms),
            tokens_used,
            cost_estimate,
            ..TaskUpdate::default()
        };
        let completed = self.persist_update(current, update).await?;
        settle(&mut state, task_id, TimerDisposition::Abort);

        // Workflow roots carry the sum of their stages; counting it again
        // would double the project totals.
        let counts_usage = completed.worker_kind != WorkerKind::Orchestrator;
        let delta = StatsDelta {
            tokens: if counts_usage {
                tokens_used.unwrap_or(0)
            } else {
                0
            },
            cost: if counts_usage {
                cost_estimate.unwrap_or(0.0)
            } else {
                0.0
            },
            duration_ms: Some(duration_ms),
            succeeded: true,
        };
        self.record_stats(&completed, delta).await;
        notify_settled(&mut state, task_id);

        info!(
            task_id = task_id.0,
            worker = completed.worker_kind.as_str(),
            duration_ms,
            "task completed"
        );
        Ok(completed)
    }

    /// Marks an in-progress task failed and lets the supervisor decide on a
    /// retry. A scheduled retry is registered before waiters are woken.
    pub async fn fail(
        &self,
        task_id: TaskId,
        error_message: impl Into<String>,
        error_stack: Option<String>,
    ) -> OrchestrationResult<FailureOutcome> {
        let mut state = self.inner.state.lock().await;
        self.fail_locked(
            &mut state,
            task_id,
            error_message.into(),
            error_stack,
            TimerDisposition::Abort,
        )
        .await
    }

    pub(crate) async fn expire(&self, task_id: TaskId) -> OrchestrationResult<FailureOutcome> {
        let mut state = self.inner.state.lock().await;
        self.fail_locked(
            &mut state,
            task_id,
            TIMEOUT_MESSAGE.to_string(),
            None,
            TimerDisposition::Detach,
        )
        .await
    }

    pub async fn cancel(
        &self,
        task_id: TaskId,
        reason: Option<String>,
    ) -> OrchestrationResult<TaskRecord> {
        let mut state = self.inner.state.lock().await;
        ensure_running(&state)?;
        let current = self
            .transition_source(&state, task_id, TaskStatus::Cancelled)
            .await?;
        self.cancel_locked(&mut state, current, reason).await
    }

    /// Cancels `root_id` and every non-terminal descendant under one lock
    /// acquisition, and drops retries scheduled for failed descendants.
    /// Returns the records that were cancelled, root first.
    pub async fn cancel_tree(
        &self,
        root_id: TaskId,
        reason: Option<String>,
    ) -> OrchestrationResult<Vec<TaskRecord>> {
        let mut state = self.inner.state.lock().await;
        ensure_running(&state)?;
        let root = self
            .transition_source(&state, root_id, TaskStatus::Cancelled)
            .await?;
        let descendants = self.descendant_ids(root_id).await?;

        let mut dropped_retries = 0usize;
        for task_id in &descendants {
            if state.retries.cancel(*task_id) {
                dropped_retries += 1;
            }
        }

        let mut cancelled = vec![self.cancel_locked(&mut state, root, reason.clone()).await?];
        let mut first_error = None;
        for task_id in descendants {
            let Some(task) = state.active.get(&task_id).cloned() else {
                continue;
            };
            match self.cancel_locked(&mut state, task, reason.clone()).await {
                Ok(record) => cancelled.push(record),
                Err(error) if first_error.is_none() => first_error = Some(error),
                Err(_) => {}
            }
        }

        info!(
            root_id = root_id.0,
            cancelled = cancelled.len(),
            dropped_retries,
            "task tree cancelled"
        );
        match first_error {
            Some(error) => Err(error),
            None => Ok(cancelled),
        }
    }

    /// In-memory copy for non-terminal tasks, otherwise the persisted record.
    pub async fn get(&self, task_id: TaskId) -> OrchestrationResult<Option<TaskRecord>> {
        {
            let state = self.inner.state.lock().await;
            if let Some(task) = state.active.get(&task_id) {
                return Ok(Some(task.clone()));
            }
        }
        self.with_store(move |store| store.get_task(task_id)).await
    }

    pub async fn list_active(&self) -> Vec<TaskRecord> {
        let state = self.inner.state.lock().await;
        let mut active = state.active.values().cloned().collect::<Vec<_>>();
        active.sort_by_key(|task| task.id);
        active
    }

    pub async fn children(&self, parent_id: TaskId) -> OrchestrationResult<Vec<TaskRecord>> {
        self.with_store(move |store| store.list_tasks_by_parent(parent_id))
            .await
    }

    pub async fn tasks_for_project(
        &self,
        project_id: ProjectId,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> OrchestrationResult<Vec<TaskRecord>> {
        self.with_store(move |store| store.list_tasks_by_project(&project_id, status, limit))
            .await
    }

    pub async fn project_stats(&self, project_id: ProjectId) -> OrchestrationResult<ProjectStats> {
        self.with_store(move |store| store.project_stats(&project_id))
            .await
    }

    /// Blocks until `task_id` reaches a terminal status and returns the
    /// persisted record.
    pub async fn wait_for_terminal(&self, task_id: TaskId) -> OrchestrationResult<TaskRecord> {
        loop {
            let state = self.inner.state.lock().await;
            let notify = match state.active.get(&task_id) {
                None => None,
                Some(_) if state.phase == ControllerPhase::ShutDown => {
                    return Err(shut_down_error().for_task(task_id));
                }
                Some(_) => state.completion_notifiers.get(&task_id).cloned(),
            };
            let Some(notify) = notify else {
                drop(state);
                return self.settled_record(task_id).await;
            };
            // Registered before the lock is released so a concurrent
            // transition cannot slip between the check and the wait.
            let notified = notify.notified();
            drop(state);
            notified.await;
        }
    }

    pub async fn pending_retries(&self) -> Vec<PendingRetry> {
        self.inner.state.lock().await.retries.pending()
    }

    /// Claims the retry scheduled for `failed_task_id`, if any.
    pub async fn take_pending_retry(&self, failed_task_id: TaskId) -> Option<RetryTicket> {
        self.inner.state.lock().await.retries.take(failed_task_id)
    }

    /// Returns whether a retry that had not fired yet was dropped.
    pub async fn cancel_retry(&self, failed_task_id: TaskId) -> bool {
        let cancelled = self
            .inner
            .state
            .lock()
            .await
            .retries
            .cancel(failed_task_id);
        if cancelled {
            info!(task_id = failed_task_id.0, "pending retry cancelled");
        }
        cancelled
    }

    pub(crate) async fn create_retry(
        &self,
        failed_task_id: TaskId,
        sibling: NewTask,
    ) -> OrchestrationResult<TaskRecord> {
        let mut state = self.inner.state.lock().await;
        if !state.retries.is_waiting(failed_task_id) {
            return Err(supervisor::retry_cancelled(failed_task_id));
        }
        let created = self.create_locked(&mut state, sibling).await;
        let sibling_id = created.as_ref().ok().map(|task| task.id);
        state.retries.mark_fired(failed_task_id, sibling_id);
        if let Ok(task) = &created {
            info!(
                task_id = task.id.0,
                retry_of = failed_task_id.0,
                retry_count = task.metadata.retry_count,
                "retry task created"
            );
        }
        created
    }

    async fn create_locked(
        &self,
        state: &mut RegistryState,
        new_task: NewTask,
    ) -> OrchestrationResult<TaskRecord> {
        ensure_running(state)?;
        if let Some(parent_id) = new_task.parent_id {
            self.check_parent(state, parent_id).await?;
        }

        let task_id = TaskId(state.next_task_id);
        state.next_task_id = state.next_task_id.saturating_add(1);
        let record = TaskRecord {
            id: task_id,
            project_id: new_task.project_id,
            task_type: new_task.task_type,
            worker_kind: new_task.worker_kind,
            status: TaskStatus::Pending,
            parent_id: new_task.parent_id,
            input: new_task.input,
            output: None,
            metadata: new_task
                .metadata
                .unwrap_or_else(|| TaskMetadata::with_priority(self.inner.config.default_priority)),
            created_at: self.inner.clock.now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        };

        let persisted = self
            .with_store(move |store| store.insert_task(&record))
            .await
            .map_err(|error| {
                error!(task_id = task_id.0, error = %error, "failed to persist new task");
                error
            })?;
        state.active.insert(task_id, persisted.clone());
        state
            .completion_notifiers
            .insert(task_id, Arc::new(Notify::new()));

        debug!(
            task_id = task_id.0,
            project_id = %persisted.project_id,
            worker = persisted.worker_kind.as_str(),
            parent_id = persisted.parent_id.map(|id| id.0),
            "task created"
        );
        Ok(persisted)
    }

    async fn fail_locked(
        &self,
        state: &mut RegistryState,
        task_id: TaskId,
        error_message: String,
        error_stack: Option<String>,
        timer: TimerDisposition,
    ) -> OrchestrationResult<FailureOutcome> {
        ensure_running(state)?;
        let current = self
            .transition_source(state, task_id, TaskStatus::Failed)
            .await?;

        let completed_at = self.inner.clock.now();
        if let Some(stack) = &error_stack {
            debug!(task_id = task_id.0, stack = %stack, "task failure stack");
        }
        let update = TaskUpdate {
            status: Some(TaskStatus::Failed),
            completed_at: Some(completed_at),
            error_message: Some(error_message),
            actual_duration_ms: current
                .started_at
                .map(|started_at| millis_between(started_at, completed_at)),
            ..TaskUpdate::default()
        };
        let failed = self.persist_update(current, update).await?;
        settle(state, task_id, timer);
        self.record_stats(&failed, StatsDelta::default()).await;

        let retry = self.inner.retry_policy.decide(&failed, completed_at);
        match retry {
            RetryDecision::Scheduled { attempt, due_at } => {
                supervisor::schedule_retry(
                    self.clone(),
                    &mut state.retries,
                    &failed,
                    attempt,
                    due_at,
                    self.inner.retry_policy.backoff,
                );
                warn!(
                    task_id = task_id.0,
                    worker = failed.worker_kind.as_str(),
                    attempt,
                    error = failed.error_message.as_deref().unwrap_or_default(),
                    "task failed; retry scheduled"
                );
            }
            RetryDecision::Exhausted { attempts } => warn!(
                task_id = task_id.0,
                worker = failed.worker_kind.as_str(),
                attempts,
                error = failed.error_message.as_deref().unwrap_or_default(),
                "task failed; retries exhausted"
            ),
            RetryDecision::NotEligible => info!(
                task_id = task_id.0,
                error = failed.error_message.as_deref().unwrap_or_default(),
                "task failed"
            ),
        }
        notify_settled(state, task_id);

        Ok(FailureOutcome {
            task: failed,
            retry,
        })
    }

    async fn cancel_locked(
        &self,
        state: &mut RegistryState,
        current: TaskRecord,
        reason: Option<String>,
    ) -> OrchestrationResult<TaskRecord> {
        let task_id = current.id;
        let update = TaskUpdate {
            status: Some(TaskStatus::Cancelled),
            completed_at: Some(self.inner.clock.now()),
            error_message: Some(reason.unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string())),
            ..TaskUpdate::default()
        };
        let cancelled = self.persist_update(current, update).await?;
        settle(state, task_id, TimerDisposition::Abort);
        notify_settled(state, task_id);
        info!(task_id = task_id.0, "task cancelled");
        Ok(cancelled)
    }

    /// The in-memory record `task_id` would move from, if `desired` is a
    /// legal next status.
    async fn transition_source(
        &self,
        state: &RegistryState,
        task_id: TaskId,
        desired: TaskStatus,
    ) -> OrchestrationResult<TaskRecord> {
        if let Some(task) = state.active.get(&task_id) {
            if task.status.can_transition_to(desired) {
                return Ok(task.clone());
            }
            return Err(CoreError::invalid_transition(task_id, task.status, desired));
        }

        match self.with_store(move |store| store.get_task(task_id)).await? {
            Some(task) if task.status.is_terminal() => {
                Err(CoreError::invalid_transition(task_id, task.status, desired))
            }
            Some(_) => Err(untracked_task(task_id)),
            None => Err(CoreError::not_found(task_id)),
        }
    }

    async fn check_parent(&self, state: &RegistryState, parent_id: TaskId) -> OrchestrationResult<()> {
        if state.active.contains_key(&parent_id) {
            return Ok(());
        }
        match self.with_store(move |store| store.get_task(parent_id)).await? {
            None => Err(CoreError::new(
                CoreErrorKind::NotFound,
                format!("parent task '{parent_id}' does not exist"),
            )
            .for_task(parent_id)),
            Some(parent) if parent.status == TaskStatus::Cancelled => Err(CoreError::new(
                CoreErrorKind::InvalidTransition,
                format!("parent task '{parent_id}' is cancelled"),
            )
            .for_task(parent_id)),
            Some(_) => Ok(()),
        }
    }

    async fn descendant_ids(&self, root_id: TaskId) -> OrchestrationResult<Vec<TaskId>> {
        let mut seen = HashSet::from([root_id]);
        let mut queue = VecDeque::from([root_id]);
        let mut descendants = Vec::new();
        while let Some(parent_id) = queue.pop_front() {
            let children = self
                .with_store(move |store| store.list_tasks_by_parent(parent_id))
                .await?;
            for child in children {
                if seen.insert(child.id) {
                    descendants.push(child.id);
                    queue.push_back(child.id);
                }
            }
        }
        Ok(descendants)
    }

    async fn settled_record(&self, task_id: TaskId) -> OrchestrationResult<TaskRecord> {
        match self.with_store(move |store| store.get_task(task_id)).await? {
            Some(task) if task.status.is_terminal() => Ok(task),
            Some(_) => Err(untracked_task(task_id)),
            None => Err(CoreError::not_found(task_id)),
        }
    }

    async fn persist_update(
        &self,
        current: TaskRecord,
        update: TaskUpdate,
    ) -> OrchestrationResult<TaskRecord> {
        let task_id = current.id;
        let stored = update.clone();
        self.with_store(move |store| store.update_task(task_id, &stored))
            .await
            .map_err(|error| {
                error!(
                    task_id = task_id.0,
                    status = update.status.map(|status| status.as_str()),
                    error = %error,
                    "failed to persist task transition"
                );
                error
            })?;

        let mut next = current;
        update.apply_to(&mut next);
        Ok(next)
    }

    async fn record_stats(&self, task: &TaskRecord, delta: StatsDelta) {
        let project_id = task.project_id.clone();
        let result = self
            .with_store(move |store| store.increment_project_stats(&project_id, &delta))
            .await;
        if let Err(error) = result {
            error!(
                task_id = task.id.0,
                project_id = %task.project_id,
                error = %error,
                "failed to update project stats"
            );
        }
    }

    fn warn_if_over_capacity(&self, state: &RegistryState, project_id: &ProjectId) {
        let Some(limit) = self.inner.config.max_concurrent_tasks else {
            return;
        };
        let running = state
            .active
            .values()
            .filter(|task| task.project_id == *project_id && task.status == TaskStatus::InProgress)
            .count();
        if running > limit {
            warn!(
                project_id = %project_id,
                running,
                limit,
                "project is over its concurrent task limit"
            );
        }
    }

    async fn with_store<T, F>(&self, operation: F) -> OrchestrationResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TaskStore) -> PersistenceResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.inner.store);
        tokio::task::spawn_blocking(move || operation(store.as_ref()))
            .await
            .map_err(|join_error| {
                CoreError::new(
                    CoreErrorKind::Internal,
                    format!("task store call did not complete: {join_error}"),
                )
            })?
    }
}

fn ensure_running(state: &RegistryState) -> OrchestrationResult<()> {
    match state.phase {
        ControllerPhase::Running => Ok(()),
        ControllerPhase::Created => Err(CoreError::new(
            CoreErrorKind::InvalidInput,
            "task lifecycle controller has not been initialized",
        )),
        ControllerPhase::ShutDown => Err(shut_down_error()),
    }
}

fn settle(state: &mut RegistryState, task_id: TaskId, timer: TimerDisposition) {
    state.active.remove(&task_id);
    state.retries.release_sibling(task_id);
    let handle = state.timers.remove(&task_id);
    if timer == TimerDisposition::Abort {
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

fn notify_settled(state: &mut RegistryState, task_id: TaskId) {
    if let Some(notify) = state.completion_notifiers.remove(&task_id) {
        notify.notify_waiters();
    }
}

fn shut_down_error() -> CoreError {
    CoreError::new(
        CoreErrorKind::Cancelled,
        "task lifecycle controller has been shut down",
    )
}

fn untracked_task(task_id: TaskId) -> CoreError {
    CoreError::new(
        CoreErrorKind::InvalidTransition,
        format!("task '{task_id}' is not tracked by this controller"),
    )
    .for_task(task_id)
}
