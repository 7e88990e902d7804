//! The execution engine: supervises local task runs against registered
//! executors.
//!
//! Admission enforces the hard concurrency cap and records the task in the
//! live set; the run itself happens on its own tokio task with a
//! cancellation scope derived from the engine's root token and a deadline
//! of the task's timeout. On return the engine persists the result,
//! drives the terminal state transition, and emits lifecycle events.
//! Retryable failures re-enter through the full admission path.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dragnet_store::{
    Store, StoreError, Task, TaskEvent, TaskEventKind, TaskPatch, TaskResult, TaskStatus, TaskType,
};

use crate::bus::TaskReport;
use crate::config::EngineConfig;
use crate::error::{OrchestrateError, Result};
use crate::events::EventSink;
use crate::state::{TaskStateMachine, dispatch};

use super::registry::ExecutorRegistry;
use super::trait_def::{ExecContext, Executor, TaskOutput};

/// Error message persisted when the run deadline fires.
pub const TIMEOUT_ERROR: &str = "task execution timed out";

/// Error message persisted when a run is cancelled.
pub const CANCELLED_ERROR: &str = "task cancelled";

struct LiveTask {
    task_type: TaskType,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

/// Snapshot of one live run for the admin surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunningSnapshot {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub started_at: DateTime<Utc>,
}

/// How a supervised run ended.
enum RunOutcome {
    Finished(anyhow::Result<TaskOutput>),
    Panicked(String),
    Deadline,
    Cancelled,
}

/// Supervisor for local task execution.
#[derive(Clone)]
pub struct ExecutionEngine {
    store: Arc<dyn Store>,
    registry: Arc<ExecutorRegistry>,
    state: TaskStateMachine,
    events: EventSink,
    config: EngineConfig,
    live: Arc<RwLock<HashMap<Uuid, LiveTask>>>,
    root: CancellationToken,
    reports: Option<mpsc::Sender<TaskReport>>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ExecutorRegistry>,
        events: EventSink,
        config: EngineConfig,
    ) -> Self {
        Self {
            state: TaskStateMachine::new(store.clone()),
            store,
            registry,
            events,
            config,
            live: Arc::new(RwLock::new(HashMap::new())),
            root: CancellationToken::new(),
            reports: None,
        }
    }

    /// Forward one [`TaskReport`] per finalized run over `tx`. The node
    /// agent uses this to relay terminal outcomes to the control plane.
    /// Reports are only sent for runs this engine finalized itself; a run
    /// settled elsewhere first (watchdog) produces none.
    pub fn with_report_channel(mut self, tx: mpsc::Sender<TaskReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    fn send_report(&self, report: TaskReport) {
        if let Some(tx) = &self.reports {
            if let Err(e) = tx.try_send(report) {
                warn!(error = %e, "dropping task report, channel unavailable");
            }
        }
    }

    /// Admit and start a task.
    ///
    /// Fails fast with [`OrchestrateError::CapacityExhausted`] when the
    /// live set is at the cap, with [`OrchestrateError::ExecutorMissing`]
    /// when no executor handles the type. Delivery is at-least-once, so a
    /// task id that is already live is accepted as a duplicate and
    /// ignored. Returns as soon as the run is spawned.
    pub fn execute_task<'a>(
        &'a self,
        task: Task,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
        if self.root.is_cancelled() {
            return Err(OrchestrateError::ShuttingDown);
        }

        let executor = self
            .registry
            .get(task.task_type)
            .ok_or(OrchestrateError::ExecutorMissing(task.task_type))?;

        match task.status {
            TaskStatus::Queued | TaskStatus::Running => {}
            other => {
                return Err(OrchestrateError::InvalidTransition {
                    task: task.id,
                    from: other,
                    to: TaskStatus::Running,
                });
            }
        }

        let cancel = {
            let mut live = self.live.write().await;
            if live.contains_key(&task.id) {
                debug!(task_id = %task.id, "duplicate delivery of live task, ignoring");
                return Ok(());
            }
            if live.len() >= self.config.max_concurrent_tasks {
                return Err(OrchestrateError::CapacityExhausted {
                    limit: self.config.max_concurrent_tasks,
                });
            }
            let cancel = self.root.child_token();
            live.insert(
                task.id,
                LiveTask {
                    task_type: task.task_type,
                    cancel: cancel.clone(),
                    started_at: Utc::now(),
                },
            );
            cancel
        };

        // Locally admitted tasks still carry `Queued`; drive the dispatch
        // transition here. Tasks arriving from the dispatcher are already
        // `Running` with their node assignment set.
        let task = if task.status == TaskStatus::Queued {
            match dispatch::mark_running(&self.state, task.id, task.node_id.as_deref()).await {
                Ok(task) => task,
                Err(e) => {
                    self.live.write().await.remove(&task.id);
                    return Err(e);
                }
            }
        } else {
            task
        };

        self.events.emit(
            TaskEvent::new(task.id, TaskEventKind::TaskAdmitted, "task admitted").with_payload(
                serde_json::json!({ "attempt": task.retry_count + 1 }),
            ),
        );
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.retry_count + 1,
            "task admitted"
        );

        let engine = self.clone();
        tokio::spawn(async move {
            engine.supervise(task, executor, cancel).await;
        });
        Ok(())
        })
    }

    /// Cancel a live run. Returns `false` when the task is not live.
    pub async fn cancel_task(&self, task_id: Uuid) -> bool {
        let live = self.live.read().await;
        match live.get(&task_id) {
            Some(entry) => {
                info!(task_id = %task_id, "cancelling live task");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Snapshot of all live runs.
    pub async fn get_running(&self) -> Vec<RunningSnapshot> {
        let live = self.live.read().await;
        let mut running: Vec<RunningSnapshot> = live
            .iter()
            .map(|(task_id, entry)| RunningSnapshot {
                task_id: *task_id,
                task_type: entry.task_type,
                started_at: entry.started_at,
            })
            .collect();
        running.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.task_id.cmp(&b.task_id)));
        running
    }

    pub async fn running_count(&self) -> usize {
        self.live.read().await.len()
    }

    /// Stop accepting work, cancel live runs, and wait (bounded by the
    /// cancel grace plus a margin) for them to drain.
    pub async fn shutdown(&self) {
        info!("execution engine shutting down");
        self.root.cancel();

        let deadline =
            tokio::time::Instant::now() + self.config.cancel_grace() + std::time::Duration::from_secs(1);
        loop {
            if self.live.read().await.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let remaining = self.live.read().await.len();
                warn!(remaining, "engine shutdown grace expired with live tasks");
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        info!("execution engine shutdown complete");
    }

    fn progress_callback(&self, task_id: Uuid) -> Arc<dyn Fn(u8) + Send + Sync> {
        let events = self.events.clone();
        let store = self.store.clone();
        Arc::new(move |pct| {
            events.emit(
                TaskEvent::new(task_id, TaskEventKind::TaskProgress, "progress")
                    .with_payload(serde_json::json!({ "progress": pct })),
            );
            let store = store.clone();
            tokio::spawn(async move {
                // Progress only applies to a task that is still running;
                // a late report after the terminal write is dropped.
                match store.find_task(task_id).await {
                    Ok(Some(task)) if task.status == TaskStatus::Running => {
                        let patch = TaskPatch {
                            progress: Some(pct),
                            ..TaskPatch::default()
                        };
                        if let Err(e) = store.update_task_fields(task_id, patch).await {
                            warn!(task_id = %task_id, error = %e, "progress update failed");
                        }
                    }
                    _ => {}
                }
            });
        })
    }

    async fn supervise(
        self,
        task: Task,
        executor: Arc<dyn Executor>,
        cancel: CancellationToken,
    ) {
        let task_id = task.id;
        let run_started = Utc::now();
        let timeout = if task.timeout_secs > 0 {
            std::time::Duration::from_secs(task.timeout_secs)
        } else {
            self.config.default_timeout()
        };

        let ctx = ExecContext::new(cancel.clone(), self.progress_callback(task.id));
        let exec_task = task.clone();
        let mut inner = tokio::spawn(async move { executor.execute(&exec_task, &ctx).await });

        let outcome = tokio::select! {
            joined = &mut inner => match joined {
                Ok(result) => RunOutcome::Finished(result),
                Err(e) if e.is_panic() => RunOutcome::Panicked(format!("{e}")),
                Err(e) => RunOutcome::Panicked(format!("executor task aborted: {e}")),
            },
            _ = tokio::time::sleep(timeout) => RunOutcome::Deadline,
            _ = cancel.cancelled() => RunOutcome::Cancelled,
        };

        // The retry path releases the slot itself (before its interval
        // sleep), so a fresh admission is not clobbered here.
        let slot_released = match outcome {
            RunOutcome::Finished(Ok(output)) => {
                self.finish_success(&task, output, run_started).await;
                false
            }
            RunOutcome::Finished(Err(e)) => {
                self.finish_failure(task, format!("{e:#}"), run_started).await
            }
            RunOutcome::Panicked(message) => {
                error!(task_id = %task_id, error = %message, "executor panicked, recovered");
                self.finish_failure(task, format!("executor panicked: {message}"), run_started)
                    .await
            }
            RunOutcome::Deadline => {
                warn!(task_id = %task_id, timeout_secs = timeout.as_secs(), "run deadline elapsed");
                cancel.cancel();
                self.await_with_grace(&mut inner).await;
                self.finish_terminal(
                    &task,
                    TaskStatus::Timeout,
                    TIMEOUT_ERROR,
                    TaskEventKind::TaskTimeout,
                    run_started,
                )
                .await;
                false
            }
            RunOutcome::Cancelled => {
                self.await_with_grace(&mut inner).await;
                self.finish_terminal(
                    &task,
                    TaskStatus::Cancelled,
                    CANCELLED_ERROR,
                    TaskEventKind::TaskCancelled,
                    run_started,
                )
                .await;
                false
            }
        };

        if !slot_released {
            self.live.write().await.remove(&task_id);
        }
    }

    /// Wait the configured grace period for a cancelled executor to
    /// return; abandon (abort) it if it does not.
    async fn await_with_grace(&self, inner: &mut tokio::task::JoinHandle<anyhow::Result<TaskOutput>>) {
        let grace = self.config.cancel_grace();
        if tokio::time::timeout(grace, &mut *inner).await.is_err() {
            warn!(grace_secs = grace.as_secs(), "executor ignored cancellation, aborting");
            inner.abort();
        }
    }

    async fn finish_success(&self, task: &Task, output: TaskOutput, run_started: DateTime<Utc>) {
        let result = TaskResult::success(task.id, output.data, run_started);
        if !self.persist_result(&result).await {
            return;
        }
        match dispatch::complete_task(&self.state, task.id, result.id).await {
            Ok(_) => {
                self.events.emit(
                    TaskEvent::new(task.id, TaskEventKind::TaskCompleted, "task completed")
                        .with_payload(serde_json::json!({ "result_id": result.id })),
                );
                info!(task_id = %task.id, "task completed");
                self.send_report(TaskReport {
                    task_id: task.id,
                    node_id: task.node_id.clone(),
                    status: TaskStatus::Completed,
                    data: result.data.clone(),
                    error: None,
                    started_at: result.started_at,
                    ended_at: result.ended_at,
                });
            }
            Err(e) => self.log_lost_race(task.id, "completion", &e),
        }
    }

    /// Handle an executor error: retry when policy allows, otherwise fail
    /// terminally. Returns whether the live slot was already released
    /// (the retry path frees it before sleeping out the interval).
    async fn finish_failure(&self, task: Task, message: String, run_started: DateTime<Utc>) -> bool {
        let retryable =
            self.config.enable_retry && task.retry_count < task.max_retries && !self.root.is_cancelled();

        if !retryable {
            let result =
                TaskResult::failure(task.id, TaskStatus::Failed, message.clone(), run_started);
            if !self.persist_result(&result).await {
                return false;
            }
            match dispatch::fail_task(&self.state, task.id, Some(result.id)).await {
                Ok(_) => {
                    self.events.emit(
                        TaskEvent::new(task.id, TaskEventKind::TaskFailed, message.clone())
                            .with_payload(serde_json::json!({ "attempts": task.retry_count + 1 })),
                    );
                    warn!(task_id = %task.id, error = %message, "task failed");
                    self.send_report(TaskReport {
                        task_id: task.id,
                        node_id: task.node_id.clone(),
                        status: TaskStatus::Failed,
                        data: serde_json::Map::new(),
                        error: Some(message),
                        started_at: result.started_at,
                        ended_at: result.ended_at,
                    });
                }
                Err(e) => self.log_lost_race(task.id, "failure", &e),
            }
            return false;
        }

        // Retry: back to queued with the counter bumped, release the slot,
        // wait out the retry interval, then re-enter through admission.
        let requeued = match dispatch::requeue_for_retry(&self.state, &task).await {
            Ok(requeued) => requeued,
            Err(e) => {
                self.log_lost_race(task.id, "retry requeue", &e);
                return false;
            }
        };
        self.events.emit(
            TaskEvent::new(
                task.id,
                TaskEventKind::TaskRetryScheduled,
                format!("retry {}/{} scheduled", requeued.retry_count, task.max_retries),
            )
            .with_payload(serde_json::json!({
                "retry_count": requeued.retry_count,
                "error": message,
            })),
        );
        info!(
            task_id = %task.id,
            retry_count = requeued.retry_count,
            max_retries = task.max_retries,
            error = %message,
            "retry scheduled"
        );

        self.live.write().await.remove(&task.id);

        let engine = self.clone();
        tokio::spawn(async move {
            engine.resubmit_after_interval(requeued).await;
        });
        true
    }

    /// Sleep out the retry interval and re-admit, backing off while the
    /// engine is at capacity. Gives up (leaving the task queued for the
    /// dispatcher) on shutdown.
    async fn resubmit_after_interval(self, task: Task) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_interval()) => {}
                _ = self.root.cancelled() => return,
            }

            // Boxed to break the supervise -> execute_task type cycle.
            let attempt: Pin<Box<dyn Future<Output = Result<()>> + Send>> =
                Box::pin(self.execute_task(task.clone()));
            match attempt.await {
                Ok(()) => return,
                Err(OrchestrateError::CapacityExhausted { .. }) => {
                    debug!(task_id = %task.id, "engine at capacity, retry waits another interval");
                }
                Err(OrchestrateError::ShuttingDown) => return,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "retry resubmission failed");
                    return;
                }
            }
        }
    }

    /// Persist a timeout/cancellation result and drive the matching
    /// terminal transition.
    async fn finish_terminal(
        &self,
        task: &Task,
        status: TaskStatus,
        message: &str,
        kind: TaskEventKind,
        run_started: DateTime<Utc>,
    ) {
        let result = TaskResult::failure(task.id, status, message, run_started);
        if !self.persist_result(&result).await {
            return;
        }
        let transition = match status {
            TaskStatus::Timeout => dispatch::timeout_task(&self.state, task.id, Some(result.id)).await,
            TaskStatus::Cancelled => {
                dispatch::cancel_running(&self.state, task.id, Some(result.id)).await
            }
            _ => unreachable!("finish_terminal only handles timeout and cancelled"),
        };
        match transition {
            Ok(_) => {
                self.events
                    .emit(TaskEvent::new(task.id, kind, message.to_string()));
                warn!(task_id = %task.id, status = %status, "task ended: {message}");
                self.send_report(TaskReport {
                    task_id: task.id,
                    node_id: task.node_id.clone(),
                    status,
                    data: serde_json::Map::new(),
                    error: Some(message.to_string()),
                    started_at: result.started_at,
                    ended_at: result.ended_at,
                });
            }
            Err(e) => self.log_lost_race(task.id, "terminal write", &e),
        }
    }

    /// Insert a result, tolerating a concurrent writer (the dispatcher's
    /// watchdog always takes precedence). Returns whether we won.
    async fn persist_result(&self, result: &TaskResult) -> bool {
        match self.store.insert_result(result).await {
            Ok(()) => true,
            Err(StoreError::Conflict(_)) => {
                debug!(
                    task_id = %result.task_id,
                    "result already persisted by another writer, keeping theirs"
                );
                false
            }
            Err(e) => {
                error!(task_id = %result.task_id, error = %e, "failed to persist result");
                false
            }
        }
    }

    fn log_lost_race(&self, task_id: Uuid, what: &str, error: &OrchestrateError) {
        debug!(
            task_id = %task_id,
            error = %error,
            "{what} skipped, task already transitioned elsewhere"
        );
    }
}
