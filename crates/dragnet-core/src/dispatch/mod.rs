//! The dispatcher: bridge between the queues and the node pool.
//!
//! A scheduler loop ticks once a second, draining the priority queues
//! through the dependency gate into an internal bounded channel. Worker
//! loops pull from that channel, pick a node by weighted scoring, publish
//! the assignment on the bus, and arm a timeout watchdog. Terminal
//! reports come back through [`Dispatcher::ingest_report`], which
//! persists the result, settles the state machine, unblocks dependents,
//! and fires the external callback. The tick also rescues tasks whose
//! watchdog was lost to a restart.

pub mod callback;
pub mod deps;
pub mod selection;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dragnet_store::{
    SortOrder, Store, StoreError, Task, TaskEvent, TaskEventKind, TaskFilter, TaskPriority,
    TaskResult, TaskStatus, TaskType,
};

use crate::bus::{CancelRequest, PubSub, TaskEnvelope, assign_channel, cancel_channel};
use crate::config::DispatcherConfig;
use crate::error::{OrchestrateError, Result};
use crate::events::EventSink;
use crate::executor::{ExecutorRegistry, TIMEOUT_ERROR};
use crate::nodes::NodeRegistry;
use crate::params;
use crate::queue::QueueManager;
use crate::retry::store_retry;
use crate::state::{TaskStateMachine, dispatch as transitions};

use deps::DependencyGate;

/// Submission payload for a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub callback_url: Option<String>,
}

impl NewTask {
    pub fn new(name: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            name: name.into(),
            task_type,
            priority: TaskPriority::Normal,
            config: Map::new(),
            depends_on: Vec::new(),
            project_id: None,
            max_retries: 0,
            timeout_secs: 0,
            callback_url: None,
        }
    }
}

pub use crate::bus::TaskReport;

/// Dependency-wait bookkeeping for one queued task.
struct WaitState {
    incomplete: usize,
    ticks: u32,
}

/// The dispatcher. Construct with [`Dispatcher::new`], wire the queue
/// topology with [`install_queue_topology`], then [`Dispatcher::start`].
pub struct Dispatcher {
    store: Arc<dyn Store>,
    queues: Arc<QueueManager>,
    nodes: Arc<NodeRegistry>,
    bus: Arc<dyn PubSub>,
    state: TaskStateMachine,
    events: EventSink,
    config: DispatcherConfig,
    http: reqwest::Client,
    work_tx: mpsc::Sender<Task>,
    work_rx: Mutex<Option<mpsc::Receiver<Task>>>,
    waits: Mutex<HashMap<Uuid, WaitState>>,
    cancel: CancellationToken,
}

/// Create every queue the registered executors route through.
pub async fn install_queue_topology(
    queues: &QueueManager,
    registry: &ExecutorRegistry,
) -> Result<()> {
    for (task_type, descriptor) in registry.descriptors() {
        queues
            .create_queue(&descriptor.queue_name, task_type, descriptor.queue_priority, 0)
            .await?;
    }
    Ok(())
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        queues: Arc<QueueManager>,
        nodes: Arc<NodeRegistry>,
        bus: Arc<dyn PubSub>,
        events: EventSink,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::channel(config.dispatch_channel_capacity.max(1));
        Arc::new(Self {
            state: TaskStateMachine::new(store.clone()),
            store,
            queues,
            nodes,
            bus,
            events,
            config,
            http: reqwest::Client::new(),
            work_tx,
            work_rx: Mutex::new(Some(work_rx)),
            waits: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the scheduler loop and the worker pool.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let rx = self
            .work_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| OrchestrateError::Validation("dispatcher started twice".to_string()))?;
        let rx = Arc::new(Mutex::new(rx));

        for idx in 0..self.config.worker_count.max(1) {
            let dispatcher = Arc::clone(self);
            let rx = Arc::clone(&rx);
            tokio::spawn(async move { dispatcher.worker_loop(idx, rx).await });
        }

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.scheduler_loop().await });
        info!(workers = self.config.worker_count, "dispatcher started");
        Ok(())
    }

    /// Stop the loops. In-flight dispatches finish; queued tasks stay
    /// queued for the next process.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    // -- admin surface ----------------------------------------------------

    /// Validate and accept a task: insert the durable record and enqueue
    /// it on its type's queue. Queue errors surface to the submitter and
    /// leave no record behind.
    pub async fn submit_task(&self, new: NewTask) -> Result<Task> {
        if new.name.trim().is_empty() {
            return Err(OrchestrateError::Validation(
                "task name must not be empty".to_string(),
            ));
        }
        params::validate_config(new.task_type, &new.config)?;

        let mut seen = HashSet::new();
        for dep_id in &new.depends_on {
            if !seen.insert(*dep_id) {
                return Err(OrchestrateError::Validation(format!(
                    "duplicate dependency {dep_id}"
                )));
            }
            if self.store.find_task(*dep_id).await?.is_none() {
                return Err(OrchestrateError::Validation(format!(
                    "dependency {dep_id} does not exist"
                )));
            }
        }

        let queue_name = self.queues.route(new.task_type).await?;

        let mut task = Task::new(new.name, new.task_type);
        task.priority = new.priority;
        task.config = new.config;
        task.depends_on = new.depends_on;
        task.project_id = new.project_id;
        task.max_retries = new.max_retries;
        task.timeout_secs = new.timeout_secs;
        task.callback_url = new.callback_url;

        self.store.insert_task(&task).await?;
        if let Err(e) = self.queues.enqueue(&queue_name, &task).await {
            // Surface the queue error; drop the half-submitted record so
            // the id never shows up as a permanently-pending ghost.
            let _ = self.store.delete_task(task.id).await;
            return Err(e);
        }

        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = %task.priority,
            queue = %queue_name,
            "task submitted"
        );
        self.store
            .find_task(task.id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", task.id).into())
    }

    /// Cancel a task wherever it currently is.
    ///
    /// Pending and queued tasks settle immediately; running tasks get a
    /// cooperative cancel request over the bus and settle when the node
    /// reports (or the watchdog fires).
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<()> {
        let task = self
            .store
            .find_task(task_id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", task_id))?;

        match task.status {
            TaskStatus::Pending => {
                transitions::cancel_pending(&self.state, task_id, None).await?;
                self.persist_cancel_result(&task).await?;
                self.events.emit(TaskEvent::new(
                    task_id,
                    TaskEventKind::TaskCancelled,
                    "cancelled before enqueue",
                ));
                Ok(())
            }
            TaskStatus::Queued => {
                transitions::cancel_queued(&self.state, task_id, None).await?;
                self.persist_cancel_result(&task).await?;
                self.waits.lock().await.remove(&task_id);
                self.events.emit(TaskEvent::new(
                    task_id,
                    TaskEventKind::TaskCancelled,
                    "cancelled while queued",
                ));
                Ok(())
            }
            TaskStatus::Running => {
                let Some(node_id) = task.node_id.as_deref() else {
                    return Err(OrchestrateError::Validation(format!(
                        "running task {task_id} has no node assignment"
                    )));
                };
                let payload = serde_json::to_vec(&CancelRequest { task_id })
                    .map_err(|e| OrchestrateError::Bus(e.to_string()))?;
                self.bus.publish(&cancel_channel(node_id), payload).await?;
                info!(task_id = %task_id, node_id, "cancellation requested");
                Ok(())
            }
            terminal => Err(OrchestrateError::Validation(format!(
                "task {task_id} is already {terminal}"
            ))),
        }
    }

    pub async fn task_status(&self, task_id: Uuid) -> Result<Task> {
        self.store
            .find_task(task_id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", task_id).into())
    }

    /// `(status, progress)` for a task.
    pub async fn task_progress(&self, task_id: Uuid) -> Result<(TaskStatus, u8)> {
        let task = self.task_status(task_id).await?;
        Ok((task.status, task.progress))
    }

    pub async fn list_running(&self) -> Result<Vec<Task>> {
        let page = self
            .store
            .list_tasks(
                &TaskFilter::by_status(TaskStatus::Running),
                1,
                10_000,
                SortOrder::CreatedAsc,
            )
            .await?;
        Ok(page.tasks)
    }

    /// Reopen a terminal task: back to pending and onto its queue.
    pub async fn resubmit_task(&self, task_id: Uuid) -> Result<Task> {
        let task = self.state.resubmit(task_id).await?;
        let queue_name = self.queues.route(task.task_type).await?;
        self.queues.enqueue(&queue_name, &task).await?;
        info!(task_id = %task_id, "terminal task resubmitted");
        self.task_status(task_id).await
    }

    // -- result ingestion -------------------------------------------------

    /// Ingest a terminal report from a worker node.
    ///
    /// Idempotent against the engine finalizing through the shared store
    /// first, and against the watchdog winning the race: whoever writes
    /// the terminal state first sticks, later writers only add the
    /// control-plane side effects that still apply.
    pub async fn ingest_report(&self, report: TaskReport) -> Result<()> {
        let task = self
            .store
            .find_task(report.task_id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", report.task_id))?;

        if task.status.is_terminal() {
            if task.status == report.status {
                // The node-side engine already persisted through the
                // shared store; only the control-plane effects remain.
                // The record's node_id is cleared at terminal, so the
                // slot settles from the report's copy.
                debug!(task_id = %task.id, status = %task.status, "report matches persisted terminal state");
                self.settle_node_slot(report.node_id.as_deref(), task.task_type, task.status)
                    .await;
                self.finalize_terminal(&task).await;
            } else {
                debug!(
                    task_id = %task.id,
                    persisted = %task.status,
                    reported = %report.status,
                    "stale report for settled task, dropping"
                );
            }
            return Ok(());
        }

        if task.status != TaskStatus::Running {
            warn!(
                task_id = %task.id,
                status = %task.status,
                "report for task that is not running, dropping"
            );
            return Ok(());
        }

        if !report.status.is_terminal() {
            warn!(
                task_id = %task.id,
                status = %report.status,
                "non-terminal report status, dropping"
            );
            return Ok(());
        }

        // Retryable failure: no result yet, back onto the queue.
        if report.status == TaskStatus::Failed && task.retry_count < task.max_retries {
            let requeued = transitions::requeue_for_retry(&self.state, &task).await?;
            self.settle_node_slot(task.node_id.as_deref(), task.task_type, TaskStatus::Failed)
                .await;
            let queue_name = self.queues.route(task.task_type).await?;
            self.queues.enqueue(&queue_name, &requeued).await?;
            self.events.emit(
                TaskEvent::new(
                    task.id,
                    TaskEventKind::TaskRetryScheduled,
                    format!(
                        "retry {}/{} scheduled",
                        requeued.retry_count, task.max_retries
                    ),
                )
                .with_payload(serde_json::json!({
                    "retry_count": requeued.retry_count,
                    "error": report.error,
                })),
            );
            info!(
                task_id = %task.id,
                retry_count = requeued.retry_count,
                "failed run requeued for retry"
            );
            return Ok(());
        }

        let result = TaskResult {
            id: Uuid::new_v4(),
            task_id: report.task_id,
            status: report.status,
            data: report.data,
            error: report.error,
            started_at: report.started_at,
            ended_at: report.ended_at,
        };
        let result_id = match store_retry("insert result", || self.store.insert_result(&result)).await
        {
            Ok(()) => Some(result.id),
            Err(StoreError::Conflict(_)) => {
                debug!(task_id = %task.id, "result already persisted, keeping existing");
                self.store
                    .find_result_by_task(task.id)
                    .await?
                    .map(|r| r.id)
            }
            Err(e) => return Err(e.into()),
        };

        let (settled, kind, message) = match report.status {
            TaskStatus::Completed => (
                transitions::complete_task(&self.state, task.id, result_id.unwrap_or(result.id)).await,
                TaskEventKind::TaskCompleted,
                "task completed".to_string(),
            ),
            TaskStatus::Failed => (
                transitions::fail_task(&self.state, task.id, result_id).await,
                TaskEventKind::TaskFailed,
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| "task failed".to_string()),
            ),
            TaskStatus::Cancelled => (
                transitions::cancel_running(&self.state, task.id, result_id).await,
                TaskEventKind::TaskCancelled,
                "task cancelled".to_string(),
            ),
            TaskStatus::Timeout => (
                transitions::timeout_task(&self.state, task.id, result_id).await,
                TaskEventKind::TaskTimeout,
                TIMEOUT_ERROR.to_string(),
            ),
            _ => unreachable!("terminal status checked above"),
        };

        let settled = match settled {
            Ok(task) => task,
            Err(OrchestrateError::Store(StoreError::Conflict(_))) => {
                debug!(task_id = %task.id, "terminal write lost the race, dropping report");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.events.emit(TaskEvent::new(task.id, kind, message));
        self.settle_node_slot(task.node_id.as_deref(), task.task_type, report.status)
            .await;
        self.finalize_terminal(&settled).await;
        Ok(())
    }

    /// Persist and link the error result for a task cancelled before
    /// dispatch. Runs after the terminal transition has won, so a racing
    /// dispatch can never leave a cancellation result on a live task.
    async fn persist_cancel_result(&self, task: &Task) -> Result<()> {
        let started = task.started_at.unwrap_or_else(Utc::now);
        let result = TaskResult::failure(
            task.id,
            TaskStatus::Cancelled,
            crate::executor::CANCELLED_ERROR,
            started,
        );
        match store_retry("insert result", || self.store.insert_result(&result)).await {
            Ok(()) => {
                self.store
                    .update_task_fields(
                        task.id,
                        dragnet_store::TaskPatch {
                            result_id: Some(Some(result.id)),
                            ..dragnet_store::TaskPatch::default()
                        },
                    )
                    .await?;
                Ok(())
            }
            Err(StoreError::Conflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Release the node slot held by a run, crediting affinity history on
    /// success.
    async fn settle_node_slot(
        &self,
        node_id: Option<&str>,
        task_type: TaskType,
        status: TaskStatus,
    ) {
        if let Some(node_id) = node_id {
            if status == TaskStatus::Completed {
                self.nodes.record_completion(node_id, task_type).await;
            } else {
                self.nodes.release(node_id).await;
            }
        }
    }

    /// Post-terminal side effects: dependent unblocking and the external
    /// callback. Both are spawned; finalization never blocks on them.
    async fn finalize_terminal(&self, task: &Task) {
        self.waits.lock().await.remove(&task.id);

        if let Some(url) = task.callback_url.clone() {
            let result = match self.store.find_result_by_task(task.id).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "result lookup for callback failed");
                    None
                }
            };
            let summary = callback::TaskSummary::from_task(task, result.as_ref());
            let client = self.http.clone();
            tokio::spawn(async move {
                callback::post_summary(&client, &url, &summary).await;
            });
        }

        if task.status == TaskStatus::Completed {
            if let Err(e) = self.unblock_pending_dependents(task.id).await {
                warn!(task_id = %task.id, error = %e, "dependent scan failed");
            }
        }
    }

    /// Re-evaluate `Pending` tasks that depend on a just-completed task
    /// and enqueue the ones whose gate now opens.
    async fn unblock_pending_dependents(&self, completed_id: Uuid) -> Result<()> {
        for dependent in deps::pending_dependents(&self.store, completed_id).await? {
            match deps::evaluate(&self.store, &dependent).await? {
                DependencyGate::Ready(_) => {
                    let queue_name = self.queues.route(dependent.task_type).await?;
                    match self.queues.enqueue(&queue_name, &dependent).await {
                        Ok(()) => {
                            info!(task_id = %dependent.id, "pending dependent unblocked");
                        }
                        Err(OrchestrateError::QueueFull { .. }) => {
                            debug!(task_id = %dependent.id, "queue still full, dependent stays pending");
                        }
                        Err(e) => return Err(e),
                    }
                }
                DependencyGate::Unresolvable { dep, status } => {
                    self.fail_unresolvable(&dependent, dep, status).await?;
                }
                DependencyGate::Waiting { .. } => {}
            }
        }
        Ok(())
    }

    // -- scheduler --------------------------------------------------------

    async fn scheduler_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("scheduler loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => break,
            }
            if let Err(e) = self.scheduler_pass().await {
                error!(error = %e, "scheduler pass failed");
            }
            if let Err(e) = self.rescue_stuck_tasks().await {
                error!(error = %e, "stuck-task rescue failed");
            }
        }
        info!("scheduler loop stopped");
    }

    /// One pass: drain the queues through the dependency gate into the
    /// worker channel. Dependency-waiting tasks go back to their queue's
    /// tail; the pass ends once it meets a task it already requeued (or
    /// hits the requeue bound), so waiting work cannot busy-loop the
    /// scheduler.
    async fn scheduler_pass(&self) -> Result<()> {
        let mut requeued_this_pass: HashSet<Uuid> = HashSet::new();

        loop {
            if requeued_this_pass.len() >= self.config.dependency_requeue_limit {
                break;
            }
            let Some((task, queue_name)) = self.queues.dequeue_highest_priority().await? else {
                break;
            };
            if requeued_this_pass.contains(&task.id) {
                // Wrapped around to work we already requeued this pass.
                self.queues.enqueue(&queue_name, &task).await?;
                break;
            }
            if task.status != TaskStatus::Queued {
                debug!(task_id = %task.id, status = %task.status, "dropping settled task from queue");
                continue;
            }

            match deps::evaluate(&self.store, &task).await? {
                DependencyGate::Ready(data) => {
                    self.waits.lock().await.remove(&task.id);
                    let task = self.materialize_dependency_data(task, data).await?;
                    if let Err(send_error) = self.work_tx.send(task).await {
                        // Workers are gone (shutdown); put the task back
                        // so the durable queue still owns it.
                        self.queues.enqueue(&queue_name, &send_error.0).await?;
                        break;
                    }
                }
                DependencyGate::Waiting { incomplete } => {
                    if self.note_wait(&task, incomplete.len()).await {
                        self.fail_stalled(&task).await?;
                    } else {
                        self.queues.enqueue(&queue_name, &task).await?;
                        requeued_this_pass.insert(task.id);
                    }
                }
                DependencyGate::Unresolvable { dep, status } => {
                    self.fail_unresolvable(&task, dep, status).await?;
                }
            }
        }
        Ok(())
    }

    /// Merge upstream results into the task's config, persisting before
    /// dispatch so the executor and the record agree.
    async fn materialize_dependency_data(
        &self,
        mut task: Task,
        data: Vec<(Uuid, Map<String, Value>)>,
    ) -> Result<Task> {
        if data.is_empty() {
            return Ok(task);
        }
        deps::merge_dependency_data(&mut task.config, data);
        self.store
            .update_task_fields(
                task.id,
                dragnet_store::TaskPatch {
                    config: Some(task.config.clone()),
                    ..dragnet_store::TaskPatch::default()
                },
            )
            .await?;
        Ok(task)
    }

    /// Record a waiting observation; returns whether the task has stalled
    /// past the tick bound without any dependency progress.
    async fn note_wait(&self, task: &Task, incomplete: usize) -> bool {
        let mut waits = self.waits.lock().await;
        let entry = waits.entry(task.id).or_insert(WaitState {
            incomplete,
            ticks: 0,
        });
        if incomplete < entry.incomplete {
            // A dependency finished since last look; that is progress.
            entry.incomplete = incomplete;
            entry.ticks = 0;
        }
        entry.ticks += 1;
        entry.ticks >= self.config.dependency_stall_ticks
    }

    async fn fail_stalled(&self, task: &Task) -> Result<()> {
        let ticks = self.config.dependency_stall_ticks;
        let err = OrchestrateError::DependencyStalled {
            task: task.id,
            ticks,
        };
        warn!(task_id = %task.id, ticks, "dependency wait stalled, failing task");
        self.fail_before_dispatch(task, err.to_string()).await
    }

    async fn fail_unresolvable(
        &self,
        task: &Task,
        dep: Uuid,
        status: Option<TaskStatus>,
    ) -> Result<()> {
        let message = match status {
            Some(status) => OrchestrateError::DependencyUnresolvable {
                task: task.id,
                dep,
                status,
            }
            .to_string(),
            None => format!(
                "dependency {dep} of task {} does not exist; upstream dependency did not complete",
                task.id
            ),
        };
        warn!(task_id = %task.id, dep = %dep, "unresolvable dependency, failing task");
        self.fail_before_dispatch(task, message).await
    }

    /// Fail a task that never dispatched (queued or pending), persisting
    /// an error result and running the terminal side effects.
    async fn fail_before_dispatch(&self, task: &Task, message: String) -> Result<()> {
        let started = task.started_at.unwrap_or_else(Utc::now);
        let result = TaskResult::failure(task.id, TaskStatus::Failed, message.clone(), started);
        let result_id = match store_retry("insert result", || self.store.insert_result(&result)).await
        {
            Ok(()) => Some(result.id),
            Err(StoreError::Conflict(_)) => None,
            Err(e) => return Err(e.into()),
        };

        let settled = match task.status {
            TaskStatus::Pending => transitions::fail_pending(&self.state, task.id, result_id).await,
            _ => transitions::fail_queued(&self.state, task.id, result_id).await,
        };
        let settled = match settled {
            Ok(settled) => settled,
            Err(OrchestrateError::Store(StoreError::Conflict(_))) => {
                debug!(task_id = %task.id, "task settled elsewhere during failure write");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.events.emit(TaskEvent::new(
            task.id,
            TaskEventKind::TaskFailed,
            message,
        ));
        Box::pin(self.finalize_terminal(&settled)).await;
        Ok(())
    }

    /// Rescue pass for tasks stuck in `Running` past their deadline with
    /// no live watchdog (control-plane restart, node lost mid-dispatch).
    async fn rescue_stuck_tasks(&self) -> Result<()> {
        let running = self.list_running().await?;
        let now = Utc::now();
        for task in running {
            let timeout_secs = if task.timeout_secs > 0 {
                task.timeout_secs
            } else {
                self.config.default_timeout_secs
            };
            let Some(started_at) = task.started_at else {
                continue;
            };
            let deadline = started_at + chrono::Duration::seconds(timeout_secs as i64);
            // Active watchdogs fire on time; the rescue only reaps runs
            // that outlived their deadline by a full extra tick interval.
            if now > deadline + chrono::Duration::seconds(self.config.tick_interval_secs as i64) {
                self.expire_running_task(&task).await;
            }
        }
        Ok(())
    }

    /// Drive a running task to `Timeout`: error result, transition,
    /// worker-side cancel request, node slot release.
    async fn expire_running_task(&self, task: &Task) {
        let started = task.started_at.unwrap_or_else(Utc::now);
        let result = TaskResult::failure(task.id, TaskStatus::Timeout, TIMEOUT_ERROR, started);
        let result_id = match store_retry("insert result", || self.store.insert_result(&result)).await
        {
            Ok(()) => Some(result.id),
            Err(StoreError::Conflict(_)) => None,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "failed to persist timeout result");
                return;
            }
        };

        match transitions::timeout_task(&self.state, task.id, result_id).await {
            Ok(settled) => {
                warn!(task_id = %task.id, "task timed out");
                self.events.emit(TaskEvent::new(
                    task.id,
                    TaskEventKind::TaskTimeout,
                    TIMEOUT_ERROR,
                ));
                if let Some(node_id) = task.node_id.as_deref() {
                    let payload = serde_json::to_vec(&CancelRequest { task_id: task.id })
                        .expect("cancel request serializes");
                    if let Err(e) = self.bus.publish(&cancel_channel(node_id), payload).await {
                        warn!(task_id = %task.id, node_id, error = %e, "timeout cancel publish failed");
                    }
                }
                self.settle_node_slot(task.node_id.as_deref(), task.task_type, TaskStatus::Timeout)
                    .await;
                self.finalize_terminal(&settled).await;
            }
            Err(OrchestrateError::Store(StoreError::Conflict(_))) => {
                debug!(task_id = %task.id, "task settled before timeout write");
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "timeout transition failed");
            }
        }
    }

    // -- workers ----------------------------------------------------------

    async fn worker_loop(self: Arc<Self>, idx: usize, rx: Arc<Mutex<mpsc::Receiver<Task>>>) {
        debug!(worker = idx, "dispatch worker started");
        loop {
            let task = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    task = rx.recv() => task,
                    _ = self.cancel.cancelled() => None,
                }
            };
            let Some(task) = task else { break };
            if let Err(e) = self.dispatch_one(task).await {
                error!(worker = idx, error = %e, "dispatch failed");
            }
        }
        debug!(worker = idx, "dispatch worker stopped");
    }

    /// Place one gate-cleared task: pick a node, mark running, publish
    /// the assignment, arm the watchdog.
    async fn dispatch_one(self: &Arc<Self>, task: Task) -> Result<()> {
        // The task may have been cancelled between the gate and here.
        let Some(current) = self.store.find_task(task.id).await? else {
            return Ok(());
        };
        if current.status != TaskStatus::Queued {
            debug!(task_id = %task.id, status = %current.status, "task settled before dispatch");
            return Ok(());
        }

        let snapshot = self.nodes.online_snapshot().await;
        let Some(node) = selection::select_node(&task, &snapshot) else {
            // No online node advertises the type at all: terminal. Nodes
            // that are merely at capacity are backpressure; the task goes
            // back to its queue for a later tick.
            if snapshot.iter().any(|n| n.accepts(task.task_type)) {
                debug!(task_id = %task.id, "capable nodes all at capacity, requeueing");
                let queue_name = self.queues.route(task.task_type).await?;
                self.queues.enqueue(&queue_name, &task).await?;
                return Ok(());
            }
            let err = OrchestrateError::NoEligibleNode(task.task_type);
            warn!(task_id = %task.id, task_type = %task.task_type, "no eligible node");
            return self.fail_before_dispatch(&task, err.to_string()).await;
        };
        let node_id = node.node_id.clone();

        let running =
            match transitions::mark_running(&self.state, task.id, Some(&node_id)).await {
                Ok(running) => running,
                Err(OrchestrateError::Store(StoreError::Conflict(_))) => {
                    debug!(task_id = %task.id, "task settled during node selection");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
        self.nodes.record_dispatch(&node_id).await;

        let envelope = TaskEnvelope {
            task: running.clone(),
            node_id: node_id.clone(),
        };
        let payload =
            serde_json::to_vec(&envelope).map_err(|e| OrchestrateError::Bus(e.to_string()))?;
        if let Err(e) = self.bus.publish(&assign_channel(&node_id), payload).await {
            // The assignment never left the control plane; the watchdog
            // below rescues the task at its deadline.
            warn!(task_id = %task.id, node_id, error = %e, "assign publish failed");
        }

        self.events.emit(
            TaskEvent::new(task.id, TaskEventKind::TaskAssigned, "task assigned")
                .with_payload(serde_json::json!({ "node_id": node_id })),
        );
        info!(task_id = %task.id, node_id, "task dispatched");

        let timeout_secs = if running.timeout_secs > 0 {
            running.timeout_secs
        } else {
            self.config.default_timeout_secs
        };
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.watchdog(running.id, timeout_secs).await;
        });
        Ok(())
    }

    /// Per-dispatch timeout watchdog. Fires only if the task is still
    /// `Running` at the deadline; the terminal write settles the race
    /// with any late executor, and the watchdog always takes precedence
    /// over a later completion.
    async fn watchdog(self: Arc<Self>, task_id: Uuid, timeout_secs: u64) {
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(timeout_secs)) => {}
            _ = self.cancel.cancelled() => return,
        }
        match self.store.find_task(task_id).await {
            Ok(Some(task)) if task.status == TaskStatus::Running => {
                self.expire_running_task(&task).await;
            }
            Ok(_) => {}
            Err(e) => warn!(task_id = %task_id, error = %e, "watchdog lookup failed"),
        }
    }
}
