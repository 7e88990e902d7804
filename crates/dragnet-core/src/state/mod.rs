//! Task state machine transitions.
//!
//! Validates and executes status transitions for tasks, enforcing the
//! allowed transition graph, optimistic locking through the store's
//! conditional update, timestamp management, and the task-record
//! invariants (`node_id` set exactly while running, `completed_at` set
//! exactly at terminal).

pub mod dispatch;

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use dragnet_store::{Store, StoreError, TaskPatch, TaskStatus};

use crate::error::{OrchestrateError, Result};

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending   -> queued               (enqueue)
/// pending   -> cancelled            (operator cancel before enqueue)
/// pending   -> failed               (dependency dead-end before enqueue)
/// queued    -> running              (dispatch)
/// queued    -> failed               (no eligible node / dependency dead-end)
/// queued    -> cancelled            (operator cancel while waiting)
/// running   -> completed
/// running   -> failed
/// running   -> timeout              (watchdog)
/// running   -> cancelled
/// running   -> queued               (retryable failure, retry_count++)
/// terminal  -> pending              (explicit retry resubmission only)
/// ```
#[derive(Clone)]
pub struct TaskStateMachine {
    store: Arc<dyn Store>,
}

impl TaskStateMachine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Check whether `from -> to` is an edge in the state graph.
    ///
    /// Terminal -> `Pending` is legal only through [`Self::resubmit`]; it
    /// is included here so observers agree on the full graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        if from.is_terminal() {
            return to == TaskStatus::Pending;
        }
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Queued)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Queued, TaskStatus::Failed)
                | (TaskStatus::Queued, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Timeout)
                | (TaskStatus::Running, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Queued)
        )
    }

    /// Execute a transition with optimistic locking.
    ///
    /// Builds the patch the target state requires:
    /// - entering `Running` sets `started_at` and resets `progress`;
    /// - entering a terminal state sets `completed_at` and clears
    ///   `node_id`;
    /// - the retry edge `Running -> Queued` goes through
    ///   [`dispatch::requeue_for_retry`], which also bumps the counter.
    ///
    /// `extra` is merged into the computed patch so callers can attach
    /// `node_id` or `result_id` in the same atomic write.
    pub async fn transition(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        extra: TaskPatch,
    ) -> Result<dragnet_store::Task> {
        if !Self::is_valid_transition(from, to) {
            return Err(OrchestrateError::InvalidTransition {
                task: task_id,
                from,
                to,
            });
        }

        let mut patch = extra;
        patch.status = Some(to);

        if to == TaskStatus::Running {
            patch.started_at = Some(Some(Utc::now()));
            patch.progress.get_or_insert(0);
        }

        if to.is_terminal() {
            patch.completed_at = Some(Some(Utc::now()));
            patch.node_id = Some(None);
        }

        let task = self
            .store
            .transition_task_status(task_id, from, patch)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(msg) => StoreError::Conflict(format!(
                    "optimistic lock failed transitioning task {task_id} {from} -> {to}: {msg}"
                ))
                .into(),
                other => OrchestrateError::Store(other),
            })?;

        tracing::debug!(
            task_id = %task_id,
            from = %from,
            to = %to,
            "task state transition"
        );

        Ok(task)
    }

    /// Resubmit a terminal task: back to `Pending` with counters reset.
    ///
    /// The explicit operator path out of the terminal set. The task keeps
    /// its id, config, and dependency edges; retry and progress counters
    /// start over and any prior `completed_at` is cleared.
    pub async fn resubmit(&self, task_id: Uuid) -> Result<dragnet_store::Task> {
        let task = self
            .store
            .find_task(task_id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", task_id))?;

        if !task.status.is_terminal() {
            return Err(OrchestrateError::InvalidTransition {
                task: task_id,
                from: task.status,
                to: TaskStatus::Pending,
            });
        }

        // Drop the stale result so the next run can persist its own
        // without tripping the one-result-per-task constraint.
        self.store.delete_result_by_task(task_id).await?;

        let patch = TaskPatch {
            retry_count: Some(0),
            progress: Some(0),
            started_at: Some(None),
            completed_at: Some(None),
            result_id: Some(None),
            ..TaskPatch::default()
        };
        self.transition(task_id, task.status, TaskStatus::Pending, patch)
            .await
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}
