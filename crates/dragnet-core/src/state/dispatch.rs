//! Semantic wrappers around [`super::TaskStateMachine`] transitions.

use uuid::Uuid;

use dragnet_store::{Task, TaskPatch, TaskStatus};

use crate::error::Result;

use super::TaskStateMachine;

/// Enqueue a freshly submitted task: `pending -> queued`.
pub async fn mark_queued(sm: &TaskStateMachine, task_id: Uuid) -> Result<Task> {
    sm.transition(
        task_id,
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskPatch::default(),
    )
    .await
}

/// Dispatch a task to a node: `queued -> running`.
///
/// Sets `started_at` and the node assignment in the same write.
pub async fn mark_running(
    sm: &TaskStateMachine,
    task_id: Uuid,
    node_id: Option<&str>,
) -> Result<Task> {
    let patch = TaskPatch {
        node_id: Some(node_id.map(str::to_owned)),
        ..TaskPatch::default()
    };
    sm.transition(task_id, TaskStatus::Queued, TaskStatus::Running, patch)
        .await
}

/// Finish successfully: `running -> completed`, progress 100, result link.
pub async fn complete_task(sm: &TaskStateMachine, task_id: Uuid, result_id: Uuid) -> Result<Task> {
    let patch = TaskPatch {
        progress: Some(100),
        result_id: Some(Some(result_id)),
        ..TaskPatch::default()
    };
    sm.transition(task_id, TaskStatus::Running, TaskStatus::Completed, patch)
        .await
}

/// Terminal failure of a running task: `running -> failed`.
pub async fn fail_task(
    sm: &TaskStateMachine,
    task_id: Uuid,
    result_id: Option<Uuid>,
) -> Result<Task> {
    let patch = TaskPatch {
        result_id: Some(result_id),
        ..TaskPatch::default()
    };
    sm.transition(task_id, TaskStatus::Running, TaskStatus::Failed, patch)
        .await
}

/// Fail a task that never left the queue (`queued -> failed`): no eligible
/// node, unresolvable dependency, or dependency stall.
pub async fn fail_queued(
    sm: &TaskStateMachine,
    task_id: Uuid,
    result_id: Option<Uuid>,
) -> Result<Task> {
    let patch = TaskPatch {
        result_id: Some(result_id),
        ..TaskPatch::default()
    };
    sm.transition(task_id, TaskStatus::Queued, TaskStatus::Failed, patch)
        .await
}

/// Fail a task that was never enqueued (`pending -> failed`): its
/// dependency reached a dead-end before the task could be queued.
pub async fn fail_pending(
    sm: &TaskStateMachine,
    task_id: Uuid,
    result_id: Option<Uuid>,
) -> Result<Task> {
    let patch = TaskPatch {
        result_id: Some(result_id),
        ..TaskPatch::default()
    };
    sm.transition(task_id, TaskStatus::Pending, TaskStatus::Failed, patch)
        .await
}

/// Watchdog expiry: `running -> timeout`.
pub async fn timeout_task(
    sm: &TaskStateMachine,
    task_id: Uuid,
    result_id: Option<Uuid>,
) -> Result<Task> {
    let patch = TaskPatch {
        result_id: Some(result_id),
        ..TaskPatch::default()
    };
    sm.transition(task_id, TaskStatus::Running, TaskStatus::Timeout, patch)
        .await
}

/// Cooperative cancellation of a running task: `running -> cancelled`.
pub async fn cancel_running(
    sm: &TaskStateMachine,
    task_id: Uuid,
    result_id: Option<Uuid>,
) -> Result<Task> {
    let patch = TaskPatch {
        result_id: Some(result_id),
        ..TaskPatch::default()
    };
    sm.transition(task_id, TaskStatus::Running, TaskStatus::Cancelled, patch)
        .await
}

/// Cancel a task still waiting in a queue: `queued -> cancelled`.
pub async fn cancel_queued(
    sm: &TaskStateMachine,
    task_id: Uuid,
    result_id: Option<Uuid>,
) -> Result<Task> {
    let patch = TaskPatch {
        result_id: Some(result_id),
        ..TaskPatch::default()
    };
    sm.transition(task_id, TaskStatus::Queued, TaskStatus::Cancelled, patch)
        .await
}

/// Cancel a task that was never enqueued: `pending -> cancelled`.
pub async fn cancel_pending(
    sm: &TaskStateMachine,
    task_id: Uuid,
    result_id: Option<Uuid>,
) -> Result<Task> {
    let patch = TaskPatch {
        result_id: Some(result_id),
        ..TaskPatch::default()
    };
    sm.transition(task_id, TaskStatus::Pending, TaskStatus::Cancelled, patch)
        .await
}

/// Retryable failure: `running -> queued` with `retry_count` incremented.
///
/// The caller checks retry eligibility (`retry_count < max_retries`)
/// before invoking; this helper re-reads the task to build the increment
/// atomically against the running state.
pub async fn requeue_for_retry(sm: &TaskStateMachine, task: &Task) -> Result<Task> {
    let patch = TaskPatch {
        retry_count: Some(task.retry_count + 1),
        node_id: Some(None),
        progress: Some(0),
        ..TaskPatch::default()
    };
    sm.transition(task.id, TaskStatus::Running, TaskStatus::Queued, patch)
        .await
}
