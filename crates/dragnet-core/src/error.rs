//! Error taxonomy for the orchestration core.
//!
//! Submission-time problems surface synchronously through these variants;
//! anything that happens after a task is queued is encoded as task state
//! (a terminal status plus an error result) rather than propagated as an
//! `Err` to some distant caller.

use dragnet_store::{StoreError, TaskStatus, TaskType};
use uuid::Uuid;

/// Errors produced by the queue manager, execution engine, dispatcher, and
/// cron scheduler.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrateError {
    /// Bad task payload, missing required fields, bad cron expression.
    /// Reported synchronously to the submitter; never enqueued.
    #[error("validation: {0}")]
    Validation(String),

    /// No queue is registered under the requested name or task type.
    #[error("queue {0:?} does not exist")]
    QueueMissing(String),

    /// The queue has reached its configured `max_size`.
    #[error("queue {name:?} is full ({size}/{max_size})")]
    QueueFull {
        name: String,
        size: usize,
        max_size: usize,
    },

    /// The execution engine is at `max_concurrent_tasks`. The task stays
    /// queued; the scheduler retries on a later tick.
    #[error("execution engine at capacity ({limit} running)")]
    CapacityExhausted { limit: usize },

    /// No registered executor handles this task type.
    #[error("no executor registered for task type {0}")]
    ExecutorMissing(TaskType),

    /// The executor returned an error (or panicked; panics are recovered
    /// and reported through this variant).
    #[error("executor failed: {0}")]
    ExecutorFailure(String),

    /// No online node advertises the task type with spare capacity.
    #[error("no eligible node for task type {0}")]
    NoEligibleNode(TaskType),

    /// A dependency finished in a terminal state other than `Completed`.
    #[error("dependency {dep} of task {task} ended {status}; upstream dependency did not complete")]
    DependencyUnresolvable {
        task: Uuid,
        dep: Uuid,
        status: TaskStatus,
    },

    /// A dependency-waiting task made no progress across the configured
    /// number of scheduler ticks (cycle or permanently stuck upstream).
    #[error("task {task} waited {ticks} scheduler ticks with no dependency progress")]
    DependencyStalled { task: Uuid, ticks: u32 },

    /// A state transition outside the legal graph was requested.
    #[error("invalid state transition {from} -> {to} for task {task}")]
    InvalidTransition {
        task: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Pub/sub publish or subscribe failure.
    #[error("bus: {0}")]
    Bus(String),

    /// Schedule rule bookkeeping failure.
    #[error("cron: {0}")]
    Cron(String),

    /// The component is shutting down and rejects new work.
    #[error("shutting down")]
    ShuttingDown,
}

impl OrchestrateError {
    /// Whether the scheduler should simply try again on a later tick
    /// instead of failing the task.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::CapacityExhausted { .. })
    }
}

pub type Result<T> = std::result::Result<T, OrchestrateError>;
