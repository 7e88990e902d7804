//! The abstract persistent store consumed by the orchestration core.
//!
//! The contract is intentionally narrow: single-document atomic writes,
//! single-leader semantics, read-after-write for the same key. Anything a
//! backend needs beyond that (connection pooling, replication, indexes) is
//! its own business. The in-process [`crate::MemoryStore`] is the reference
//! implementation; a durable backend implements the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    QueueRecord, ScheduleRule, Task, TaskEvent, TaskResult, TaskStatus, TaskType,
};

/// Errors surfaced by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced document does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// A uniqueness or optimistic-concurrency constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend is temporarily unreachable; the caller may retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A document could not be encoded or decoded.
    #[error("serialization: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether a bounded retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Query helpers
// ---------------------------------------------------------------------------

/// Partial update applied to a task document.
///
/// `None` leaves a field untouched. Clearable fields use a nested `Option`:
/// `node_id: Some(None)` clears the node assignment.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub node_id: Option<Option<String>>,
    pub retry_count: Option<u32>,
    pub config: Option<Map<String, Value>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub result_id: Option<Option<Uuid>>,
}

impl TaskPatch {
    /// Apply this patch to a task record in place.
    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(progress) = self.progress {
            task.progress = progress.min(100);
        }
        if let Some(node_id) = &self.node_id {
            task.node_id = node_id.clone();
        }
        if let Some(retry_count) = self.retry_count {
            task.retry_count = retry_count;
        }
        if let Some(config) = &self.config {
            task.config = config.clone();
        }
        if let Some(started_at) = self.started_at {
            task.started_at = started_at;
        }
        if let Some(completed_at) = self.completed_at {
            task.completed_at = completed_at;
        }
        if let Some(result_id) = self.result_id {
            task.result_id = result_id;
        }
    }
}

/// Filter for [`Store::list_tasks`]. All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub project_id: Option<String>,
    pub node_id: Option<String>,
}

impl TaskFilter {
    pub fn by_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(task_type) = self.task_type {
            if task.task_type != task_type {
                return false;
            }
        }
        if let Some(project_id) = &self.project_id {
            if task.project_id.as_deref() != Some(project_id.as_str()) {
                return false;
            }
        }
        if let Some(node_id) = &self.node_id {
            if task.node_id.as_deref() != Some(node_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Sort order for task listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    CreatedAsc,
    #[default]
    CreatedDesc,
}

/// One page of a task listing, with the total match count before paging.
#[derive(Debug, Clone)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

// ---------------------------------------------------------------------------
// The store trait
// ---------------------------------------------------------------------------

/// Durable storage operations the orchestration core consumes.
///
/// Object-safe so components hold `Arc<dyn Store>`. Every write is atomic
/// per document; cross-document consistency is the orchestrator's job.
#[async_trait]
pub trait Store: Send + Sync {
    // -- tasks ------------------------------------------------------------

    /// Insert a new task document. Fails with [`StoreError::Conflict`] if
    /// the id already exists.
    async fn insert_task(&self, task: &Task) -> StoreResult<()>;

    /// Update only status and progress.
    async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        progress: u8,
    ) -> StoreResult<()>;

    /// Conditionally transition a task's status, applying `patch` in the
    /// same atomic write. Fails with [`StoreError::Conflict`] if the stored
    /// status is not `expected`. Returns the updated document.
    ///
    /// This is the optimistic-lock primitive the state machine builds on.
    async fn transition_task_status(
        &self,
        id: Uuid,
        expected: TaskStatus,
        patch: TaskPatch,
    ) -> StoreResult<Task>;

    /// Apply a partial update unconditionally.
    async fn update_task_fields(&self, id: Uuid, patch: TaskPatch) -> StoreResult<()>;

    async fn find_task(&self, id: Uuid) -> StoreResult<Option<Task>>;

    /// List tasks matching `filter`, sorted, paged. `page` is 1-based.
    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: usize,
        page_size: usize,
        sort: SortOrder,
    ) -> StoreResult<TaskPage>;

    async fn delete_task(&self, id: Uuid) -> StoreResult<()>;

    // -- results ----------------------------------------------------------

    /// Insert a task result. At most one result may exist per task;
    /// duplicates fail with [`StoreError::Conflict`].
    async fn insert_result(&self, result: &TaskResult) -> StoreResult<()>;

    async fn find_result_by_task(&self, task_id: Uuid) -> StoreResult<Option<TaskResult>>;

    /// Remove a task's result, if any. Used when a terminal task is
    /// explicitly resubmitted, so its next run can persist a fresh result
    /// without tripping the uniqueness constraint.
    async fn delete_result_by_task(&self, task_id: Uuid) -> StoreResult<()>;

    // -- queues -----------------------------------------------------------

    async fn insert_queue(&self, queue: &QueueRecord) -> StoreResult<()>;

    /// Apply a relative change to a queue's `count`, clamped at zero.
    async fn update_queue_count(&self, name: &str, delta: i64) -> StoreResult<()>;

    async fn list_queues(&self) -> StoreResult<Vec<QueueRecord>>;

    /// Append a task id to the durable member list `task_queue:<name>`.
    async fn push_queue_task(&self, name: &str, task_id: Uuid) -> StoreResult<()>;

    /// Remove a task id from the durable member list.
    async fn remove_queue_task(&self, name: &str, task_id: Uuid) -> StoreResult<()>;

    /// Read the durable member list in order.
    async fn list_queue_tasks(&self, name: &str) -> StoreResult<Vec<Uuid>>;

    // -- schedule rules ---------------------------------------------------

    async fn insert_schedule_rule(&self, rule: &ScheduleRule) -> StoreResult<()>;

    async fn update_schedule_rule(&self, rule: &ScheduleRule) -> StoreResult<()>;

    async fn delete_schedule_rule(&self, id: Uuid) -> StoreResult<()>;

    async fn find_schedule_rule(&self, id: Uuid) -> StoreResult<Option<ScheduleRule>>;

    async fn list_schedule_rules(&self) -> StoreResult<Vec<ScheduleRule>>;

    // -- events -----------------------------------------------------------

    async fn insert_event(&self, event: &TaskEvent) -> StoreResult<()>;

    /// Append an event to the per-task ring buffer, evicting the oldest
    /// entry beyond `capacity` and anything older than `ttl_secs`.
    async fn append_task_event_buffer(
        &self,
        task_id: Uuid,
        event: &TaskEvent,
        capacity: usize,
        ttl_secs: u64,
    ) -> StoreResult<()>;

    /// Read the per-task ring buffer, oldest first.
    async fn list_task_events(&self, task_id: Uuid) -> StoreResult<Vec<TaskEvent>>;
}

/// Default per-task event ring capacity.
pub const EVENT_BUFFER_CAPACITY: usize = 100;

/// Default per-task event retention, 24 hours.
pub const EVENT_BUFFER_TTL_SECS: u64 = 24 * 60 * 60;
