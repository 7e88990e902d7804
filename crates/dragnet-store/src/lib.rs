//! Data model and storage contract for the dragnet control plane.
//!
//! The orchestration core only ever talks to persistence through the
//! [`Store`] trait; [`MemoryStore`] is the in-process implementation used
//! in single-node deployments and tests.

pub mod memory;
pub mod models;
pub mod store;

pub use memory::MemoryStore;
pub use models::{
    QueueRecord, ScheduleRule, Task, TaskEvent, TaskEventKind, TaskPriority, TaskResult,
    TaskStatus, TaskType,
};
pub use store::{
    EVENT_BUFFER_CAPACITY, EVENT_BUFFER_TTL_SECS, SortOrder, Store, StoreError, StoreResult,
    TaskFilter, TaskPage, TaskPatch,
};
