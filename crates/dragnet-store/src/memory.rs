//! In-process reference implementation of the [`Store`] trait.
//!
//! Backed by `tokio::sync::RwLock`-guarded maps. Every write takes the
//! write lock for the duration of one document mutation, which gives the
//! per-document atomicity and read-after-write ordering the contract asks
//! for. Suitable for single-process deployments and tests; a durable
//! backend replaces this behind the same trait.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{QueueRecord, ScheduleRule, Task, TaskEvent, TaskResult, TaskStatus};
use crate::store::{
    SortOrder, Store, StoreError, StoreResult, TaskFilter, TaskPage, TaskPatch,
};

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, Task>,
    results: HashMap<Uuid, TaskResult>,
    results_by_task: HashMap<Uuid, Uuid>,
    queues: HashMap<String, QueueRecord>,
    /// Durable queue member lists, keyed by queue name (the `task_queue:`
    /// prefix is a backend detail; the memory store keys by bare name).
    queue_tasks: HashMap<String, Vec<Uuid>>,
    rules: HashMap<Uuid, ScheduleRule>,
    events: Vec<TaskEvent>,
    task_event_buffers: HashMap<Uuid, VecDeque<TaskEvent>>,
}

/// In-memory, single-leader store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of events persisted to the flat event log.
    ///
    /// Test observability; the flat log has no read API in the contract.
    pub async fn event_log_len(&self) -> usize {
        self.inner.read().await.events.len()
    }

    /// Events persisted to the flat log for one task, oldest first.
    pub async fn events_for_task(&self, task_id: Uuid) -> Vec<TaskEvent> {
        self.inner
            .read()
            .await
            .events
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_task(&self, task: &Task) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!(
                "task {} already exists",
                task.id
            )));
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        progress: u8,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("task", id))?;
        task.status = status;
        task.progress = progress.min(100);
        Ok(())
    }

    async fn transition_task_status(
        &self,
        id: Uuid,
        expected: TaskStatus,
        patch: TaskPatch,
    ) -> StoreResult<Task> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("task", id))?;
        if task.status != expected {
            return Err(StoreError::Conflict(format!(
                "task {} has status {}, expected {}",
                id, task.status, expected
            )));
        }
        patch.apply(task);
        Ok(task.clone())
    }

    async fn update_task_fields(&self, id: Uuid, patch: TaskPatch) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("task", id))?;
        patch.apply(task);
        Ok(())
    }

    async fn find_task(&self, id: Uuid) -> StoreResult<Option<Task>> {
        Ok(self.inner.read().await.tasks.get(&id).cloned())
    }

    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: usize,
        page_size: usize,
        sort: SortOrder,
    ) -> StoreResult<TaskPage> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        match sort {
            SortOrder::CreatedAsc => {
                tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            }
            SortOrder::CreatedDesc => {
                tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)))
            }
        }
        let total = tasks.len();
        let page = page.max(1);
        let page_size = page_size.max(1);
        let start = (page - 1).saturating_mul(page_size);
        let tasks = if start >= tasks.len() {
            Vec::new()
        } else {
            tasks[start..(start + page_size).min(total)].to_vec()
        };
        Ok(TaskPage {
            tasks,
            total,
            page,
            page_size,
        })
    }

    async fn delete_task(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .tasks
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("task", id))?;
        inner.task_event_buffers.remove(&id);
        Ok(())
    }

    async fn insert_result(&self, result: &TaskResult) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.results_by_task.contains_key(&result.task_id) {
            return Err(StoreError::Conflict(format!(
                "task {} already has a result",
                result.task_id
            )));
        }
        inner.results_by_task.insert(result.task_id, result.id);
        inner.results.insert(result.id, result.clone());
        Ok(())
    }

    async fn find_result_by_task(&self, task_id: Uuid) -> StoreResult<Option<TaskResult>> {
        let inner = self.inner.read().await;
        Ok(inner
            .results_by_task
            .get(&task_id)
            .and_then(|rid| inner.results.get(rid))
            .cloned())
    }

    async fn delete_result_by_task(&self, task_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(result_id) = inner.results_by_task.remove(&task_id) {
            inner.results.remove(&result_id);
        }
        Ok(())
    }

    async fn insert_queue(&self, queue: &QueueRecord) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.queues.contains_key(&queue.name) {
            return Err(StoreError::Conflict(format!(
                "queue {:?} already exists",
                queue.name
            )));
        }
        inner.queues.insert(queue.name.clone(), queue.clone());
        inner.queue_tasks.entry(queue.name.clone()).or_default();
        Ok(())
    }

    async fn update_queue_count(&self, name: &str, delta: i64) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let queue = inner
            .queues
            .get_mut(name)
            .ok_or_else(|| StoreError::not_found("queue", name))?;
        let count = queue.count as i64 + delta;
        queue.count = count.max(0) as usize;
        Ok(())
    }

    async fn list_queues(&self) -> StoreResult<Vec<QueueRecord>> {
        let inner = self.inner.read().await;
        let mut queues: Vec<QueueRecord> = inner.queues.values().cloned().collect();
        queues.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.name.cmp(&b.name)));
        Ok(queues)
    }

    async fn push_queue_task(&self, name: &str, task_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.queues.contains_key(name) {
            return Err(StoreError::not_found("queue", name));
        }
        inner
            .queue_tasks
            .entry(name.to_string())
            .or_default()
            .push(task_id);
        Ok(())
    }

    async fn remove_queue_task(&self, name: &str, task_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let list = inner
            .queue_tasks
            .get_mut(name)
            .ok_or_else(|| StoreError::not_found("queue", name))?;
        if let Some(pos) = list.iter().position(|id| *id == task_id) {
            list.remove(pos);
        }
        Ok(())
    }

    async fn list_queue_tasks(&self, name: &str) -> StoreResult<Vec<Uuid>> {
        let inner = self.inner.read().await;
        Ok(inner.queue_tasks.get(name).cloned().unwrap_or_default())
    }

    async fn insert_schedule_rule(&self, rule: &ScheduleRule) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.rules.contains_key(&rule.id) {
            return Err(StoreError::Conflict(format!(
                "schedule rule {} already exists",
                rule.id
            )));
        }
        inner.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn update_schedule_rule(&self, rule: &ScheduleRule) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.rules.contains_key(&rule.id) {
            return Err(StoreError::not_found("schedule rule", rule.id));
        }
        inner.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn delete_schedule_rule(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .rules
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("schedule rule", id))?;
        Ok(())
    }

    async fn find_schedule_rule(&self, id: Uuid) -> StoreResult<Option<ScheduleRule>> {
        Ok(self.inner.read().await.rules.get(&id).cloned())
    }

    async fn list_schedule_rules(&self) -> StoreResult<Vec<ScheduleRule>> {
        let inner = self.inner.read().await;
        let mut rules: Vec<ScheduleRule> = inner.rules.values().cloned().collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rules)
    }

    async fn insert_event(&self, event: &TaskEvent) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.events.push(event.clone());
        Ok(())
    }

    async fn append_task_event_buffer(
        &self,
        task_id: Uuid,
        event: &TaskEvent,
        capacity: usize,
        ttl_secs: u64,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let buffer = inner.task_event_buffers.entry(task_id).or_default();
        buffer.push_back(event.clone());
        let cutoff = Utc::now() - Duration::seconds(ttl_secs as i64);
        while let Some(front) = buffer.front() {
            if front.recorded_at < cutoff {
                buffer.pop_front();
            } else {
                break;
            }
        }
        while capacity > 0 && buffer.len() > capacity {
            buffer.pop_front();
        }
        Ok(())
    }

    async fn list_task_events(&self, task_id: Uuid) -> StoreResult<Vec<TaskEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .task_event_buffers
            .get(&task_id)
            .map(|buf| buf.iter().cloned().collect())
            .unwrap_or_default())
    }
}
