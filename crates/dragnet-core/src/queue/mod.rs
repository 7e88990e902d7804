//! Named priority queues of pending work.
//!
//! Queues are held in memory for fast arbitration and mirrored into the
//! durable store (descriptor plus member list) on every enqueue/dequeue,
//! so a restarted orchestrator can rebuild exactly what it lost. Strict
//! priority between queues, FIFO within a queue; high-priority queues can
//! starve lower ones, by contract.

pub mod sync;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use dragnet_store::{QueueRecord, Store, Task, TaskEvent, TaskEventKind, TaskStatus, TaskType};

use crate::error::{OrchestrateError, Result};
use crate::events::EventSink;
use crate::state::{TaskStateMachine, dispatch};

struct QueueState {
    record: QueueRecord,
    tasks: VecDeque<Uuid>,
}

/// Manager of all named dispatch queues.
///
/// Construct one per process and share the handle; it owns its own lock.
pub struct QueueManager {
    store: Arc<dyn Store>,
    state: TaskStateMachine,
    events: EventSink,
    queues: RwLock<HashMap<String, QueueState>>,
}

/// Point-in-time view of one queue for the admin surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub name: String,
    pub task_type: TaskType,
    pub priority: i32,
    pub max_size: usize,
    pub depth: usize,
}

impl QueueManager {
    pub fn new(store: Arc<dyn Store>, events: EventSink) -> Self {
        Self {
            state: TaskStateMachine::new(store.clone()),
            store,
            events,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Create a queue in memory and in the durable store.
    ///
    /// Idempotent for an existing queue with the same shape; changing an
    /// existing queue's type or priority is a validation error.
    pub async fn create_queue(
        &self,
        name: &str,
        task_type: TaskType,
        priority: i32,
        max_size: usize,
    ) -> Result<()> {
        let mut queues = self.queues.write().await;
        if let Some(existing) = queues.get(name) {
            let record = &existing.record;
            if record.task_type == task_type
                && record.priority == priority
                && record.max_size == max_size
            {
                return Ok(());
            }
            return Err(OrchestrateError::Validation(format!(
                "queue {name:?} already exists with a different shape"
            )));
        }

        let record = QueueRecord {
            name: name.to_string(),
            task_type,
            priority,
            max_size,
            count: 0,
        };
        match self.store.insert_queue(&record).await {
            Ok(()) => {}
            // Durable record survived a restart; adopt it.
            Err(dragnet_store::StoreError::Conflict(_)) => {}
            Err(e) => return Err(e.into()),
        }
        debug!(queue = %name, task_type = %task_type, priority, "queue created");
        queues.insert(
            name.to_string(),
            QueueState {
                record,
                tasks: VecDeque::new(),
            },
        );
        Ok(())
    }

    /// Resolve the queue that serves a task type.
    ///
    /// When several queues share the type, the highest-priority one (name
    /// as tiebreak) wins.
    pub async fn route(&self, task_type: TaskType) -> Result<String> {
        let queues = self.queues.read().await;
        let mut candidates: Vec<&QueueState> = queues
            .values()
            .filter(|q| q.record.task_type == task_type)
            .collect();
        candidates.sort_by(|a, b| {
            b.record
                .priority
                .cmp(&a.record.priority)
                .then_with(|| a.record.name.cmp(&b.record.name))
        });
        candidates
            .first()
            .map(|q| q.record.name.clone())
            .ok_or_else(|| OrchestrateError::QueueMissing(task_type.to_string()))
    }

    /// Append a task to a queue, mirroring the durable member list, and
    /// transition `pending -> queued` atomically with the durable record.
    ///
    /// A task that is already `Queued` (dependency re-enqueue, retry) is
    /// appended without a second transition.
    pub async fn enqueue(&self, queue_name: &str, task: &Task) -> Result<()> {
        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| OrchestrateError::QueueMissing(queue_name.to_string()))?;

        if queue.record.max_size > 0 && queue.tasks.len() >= queue.record.max_size {
            return Err(OrchestrateError::QueueFull {
                name: queue_name.to_string(),
                size: queue.tasks.len(),
                max_size: queue.record.max_size,
            });
        }

        match task.status {
            TaskStatus::Pending => {
                dispatch::mark_queued(&self.state, task.id).await?;
                self.events.emit(
                    TaskEvent::new(task.id, TaskEventKind::TaskQueued, "task queued")
                        .with_payload(serde_json::json!({ "queue": queue_name })),
                );
            }
            TaskStatus::Queued => {}
            other => {
                return Err(OrchestrateError::InvalidTransition {
                    task: task.id,
                    from: other,
                    to: TaskStatus::Queued,
                });
            }
        }

        self.store.push_queue_task(queue_name, task.id).await?;
        self.store.update_queue_count(queue_name, 1).await?;
        queue.tasks.push_back(task.id);
        queue.record.count = queue.tasks.len();
        Ok(())
    }

    /// Pop the head of the highest-priority non-empty queue.
    ///
    /// Returns the dequeued task record and the queue it came from, or
    /// `None` when every queue is empty. Member ids whose task record has
    /// disappeared are dropped and the scan continues.
    pub async fn dequeue_highest_priority(&self) -> Result<Option<(Task, String)>> {
        let mut queues = self.queues.write().await;
        let mut order: Vec<String> = queues.keys().cloned().collect();
        order.sort_by(|a, b| {
            let pa = queues[a].record.priority;
            let pb = queues[b].record.priority;
            pb.cmp(&pa).then_with(|| a.cmp(b))
        });

        for name in order {
            let queue = queues.get_mut(&name).expect("queue vanished under lock");
            while let Some(task_id) = queue.tasks.pop_front() {
                queue.record.count = queue.tasks.len();
                self.store.remove_queue_task(&name, task_id).await?;
                self.store.update_queue_count(&name, -1).await?;

                match self.store.find_task(task_id).await? {
                    Some(task) => return Ok(Some((task, name))),
                    None => {
                        warn!(queue = %name, task_id = %task_id, "queued task record missing, dropping");
                        continue;
                    }
                }
            }
        }
        Ok(None)
    }

    /// Look up one queue's stats.
    pub async fn get_queue(&self, name: &str) -> Option<QueueStats> {
        let queues = self.queues.read().await;
        queues.get(name).map(|q| QueueStats {
            name: q.record.name.clone(),
            task_type: q.record.task_type,
            priority: q.record.priority,
            max_size: q.record.max_size,
            depth: q.tasks.len(),
        })
    }

    /// Stats for every queue, highest priority first.
    pub async fn stats(&self) -> Vec<QueueStats> {
        let queues = self.queues.read().await;
        let mut stats: Vec<QueueStats> = queues
            .values()
            .map(|q| QueueStats {
                name: q.record.name.clone(),
                task_type: q.record.task_type,
                priority: q.record.priority,
                max_size: q.record.max_size,
                depth: q.tasks.len(),
            })
            .collect();
        stats.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        stats
    }

    /// Total queued tasks across all queues.
    pub async fn depth(&self) -> usize {
        let queues = self.queues.read().await;
        queues.values().map(|q| q.tasks.len()).sum()
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Replace one queue's in-memory sequence. Used by the convergence
    /// sweep after the durable list has been declared authoritative.
    pub(crate) async fn replace_members(&self, name: &str, members: VecDeque<Uuid>) {
        let mut queues = self.queues.write().await;
        if let Some(queue) = queues.get_mut(name) {
            queue.record.count = members.len();
            queue.tasks = members;
        }
    }

    /// Snapshot of one queue's in-memory member sequence.
    pub(crate) async fn members(&self, name: &str) -> Option<Vec<Uuid>> {
        let queues = self.queues.read().await;
        queues.get(name).map(|q| q.tasks.iter().copied().collect())
    }

    /// Names of all known queues.
    pub(crate) async fn names(&self) -> Vec<String> {
        self.queues.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dragnet_store::MemoryStore;

    async fn manager() -> QueueManager {
        QueueManager::new(Arc::new(MemoryStore::new()), EventSink::disconnected())
    }

    async fn queued_task(manager: &QueueManager, name: &str, queue: &str) -> Task {
        let task = Task::new(name, TaskType::PortScan);
        manager.store().insert_task(&task).await.unwrap();
        manager.enqueue(queue, &task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn create_queue_is_idempotent_for_same_shape() {
        let m = manager().await;
        m.create_queue("portscan", TaskType::PortScan, 5, 0)
            .await
            .unwrap();
        m.create_queue("portscan", TaskType::PortScan, 5, 0)
            .await
            .unwrap();

        let err = m
            .create_queue("portscan", TaskType::PortScan, 9, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrateError::Validation(_)));
    }

    #[tokio::test]
    async fn enqueue_missing_queue_fails() {
        let m = manager().await;
        let task = Task::new("t", TaskType::PortScan);
        m.store().insert_task(&task).await.unwrap();
        let err = m.enqueue("ghost", &task).await.unwrap_err();
        assert!(matches!(err, OrchestrateError::QueueMissing(_)));
    }

    #[tokio::test]
    async fn enqueue_full_queue_fails() {
        let m = manager().await;
        m.create_queue("portscan", TaskType::PortScan, 5, 1)
            .await
            .unwrap();
        queued_task(&m, "first", "portscan").await;

        let task = Task::new("second", TaskType::PortScan);
        m.store().insert_task(&task).await.unwrap();
        let err = m.enqueue("portscan", &task).await.unwrap_err();
        assert!(matches!(err, OrchestrateError::QueueFull { .. }));
    }

    #[tokio::test]
    async fn enqueue_transitions_pending_to_queued() {
        let m = manager().await;
        m.create_queue("portscan", TaskType::PortScan, 5, 0)
            .await
            .unwrap();
        let task = queued_task(&m, "t", "portscan").await;

        let stored = m.store().find_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);

        // Durable mirror holds the member.
        let members = m.store().list_queue_tasks("portscan").await.unwrap();
        assert_eq!(members, vec![task.id]);
    }

    #[tokio::test]
    async fn fifo_within_queue() {
        let m = manager().await;
        m.create_queue("portscan", TaskType::PortScan, 5, 0)
            .await
            .unwrap();
        let a = queued_task(&m, "a", "portscan").await;
        let b = queued_task(&m, "b", "portscan").await;

        let (first, _) = m.dequeue_highest_priority().await.unwrap().unwrap();
        let (second, _) = m.dequeue_highest_priority().await.unwrap().unwrap();
        assert_eq!(first.id, a.id);
        assert_eq!(second.id, b.id);
        assert!(m.dequeue_highest_priority().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn strict_priority_between_queues() {
        let m = manager().await;
        m.create_queue("discovery", TaskType::PortScan, 5, 0)
            .await
            .unwrap();
        m.create_queue("vulnscan", TaskType::VulnScan, 10, 0)
            .await
            .unwrap();

        let low = queued_task(&m, "low", "discovery").await;
        let task = Task::new("high", TaskType::VulnScan);
        m.store().insert_task(&task).await.unwrap();
        m.enqueue("vulnscan", &task).await.unwrap();

        let (first, from) = m.dequeue_highest_priority().await.unwrap().unwrap();
        assert_eq!(first.id, task.id);
        assert_eq!(from, "vulnscan");

        let (second, _) = m.dequeue_highest_priority().await.unwrap().unwrap();
        assert_eq!(second.id, low.id);
    }

    #[tokio::test]
    async fn dequeue_mirrors_durable_list() {
        let m = manager().await;
        m.create_queue("portscan", TaskType::PortScan, 5, 0)
            .await
            .unwrap();
        queued_task(&m, "t", "portscan").await;

        m.dequeue_highest_priority().await.unwrap().unwrap();
        assert!(m.store().list_queue_tasks("portscan").await.unwrap().is_empty());
        let queues = m.store().list_queues().await.unwrap();
        assert_eq!(queues[0].count, 0);
    }

    #[tokio::test]
    async fn route_prefers_highest_priority_queue_of_type() {
        let m = manager().await;
        m.create_queue("portscan", TaskType::PortScan, 5, 0)
            .await
            .unwrap();
        m.create_queue("portscan_fast", TaskType::PortScan, 9, 0)
            .await
            .unwrap();

        assert_eq!(m.route(TaskType::PortScan).await.unwrap(), "portscan_fast");
        assert!(matches!(
            m.route(TaskType::WebCrawl).await,
            Err(OrchestrateError::QueueMissing(_))
        ));
    }
}
