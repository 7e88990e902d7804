//! Dependency resolution.
//!
//! A task is eligible to dispatch only when every task it depends on
//! exists, is `Completed`, and has a persisted result. When the gate
//! opens, the upstream results are materialized into the dependent's
//! config under `dependencyData` so executors can consume them without
//! re-fetching.

use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use dragnet_store::{Store, Task, TaskStatus};

use crate::error::Result;
use crate::params::DEPENDENCY_DATA_KEY;

/// Outcome of evaluating a task's dependency gate.
#[derive(Debug)]
pub enum DependencyGate {
    /// Every dependency completed; carries `(dep_id, result_data)` pairs
    /// ready to merge into the dependent's config.
    Ready(Vec<(Uuid, Map<String, Value>)>),
    /// At least one dependency has not finished yet.
    Waiting { incomplete: Vec<Uuid> },
    /// A dependency ended in a terminal state other than `Completed`, or
    /// no longer exists; the dependent can never run.
    Unresolvable { dep: Uuid, status: Option<TaskStatus> },
}

/// Evaluate the dependency gate for a task.
pub async fn evaluate(store: &Arc<dyn Store>, task: &Task) -> Result<DependencyGate> {
    let mut ready = Vec::with_capacity(task.depends_on.len());
    let mut incomplete = Vec::new();

    for dep_id in &task.depends_on {
        let dep = match store.find_task(*dep_id).await? {
            Some(dep) => dep,
            None => {
                return Ok(DependencyGate::Unresolvable {
                    dep: *dep_id,
                    status: None,
                });
            }
        };

        match dep.status {
            TaskStatus::Completed => match store.find_result_by_task(*dep_id).await? {
                Some(result) => ready.push((*dep_id, result.data)),
                // Completed status but the result write has not landed
                // yet; the dependent keeps waiting for the durable write.
                None => incomplete.push(*dep_id),
            },
            status if status.is_terminal() => {
                return Ok(DependencyGate::Unresolvable {
                    dep: *dep_id,
                    status: Some(status),
                });
            }
            _ => incomplete.push(*dep_id),
        }
    }

    if incomplete.is_empty() {
        Ok(DependencyGate::Ready(ready))
    } else {
        Ok(DependencyGate::Waiting { incomplete })
    }
}

/// Merge upstream results into a config map under `dependencyData`,
/// union-with-overwrite against whatever is already there.
pub fn merge_dependency_data(
    config: &mut Map<String, Value>,
    data: Vec<(Uuid, Map<String, Value>)>,
) {
    if data.is_empty() {
        return;
    }
    let entry = config
        .entry(DEPENDENCY_DATA_KEY.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    let map = entry.as_object_mut().expect("just ensured object");
    for (dep_id, dep_data) in data {
        map.insert(dep_id.to_string(), Value::Object(dep_data));
    }
}

/// Find tasks parked in `Pending` that depend on `completed_id`.
///
/// These are tasks that could not be enqueued at submit time (full
/// queue); queued dependents are re-evaluated by the scheduler loop
/// itself.
pub async fn pending_dependents(
    store: &Arc<dyn Store>,
    completed_id: Uuid,
) -> Result<Vec<Task>> {
    let page = store
        .list_tasks(
            &dragnet_store::TaskFilter::by_status(TaskStatus::Pending),
            1,
            usize::MAX.min(10_000),
            dragnet_store::SortOrder::CreatedAsc,
        )
        .await?;
    Ok(page
        .tasks
        .into_iter()
        .filter(|t| t.depends_on.contains(&completed_id))
        .collect())
}
