//! Behavioral tests for the in-process store against the contract the
//! orchestration core relies on.

use chrono::Utc;
use uuid::Uuid;

use dragnet_store::{
    MemoryStore, QueueRecord, ScheduleRule, SortOrder, Store, StoreError, Task, TaskFilter,
    TaskPatch, TaskResult, TaskStatus, TaskType,
};

fn queue(name: &str, priority: i32) -> QueueRecord {
    QueueRecord {
        name: name.to_string(),
        task_type: TaskType::PortScan,
        priority,
        max_size: 0,
        count: 0,
    }
}

fn rule(name: &str, template_id: Uuid) -> ScheduleRule {
    ScheduleRule {
        id: Uuid::new_v4(),
        name: name.to_string(),
        cron_expr: "0 0 * * * *".to_string(),
        timezone: "UTC".to_string(),
        enabled: true,
        template_id,
        next_run_at: None,
        last_run_at: None,
        run_count: 0,
        max_runs: None,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn read_after_write_for_same_key() {
    let store = MemoryStore::new();
    let task = Task::new("probe", TaskType::PortScan);
    store.insert_task(&task).await.unwrap();

    // A write followed by a read of the same document must observe it.
    store
        .update_task_status(task.id, TaskStatus::Queued, 0)
        .await
        .unwrap();
    let found = store.find_task(task.id).await.unwrap().unwrap();
    assert_eq!(found.status, TaskStatus::Queued);
}

#[tokio::test]
async fn patch_clears_node_id_with_nested_option() {
    let store = MemoryStore::new();
    let mut task = Task::new("probe", TaskType::PortScan);
    task.node_id = Some("node-1".to_string());
    task.status = TaskStatus::Running;
    store.insert_task(&task).await.unwrap();

    store
        .update_task_fields(
            task.id,
            TaskPatch {
                node_id: Some(None),
                ..TaskPatch::default()
            },
        )
        .await
        .unwrap();

    let found = store.find_task(task.id).await.unwrap().unwrap();
    assert!(found.node_id.is_none());
}

#[tokio::test]
async fn transition_applies_patch_atomically() {
    let store = MemoryStore::new();
    let mut task = Task::new("probe", TaskType::PortScan);
    task.status = TaskStatus::Running;
    task.node_id = Some("node-1".to_string());
    store.insert_task(&task).await.unwrap();

    let now = Utc::now();
    let updated = store
        .transition_task_status(
            task.id,
            TaskStatus::Running,
            TaskPatch {
                status: Some(TaskStatus::Completed),
                progress: Some(100),
                node_id: Some(None),
                completed_at: Some(Some(now)),
                ..TaskPatch::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.status, TaskStatus::Completed);
    assert_eq!(updated.progress, 100);
    assert!(updated.node_id.is_none());
    assert_eq!(updated.completed_at, Some(now));
}

#[tokio::test]
async fn list_tasks_sort_orders() {
    let store = MemoryStore::new();
    let mut first = Task::new("first", TaskType::WebCrawl);
    first.created_at = Utc::now() - chrono::Duration::seconds(60);
    let second = Task::new("second", TaskType::WebCrawl);
    store.insert_task(&first).await.unwrap();
    store.insert_task(&second).await.unwrap();

    let asc = store
        .list_tasks(&TaskFilter::default(), 1, 10, SortOrder::CreatedAsc)
        .await
        .unwrap();
    assert_eq!(asc.tasks[0].name, "first");

    let desc = store
        .list_tasks(&TaskFilter::default(), 1, 10, SortOrder::CreatedDesc)
        .await
        .unwrap();
    assert_eq!(desc.tasks[0].name, "second");
}

#[tokio::test]
async fn page_past_end_is_empty() {
    let store = MemoryStore::new();
    store
        .insert_task(&Task::new("only", TaskType::DirScan))
        .await
        .unwrap();

    let page = store
        .list_tasks(&TaskFilter::default(), 3, 10, SortOrder::CreatedDesc)
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert!(page.tasks.is_empty());
}

#[tokio::test]
async fn queues_list_sorted_by_priority_desc() {
    let store = MemoryStore::new();
    store.insert_queue(&queue("discovery", 5)).await.unwrap();
    store.insert_queue(&queue("vulnscan", 10)).await.unwrap();

    let queues = store.list_queues().await.unwrap();
    assert_eq!(queues[0].name, "vulnscan");
    assert_eq!(queues[1].name, "discovery");
}

#[tokio::test]
async fn push_to_missing_queue_fails() {
    let store = MemoryStore::new();
    let result = store.push_queue_task("nope", Uuid::new_v4()).await;
    assert!(matches!(result, Err(StoreError::NotFound { .. })));
}

#[tokio::test]
async fn schedule_rule_crud() {
    let store = MemoryStore::new();
    let template = Task::new("template", TaskType::SubdomainEnum);
    store.insert_task(&template).await.unwrap();

    let mut r = rule("nightly", template.id);
    store.insert_schedule_rule(&r).await.unwrap();

    r.run_count = 3;
    r.enabled = false;
    store.update_schedule_rule(&r).await.unwrap();

    let found = store.find_schedule_rule(r.id).await.unwrap().unwrap();
    assert_eq!(found.run_count, 3);
    assert!(!found.enabled);

    store.delete_schedule_rule(r.id).await.unwrap();
    assert!(store.find_schedule_rule(r.id).await.unwrap().is_none());
    assert!(matches!(
        store.delete_schedule_rule(r.id).await,
        Err(StoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn result_survives_task_deletion() {
    let store = MemoryStore::new();
    let task = Task::new("probe", TaskType::PortScan);
    store.insert_task(&task).await.unwrap();
    let result = TaskResult::success(task.id, serde_json::Map::new(), Utc::now());
    store.insert_result(&result).await.unwrap();

    store.delete_task(task.id).await.unwrap();
    assert!(store.find_task(task.id).await.unwrap().is_none());
    assert!(store.find_result_by_task(task.id).await.unwrap().is_some());
}
