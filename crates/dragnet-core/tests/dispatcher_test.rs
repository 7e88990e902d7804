//! End-to-end dispatcher tests over a fully wired in-process control
//! plane: submission, priority arbitration, node selection, watchdog
//! timeouts, and cancellation.

use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use uuid::Uuid;

use dragnet_core::bus::{PubSub, TaskEnvelope, assign_channel, cancel_channel};
use dragnet_core::config::{DispatcherConfig, EngineConfig};
use dragnet_core::dispatch::NewTask;
use dragnet_core::error::OrchestrateError;
use dragnet_core::executor::{ExecutorRegistry, TIMEOUT_ERROR};
use dragnet_store::{Store, TaskStatus, TaskType};
use dragnet_test_utils::{
    InstantExecutor, SleepyExecutor, TestRig, task, valid_config, wait_for,
};

async fn wait_for_status(rig: &TestRig, task_id: Uuid, status: TaskStatus) {
    let store = rig.store.clone();
    wait_for("task status", Duration::from_secs(15), move || {
        let store = store.clone();
        async move {
            store
                .find_task(task_id)
                .await
                .unwrap()
                .is_some_and(|t| t.status == status)
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_task_happy_path() {
    let rig = TestRig::new().await;
    let mut registry = ExecutorRegistry::new();
    let mut data = serde_json::Map::new();
    data.insert("open_ports".to_string(), json!([22]));
    registry.register(InstantExecutor::with_data(TaskType::PortScan, data));

    // Watch the node's assign channel before anything can publish to it.
    let mut assigns = rig.bus.subscribe(&assign_channel("n1")).await.unwrap();
    rig.start_node("n1", registry, EngineConfig::default(), 0)
        .await;

    let mut new = NewTask::new("probe", TaskType::PortScan);
    new.config = valid_config(TaskType::PortScan);
    new.timeout_secs = 60;
    let submitted = rig.dispatcher.submit_task(new).await.unwrap();
    assert_eq!(submitted.status, TaskStatus::Queued);

    wait_for_status(&rig, submitted.id, TaskStatus::Completed).await;

    let settled = rig.store.find_task(submitted.id).await.unwrap().unwrap();
    assert!(settled.completed_at.is_some());
    assert!(settled.node_id.is_none());

    let result = rig
        .store
        .find_result_by_task(submitted.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.task_id, submitted.id);
    assert_eq!(result.data["open_ports"], json!([22]));

    // Exactly one assignment for this task went over the bus.
    let first = tokio::time::timeout(Duration::from_secs(2), assigns.next())
        .await
        .expect("no assignment published")
        .unwrap();
    let envelope: TaskEnvelope = serde_json::from_slice(&first).unwrap();
    assert_eq!(envelope.task.id, submitted.id);
    assert_eq!(envelope.node_id, "n1");
    let second = tokio::time::timeout(Duration::from_millis(300), assigns.next()).await;
    assert!(second.is_err(), "unexpected second assignment");

    rig.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn priority_arbitration_with_capacity_one_node() {
    // Single worker loop so dispatch order is observable.
    let rig = TestRig::with_dispatcher_config(DispatcherConfig {
        worker_count: 1,
        ..DispatcherConfig::default()
    })
    .await;

    let mut registry = ExecutorRegistry::new();
    registry.register(SleepyExecutor::new(
        TaskType::VulnScan,
        Duration::from_millis(300),
    ));
    registry.register(SleepyExecutor::new(
        TaskType::AssetDiscovery,
        Duration::from_millis(100),
    ));
    rig.start_node("n1", registry, EngineConfig::default(), 1)
        .await;

    // Submit the low-priority task first; the vulnscan queue (priority
    // 10) must still beat the discovery queue (priority 5).
    let mut low = NewTask::new("low", TaskType::AssetDiscovery);
    low.config = valid_config(TaskType::AssetDiscovery);
    let t_b = rig.dispatcher.submit_task(low).await.unwrap();

    let mut high = NewTask::new("high", TaskType::VulnScan);
    high.config = valid_config(TaskType::VulnScan);
    let t_a = rig.dispatcher.submit_task(high).await.unwrap();

    wait_for_status(&rig, t_a.id, TaskStatus::Completed).await;
    wait_for_status(&rig, t_b.id, TaskStatus::Completed).await;

    let a = rig.store.find_task(t_a.id).await.unwrap().unwrap();
    let b = rig.store.find_task(t_b.id).await.unwrap().unwrap();
    assert!(
        a.started_at.unwrap() < b.started_at.unwrap(),
        "high-priority queue must dispatch first"
    );

    rig.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_eligible_node_fails_without_publishing() {
    let rig = TestRig::new().await;

    // The vulnscan queue exists, but the only node advertises port scans.
    let mut topology_only = ExecutorRegistry::new();
    topology_only.register(InstantExecutor::new(TaskType::VulnScan));
    dragnet_core::dispatch::install_queue_topology(&rig.queues, &topology_only)
        .await
        .unwrap();

    let mut registry = ExecutorRegistry::new();
    registry.register(InstantExecutor::new(TaskType::PortScan));
    rig.start_node("n1", registry, EngineConfig::default(), 0)
        .await;

    let mut assigns = rig.bus.subscribe(&assign_channel("n1")).await.unwrap();

    let mut new = NewTask::new("unplaceable", TaskType::VulnScan);
    new.config = valid_config(TaskType::VulnScan);
    let submitted = rig.dispatcher.submit_task(new).await.unwrap();

    wait_for_status(&rig, submitted.id, TaskStatus::Failed).await;

    let result = rig
        .store
        .find_result_by_task(submitted.id)
        .await
        .unwrap()
        .unwrap();
    assert!(result.error.unwrap().contains("no eligible node"));

    // Nothing was published for it.
    let published = tokio::time::timeout(Duration::from_millis(300), assigns.next()).await;
    assert!(published.is_err());

    rig.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn watchdog_times_out_unresponsive_run() {
    let rig = TestRig::new().await;
    let mut registry = ExecutorRegistry::new();
    registry.register(SleepyExecutor::ignoring_cancel(
        TaskType::PortScan,
        Duration::from_secs(5),
    ));
    let mut cancels = rig.bus.subscribe(&cancel_channel("n1")).await.unwrap();
    rig.start_node(
        "n1",
        registry,
        EngineConfig {
            cancel_grace_secs: 0,
            ..EngineConfig::default()
        },
        0,
    )
    .await;

    let mut new = NewTask::new("hung", TaskType::PortScan);
    new.config = valid_config(TaskType::PortScan);
    new.timeout_secs = 1;
    let submitted = rig.dispatcher.submit_task(new).await.unwrap();

    wait_for_status(&rig, submitted.id, TaskStatus::Timeout).await;

    let result = rig
        .store
        .find_result_by_task(submitted.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.error.as_deref(), Some(TIMEOUT_ERROR));

    // Worker-side cancellation was requested over the bus.
    let cancel_msg = tokio::time::timeout(Duration::from_secs(3), cancels.next())
        .await
        .expect("no cancel published")
        .unwrap();
    let request: dragnet_core::bus::CancelRequest = serde_json::from_slice(&cancel_msg).unwrap();
    assert_eq!(request.task_id, submitted.id);

    rig.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_running_task_settles_cancelled() {
    let rig = TestRig::new().await;
    let mut registry = ExecutorRegistry::new();
    registry.register(SleepyExecutor::new(
        TaskType::PortScan,
        Duration::from_secs(30),
    ));
    rig.start_node("n1", registry, EngineConfig::default(), 0)
        .await;

    let mut new = NewTask::new("victim", TaskType::PortScan);
    new.config = valid_config(TaskType::PortScan);
    let submitted = rig.dispatcher.submit_task(new).await.unwrap();

    wait_for_status(&rig, submitted.id, TaskStatus::Running).await;
    rig.dispatcher.cancel_task(submitted.id).await.unwrap();

    wait_for_status(&rig, submitted.id, TaskStatus::Cancelled).await;
    let result = rig
        .store
        .find_result_by_task(submitted.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.status, TaskStatus::Cancelled);

    rig.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_queued_task_never_dispatches() {
    let rig = TestRig::new().await;
    let mut registry = ExecutorRegistry::new();
    registry.register(InstantExecutor::new(TaskType::PortScan));
    rig.start_node("n1", registry, EngineConfig::default(), 0)
        .await;

    // Park the task behind an incomplete dependency so it stays queued.
    let dep = task("dep", TaskType::PortScan)
        .status(TaskStatus::Running)
        .build();
    rig.store.insert_task(&dep).await.unwrap();

    let mut new = NewTask::new("parked", TaskType::PortScan);
    new.config = valid_config(TaskType::PortScan);
    new.depends_on = vec![dep.id];
    let submitted = rig.dispatcher.submit_task(new).await.unwrap();
    assert_eq!(submitted.status, TaskStatus::Queued);

    rig.dispatcher.cancel_task(submitted.id).await.unwrap();
    wait_for_status(&rig, submitted.id, TaskStatus::Cancelled).await;

    // Cancelling a settled task is a validation error.
    let err = rig.dispatcher.cancel_task(submitted.id).await.unwrap_err();
    assert!(matches!(err, OrchestrateError::Validation(_)));

    rig.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submit_validation_failures_leave_no_record() {
    let rig = TestRig::new().await;
    let mut registry = ExecutorRegistry::new();
    registry.register(InstantExecutor::new(TaskType::PortScan));
    rig.start_node("n1", registry, EngineConfig::default(), 0)
        .await;

    // Bad config: port_scan requires a target.
    let bad = NewTask::new("bad", TaskType::PortScan);
    let err = rig.dispatcher.submit_task(bad).await.unwrap_err();
    assert!(matches!(err, OrchestrateError::Validation(_)));

    // Unknown dependency.
    let mut dangling = NewTask::new("dangling", TaskType::PortScan);
    dangling.config = valid_config(TaskType::PortScan);
    dangling.depends_on = vec![Uuid::new_v4()];
    let err = rig.dispatcher.submit_task(dangling).await.unwrap_err();
    assert!(matches!(err, OrchestrateError::Validation(_)));

    // No queue routes web crawls in this deployment.
    let mut unrouted = NewTask::new("unrouted", TaskType::WebCrawl);
    unrouted.config = valid_config(TaskType::WebCrawl);
    let err = rig.dispatcher.submit_task(unrouted).await.unwrap_err();
    assert!(matches!(err, OrchestrateError::QueueMissing(_)));

    // None of the rejected submissions left a task behind.
    let page = rig
        .store
        .list_tasks(
            &dragnet_store::TaskFilter::default(),
            1,
            100,
            dragnet_store::SortOrder::CreatedAsc,
        )
        .await
        .unwrap();
    assert_eq!(page.total, 0);

    rig.teardown().await;
}
