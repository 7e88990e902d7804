//! Execution engine tests: admission, capacity, retries, deadlines,
//! cancellation, and panic recovery.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dragnet_core::config::{EngineConfig, EventConfig};
use dragnet_core::error::OrchestrateError;
use dragnet_core::events::event_pipeline;
use dragnet_core::executor::{CANCELLED_ERROR, ExecutionEngine, ExecutorRegistry, TIMEOUT_ERROR};
use dragnet_store::{MemoryStore, Store, TaskEventKind, TaskStatus, TaskType};
use dragnet_test_utils::{
    FlakyExecutor, InstantExecutor, PanickingExecutor, SleepyExecutor, task, wait_for,
};
use tokio_util::sync::CancellationToken;

struct EngineRig {
    store: Arc<MemoryStore>,
    engine: ExecutionEngine,
    cancel: CancellationToken,
}

fn rig(registry: ExecutorRegistry, config: EngineConfig) -> EngineRig {
    let store = Arc::new(MemoryStore::new());
    let (events, drain) = event_pipeline(store.clone(), EventConfig::default());
    let cancel = CancellationToken::new();
    tokio::spawn(drain.run(cancel.clone()));

    let engine = ExecutionEngine::new(
        store.clone() as Arc<dyn Store>,
        Arc::new(registry),
        events,
        config,
    );
    EngineRig {
        store,
        engine,
        cancel,
    }
}

fn fast_retry_config() -> EngineConfig {
    EngineConfig {
        max_concurrent_tasks: 4,
        default_timeout_secs: 30,
        enable_retry: true,
        retry_interval_secs: 0,
        cancel_grace_secs: 1,
    }
}

async fn wait_for_status(store: &Arc<MemoryStore>, task_id: uuid::Uuid, status: TaskStatus) {
    let store = store.clone();
    wait_for("task status", Duration::from_secs(10), move || {
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
async fn executes_task_and_persists_result() {
    let mut registry = ExecutorRegistry::new();
    let mut data = serde_json::Map::new();
    data.insert("open_ports".to_string(), serde_json::json!([22, 80]));
    registry.register(InstantExecutor::with_data(TaskType::PortScan, data));
    let rig = rig(registry, fast_retry_config());

    let t = task("probe", TaskType::PortScan).queued().build();
    rig.store.insert_task(&t).await.unwrap();
    rig.engine.execute_task(t.clone()).await.unwrap();

    wait_for_status(&rig.store, t.id, TaskStatus::Completed).await;

    let settled = rig.store.find_task(t.id).await.unwrap().unwrap();
    assert_eq!(settled.progress, 100);
    assert!(settled.node_id.is_none());
    assert!(settled.started_at.is_some());
    assert!(settled.completed_at.is_some());

    let result = rig.store.find_result_by_task(t.id).await.unwrap().unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.data["open_ports"], serde_json::json!([22, 80]));
    assert_eq!(settled.result_id, Some(result.id));
    rig.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admission_enforces_concurrency_cap() {
    let mut registry = ExecutorRegistry::new();
    registry.register(SleepyExecutor::new(
        TaskType::PortScan,
        Duration::from_millis(400),
    ));
    let rig = rig(
        registry,
        EngineConfig {
            max_concurrent_tasks: 1,
            ..fast_retry_config()
        },
    );

    let first = task("first", TaskType::PortScan).queued().build();
    let second = task("second", TaskType::PortScan).queued().build();
    rig.store.insert_task(&first).await.unwrap();
    rig.store.insert_task(&second).await.unwrap();

    rig.engine.execute_task(first.clone()).await.unwrap();
    let err = rig.engine.execute_task(second.clone()).await.unwrap_err();
    assert!(matches!(err, OrchestrateError::CapacityExhausted { limit: 1 }));
    assert_eq!(rig.engine.running_count().await, 1);

    // Once the first run drains, the same task admits cleanly.
    wait_for_status(&rig.store, first.id, TaskStatus::Completed).await;
    rig.engine.execute_task(second.clone()).await.unwrap();
    wait_for_status(&rig.store, second.id, TaskStatus::Completed).await;
    rig.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_failures_retry_until_success() {
    let mut registry = ExecutorRegistry::new();
    let flaky = FlakyExecutor::new(TaskType::VulnScan, 2);
    let attempts = flaky.attempts();
    registry.register(flaky);
    let rig = rig(registry, fast_retry_config());

    let t = task("flaky", TaskType::VulnScan)
        .queued()
        .max_retries(2)
        .build();
    rig.store.insert_task(&t).await.unwrap();
    rig.engine.execute_task(t.clone()).await.unwrap();

    wait_for_status(&rig.store, t.id, TaskStatus::Completed).await;

    let settled = rig.store.find_task(t.id).await.unwrap().unwrap();
    assert_eq!(settled.retry_count, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // The event stream carries exactly two retry notices (drained
    // asynchronously, so poll for them).
    let store = rig.store.clone();
    let task_id = t.id;
    wait_for("retry events", Duration::from_secs(5), move || {
        let store = store.clone();
        async move {
            store
                .events_for_task(task_id)
                .await
                .iter()
                .filter(|e| e.kind == TaskEventKind::TaskRetryScheduled)
                .count()
                == 2
        }
    })
    .await;
    rig.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_budget_is_a_hard_bound() {
    let mut registry = ExecutorRegistry::new();
    let flaky = FlakyExecutor::new(TaskType::VulnScan, 99);
    let attempts = flaky.attempts();
    registry.register(flaky);
    let rig = rig(registry, fast_retry_config());

    let t = task("doomed", TaskType::VulnScan)
        .queued()
        .max_retries(1)
        .build();
    rig.store.insert_task(&t).await.unwrap();
    rig.engine.execute_task(t.clone()).await.unwrap();

    wait_for_status(&rig.store, t.id, TaskStatus::Failed).await;

    // Executed at most 1 + max_retries times.
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let result = rig.store.find_result_by_task(t.id).await.unwrap().unwrap();
    assert!(result.error.unwrap().contains("transient upstream failure"));
    rig.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_disabled_fails_terminally_on_first_error() {
    let mut registry = ExecutorRegistry::new();
    let flaky = FlakyExecutor::new(TaskType::VulnScan, 99);
    let attempts = flaky.attempts();
    registry.register(flaky);
    let rig = rig(
        registry,
        EngineConfig {
            enable_retry: false,
            ..fast_retry_config()
        },
    );

    let t = task("no-retry", TaskType::VulnScan)
        .queued()
        .max_retries(5)
        .build();
    rig.store.insert_task(&t).await.unwrap();
    rig.engine.execute_task(t.clone()).await.unwrap();

    wait_for_status(&rig.store, t.id, TaskStatus::Failed).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    rig.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deadline_marks_timeout_even_if_executor_ignores_cancel() {
    let mut registry = ExecutorRegistry::new();
    registry.register(SleepyExecutor::ignoring_cancel(
        TaskType::PortScan,
        Duration::from_secs(5),
    ));
    let rig = rig(
        registry,
        EngineConfig {
            cancel_grace_secs: 0,
            ..fast_retry_config()
        },
    );

    let t = task("slow", TaskType::PortScan)
        .queued()
        .timeout_secs(1)
        .build();
    rig.store.insert_task(&t).await.unwrap();
    rig.engine.execute_task(t.clone()).await.unwrap();

    wait_for_status(&rig.store, t.id, TaskStatus::Timeout).await;

    let result = rig.store.find_result_by_task(t.id).await.unwrap().unwrap();
    assert_eq!(result.status, TaskStatus::Timeout);
    assert_eq!(result.error.as_deref(), Some(TIMEOUT_ERROR));
    rig.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_settles_without_retry() {
    let mut registry = ExecutorRegistry::new();
    registry.register(SleepyExecutor::new(
        TaskType::PortScan,
        Duration::from_secs(10),
    ));
    let rig = rig(registry, fast_retry_config());

    let t = task("victim", TaskType::PortScan)
        .queued()
        .max_retries(3)
        .build();
    rig.store.insert_task(&t).await.unwrap();
    rig.engine.execute_task(t.clone()).await.unwrap();

    wait_for_status(&rig.store, t.id, TaskStatus::Running).await;
    assert!(rig.engine.cancel_task(t.id).await);

    wait_for_status(&rig.store, t.id, TaskStatus::Cancelled).await;
    let settled = rig.store.find_task(t.id).await.unwrap().unwrap();
    // Cancellation never schedules a retry.
    assert_eq!(settled.retry_count, 0);
    let result = rig.store.find_result_by_task(t.id).await.unwrap().unwrap();
    assert_eq!(result.error.as_deref(), Some(CANCELLED_ERROR));
    rig.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn executor_panic_is_recovered_as_failure() {
    let mut registry = ExecutorRegistry::new();
    registry.register(PanickingExecutor::new(TaskType::WebCrawl));
    let rig = rig(registry, fast_retry_config());

    let t = task("boom", TaskType::WebCrawl).queued().build();
    rig.store.insert_task(&t).await.unwrap();
    rig.engine.execute_task(t.clone()).await.unwrap();

    wait_for_status(&rig.store, t.id, TaskStatus::Failed).await;
    let result = rig.store.find_result_by_task(t.id).await.unwrap().unwrap();
    assert!(result.error.unwrap().contains("panic"));
    rig.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_delivery_runs_once() {
    let mut registry = ExecutorRegistry::new();
    let flaky = FlakyExecutor::new(TaskType::PortScan, 0).with_delay(Duration::from_millis(200));
    let attempts = flaky.attempts();
    registry.register(flaky);
    let rig = rig(registry, fast_retry_config());

    let t = task("dup", TaskType::PortScan).queued().build();
    rig.store.insert_task(&t).await.unwrap();
    rig.engine.execute_task(t.clone()).await.unwrap();
    // At-least-once delivery hands the same envelope over again.
    rig.engine.execute_task(t.clone()).await.unwrap();

    wait_for_status(&rig.store, t.id, TaskStatus::Completed).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    // Result uniqueness held through the duplicate.
    let result = rig.store.find_result_by_task(t.id).await.unwrap();
    assert!(result.is_some());
    rig.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unregistered_type_is_refused() {
    let registry = ExecutorRegistry::new();
    let rig = rig(registry, fast_retry_config());

    let t = task("orphan", TaskType::DirScan).queued().build();
    rig.store.insert_task(&t).await.unwrap();
    let err = rig.engine.execute_task(t).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestrateError::ExecutorMissing(TaskType::DirScan)
    ));
    rig.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_cancels_live_runs_and_refuses_new_work() {
    let mut registry = ExecutorRegistry::new();
    registry.register(SleepyExecutor::new(
        TaskType::PortScan,
        Duration::from_secs(10),
    ));
    let rig = rig(registry, fast_retry_config());

    let t = task("draining", TaskType::PortScan).queued().build();
    rig.store.insert_task(&t).await.unwrap();
    rig.engine.execute_task(t.clone()).await.unwrap();
    wait_for_status(&rig.store, t.id, TaskStatus::Running).await;

    rig.engine.shutdown().await;
    assert_eq!(rig.engine.running_count().await, 0);
    wait_for_status(&rig.store, t.id, TaskStatus::Cancelled).await;

    let late = task("late", TaskType::PortScan).queued().build();
    rig.store.insert_task(&late).await.unwrap();
    let err = rig.engine.execute_task(late).await.unwrap_err();
    assert!(matches!(err, OrchestrateError::ShuttingDown));
    rig.cancel.cancel();
}
