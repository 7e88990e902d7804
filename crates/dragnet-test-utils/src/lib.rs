//! Shared builders and mock executors for dragnet integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use dragnet_core::executor::{ExecContext, Executor, TaskOutput};
use dragnet_store::{Task, TaskPriority, TaskStatus, TaskType};

// ---------------------------------------------------------------------------
// Task building
// ---------------------------------------------------------------------------

/// Minimal config map that passes submit-time validation for a type.
pub fn valid_config(task_type: TaskType) -> Map<String, Value> {
    let value = match task_type {
        TaskType::SubdomainEnum => json!({"domain": "example.com"}),
        TaskType::PortScan => json!({"target": "10.0.0.1"}),
        TaskType::VulnScan => json!({"target": "10.0.0.1"}),
        TaskType::AssetDiscovery => json!({"targets": ["10.0.0.0/24"]}),
        TaskType::DirScan => json!({"baseUrl": "https://example.com"}),
        TaskType::WebCrawl => json!({"startUrl": "https://example.com"}),
        TaskType::SensitiveScan => json!({"target": "https://example.com"}),
        TaskType::PageMonitor => json!({"url": "https://example.com"}),
    };
    match value {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

/// Fluent builder over [`Task`] for store-level tests.
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(name: &str, task_type: TaskType) -> Self {
        let mut task = Task::new(name, task_type);
        task.config = valid_config(task_type);
        Self { task }
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn queued(self) -> Self {
        self.status(TaskStatus::Queued)
    }

    pub fn timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.task.timeout_secs = timeout_secs;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.task.max_retries = max_retries;
        self
    }

    pub fn depends_on(mut self, deps: &[Uuid]) -> Self {
        self.task.depends_on = deps.to_vec();
        self
    }

    pub fn config_entry(mut self, key: &str, value: Value) -> Self {
        self.task.config.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// Shorthand for [`TaskBuilder::new`].
pub fn task(name: &str, task_type: TaskType) -> TaskBuilder {
    TaskBuilder::new(name, task_type)
}

// ---------------------------------------------------------------------------
// Mock executors
// ---------------------------------------------------------------------------

/// Completes immediately with a fixed data payload.
pub struct InstantExecutor {
    task_type: TaskType,
    data: Map<String, Value>,
}

impl InstantExecutor {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            data: Map::new(),
        }
    }

    pub fn with_data(task_type: TaskType, data: Map<String, Value>) -> Self {
        Self { task_type, data }
    }
}

#[async_trait]
impl Executor for InstantExecutor {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn execute(&self, _task: &Task, ctx: &ExecContext) -> Result<TaskOutput> {
        ctx.report_progress(100);
        Ok(TaskOutput::new(self.data.clone()))
    }
}

/// Fails the first `n` executions with a retryable error, then succeeds.
pub struct FlakyExecutor {
    task_type: TaskType,
    failures_remaining: AtomicU32,
    attempts: Arc<AtomicU32>,
    delay: Duration,
}

impl FlakyExecutor {
    pub fn new(task_type: TaskType, failures: u32) -> Self {
        Self {
            task_type,
            failures_remaining: AtomicU32::new(failures),
            attempts: Arc::new(AtomicU32::new(0)),
            delay: Duration::ZERO,
        }
    }

    /// Sleep this long inside every execution before settling.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Counter of executions observed so far, shared with the test.
    pub fn attempts(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.attempts)
    }
}

#[async_trait]
impl Executor for FlakyExecutor {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn execute(&self, _task: &Task, _ctx: &ExecContext) -> Result<TaskOutput> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("transient upstream failure"));
        }
        Ok(TaskOutput::default())
    }
}

/// Sleeps for a fixed duration. With `ignore_cancel` it sleeps straight
/// through cancellation, which is how tests exercise the grace period and
/// the watchdog taking precedence.
pub struct SleepyExecutor {
    task_type: TaskType,
    duration: Duration,
    ignore_cancel: bool,
}

impl SleepyExecutor {
    pub fn new(task_type: TaskType, duration: Duration) -> Self {
        Self {
            task_type,
            duration,
            ignore_cancel: false,
        }
    }

    pub fn ignoring_cancel(task_type: TaskType, duration: Duration) -> Self {
        Self {
            task_type,
            duration,
            ignore_cancel: true,
        }
    }
}

#[async_trait]
impl Executor for SleepyExecutor {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn execute(&self, _task: &Task, ctx: &ExecContext) -> Result<TaskOutput> {
        if self.ignore_cancel {
            tokio::time::sleep(self.duration).await;
            return Ok(TaskOutput::default());
        }
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => Ok(TaskOutput::default()),
            _ = ctx.cancellation().cancelled() => Err(anyhow!("cancelled")),
        }
    }
}

/// Panics on every execution; exercises panic recovery.
pub struct PanickingExecutor {
    task_type: TaskType,
}

impl PanickingExecutor {
    pub fn new(task_type: TaskType) -> Self {
        Self { task_type }
    }
}

#[async_trait]
impl Executor for PanickingExecutor {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn execute(&self, _task: &Task, _ctx: &ExecContext) -> Result<TaskOutput> {
        panic!("executor blew up");
    }
}

// ---------------------------------------------------------------------------
// Control-plane rig
// ---------------------------------------------------------------------------

use dragnet_core::agent::{ControlLink, NodeAgent, NodeAgentConfig, ReportSink};
use dragnet_core::bus::{InProcessBus, PubSub};
use dragnet_core::config::{DispatcherConfig, EngineConfig, EventConfig};
use dragnet_core::dispatch::{Dispatcher, install_queue_topology};
use dragnet_core::events::{EventSink, event_pipeline};
use dragnet_core::executor::{ExecutionEngine, ExecutorRegistry};
use dragnet_core::nodes::NodeRegistry;
use dragnet_core::queue::QueueManager;
use dragnet_store::{MemoryStore, Store};
use tokio_util::sync::CancellationToken;

/// A fully wired in-process control plane for integration tests.
pub struct TestRig {
    pub store: Arc<MemoryStore>,
    pub queues: Arc<QueueManager>,
    pub nodes: Arc<NodeRegistry>,
    pub bus: Arc<InProcessBus>,
    pub dispatcher: Arc<Dispatcher>,
    pub events: EventSink,
    pub cancel: CancellationToken,
}

impl TestRig {
    /// Control plane with default dispatcher config (1 s scheduler tick).
    pub async fn new() -> Self {
        Self::with_dispatcher_config(DispatcherConfig::default()).await
    }

    pub async fn with_dispatcher_config(config: DispatcherConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let (events, drain) = event_pipeline(store.clone(), EventConfig::default());
        let cancel = CancellationToken::new();
        tokio::spawn(drain.run(cancel.clone()));

        let queues = Arc::new(QueueManager::new(
            store.clone() as Arc<dyn Store>,
            events.clone(),
        ));
        let nodes = Arc::new(NodeRegistry::new());
        let bus = Arc::new(InProcessBus::new());
        let dispatcher = Dispatcher::new(
            store.clone() as Arc<dyn Store>,
            Arc::clone(&queues),
            Arc::clone(&nodes),
            bus.clone() as Arc<dyn PubSub>,
            events.clone(),
            config,
        );
        dispatcher.start().await.expect("dispatcher failed to start");

        Self {
            store,
            queues,
            nodes,
            bus,
            dispatcher,
            events,
            cancel,
        }
    }

    /// Install queue topology for the registry and start a worker node
    /// running it. The agent heartbeats every second so tests never wait
    /// on node discovery.
    pub async fn start_node(
        &self,
        node_id: &str,
        registry: ExecutorRegistry,
        engine_config: EngineConfig,
        max_concurrent: u32,
    ) -> Arc<NodeAgent> {
        install_queue_topology(&self.queues, &registry)
            .await
            .expect("queue topology install failed");

        let task_types = registry.task_types();
        let (report_tx, report_rx) = NodeAgent::report_channel();
        let engine = ExecutionEngine::new(
            self.store.clone() as Arc<dyn Store>,
            Arc::new(registry),
            self.events.clone(),
            engine_config,
        )
        .with_report_channel(report_tx);

        let agent = NodeAgent::new(
            NodeAgentConfig {
                node_id: node_id.to_string(),
                task_types,
                max_concurrent,
                heartbeat_interval_secs: 1,
                agent_version: "test".to_string(),
                telemetry: Default::default(),
            },
            engine,
            report_rx,
            self.bus.clone() as Arc<dyn PubSub>,
            self.nodes.clone() as Arc<dyn ControlLink>,
            self.dispatcher.clone() as Arc<dyn ReportSink>,
        );
        agent.start().await.expect("node agent failed to start");
        agent
    }

    pub async fn teardown(self) {
        self.dispatcher.shutdown();
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Polling helper
// ---------------------------------------------------------------------------

/// Await a condition with a deadline, polling every 10 ms. Panics with
/// `what` on expiry.
pub async fn wait_for<F, Fut>(what: &str, deadline: Duration, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if probe().await {
            return;
        }
        if start.elapsed() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
