//! The `Executor` trait -- the adapter interface for scan implementations.
//!
//! Each concrete executor (subdomain enumerator, port prober, vuln
//! scanner, ...) implements this trait. The trait is intentionally
//! object-safe so executors can be stored as `Arc<dyn Executor>` in the
//! [`super::ExecutorRegistry`]. The orchestration core treats the scan
//! logic as opaque: it only supplies a validated config, a cancellation
//! scope, and a progress callback, and takes back a result payload.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use dragnet_store::{Task, TaskType};

/// Static routing facts about an executor.
///
/// The descriptor replaces per-type switch statements: queue topology is
/// derived from the registered executors, and anything else that varies by
/// task type hangs off the executor itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorDescriptor {
    /// Dispatch queue this executor's tasks are routed through.
    pub queue_name: String,
    /// Static arbitration priority of that queue; higher drains first.
    pub queue_priority: i32,
}

impl ExecutorDescriptor {
    /// Default queue topology for a task type.
    pub fn for_type(task_type: TaskType) -> Self {
        let (queue_name, queue_priority) = match task_type {
            TaskType::VulnScan => ("vulnscan", 10),
            TaskType::SensitiveScan => ("sensitive", 8),
            TaskType::SubdomainEnum => ("subdomain", 5),
            TaskType::PortScan => ("portscan", 5),
            TaskType::AssetDiscovery => ("discovery", 5),
            TaskType::DirScan => ("dirscan", 4),
            TaskType::WebCrawl => ("webcrawl", 3),
            TaskType::PageMonitor => ("pagemonitor", 2),
        };
        Self {
            queue_name: queue_name.to_string(),
            queue_priority,
        }
    }
}

/// Payload an executor hands back on success.
#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    pub data: Map<String, Value>,
}

impl TaskOutput {
    pub fn new(data: Map<String, Value>) -> Self {
        Self { data }
    }
}

type ProgressFn = dyn Fn(u8) + Send + Sync;

/// Per-run context the engine hands to an executor.
///
/// Executors must watch `cancel` and return promptly once it fires; the
/// engine only waits a bounded grace period before abandoning the run.
#[derive(Clone)]
pub struct ExecContext {
    cancel: CancellationToken,
    progress: Arc<ProgressFn>,
}

impl ExecContext {
    pub fn new(cancel: CancellationToken, progress: Arc<ProgressFn>) -> Self {
        Self { cancel, progress }
    }

    /// Context that ignores progress and is never cancelled. For tests.
    pub fn detached() -> Self {
        Self {
            cancel: CancellationToken::new(),
            progress: Arc::new(|_| {}),
        }
    }

    /// The cancellation scope for this run.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the run has been asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report completion progress, 0-100.
    pub fn report_progress(&self, pct: u8) {
        (self.progress)(pct.min(100));
    }
}

impl std::fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Adapter interface for task-type-specific scan logic.
///
/// # Object Safety
///
/// This trait is object-safe: it is stored as `Arc<dyn Executor>` in the
/// [`super::ExecutorRegistry`] and shared across engine runs.
#[async_trait]
pub trait Executor: Send + Sync {
    /// The task type this executor handles.
    fn task_type(&self) -> TaskType;

    /// Routing facts for this executor. The default derives the standard
    /// queue topology from the task type.
    fn descriptor(&self) -> ExecutorDescriptor {
        ExecutorDescriptor::for_type(self.task_type())
    }

    /// Perform the scan.
    ///
    /// The implementation should:
    /// 1. Read its validated parameters from `task.config`.
    /// 2. Periodically call `ctx.report_progress`.
    /// 3. Return early (any `Err` is fine) once `ctx.cancellation()` fires.
    ///
    /// Retries re-invoke `execute` with the same task (bumped
    /// `retry_count`), so implementations must tolerate re-execution.
    async fn execute(&self, task: &Task, ctx: &ExecContext) -> Result<TaskOutput>;
}

// Compile-time assertion: Executor must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Executor) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopExecutor;

    #[async_trait]
    impl Executor for NoopExecutor {
        fn task_type(&self) -> TaskType {
            TaskType::PortScan
        }

        async fn execute(&self, _task: &Task, _ctx: &ExecContext) -> Result<TaskOutput> {
            Ok(TaskOutput::default())
        }
    }

    #[test]
    fn executor_is_object_safe() {
        let executor: Arc<dyn Executor> = Arc::new(NoopExecutor);
        assert_eq!(executor.task_type(), TaskType::PortScan);
        assert_eq!(executor.descriptor().queue_name, "portscan");
    }

    #[tokio::test]
    async fn noop_executor_runs() {
        let executor = NoopExecutor;
        let task = Task::new("t", TaskType::PortScan);
        let output = executor.execute(&task, &ExecContext::detached()).await;
        assert!(output.is_ok());
    }

    #[test]
    fn default_descriptors_cover_all_types() {
        for task_type in TaskType::ALL {
            let descriptor = ExecutorDescriptor::for_type(task_type);
            assert!(!descriptor.queue_name.is_empty());
        }
        // Vulnerability scans outrank crawls.
        assert!(
            ExecutorDescriptor::for_type(TaskType::VulnScan).queue_priority
                > ExecutorDescriptor::for_type(TaskType::WebCrawl).queue_priority
        );
    }

    #[test]
    fn progress_callback_clamps() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = ExecContext::new(
            CancellationToken::new(),
            Arc::new(move |pct| sink.lock().unwrap().push(pct)),
        );
        ctx.report_progress(42);
        ctx.report_progress(200);
        assert_eq!(*seen.lock().unwrap(), vec![42, 100]);
    }
}
