//! Executor registry -- the typed collection of available executors.
//!
//! The engine looks executors up by task type at admission; the dispatcher
//! derives the queue topology from the registered descriptors at startup.

use std::collections::HashMap;
use std::sync::Arc;

use dragnet_store::TaskType;

use super::trait_def::{Executor, ExecutorDescriptor};

/// A collection of registered [`Executor`] implementations, one per task
/// type.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its own task type.
    ///
    /// If the type already had an executor, it is replaced and the old
    /// one returned.
    pub fn register(&mut self, executor: impl Executor + 'static) -> Option<Arc<dyn Executor>> {
        let task_type = executor.task_type();
        self.executors.insert(task_type, Arc::new(executor))
    }

    /// Look up the executor for a task type.
    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn Executor>> {
        self.executors.get(&task_type).cloned()
    }

    /// Task types with a registered executor, in stable order.
    pub fn task_types(&self) -> Vec<TaskType> {
        TaskType::ALL
            .into_iter()
            .filter(|t| self.executors.contains_key(t))
            .collect()
    }

    /// Descriptors of every registered executor, in stable type order.
    pub fn descriptors(&self) -> Vec<(TaskType, ExecutorDescriptor)> {
        self.task_types()
            .into_iter()
            .map(|t| (t, self.executors[&t].descriptor()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::trait_def::{ExecContext, TaskOutput};
    use anyhow::Result;
    use async_trait::async_trait;
    use dragnet_store::Task;

    struct FakeExecutor {
        task_type: TaskType,
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        fn task_type(&self) -> TaskType {
            self.task_type
        }

        async fn execute(&self, _task: &Task, _ctx: &ExecContext) -> Result<TaskOutput> {
            Ok(TaskOutput::default())
        }
    }

    #[test]
    fn registry_starts_empty() {
        let registry = ExecutorRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.task_types().is_empty());
    }

    #[test]
    fn register_and_get() {
        let mut registry = ExecutorRegistry::new();
        let old = registry.register(FakeExecutor {
            task_type: TaskType::PortScan,
        });
        assert!(old.is_none());
        assert!(registry.get(TaskType::PortScan).is_some());
        assert!(registry.get(TaskType::VulnScan).is_none());
    }

    #[test]
    fn register_replaces_same_type() {
        let mut registry = ExecutorRegistry::new();
        registry.register(FakeExecutor {
            task_type: TaskType::PortScan,
        });
        let old = registry.register(FakeExecutor {
            task_type: TaskType::PortScan,
        });
        assert!(old.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn descriptors_in_stable_order() {
        let mut registry = ExecutorRegistry::new();
        registry.register(FakeExecutor {
            task_type: TaskType::WebCrawl,
        });
        registry.register(FakeExecutor {
            task_type: TaskType::SubdomainEnum,
        });

        let descriptors = registry.descriptors();
        assert_eq!(descriptors.len(), 2);
        // TaskType::ALL order: subdomain_enum before web_crawl.
        assert_eq!(descriptors[0].0, TaskType::SubdomainEnum);
        assert_eq!(descriptors[1].0, TaskType::WebCrawl);
    }
}
