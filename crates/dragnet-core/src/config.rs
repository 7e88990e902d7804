//! Configuration for the orchestration components.
//!
//! Each component takes its own config struct so deployments can tune them
//! independently; all of them deserialize from the server's TOML config
//! with serde defaults matching the constants here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard cap on concurrently running tasks.
    pub max_concurrent_tasks: usize,
    /// Timeout applied when a task carries `timeout_secs == 0`.
    pub default_timeout_secs: u64,
    /// Whether failed tasks are retried up to their `max_retries`.
    pub enable_retry: bool,
    /// Delay between an executor failure and the retry resubmission.
    pub retry_interval_secs: u64,
    /// How long a cancelled executor gets to return before the engine
    /// declares it unresponsive and abandons the join.
    pub cancel_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 16,
            default_timeout_secs: 3600,
            enable_retry: true,
            retry_interval_secs: 30,
            cancel_grace_secs: 5,
        }
    }
}

impl EngineConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

/// Configuration for the dispatcher and its scheduler loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of worker loops pulling from the internal dispatch channel.
    pub worker_count: usize,
    /// Scheduler tick period.
    pub tick_interval_secs: u64,
    /// Capacity of the scheduler -> worker channel.
    pub dispatch_channel_capacity: usize,
    /// Maximum dependency-waiting tasks re-enqueued per scheduler pass
    /// before the pass yields (busy-loop bound).
    pub dependency_requeue_limit: usize,
    /// Scheduler ticks a task may wait with no dependency progress before
    /// it is failed as stalled.
    pub dependency_stall_ticks: u32,
    /// Timeout applied when a dispatched task carries `timeout_secs == 0`.
    pub default_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            tick_interval_secs: 1,
            dispatch_channel_capacity: 64,
            dependency_requeue_limit: 32,
            dependency_stall_ticks: 300,
            default_timeout_secs: 3600,
        }
    }
}

impl DispatcherConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

/// Configuration for node heartbeat monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMonitorConfig {
    /// Expected heartbeat period for registered nodes.
    pub heartbeat_interval_secs: u64,
    /// Multiples of the heartbeat interval after which a silent node is
    /// marked offline.
    pub offline_multiplier: u32,
}

impl Default for NodeMonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            offline_multiplier: 3,
        }
    }
}

impl NodeMonitorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Silence threshold before a node is considered offline.
    pub fn offline_after(&self) -> Duration {
        self.heartbeat_interval() * self.offline_multiplier.max(1)
    }
}

/// Configuration for the cron scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// How often due entries are checked.
    pub tick_interval_secs: u64,
    /// How often the self-heal pass verifies every enabled rule has a
    /// live entry.
    pub self_heal_interval_secs: u64,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 1,
            self_heal_interval_secs: 300,
        }
    }
}

/// Configuration for the event pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Bounded event channel capacity; producers drop (newest) once full.
    pub channel_capacity: usize,
    /// Per-task ring buffer capacity in the store.
    pub ring_capacity: usize,
    /// Per-task ring buffer retention.
    pub ring_ttl_secs: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            ring_capacity: dragnet_store::EVENT_BUFFER_CAPACITY,
            ring_ttl_secs: dragnet_store::EVENT_BUFFER_TTL_SECS,
        }
    }
}

/// Queue convergence sweep period.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSyncConfig {
    pub sweep_interval_secs: u64,
}

impl Default for QueueSyncConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
        }
    }
}
