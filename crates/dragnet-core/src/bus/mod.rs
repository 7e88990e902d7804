//! Pub/sub transport between the dispatcher and worker nodes.
//!
//! Two channel families:
//!
//! - `task_assign:<node_id>` -- the dispatcher publishes a serialized
//!   [`TaskEnvelope`]; the named node subscribes.
//! - `task_cancel:<node_id>` -- the dispatcher publishes a
//!   [`CancelRequest`] asking for cooperative cancellation.
//!
//! Delivery is at-least-once; consumers must be idempotent on task id.

pub mod memory;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dragnet_store::Task;

use crate::error::Result;

pub use memory::InProcessBus;

/// Channel a node receives task assignments on.
pub fn assign_channel(node_id: &str) -> String {
    format!("task_assign:{node_id}")
}

/// Channel a node receives cancellation requests on.
pub fn cancel_channel(node_id: &str) -> String {
    format!("task_cancel:{node_id}")
}

/// Serialized task assignment published to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task: Task,
    /// Node the assignment is addressed to; consumers drop envelopes that
    /// were misrouted by the transport.
    pub node_id: String,
}

/// Cooperative cancellation request published to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub task_id: Uuid,
}

/// Terminal report a worker node sends back for one task run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: Uuid,
    /// Node the run executed on; the control plane uses it to settle the
    /// node's slot after the task record has already been finalized.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Terminal status the run reached on the worker.
    pub status: dragnet_store::TaskStatus,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: chrono::DateTime<chrono::Utc>,
}

/// Stream of raw messages from one channel subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Transport abstraction over the pub/sub bus.
///
/// Object-safe; the dispatcher and node agents hold `Arc<dyn PubSub>`.
/// The in-process implementation backs single-binary deployments and
/// tests; a networked broker implements the same trait.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a payload to a channel. Publishing to a channel with no
    /// subscribers is not an error.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to a channel, receiving every payload published after
    /// the subscription is established.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use dragnet_store::TaskType;

    #[test]
    fn channel_names() {
        assert_eq!(assign_channel("node-1"), "task_assign:node-1");
        assert_eq!(cancel_channel("node-1"), "task_cancel:node-1");
    }

    #[test]
    fn envelope_roundtrip() {
        let envelope = TaskEnvelope {
            task: Task::new("probe", TaskType::PortScan),
            node_id: "node-1".to_string(),
        };
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let back: TaskEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.task.id, envelope.task.id);
        assert_eq!(back.node_id, "node-1");
    }
}
