//! Live inventory of worker nodes.
//!
//! Nodes own their own telemetry; the control plane only reads it.
//! Heartbeat ingest is the single write path for resource data, while
//! dispatch bookkeeping (running counts, per-type history) is maintained
//! optimistically between beats and corrected by the next one.

pub mod monitor;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use dragnet_store::TaskType;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Availability of a worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    /// Administratively removed from candidate pools.
    Disabled,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeStatus {
    type Err = NodeStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "disabled" => Ok(Self::Disabled),
            other => Err(NodeStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NodeStatus`] string.
#[derive(Debug, Clone)]
pub struct NodeStatusParseError(pub String);

impl fmt::Display for NodeStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node status: {:?}", self.0)
    }
}

impl std::error::Error for NodeStatusParseError {}

/// Periodic status report pushed by a worker node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: NodeStatus,
    pub cpu_usage_pct: f64,
    pub memory_usage_bytes: u64,
    /// Advertised memory budget; selection assumes 50% pressure when
    /// absent.
    pub max_memory_bytes: Option<u64>,
    /// Network throughput in KB/s.
    pub net_in_kbps: f64,
    pub net_out_kbps: f64,
    pub running_tasks: u32,
    pub queued_tasks: u32,
    pub agent_version: String,
}

impl Heartbeat {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp: Utc::now(),
            status: NodeStatus::Online,
            cpu_usage_pct: 0.0,
            memory_usage_bytes: 0,
            max_memory_bytes: None,
            net_in_kbps: 0.0,
            net_out_kbps: 0.0,
            running_tasks: 0,
            queued_tasks: 0,
            agent_version: String::new(),
        }
    }
}

/// Capabilities a node announces when it joins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node_id: String,
    /// Task types the node accepts; empty means "all types".
    pub task_types: Vec<TaskType>,
    /// Concurrency cap; `0` means uncapped.
    pub max_concurrent: u32,
}

/// The control plane's view of one worker node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHandle {
    pub node_id: String,
    pub status: NodeStatus,
    pub task_types: Vec<TaskType>,
    pub max_concurrent: u32,
    pub cpu_usage_pct: f64,
    pub memory_usage_bytes: u64,
    pub max_memory_bytes: Option<u64>,
    pub net_in_kbps: f64,
    pub net_out_kbps: f64,
    pub running_tasks: u32,
    pub queued_tasks: u32,
    pub agent_version: String,
    pub last_seen: DateTime<Utc>,
    /// Tasks this node has completed, per type. Selection biases toward
    /// nodes with history for the type being placed.
    pub type_history: HashMap<TaskType, u64>,
}

impl NodeHandle {
    fn from_registration(reg: NodeRegistration) -> Self {
        Self {
            node_id: reg.node_id,
            status: NodeStatus::Online,
            task_types: reg.task_types,
            max_concurrent: reg.max_concurrent,
            cpu_usage_pct: 0.0,
            memory_usage_bytes: 0,
            max_memory_bytes: None,
            net_in_kbps: 0.0,
            net_out_kbps: 0.0,
            running_tasks: 0,
            queued_tasks: 0,
            agent_version: String::new(),
            last_seen: Utc::now(),
            type_history: HashMap::new(),
        }
    }

    /// Whether the node advertises a task type (empty list = all types).
    pub fn accepts(&self, task_type: TaskType) -> bool {
        self.task_types.is_empty() || self.task_types.contains(&task_type)
    }

    /// Whether the node has spare slots (cap of `0` = uncapped).
    pub fn has_capacity(&self) -> bool {
        self.max_concurrent == 0 || self.running_tasks < self.max_concurrent
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// In-memory registry of worker nodes; the constructor returns an opaque
/// handle owning its own lock.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, NodeHandle>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce (or re-announce) a node's capabilities.
    pub async fn register(&self, reg: NodeRegistration) {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(&reg.node_id) {
            Some(node) => {
                node.task_types = reg.task_types;
                node.max_concurrent = reg.max_concurrent;
                node.status = NodeStatus::Online;
                node.last_seen = Utc::now();
            }
            None => {
                info!(node_id = %reg.node_id, "node registered");
                nodes.insert(reg.node_id.clone(), NodeHandle::from_registration(reg));
            }
        }
    }

    /// Ingest a heartbeat, implicitly registering unknown nodes.
    pub async fn ingest_heartbeat(&self, hb: Heartbeat) {
        let mut nodes = self.nodes.write().await;
        let node = nodes.entry(hb.node_id.clone()).or_insert_with(|| {
            info!(node_id = %hb.node_id, "node discovered via heartbeat");
            NodeHandle::from_registration(NodeRegistration {
                node_id: hb.node_id.clone(),
                task_types: Vec::new(),
                max_concurrent: 0,
            })
        });
        // A disabled node stays disabled regardless of what it reports.
        if node.status != NodeStatus::Disabled {
            node.status = hb.status;
        }
        node.cpu_usage_pct = hb.cpu_usage_pct;
        node.memory_usage_bytes = hb.memory_usage_bytes;
        node.max_memory_bytes = hb.max_memory_bytes;
        node.net_in_kbps = hb.net_in_kbps;
        node.net_out_kbps = hb.net_out_kbps;
        node.running_tasks = hb.running_tasks;
        node.queued_tasks = hb.queued_tasks;
        node.agent_version = hb.agent_version;
        node.last_seen = hb.timestamp;
    }

    pub async fn get(&self, node_id: &str) -> Option<NodeHandle> {
        self.nodes.read().await.get(node_id).cloned()
    }

    /// All nodes, stable order.
    pub async fn list(&self) -> Vec<NodeHandle> {
        let nodes = self.nodes.read().await;
        let mut all: Vec<NodeHandle> = nodes.values().cloned().collect();
        all.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        all
    }

    /// Candidate pool for selection: online nodes only, stable order.
    pub async fn online_snapshot(&self) -> Vec<NodeHandle> {
        let nodes = self.nodes.read().await;
        let mut online: Vec<NodeHandle> = nodes
            .values()
            .filter(|n| n.status == NodeStatus::Online)
            .cloned()
            .collect();
        online.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        online
    }

    pub async fn set_status(&self, node_id: &str, status: NodeStatus) -> bool {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(node_id) {
            Some(node) => {
                node.status = status;
                true
            }
            None => false,
        }
    }

    /// Bump the running count when a task is placed on a node. The next
    /// heartbeat overwrites with the node's own number.
    pub async fn record_dispatch(&self, node_id: &str) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(node_id) {
            node.running_tasks = node.running_tasks.saturating_add(1);
        }
    }

    /// Record a completed run for affinity history and drop the slot.
    pub async fn record_completion(&self, node_id: &str, task_type: TaskType) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(node_id) {
            node.running_tasks = node.running_tasks.saturating_sub(1);
            *node.type_history.entry(task_type).or_insert(0) += 1;
        }
    }

    /// Drop a slot without recording history (failed/timed-out runs).
    pub async fn release(&self, node_id: &str) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(node_id) {
            node.running_tasks = node.running_tasks.saturating_sub(1);
        }
    }

    /// Mark nodes silent for longer than `offline_after` as offline.
    /// Returns the ids that flipped.
    pub async fn sweep_offline(&self, offline_after: chrono::Duration) -> Vec<String> {
        let cutoff = Utc::now() - offline_after;
        let mut flipped = Vec::new();
        let mut nodes = self.nodes.write().await;
        for node in nodes.values_mut() {
            if node.status == NodeStatus::Online && node.last_seen < cutoff {
                node.status = NodeStatus::Offline;
                debug!(node_id = %node.node_id, last_seen = %node.last_seen, "node marked offline");
                flipped.push(node.node_id.clone());
            }
        }
        flipped
    }

    pub async fn count(&self) -> usize {
        self.nodes.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heartbeat_discovers_and_updates() {
        let registry = NodeRegistry::new();
        let mut hb = Heartbeat::new("node-1");
        hb.cpu_usage_pct = 42.0;
        hb.running_tasks = 3;
        registry.ingest_heartbeat(hb).await;

        let node = registry.get("node-1").await.unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.cpu_usage_pct, 42.0);
        assert_eq!(node.running_tasks, 3);
        assert!(node.accepts(TaskType::VulnScan), "empty list means all types");
    }

    #[tokio::test]
    async fn disabled_node_ignores_heartbeat_status() {
        let registry = NodeRegistry::new();
        registry.ingest_heartbeat(Heartbeat::new("node-1")).await;
        registry.set_status("node-1", NodeStatus::Disabled).await;

        registry.ingest_heartbeat(Heartbeat::new("node-1")).await;
        let node = registry.get("node-1").await.unwrap();
        assert_eq!(node.status, NodeStatus::Disabled);
        assert!(registry.online_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn dispatch_and_completion_bookkeeping() {
        let registry = NodeRegistry::new();
        registry
            .register(NodeRegistration {
                node_id: "node-1".to_string(),
                task_types: vec![TaskType::PortScan],
                max_concurrent: 2,
            })
            .await;

        registry.record_dispatch("node-1").await;
        registry.record_dispatch("node-1").await;
        let node = registry.get("node-1").await.unwrap();
        assert_eq!(node.running_tasks, 2);
        assert!(!node.has_capacity());

        registry.record_completion("node-1", TaskType::PortScan).await;
        let node = registry.get("node-1").await.unwrap();
        assert_eq!(node.running_tasks, 1);
        assert_eq!(node.type_history[&TaskType::PortScan], 1);
        assert!(node.has_capacity());
    }

    #[tokio::test]
    async fn sweep_marks_silent_nodes_offline() {
        let registry = NodeRegistry::new();
        let mut hb = Heartbeat::new("stale");
        hb.timestamp = Utc::now() - chrono::Duration::seconds(120);
        registry.ingest_heartbeat(hb).await;
        registry.ingest_heartbeat(Heartbeat::new("fresh")).await;

        let flipped = registry.sweep_offline(chrono::Duration::seconds(30)).await;
        assert_eq!(flipped, vec!["stale".to_string()]);

        let online = registry.online_snapshot().await;
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].node_id, "fresh");
    }

    #[tokio::test]
    async fn release_saturates_at_zero() {
        let registry = NodeRegistry::new();
        registry.ingest_heartbeat(Heartbeat::new("node-1")).await;
        registry.release("node-1").await;
        assert_eq!(registry.get("node-1").await.unwrap().running_tasks, 0);
    }
}
