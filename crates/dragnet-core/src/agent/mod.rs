//! Node-side worker runtime.
//!
//! A [`NodeAgent`] is what runs on a worker node: it subscribes to its
//! `task_assign`/`task_cancel` channels, runs assignments on a local
//! [`ExecutionEngine`], pushes heartbeats, and relays terminal reports
//! back to the control plane. In a single-binary deployment the control
//! links are the in-process registry and dispatcher; a remote deployment
//! implements the same two traits over its transport.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dragnet_store::TaskType;

use crate::bus::{PubSub, TaskReport, assign_channel, cancel_channel};
use crate::dispatch::Dispatcher;
use crate::error::{OrchestrateError, Result};
use crate::executor::ExecutionEngine;
use crate::nodes::{Heartbeat, NodeRegistration, NodeRegistry, NodeStatus};

/// Control-plane link for node registration and heartbeats.
#[async_trait]
pub trait ControlLink: Send + Sync {
    async fn register(&self, registration: NodeRegistration) -> Result<()>;
    async fn heartbeat(&self, heartbeat: Heartbeat) -> Result<()>;
}

#[async_trait]
impl ControlLink for NodeRegistry {
    async fn register(&self, registration: NodeRegistration) -> Result<()> {
        NodeRegistry::register(self, registration).await;
        Ok(())
    }

    async fn heartbeat(&self, heartbeat: Heartbeat) -> Result<()> {
        self.ingest_heartbeat(heartbeat).await;
        Ok(())
    }
}

/// Control-plane link for terminal task reports.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn report(&self, report: TaskReport) -> Result<()>;
}

#[async_trait]
impl ReportSink for Dispatcher {
    async fn report(&self, report: TaskReport) -> Result<()> {
        self.ingest_report(report).await
    }
}

/// Static telemetry baseline a node advertises between real samples.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeTelemetry {
    pub cpu_usage_pct: f64,
    pub memory_usage_bytes: u64,
    pub max_memory_bytes: Option<u64>,
    pub net_in_kbps: f64,
    pub net_out_kbps: f64,
}

/// Configuration for one worker node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAgentConfig {
    pub node_id: String,
    /// Task types the node accepts; empty means all.
    #[serde(default)]
    pub task_types: Vec<TaskType>,
    #[serde(default)]
    pub max_concurrent: u32,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default)]
    pub telemetry: NodeTelemetry,
}

fn default_heartbeat_secs() -> u64 {
    10
}

/// The worker-node runtime.
pub struct NodeAgent {
    config: NodeAgentConfig,
    engine: ExecutionEngine,
    bus: Arc<dyn PubSub>,
    control: Arc<dyn ControlLink>,
    reports: Arc<dyn ReportSink>,
    report_rx: tokio::sync::Mutex<Option<mpsc::Receiver<TaskReport>>>,
    cancel: CancellationToken,
}

impl NodeAgent {
    /// Build an agent around an engine. The engine must have been
    /// constructed with [`ExecutionEngine::with_report_channel`] using
    /// the sender half of `report_rx`.
    pub fn new(
        config: NodeAgentConfig,
        engine: ExecutionEngine,
        report_rx: mpsc::Receiver<TaskReport>,
        bus: Arc<dyn PubSub>,
        control: Arc<dyn ControlLink>,
        reports: Arc<dyn ReportSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            engine,
            bus,
            control,
            reports,
            report_rx: tokio::sync::Mutex::new(Some(report_rx)),
            cancel: CancellationToken::new(),
        })
    }

    /// Report channel sized for one node's engine.
    pub fn report_channel() -> (mpsc::Sender<TaskReport>, mpsc::Receiver<TaskReport>) {
        mpsc::channel(64)
    }

    /// Register with the control plane and spawn the agent loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        // Subscribe before announcing the node: an assignment dispatched
        // the moment registration lands must not fall into the gap.
        let assign_stream = self
            .bus
            .subscribe(&assign_channel(&self.config.node_id))
            .await?;
        let cancel_stream = self
            .bus
            .subscribe(&cancel_channel(&self.config.node_id))
            .await?;

        self.control
            .register(NodeRegistration {
                node_id: self.config.node_id.clone(),
                task_types: self.config.task_types.clone(),
                max_concurrent: self.config.max_concurrent,
            })
            .await?;
        // First beat immediately so the node is schedulable before the
        // first interval elapses.
        self.control.heartbeat(self.build_heartbeat(0).await).await?;
        let report_rx = self
            .report_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| OrchestrateError::Validation("node agent started twice".to_string()))?;

        let agent = Arc::clone(self);
        tokio::spawn(async move { agent.heartbeat_loop().await });
        let agent = Arc::clone(self);
        tokio::spawn(async move { agent.assign_loop(assign_stream).await });
        let agent = Arc::clone(self);
        tokio::spawn(async move { agent.cancel_loop(cancel_stream).await });
        let agent = Arc::clone(self);
        tokio::spawn(async move { agent.report_loop(report_rx).await });

        info!(node_id = %self.config.node_id, "node agent started");
        Ok(())
    }

    /// Stop the loops and drain the engine.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.engine.shutdown().await;
        let mut heartbeat = self.build_heartbeat(0).await;
        heartbeat.status = NodeStatus::Offline;
        let _ = self.control.heartbeat(heartbeat).await;
        info!(node_id = %self.config.node_id, "node agent stopped");
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    async fn build_heartbeat(&self, queued: u32) -> Heartbeat {
        let telemetry = &self.config.telemetry;
        Heartbeat {
            node_id: self.config.node_id.clone(),
            timestamp: Utc::now(),
            status: NodeStatus::Online,
            cpu_usage_pct: telemetry.cpu_usage_pct,
            memory_usage_bytes: telemetry.memory_usage_bytes,
            max_memory_bytes: telemetry.max_memory_bytes,
            net_in_kbps: telemetry.net_in_kbps,
            net_out_kbps: telemetry.net_out_kbps,
            running_tasks: self.engine.running_count().await as u32,
            queued_tasks: queued,
            agent_version: self.config.agent_version.clone(),
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let period = std::time::Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => break,
            }
            let heartbeat = self.build_heartbeat(0).await;
            if let Err(e) = self.control.heartbeat(heartbeat).await {
                warn!(node_id = %self.config.node_id, error = %e, "heartbeat failed");
            }
        }
    }

    async fn assign_loop(self: Arc<Self>, mut stream: crate::bus::MessageStream) {
        loop {
            let payload = tokio::select! {
                payload = stream.next() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            };
            let envelope: crate::bus::TaskEnvelope = match serde_json::from_slice(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(node_id = %self.config.node_id, error = %e, "bad assign envelope");
                    continue;
                }
            };
            if envelope.node_id != self.config.node_id {
                debug!(
                    node_id = %self.config.node_id,
                    addressed = %envelope.node_id,
                    "dropping misrouted assignment"
                );
                continue;
            }

            let task_id = envelope.task.id;
            match self.engine.execute_task(envelope.task).await {
                Ok(()) => {}
                // Duplicate deliveries are absorbed inside the engine;
                // capacity refusals leave the task to the watchdog.
                Err(OrchestrateError::CapacityExhausted { limit }) => {
                    warn!(
                        node_id = %self.config.node_id,
                        task_id = %task_id,
                        limit,
                        "assignment refused, engine at capacity"
                    );
                }
                Err(e) => {
                    error!(
                        node_id = %self.config.node_id,
                        task_id = %task_id,
                        error = %e,
                        "assignment failed to start"
                    );
                }
            }
        }
    }

    async fn cancel_loop(self: Arc<Self>, mut stream: crate::bus::MessageStream) {
        loop {
            let payload = tokio::select! {
                payload = stream.next() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            };
            let request: crate::bus::CancelRequest = match serde_json::from_slice(&payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!(node_id = %self.config.node_id, error = %e, "bad cancel request");
                    continue;
                }
            };
            if !self.engine.cancel_task(request.task_id).await {
                debug!(
                    node_id = %self.config.node_id,
                    task_id = %request.task_id,
                    "cancel request for task not running here"
                );
            }
        }
    }

    async fn report_loop(self: Arc<Self>, mut rx: mpsc::Receiver<TaskReport>) {
        loop {
            let report = tokio::select! {
                report = rx.recv() => match report {
                    Some(report) => report,
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            };
            let task_id = report.task_id;
            if let Err(e) = self.reports.report(report).await {
                warn!(
                    node_id = %self.config.node_id,
                    task_id = %task_id,
                    error = %e,
                    "terminal report delivery failed"
                );
            }
        }
    }
}
