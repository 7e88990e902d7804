//! Task orchestration core of the dragnet control plane.
//!
//! The pieces, leaves first: the [`queue`] manager arbitrates named
//! priority queues; the [`executor`] engine supervises local runs of
//! typed executors; the [`nodes`] registry tracks worker health through
//! heartbeats; the [`dispatch`]er pulls queued work through the
//! dependency gate, places it on a node by weighted scoring, and polices
//! timeouts; the [`cron`] scheduler materializes tasks from schedule
//! rules; the [`agent`] runtime is the node-side consumer of it all.
//! Persistence and transport stay behind the [`dragnet_store::Store`] and
//! [`bus::PubSub`] traits.

pub mod agent;
pub mod bus;
pub mod config;
pub mod cron;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod executor;
pub mod nodes;
pub mod params;
pub mod queue;
pub mod retry;
pub mod state;

pub use config::{
    CronConfig, DispatcherConfig, EngineConfig, EventConfig, NodeMonitorConfig, QueueSyncConfig,
};
pub use error::{OrchestrateError, Result};
