//! Heartbeat-driven failure detection.
//!
//! Worker nodes push heartbeats at a configured interval; a node silent
//! for more than three intervals is marked offline and drops out of the
//! candidate pool. The sweep runs at the heartbeat interval, so the
//! effective detection latency is between three and four intervals.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::NodeMonitorConfig;

use super::NodeRegistry;

/// Run the offline sweep until cancelled.
pub async fn run(nodes: Arc<NodeRegistry>, config: NodeMonitorConfig, cancel: CancellationToken) {
    let offline_after = chrono::Duration::from_std(config.offline_after())
        .unwrap_or_else(|_| chrono::Duration::seconds(30));
    let mut ticker = tokio::time::interval(config.heartbeat_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    info!(
        heartbeat_secs = config.heartbeat_interval_secs,
        offline_multiplier = config.offline_multiplier,
        "node monitor started"
    );
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }
        let flipped = nodes.sweep_offline(offline_after).await;
        if !flipped.is_empty() {
            warn!(nodes = ?flipped, "nodes missed heartbeats, marked offline");
        }
    }
    info!("node monitor stopped");
}
