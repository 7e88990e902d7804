//! Queue convergence sweep.
//!
//! The in-memory queue sequences and the durable member lists are written
//! together, but a crash between the two writes (or a restart that loses
//! memory entirely) can let them diverge. Once a minute the sweep compares
//! them per queue; on divergence the durable list is authoritative and the
//! in-memory sequence is rebuilt from it, re-reading every task record and
//! dropping members that are no longer dispatchable.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use dragnet_store::TaskStatus;

use crate::config::QueueSyncConfig;
use crate::error::Result;

use super::QueueManager;

/// Run the convergence sweep until cancelled.
pub async fn run(queues: Arc<QueueManager>, config: QueueSyncConfig, cancel: CancellationToken) {
    let period = std::time::Duration::from_secs(config.sweep_interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first interval tick fires immediately; skip it so a fresh
    // process does not sweep before anything has been enqueued.
    ticker.tick().await;

    info!(period_secs = config.sweep_interval_secs, "queue sync started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }
        if let Err(e) = converge_once(&queues).await {
            warn!(error = %e, "queue convergence sweep failed");
        }
    }
    info!("queue sync stopped");
}

/// One full convergence pass over every queue. Returns the number of
/// queues that had to be rebuilt.
pub async fn converge_once(queues: &QueueManager) -> Result<usize> {
    let mut rebuilt = 0;
    for name in queues.names().await {
        let durable = queues.store().list_queue_tasks(&name).await?;
        let memory = queues.members(&name).await.unwrap_or_default();

        if durable == memory {
            continue;
        }

        warn!(
            queue = %name,
            durable_len = durable.len(),
            memory_len = memory.len(),
            "queue diverged from durable list, rebuilding from store"
        );

        let mut members: VecDeque<Uuid> = VecDeque::with_capacity(durable.len());
        for task_id in durable {
            match queues.store().find_task(task_id).await? {
                Some(task) if task.status == TaskStatus::Queued => members.push_back(task_id),
                Some(task) => {
                    debug!(
                        queue = %name,
                        task_id = %task_id,
                        status = %task.status,
                        "dropping non-queued member during convergence"
                    );
                    queues.store().remove_queue_task(&name, task_id).await?;
                    queues.store().update_queue_count(&name, -1).await?;
                }
                None => {
                    warn!(queue = %name, task_id = %task_id, "dropping vanished member during convergence");
                    queues.store().remove_queue_task(&name, task_id).await?;
                    queues.store().update_queue_count(&name, -1).await?;
                }
            }
        }
        queues.replace_members(&name, members).await;
        rebuilt += 1;
    }
    Ok(rebuilt)
}
