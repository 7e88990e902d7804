//! Task event pipeline.
//!
//! Producers (engine, dispatcher, cron) emit through a bounded channel
//! with a non-blocking send; when the channel is full the new event is
//! dropped and a counter incremented, so a slow store can never stall the
//! scheduling path. A single drain task persists events to the flat log
//! and the per-task ring buffer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dragnet_store::{Store, TaskEvent};

use crate::config::EventConfig;

/// Cloneable producer handle for the event channel.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<TaskEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// Emit an event without blocking. Overflow drops the event.
    pub fn emit(&self, event: TaskEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                task_id = %event.task_id,
                kind = %event.kind,
                dropped_total = dropped,
                "event channel full, dropping event"
            );
        }
    }

    /// Total events dropped due to channel overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// A sink whose events go nowhere. For components constructed before
    /// the pipeline, and for tests that do not observe events.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Consumer half of the event channel.
pub struct EventDrain {
    rx: mpsc::Receiver<TaskEvent>,
    store: Arc<dyn Store>,
    config: EventConfig,
}

impl EventDrain {
    /// Persist events until the channel closes or `cancel` fires.
    ///
    /// Store failures are logged and the event skipped; the stream is
    /// lossy by contract.
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("event drain started");
        loop {
            let event = tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };

            if let Err(e) = self.store.insert_event(&event).await {
                warn!(task_id = %event.task_id, error = %e, "failed to persist event");
                continue;
            }
            if let Err(e) = self
                .store
                .append_task_event_buffer(
                    event.task_id,
                    &event,
                    self.config.ring_capacity,
                    self.config.ring_ttl_secs,
                )
                .await
            {
                warn!(task_id = %event.task_id, error = %e, "failed to append event ring");
            }
        }
        debug!("event drain stopped");
    }
}

/// Build the event pipeline: a sink for producers and the drain task.
pub fn event_pipeline(store: Arc<dyn Store>, config: EventConfig) -> (EventSink, EventDrain) {
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let sink = EventSink {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let drain = EventDrain { rx, store, config };
    (sink, drain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dragnet_store::{MemoryStore, TaskEventKind};
    use uuid::Uuid;

    #[tokio::test]
    async fn events_flow_to_store_and_ring() {
        let store = Arc::new(MemoryStore::new());
        let (sink, drain) = event_pipeline(store.clone(), EventConfig::default());
        let cancel = CancellationToken::new();
        let drain_handle = tokio::spawn(drain.run(cancel.clone()));

        let task_id = Uuid::new_v4();
        sink.emit(TaskEvent::new(task_id, TaskEventKind::TaskQueued, "queued"));
        sink.emit(TaskEvent::new(
            task_id,
            TaskEventKind::TaskCompleted,
            "done",
        ));

        // Give the drain a moment to persist, then stop it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        drain_handle.await.unwrap();

        assert_eq!(store.event_log_len().await, 2);
        let ring = store.list_task_events(task_id).await.unwrap();
        assert_eq!(ring.len(), 2);
        assert_eq!(ring[0].kind, TaskEventKind::TaskQueued);
    }

    #[tokio::test]
    async fn overflow_drops_newest_and_counts() {
        let store = Arc::new(MemoryStore::new());
        let (sink, _drain) = event_pipeline(
            store,
            EventConfig {
                channel_capacity: 2,
                ..EventConfig::default()
            },
        );

        // No drain running; the third send must overflow.
        let task_id = Uuid::new_v4();
        for _ in 0..3 {
            sink.emit(TaskEvent::new(task_id, TaskEventKind::TaskProgress, "p"));
        }
        assert_eq!(sink.dropped(), 1);
    }
}
