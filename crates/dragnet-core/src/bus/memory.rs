//! In-process pub/sub over per-channel broadcast channels.
//!
//! Channels are created lazily on first publish or subscribe. A lagging
//! subscriber loses the overrun messages (logged) and keeps receiving --
//! consistent with the at-least-once, duplicate-tolerant contract, which
//! already requires consumers to survive imperfect delivery.

use std::collections::HashMap;
use std::sync::Mutex;

use async_stream::stream;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::Result;

use super::{MessageStream, PubSub};

const CHANNEL_CAPACITY: usize = 256;

/// In-process implementation of [`PubSub`].
#[derive(Default)]
pub struct InProcessBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self.channels.lock().expect("bus lock poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSub for InProcessBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        // A send error only means nobody is subscribed right now.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let mut rx = self.sender(channel).subscribe();
        let channel = channel.to_string();
        let stream: MessageStream = Box::pin(stream! {
            loop {
                match rx.recv().await {
                    Ok(payload) => yield payload,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(channel = %channel, missed, "bus subscriber lagged, messages lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = InProcessBus::new();
        let mut stream = bus.subscribe("task_assign:node-1").await.unwrap();

        bus.publish("task_assign:node-1", b"payload".to_vec())
            .await
            .unwrap();

        let got = stream.next().await.unwrap();
        assert_eq!(got, b"payload");
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bus = InProcessBus::new();
        let mut a = bus.subscribe("task_assign:a").await.unwrap();
        let _b = bus.subscribe("task_assign:b").await.unwrap();

        bus.publish("task_assign:a", b"for-a".to_vec()).await.unwrap();

        let got = a.next().await.unwrap();
        assert_eq!(got, b"for-a");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = InProcessBus::new();
        assert!(bus.publish("task_assign:ghost", vec![1]).await.is_ok());
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_messages() {
        let bus = InProcessBus::new();
        bus.publish("c", b"early".to_vec()).await.unwrap();

        let mut stream = bus.subscribe("c").await.unwrap();
        bus.publish("c", b"late".to_vec()).await.unwrap();

        let got = stream.next().await.unwrap();
        assert_eq!(got, b"late");
    }
}
