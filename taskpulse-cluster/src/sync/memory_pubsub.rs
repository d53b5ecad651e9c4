//! In-process pub/sub transport for single-node deployments and tests

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::warn;

use super::relay::{PubSubTransport, TransportMessage};
use crate::Result;

/// Default buffer per channel
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Channel name -> broadcast bus
#[derive(Debug)]
pub struct MemoryTransport {
    channels: DashMap<String, broadcast::Sender<String>>,
    buffer_size: usize,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    #[must_use]
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            channels: DashMap::new(),
            buffer_size: buffer_size.max(1),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer_size).0)
            .clone()
    }

    /// Live subscriptions on `channel`
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map_or(0, |sender| sender.receiver_count())
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        if let Some(sender) = self.channels.get(channel) {
            // Nobody listening is fine for pub/sub
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<BoxStream<'static, TransportMessage>> {
        let streams = channels.iter().map(|channel| {
            let name = channel.clone();
            BroadcastStream::new(self.sender(channel).subscribe()).filter_map(move |item| {
                let message = match item {
                    Ok(payload) => Some(TransportMessage {
                        channel: name.clone(),
                        payload,
                    }),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(channel = %name, skipped = skipped, "In-memory subscriber lagged");
                        None
                    }
                };
                future::ready(message)
            })
        });

        Ok(stream::select_all(streams).boxed())
    }
}
