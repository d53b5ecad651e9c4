use anyhow::Context;
use async_trait::async_trait;
use futures::future;
use futures::stream::{BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient};
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

use super::relay::{PubSubTransport, TransportMessage};
use crate::{Error, Result};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Redis Pub/Sub transport for multi-replica deployments
///
/// Publishing goes through a shared auto-reconnecting connection; every
/// subscription opens its own dedicated Pub/Sub connection, as Redis requires.
pub struct RedisTransport {
    redis_client: RedisClient,
    publisher: ConnectionManager,
}

impl RedisTransport {
    /// Connect to Redis. Fails if the server cannot be reached within the timeout.
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let redis_client = RedisClient::open(redis_url).context("Failed to create Redis client")?;

        let publisher = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            redis_client.get_connection_manager(),
        )
        .await
        .context("Timed out connecting to Redis")?
        .context("Failed to connect to Redis")?;

        info!("Redis transport connected");

        Ok(Self {
            redis_client,
            publisher,
        })
    }
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.publisher.clone();

        let _receivers: usize = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish(channel, payload),
        )
        .await
        .map_err(|_| Error::Transport(format!("Timed out publishing to {channel}")))??;

        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<BoxStream<'static, TransportMessage>> {
        let mut pubsub = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.redis_client.get_async_pubsub(),
        )
        .await
        .map_err(|_| Error::Transport("Timed out getting Redis Pub/Sub connection".to_string()))??;

        timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.subscribe(channels.to_vec()),
        )
        .await
        .map_err(|_| Error::Transport(format!("Timed out subscribing to {channels:?}")))??;

        let stream = pubsub.into_on_message().filter_map(|msg| {
            let channel = msg.get_channel_name().to_string();
            let message = match msg.get_payload::<String>() {
                Ok(payload) => Some(TransportMessage { channel, payload }),
                Err(e) => {
                    warn!(error = %e, channel = %channel, "Invalid payload");
                    None
                }
            };
            future::ready(message)
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::events::{Action, Event, Topic};
    use crate::sync::relay::{Relay, RelayConfig};
    use serde_json::json;
    use std::sync::Arc;
    use taskpulse_core::models::{EntityId, EntityKind};

    #[tokio::test]
    async fn test_connect_fails_for_bad_url() {
        assert!(RedisTransport::connect("not-a-redis-url").await.is_err());
    }

    // Integration tests require Redis running
    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_pubsub_integration() {
        let redis_url = "redis://127.0.0.1:6379";
        let config = RelayConfig {
            key_prefix: format!("taskpulse-test-{}:", nanoid::nanoid!(8)),
            ..RelayConfig::default()
        };

        // Two relays simulating different nodes
        let node1 = Arc::new(Relay::new(
            Arc::new(RedisTransport::connect(redis_url).await.unwrap()),
            config.clone(),
        ));
        let node2 = Arc::new(Relay::new(
            Arc::new(RedisTransport::connect(redis_url).await.unwrap()),
            config,
        ));
        let _t1 = node1.clone().start();
        let _t2 = node2.clone().start();
        node1.wait_subscribed().await;
        node2.wait_subscribed().await;

        let mut rx = node2.subscribe(&[Topic::TaskUpdates]);

        let event = Event::new(
            EntityKind::Task,
            Action::Updated,
            json!({"id": EntityId::new().to_string(), "title": "from node1"}),
        );
        node1.publish(Topic::TaskUpdates, &event).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, event);

        node1.shutdown();
        node2.shutdown();
    }
}
