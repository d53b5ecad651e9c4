//! Pub/Sub relay
//!
//! Bridges local event delivery with an external pub/sub transport so every
//! server instance sees the same logical event stream:
//! 1. `publish` serializes an event onto `{key_prefix}{topic}`
//! 2. one subscriber task per instance listens on all static topics
//! 3. received events fan out to local [`RelaySubscription`]s through a
//!    per-topic broadcast channel

use async_trait::async_trait;
use futures::stream::{BoxStream, SelectAll, Stream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use taskpulse_core::Config;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error, info, warn};

use super::events::{self, Event, Topic};
use crate::{Error, Result};

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Events buffered per topic for slow local subscribers
const LOCAL_CHANNEL_CAPACITY: usize = 1024;

/// Raw message received from a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub channel: String,
    pub payload: String,
}

/// External pub/sub backend
#[async_trait]
pub trait PubSubTransport: Send + Sync + 'static {
    /// Send `payload` to every current subscriber of `channel`
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Open one subscription covering `channels`. The stream ends when the
    /// underlying connection is lost.
    async fn subscribe(&self, channels: &[String]) -> Result<BoxStream<'static, TransportMessage>>;
}

/// Relay settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub key_prefix: String,
    pub publish_attempts: u32,
    pub publish_timeout: Duration,
    pub publish_backoff: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            key_prefix: "taskpulse:".to_string(),
            publish_attempts: 3,
            publish_timeout: Duration::from_secs(2),
            publish_backoff: Duration::from_millis(100),
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            key_prefix: config.redis.key_prefix.clone(),
            publish_attempts: config.realtime.publish_attempts.max(1),
            publish_timeout: config.realtime.publish_timeout(),
            publish_backoff: config.realtime.publish_backoff(),
        }
    }
}

/// Broadcast bus over an external pub/sub transport
pub struct Relay {
    transport: Arc<dyn PubSubTransport>,
    config: RelayConfig,
    local: HashMap<Topic, broadcast::Sender<Event>>,
    subscribed: watch::Sender<bool>,
    cancel_token: CancellationToken,
    published: AtomicU64,
    publish_failures: AtomicU64,
    received: AtomicU64,
}

impl Relay {
    #[must_use]
    pub fn new(transport: Arc<dyn PubSubTransport>, config: RelayConfig) -> Self {
        let local = Topic::ALL
            .into_iter()
            .map(|topic| (topic, broadcast::channel(LOCAL_CHANNEL_CAPACITY).0))
            .collect();

        Self {
            transport,
            config,
            local,
            subscribed: watch::Sender::new(false),
            cancel_token: CancellationToken::new(),
            published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            received: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Get the cancellation token for external shutdown signaling
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Stop the subscriber task and end every open [`RelaySubscription`]
    pub fn shutdown(&self) {
        info!("Shutting down relay");
        self.cancel_token.cancel();
    }

    /// Publish one event, single bounded attempt
    pub async fn publish(&self, topic: Topic, event: &Event) -> Result<()> {
        let channel = topic.channel(&self.config.key_prefix);
        let payload = events::encode(event)?;

        let result = match timeout(
            self.config.publish_timeout,
            self.transport.publish(&channel, &payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Transport(format!("Timed out publishing to {channel}"))),
        };

        match &result {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    channel = %channel,
                    entity = %event.entity,
                    action = %event.action,
                    "Event published"
                );
            }
            Err(_) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        result
    }

    /// Publish with up to `publish_attempts` attempts and doubling backoff.
    /// Returns the last transport error once attempts are exhausted.
    pub async fn publish_with_retry(&self, topic: Topic, event: &Event) -> Result<()> {
        let attempts = self.config.publish_attempts.max(1);
        let mut backoff = self.config.publish_backoff;
        let mut attempt = 1;

        loop {
            match self.publish(topic, event).await {
                Ok(()) => return Ok(()),
                // Encoding failures will not improve on retry
                Err(e @ Error::Codec(_)) => return Err(e),
                Err(e) if attempt >= attempts => {
                    warn!(
                        error = %e,
                        topic = %topic,
                        attempts = attempts,
                        "Dropping event after failed publish attempts"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        topic = %topic,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }

    /// Independent stream of events for `topics`
    ///
    /// Events on one topic arrive in transport order; there is no ordering
    /// across topics. Only events received after this call are delivered.
    #[must_use]
    pub fn subscribe(&self, topics: &[Topic]) -> RelaySubscription {
        let mut streams = SelectAll::new();
        for topic in topics {
            if let Some(sender) = self.local.get(topic) {
                streams.push(BroadcastStream::new(sender.subscribe()));
            }
        }
        RelaySubscription {
            streams,
            closed: Box::pin(self.cancel_token.clone().cancelled_owned()),
        }
    }

    /// Wait until the subscriber task holds a live external subscription
    pub async fn wait_subscribed(&self) {
        let mut rx = self.subscribed.subscribe();
        // Only fails if the sender is dropped, which means `self` is gone
        let _ = rx.wait_for(|subscribed| *subscribed).await;
    }

    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        *self.subscribed.borrow()
    }

    /// Spawn the per-instance subscriber task
    ///
    /// Reconnects with exponential backoff when the transport drops and exits
    /// when the relay is shut down.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let cancel = self.cancel_token.clone();

        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;

            loop {
                if cancel.is_cancelled() {
                    info!("Relay subscriber task cancelled");
                    break;
                }

                match self.run_subscriber().await {
                    SubscriberExit::Cancelled => {
                        info!("Relay subscriber task cancelled");
                        break;
                    }
                    SubscriberExit::Disconnected => {
                        // Connection was healthy before it dropped
                        error!(
                            "Relay subscription ended (connection lost), reconnecting after {}s",
                            INITIAL_BACKOFF_SECS
                        );
                        backoff_secs = INITIAL_BACKOFF_SECS;
                    }
                    SubscriberExit::ConnectFailed(e) => {
                        error!(
                            error = %e,
                            backoff_secs = backoff_secs,
                            "Relay failed to subscribe, retrying after backoff"
                        );
                    }
                }

                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("Relay subscriber task cancelled during backoff");
                        break;
                    }
                    () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }

                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }

            self.subscribed.send_replace(false);
        })
    }

    async fn run_subscriber(&self) -> SubscriberExit {
        let channels: Vec<String> = Topic::ALL
            .iter()
            .map(|topic| topic.channel(&self.config.key_prefix))
            .collect();

        let mut stream = match self.transport.subscribe(&channels).await {
            Ok(stream) => stream,
            Err(e) => return SubscriberExit::ConnectFailed(e),
        };

        info!(channels = ?channels, "Relay subscribed");
        self.subscribed.send_replace(true);

        let exit = loop {
            let msg = tokio::select! {
                () = self.cancel_token.cancelled() => break SubscriberExit::Cancelled,
                msg = stream.next() => msg,
            };

            match msg {
                Some(msg) => self.dispatch(&msg),
                None => break SubscriberExit::Disconnected,
            }
        };

        self.subscribed.send_replace(false);
        exit
    }

    fn dispatch(&self, msg: &TransportMessage) {
        let Some(topic) = Topic::from_channel(&self.config.key_prefix, &msg.channel) else {
            warn!(channel = %msg.channel, "Message on unknown channel");
            return;
        };

        let event = match events::decode(&msg.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    error = %e,
                    channel = %msg.channel,
                    payload = %msg.payload,
                    "Failed to decode relayed event"
                );
                return;
            }
        };

        self.received.fetch_add(1, Ordering::Relaxed);

        if let Some(sender) = self.local.get(&topic) {
            // No local subscribers is not an error
            let receivers = sender.send(event).unwrap_or(0);
            debug!(topic = %topic, local_subscribers = receivers, "Relayed event");
        }
    }

    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn publish_failure_count(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

/// How the subscriber loop exited, which decides the backoff behavior
enum SubscriberExit {
    /// Shutdown was requested
    Cancelled,
    /// Subscription was live, then the transport stream ended. Backoff resets.
    Disconnected,
    /// Could not subscribe. Backoff keeps increasing.
    ConnectFailed(Error),
}

/// Continuous stream of relayed events for a set of topics
///
/// Ends when the relay shuts down. A subscriber that falls more than the
/// local buffer behind skips the missed events.
pub struct RelaySubscription {
    streams: SelectAll<BroadcastStream<Event>>,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl RelaySubscription {
    /// Next event, or `None` once the relay has shut down
    pub async fn recv(&mut self) -> Option<Event> {
        self.next().await
    }
}

impl Stream for RelaySubscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        if self.closed.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }

        loop {
            match self.streams.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(skipped = skipped, "Relay subscriber lagged, events dropped");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::memory_pubsub::MemoryTransport;
    use mockall::mock;
    use serde_json::json;
    use taskpulse_core::models::{EntityId, EntityKind};

    mock! {
        pub Transport {}

        #[async_trait]
        impl PubSubTransport for Transport {
            async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
            async fn subscribe(&self, channels: &[String]) -> Result<BoxStream<'static, TransportMessage>>;
        }
    }

    fn task_event(title: &str) -> Event {
        Event::new(
            EntityKind::Task,
            events::Action::Updated,
            json!({"id": EntityId::new().to_string(), "title": title}),
        )
    }

    #[tokio::test]
    async fn test_publish_uses_prefixed_channel() {
        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .withf(|channel, payload| {
                channel.to_string() == "tp:task_updates" && payload.contains("\"title\":\"t1\"")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let relay = Relay::new(
            Arc::new(transport),
            RelayConfig {
                key_prefix: "tp:".to_string(),
                ..RelayConfig::default()
            },
        );

        relay.publish(Topic::TaskUpdates, &task_event("t1")).await.unwrap();
        assert_eq!(relay.published_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_retries_then_succeeds() {
        let mut transport = MockTransport::new();
        let mut seq = mockall::Sequence::new();
        transport
            .expect_publish()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(Error::Transport("connection refused".to_string())));
        transport
            .expect_publish()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let relay = Relay::new(Arc::new(transport), RelayConfig::default());
        relay
            .publish_with_retry(Topic::TaskUpdates, &task_event("t1"))
            .await
            .unwrap();

        assert_eq!(relay.publish_failure_count(), 2);
        assert_eq!(relay.published_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_gives_up_after_attempts() {
        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .times(3)
            .returning(|_, _| Err(Error::Transport("connection refused".to_string())));

        let relay = Relay::new(Arc::new(transport), RelayConfig::default());
        let err = relay
            .publish_with_retry(Topic::TaskUpdates, &task_event("t1"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(relay.publish_failure_count(), 3);
    }

    #[tokio::test]
    async fn test_subscriptions_receive_independent_copies() {
        let relay = Arc::new(Relay::new(
            Arc::new(MemoryTransport::new()),
            RelayConfig::default(),
        ));
        let _task = relay.clone().start();
        relay.wait_subscribed().await;

        let mut first = relay.subscribe(&[Topic::TaskUpdates]);
        let mut second = relay.subscribe(&[Topic::TaskUpdates, Topic::CommentUpdates]);

        let event = task_event("t1");
        relay.publish(Topic::TaskUpdates, &event).await.unwrap();

        assert_eq!(first.recv().await.unwrap(), event);
        assert_eq!(second.recv().await.unwrap(), event);

        relay.shutdown();
    }

    #[tokio::test]
    async fn test_subscription_filters_topics() {
        let relay = Arc::new(Relay::new(
            Arc::new(MemoryTransport::new()),
            RelayConfig::default(),
        ));
        let _task = relay.clone().start();
        relay.wait_subscribed().await;

        let mut comments = relay.subscribe(&[Topic::CommentUpdates]);

        relay
            .publish(Topic::TaskUpdates, &task_event("ignored"))
            .await
            .unwrap();
        let comment = Event::new(
            EntityKind::Comment,
            events::Action::Created,
            json!({"id": EntityId::new().to_string(), "body": "hi"}),
        );
        relay.publish(Topic::CommentUpdates, &comment).await.unwrap();

        assert_eq!(comments.recv().await.unwrap(), comment);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_ends_subscriptions() {
        let relay = Arc::new(Relay::new(
            Arc::new(MemoryTransport::new()),
            RelayConfig::default(),
        ));
        let task = relay.clone().start();
        relay.wait_subscribed().await;

        let mut open = relay.subscribe(&Topic::ALL);
        relay.shutdown();

        assert!(open.recv().await.is_none());
        // subscriptions taken after shutdown are already finished
        assert!(relay.subscribe(&[Topic::TaskUpdates]).recv().await.is_none());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_payload_is_skipped() {
        let transport = Arc::new(MemoryTransport::new());
        let relay = Arc::new(Relay::new(transport.clone(), RelayConfig::default()));
        let _task = relay.clone().start();
        relay.wait_subscribed().await;

        let mut sub = relay.subscribe(&[Topic::TaskUpdates]);

        transport
            .publish("taskpulse:task_updates", "{broken")
            .await
            .unwrap();
        let event = task_event("after");
        relay.publish(Topic::TaskUpdates, &event).await.unwrap();

        assert_eq!(sub.recv().await.unwrap(), event);
        assert_eq!(relay.received_count(), 1);
        relay.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriber_retries_failed_subscribe() {
        let mut transport = MockTransport::new();
        let mut seq = mockall::Sequence::new();
        transport
            .expect_subscribe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::Transport("connection refused".to_string())));
        transport
            .expect_subscribe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(futures::stream::pending::<TransportMessage>().boxed()));

        let relay = Arc::new(Relay::new(Arc::new(transport), RelayConfig::default()));
        let task = relay.clone().start();

        relay.wait_subscribed().await;
        assert!(relay.is_subscribed());

        relay.shutdown();
        task.await.unwrap();
        assert!(!relay.is_subscribed());
    }
}
