//! Realtime hub
//!
//! Single entry point for the transport adapter. It owns:
//! - the connection registry
//! - the pub/sub relay and its subscriber task
//! - the access filter, applied by each connection's relay subscription
//! - the write coalescer
//!
//! Every registered connection gets its own relay subscription for the
//! topics of its session, running in a task that ends with the connection.

use std::sync::Arc;
use taskpulse_core::config::RealtimeConfig;
use taskpulse_core::models::{EntityId, EntityKind, MutationFields, UserId};
use taskpulse_core::repository::{AccessRepository, MutationStore};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::access::AccessFilter;
use super::debounce::{DebounceKey, WriteCoalescer};
use super::events::{ClientRequest, Event, Topic};
use super::registry::{ConnectionHandle, ConnectionRegistry, Frame};
use super::relay::{PubSubTransport, Relay, RelayConfig, RelaySubscription};
use crate::{Error, Result};

/// Hub metrics, as reported by the health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubMetrics {
    pub connections: usize,
    pub identities: usize,
    pub pending_writes: usize,
    pub relay_subscribed: bool,
}

pub struct RealtimeHub {
    registry: Arc<ConnectionRegistry>,
    relay: Arc<Relay>,
    access: Arc<AccessFilter>,
    coalescer: Arc<WriteCoalescer>,
    config: RealtimeConfig,
    cancel_token: CancellationToken,
    tasks: TaskTracker,
}

impl RealtimeHub {
    #[must_use]
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        relay_config: RelayConfig,
        access_repository: Arc<dyn AccessRepository>,
        mutation_store: Arc<dyn MutationStore>,
        config: RealtimeConfig,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = Arc::new(Relay::new(transport, relay_config));
        let access = Arc::new(AccessFilter::new(access_repository, registry.clone()));
        let coalescer = Arc::new(WriteCoalescer::new(
            relay.clone(),
            mutation_store,
            config.debounce_period(),
        ));

        Self {
            registry,
            relay,
            access,
            coalescer,
            config,
            cancel_token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    #[must_use]
    pub const fn access(&self) -> &Arc<AccessFilter> {
        &self.access
    }

    #[must_use]
    pub const fn coalescer(&self) -> &Arc<WriteCoalescer> {
        &self.coalescer
    }

    #[must_use]
    pub const fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    /// Spawn the relay subscriber task
    pub fn start(&self) {
        let relay_task = self.relay.clone().start();
        self.tasks.spawn(async move {
            if let Err(e) = relay_task.await {
                warn!(error = %e, "Relay subscriber task ended abnormally");
            }
        });
        info!("Realtime hub started");
    }

    /// Create a handle for a newly verified connection. It is closed when the
    /// hub shuts down.
    #[must_use]
    pub fn new_connection(&self, identity: UserId) -> (ConnectionHandle, mpsc::Receiver<Frame>) {
        ConnectionHandle::with_cancel_token(
            identity,
            self.config.outbound_queue_capacity,
            self.cancel_token.child_token(),
        )
    }

    /// Register the connection and open its relay subscription for `topics`.
    ///
    /// Events published after this returns reach the connection if its
    /// identity is entitled to them.
    pub fn on_connection_established(&self, handle: ConnectionHandle, topics: &[Topic]) {
        let subscription = self.relay.subscribe(topics);
        self.registry.register(handle.clone());
        self.spawn_session(handle, subscription, topics.len());
    }

    fn spawn_session(&self, handle: ConnectionHandle, mut subscription: RelaySubscription, topics: usize) {
        let access = self.access.clone();

        self.tasks.spawn(async move {
            let cancel = handle.cancel_token();
            debug!(
                user_id = %handle.identity(),
                connection_id = %handle.id(),
                topics = topics,
                "Connection subscription started"
            );

            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = subscription.recv() => event,
                };

                let Some(event) = event else {
                    debug!(connection_id = %handle.id(), "Relay subscription closed");
                    break;
                };

                // A failed write has already unregistered the handle
                if access.deliver_to(&event, &handle).await.failed > 0 {
                    break;
                }
            }

            debug!(connection_id = %handle.id(), "Connection subscription stopped");
        });
    }

    /// Unregister the connection. This closes it, which ends its subscription.
    pub fn on_connection_closed(&self, handle: &ConnectionHandle) {
        self.registry.unregister(handle);
    }

    /// Close every connection, leaving the relay and coalescer running
    pub fn close_connections(&self) {
        self.registry.close_all();
    }

    /// Handle a frame sent by a client: decode, check the sender may see the
    /// entity, then publish it to every entitled connection.
    pub async fn on_client_message(&self, handle: &ConnectionHandle, raw: &str) -> Result<()> {
        if raw.len() > self.config.max_message_bytes {
            return Err(Error::InvalidEvent(format!(
                "Message of {} bytes exceeds limit of {}",
                raw.len(),
                self.config.max_message_bytes
            )));
        }

        let event = ClientRequest::decode(raw)?.into_event()?;

        if !self.access.is_eligible(&event, handle.identity()).await? {
            return Err(Error::Forbidden(format!(
                "{} has no access to {}",
                handle.identity(),
                event.entity
            )));
        }

        self.relay.publish_with_retry(event.topic(), &event).await?;

        debug!(
            user_id = %handle.identity(),
            connection_id = %handle.id(),
            entity = %event.entity,
            action = %event.action,
            "Client event published"
        );
        Ok(())
    }

    /// Check `identity` may observe and edit the entity
    pub async fn authorize(&self, identity: &UserId, kind: EntityKind, id: &EntityId) -> Result<()> {
        let scope = Event::updated(kind, id, &MutationFields::new());
        if self.access.is_eligible(&scope, identity).await? {
            Ok(())
        } else {
            Err(Error::Forbidden(format!("{identity} has no access to {kind} {id}")))
        }
    }

    /// Publish an edit now and coalesce its durable write
    pub async fn request_update(
        &self,
        kind: EntityKind,
        id: EntityId,
        fields: MutationFields,
    ) -> Result<()> {
        self.coalescer
            .request_update(DebounceKey::new(kind, id), fields)
            .await
    }

    #[must_use]
    pub fn metrics(&self) -> HubMetrics {
        let registry = self.registry.metrics();
        HubMetrics {
            connections: registry.active_connections,
            identities: registry.active_identities,
            pending_writes: self.coalescer.pending_count(),
            relay_subscribed: self.relay.is_subscribed(),
        }
    }

    /// Stop background tasks, close every connection and flush pending writes
    pub async fn shutdown(&self) {
        info!("Shutting down realtime hub");
        self.cancel_token.cancel();
        self.relay.shutdown();
        self.registry.close_all();

        self.tasks.close();
        self.tasks.wait().await;

        let flushed = self.coalescer.shutdown().await;
        info!(flushed_writes = flushed, "Realtime hub stopped");
    }
}
