use std::collections::HashSet;
use std::sync::Arc;
use taskpulse_core::models::UserId;
use taskpulse_core::repository::AccessRepository;
use tracing::{debug, warn};

use super::events::{self, Event};
use super::registry::{ConnectionHandle, ConnectionRegistry, Frame};
use crate::{Error, Result};

/// Outcome of delivering one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Identities entitled to the event
    pub recipients: usize,
    /// Connections the frame was queued on
    pub delivered: usize,
    /// Connections that failed and were unregistered
    pub failed: usize,
}

/// Restricts fan-out to identities entitled to see an entity
pub struct AccessFilter {
    repository: Arc<dyn AccessRepository>,
    registry: Arc<ConnectionRegistry>,
}

impl AccessFilter {
    #[must_use]
    pub fn new(repository: Arc<dyn AccessRepository>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            repository,
            registry,
        }
    }

    /// Identities allowed to observe the entity the event refers to.
    ///
    /// Callers must treat an error as the empty set.
    pub async fn eligible_recipients(&self, event: &Event) -> Result<HashSet<UserId>> {
        let entity_id = event.entity_id()?;
        self.repository
            .lookup_entity_access_list(event.entity, &entity_id)
            .await
            .map_err(Error::AccessLookup)
    }

    pub async fn is_eligible(&self, event: &Event, identity: &UserId) -> Result<bool> {
        Ok(self.eligible_recipients(event).await?.contains(identity))
    }

    /// Write the event to every live connection of every eligible identity.
    ///
    /// A failed write unregisters that connection only; the others still get
    /// the event.
    pub async fn deliver(&self, event: &Event) -> DeliveryReport {
        let recipients = match self.eligible_recipients(event).await {
            Ok(recipients) => recipients,
            Err(e) => {
                warn!(
                    error = %e,
                    entity = %event.entity,
                    action = %event.action,
                    "Access lookup failed, event not delivered"
                );
                return DeliveryReport::default();
            }
        };

        let frame: Frame = match events::encode(event) {
            Ok(payload) => payload.into(),
            Err(e) => {
                warn!(error = %e, entity = %event.entity, "Failed to encode event");
                return DeliveryReport::default();
            }
        };

        let mut report = DeliveryReport {
            recipients: recipients.len(),
            ..DeliveryReport::default()
        };
        let mut failed_handles = Vec::new();

        for identity in &recipients {
            // Registry lock is released before any write
            for handle in self.registry.lookup(identity) {
                match handle.send(frame.clone()) {
                    Ok(()) => {
                        report.delivered += 1;
                        debug!(
                            user_id = %identity,
                            connection_id = %handle.id(),
                            entity = %event.entity,
                            "Event sent to client"
                        );
                    }
                    Err(err) => {
                        warn!(
                            user_id = %identity,
                            connection_id = %handle.id(),
                            error = %err,
                            "Failed to send event to client, marking for cleanup"
                        );
                        failed_handles.push(handle);
                    }
                }
            }
        }

        // Clean up failed connections
        report.failed = failed_handles.len();
        for handle in &failed_handles {
            self.registry.unregister(handle);
        }

        if report.delivered > 0 || report.failed > 0 {
            debug!(
                entity = %event.entity,
                action = %event.action,
                recipients = report.recipients,
                delivered = report.delivered,
                failed = report.failed,
                "Event delivery complete"
            );
        }

        report
    }

    /// Write the event to one connection if its identity is entitled.
    ///
    /// Used by a connection's own relay subscription. A failed write
    /// unregisters the handle and is reported in `failed`.
    pub async fn deliver_to(&self, event: &Event, handle: &ConnectionHandle) -> DeliveryReport {
        match self.is_eligible(event, handle.identity()).await {
            Ok(true) => {}
            Ok(false) => return DeliveryReport::default(),
            Err(e) => {
                warn!(
                    error = %e,
                    user_id = %handle.identity(),
                    entity = %event.entity,
                    "Access lookup failed, event not delivered"
                );
                return DeliveryReport::default();
            }
        }

        let frame: Frame = match events::encode(event) {
            Ok(payload) => payload.into(),
            Err(e) => {
                warn!(error = %e, entity = %event.entity, "Failed to encode event");
                return DeliveryReport::default();
            }
        };

        match handle.send(frame) {
            Ok(()) => DeliveryReport {
                recipients: 1,
                delivered: 1,
                failed: 0,
            },
            Err(err) => {
                warn!(
                    user_id = %handle.identity(),
                    connection_id = %handle.id(),
                    error = %err,
                    "Failed to send event to client, unregistering"
                );
                self.registry.unregister(handle);
                DeliveryReport {
                    recipients: 1,
                    delivered: 0,
                    failed: 1,
                }
            }
        }
    }
}
