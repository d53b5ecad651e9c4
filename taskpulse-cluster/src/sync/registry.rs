use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use taskpulse_core::models::UserId;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{Error, Result};

/// Identifier of one live connection
pub type ConnectionId = String;

/// Serialized event ready to be written to a socket
pub type Frame = Arc<str>;

/// Handle to one client connection
///
/// Cloning is cheap; all clones share the outbound queue and the
/// cancellation token. The transport side owns the matching receiver and
/// exits once the token is cancelled.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: UserId,
    sender: mpsc::Sender<Frame>,
    cancel_token: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle with an outbound queue of `capacity` frames
    #[must_use]
    pub fn new(identity: UserId, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        Self::with_cancel_token(identity, capacity, CancellationToken::new())
    }

    /// Create a handle whose lifetime is tied to `cancel_token`
    #[must_use]
    pub fn with_cancel_token(
        identity: UserId,
        capacity: usize,
        cancel_token: CancellationToken,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: nanoid::nanoid!(16),
            identity,
            sender,
            cancel_token,
        };
        (handle, receiver)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn identity(&self) -> &UserId {
        &self.identity
    }

    /// Token observed by this connection's reader and writer tasks
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Queue a frame without waiting. A full or closed queue is a write failure.
    pub fn send(&self, frame: Frame) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        self.sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull,
            TrySendError::Closed(_) => Error::ConnectionClosed,
        })
    }

    /// Signal the connection's tasks to stop. Idempotent.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.cancel_token.is_cancelled() && !self.sender.is_closed()
    }
}

/// Process-wide table of live connections, keyed by identity
///
/// One lock guards the whole map and is only held for map mutation and
/// lookup; writes to connections always happen after it is released.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>>,
    total_registered: AtomicU64,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `handle` to its identity's connection set. Re-registering the same
    /// handle is a no-op.
    pub fn register(&self, handle: ConnectionHandle) {
        let identity = *handle.identity();
        let connection_id = handle.id.clone();

        let inserted = {
            let mut connections = self.connections.lock();
            connections
                .entry(identity)
                .or_default()
                .insert(connection_id.clone(), handle)
                .is_none()
        };

        if inserted {
            self.total_registered.fetch_add(1, Ordering::Relaxed);
            info!(
                connection_id = %connection_id,
                user_id = %identity,
                "Connection registered"
            );
        }
    }

    /// Remove `handle` and close it. The identity disappears with its last
    /// connection. Returns whether the handle was present.
    pub fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let identity = handle.identity();

        let removed = {
            let mut connections = self.connections.lock();
            match connections.get_mut(identity) {
                Some(set) => {
                    let removed = set.remove(handle.id()).is_some();
                    if set.is_empty() {
                        connections.remove(identity);
                    }
                    removed
                }
                None => false,
            }
        };

        handle.close();

        if removed {
            info!(
                connection_id = %handle.id(),
                user_id = %identity,
                "Connection unregistered"
            );
        } else {
            debug!(
                connection_id = %handle.id(),
                user_id = %identity,
                "Unregister for unknown connection ignored"
            );
        }

        removed
    }

    /// Live handles of `identity`; empty when it has none
    #[must_use]
    pub fn lookup(&self, identity: &UserId) -> Vec<ConnectionHandle> {
        self.connections
            .lock()
            .get(identity)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.lock().values().map(HashMap::len).sum()
    }

    #[must_use]
    pub fn identity_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Close and drop every connection
    pub fn close_all(&self) {
        let drained: Vec<ConnectionHandle> = {
            let mut connections = self.connections.lock();
            connections
                .drain()
                .flat_map(|(_, set)| set.into_values())
                .collect()
        };

        for handle in &drained {
            handle.close();
        }

        if !drained.is_empty() {
            info!(count = drained.len(), "Closed all connections");
        }
    }

    #[must_use]
    pub fn metrics(&self) -> RegistryMetrics {
        let (active_connections, active_identities) = {
            let connections = self.connections.lock();
            (
                connections.values().map(HashMap::len).sum(),
                connections.len(),
            )
        };

        RegistryMetrics {
            active_connections,
            active_identities,
            total_registered: self.total_registered.load(Ordering::Relaxed),
        }
    }
}

/// Registry metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryMetrics {
    pub active_connections: usize,
    pub active_identities: usize,
    pub total_registered: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let (handle, _rx) = ConnectionHandle::new(user, 8);

        registry.register(handle.clone());

        let handles = registry.lookup(&user);
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].id(), handle.id());
        assert!(registry.lookup(&UserId::new()).is_empty());
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::new(UserId::new(), 8);

        registry.register(handle.clone());
        registry.register(handle.clone());

        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.metrics().total_registered, 1);
    }

    #[test]
    fn test_multiple_devices_per_identity() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let (phone, _rx1) = ConnectionHandle::new(user, 8);
        let (laptop, _rx2) = ConnectionHandle::new(user, 8);

        registry.register(phone.clone());
        registry.register(laptop.clone());
        assert_eq!(registry.lookup(&user).len(), 2);
        assert_eq!(registry.identity_count(), 1);

        assert!(registry.unregister(&phone));
        assert_eq!(registry.lookup(&user).len(), 1);
        assert!(laptop.is_alive());
    }

    #[test]
    fn test_identity_removed_with_last_connection() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let (handle, _rx) = ConnectionHandle::new(user, 8);

        registry.register(handle.clone());
        assert!(registry.unregister(&handle));

        assert!(registry.lookup(&user).is_empty());
        assert_eq!(registry.identity_count(), 0);
        assert!(registry.connections.lock().is_empty());
    }

    #[test]
    fn test_unregister_twice_is_noop_and_closes() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::new(UserId::new(), 8);

        registry.register(handle.clone());
        assert!(registry.unregister(&handle));
        assert!(!registry.unregister(&handle));

        assert!(!handle.is_alive());
        assert!(handle.cancel_token().is_cancelled());
    }

    #[test]
    fn test_send_reports_full_and_closed_queue() {
        let (handle, mut rx) = ConnectionHandle::new(UserId::new(), 1);

        handle.send(Frame::from("one")).unwrap();
        assert!(matches!(handle.send(Frame::from("two")), Err(Error::QueueFull)));
        assert_eq!(&*rx.try_recv().unwrap(), "one");

        drop(rx);
        assert!(matches!(
            handle.send(Frame::from("three")),
            Err(Error::ConnectionClosed)
        ));
        assert!(!handle.is_alive());
    }

    #[test]
    fn test_send_after_close_fails() {
        let (handle, _rx) = ConnectionHandle::new(UserId::new(), 4);
        handle.close();
        assert!(matches!(handle.send(Frame::from("x")), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_close_all() {
        let registry = ConnectionRegistry::new();
        let (a, _rx1) = ConnectionHandle::new(UserId::new(), 4);
        let (b, _rx2) = ConnectionHandle::new(UserId::new(), 4);
        registry.register(a.clone());
        registry.register(b.clone());

        registry.close_all();

        assert_eq!(registry.connection_count(), 0);
        assert!(!a.is_alive());
        assert!(!b.is_alive());
    }

    #[test]
    fn test_metrics() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let (a, _rx1) = ConnectionHandle::new(user, 4);
        let (b, _rx2) = ConnectionHandle::new(user, 4);
        registry.register(a.clone());
        registry.register(b);
        registry.unregister(&a);

        assert_eq!(
            registry.metrics(),
            RegistryMetrics {
                active_connections: 1,
                active_identities: 1,
                total_registered: 2,
            }
        );
    }
}
