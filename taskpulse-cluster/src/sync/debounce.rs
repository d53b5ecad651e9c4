//! Debounced write coalescing
//!
//! Live viewers see every edit immediately through the relay, while the
//! durable write for an entity is deferred until its debounce window closes.
//! Edits arriving inside the window are merged into the one pending write.
//!
//! The window is fixed: it opens with the first edit after a quiet period and
//! is not extended by later edits, so a row is at most one period stale even
//! under continuous editing.
//!
//! Edits for one key are applied one at a time in arrival order, so the
//! buffered write and the published events agree on which value is latest.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskpulse_core::models::{EntityId, EntityKind, MutationFields};
use taskpulse_core::repository::MutationStore;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::events::Event;
use super::relay::Relay;
use crate::Result;

/// One pending write per key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DebounceKey {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl DebounceKey {
    #[must_use]
    pub const fn new(kind: EntityKind, id: EntityId) -> Self {
        Self { kind, id }
    }
}

impl std::fmt::Display for DebounceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

struct Pending {
    fields: MutationFields,
    /// Distinguishes this window from a later one for the same key
    generation: u64,
    cancel_token: CancellationToken,
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicU64,
    coalesced: AtomicU64,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
}

/// Coalescer metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalescerMetrics {
    pub pending: usize,
    /// Windows opened
    pub scheduled: u64,
    /// Edits merged into an already pending write
    pub coalesced: u64,
    pub persisted: u64,
    pub persist_failures: u64,
}

/// Publishes edits immediately and coalesces their durable writes
pub struct WriteCoalescer {
    relay: Arc<Relay>,
    store: Arc<dyn MutationStore>,
    period: Duration,
    pending: Arc<DashMap<DebounceKey, Pending>>,
    /// Serializes edits per key; entries are dropped once nobody waits on them
    gates: DashMap<DebounceKey, Arc<AsyncMutex<()>>>,
    next_generation: AtomicU64,
    counters: Arc<Counters>,
    /// Set by `shutdown`; later edits are written through
    closed: AtomicBool,
    cancel_token: CancellationToken,
}

impl WriteCoalescer {
    #[must_use]
    pub fn new(relay: Arc<Relay>, store: Arc<dyn MutationStore>, period: Duration) -> Self {
        Self {
            relay,
            store,
            period,
            pending: Arc::new(DashMap::new()),
            gates: DashMap::new(),
            next_generation: AtomicU64::new(0),
            counters: Arc::new(Counters::default()),
            closed: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Apply an edit: publish it to live viewers now, write it to storage
    /// once the key's debounce window closes.
    ///
    /// The write is buffered before publishing and stays scheduled even if
    /// publishing fails; the publish error is returned so the caller can log
    /// it. After `shutdown` the write happens before this returns.
    pub async fn request_update(&self, key: DebounceKey, fields: MutationFields) -> Result<()> {
        let gate = Arc::clone(&self.gates.entry(key).or_default());

        let result = {
            let _guard = gate.lock().await;
            self.apply(key, fields).await
        };

        drop(gate);
        self.gates.remove_if(&key, |_, gate| Arc::strong_count(gate) == 1);

        result
    }

    async fn apply(&self, key: DebounceKey, fields: MutationFields) -> Result<()> {
        let event = Event::updated(key.kind, &key.id, &fields);

        if self.closed.load(Ordering::Acquire) {
            // No timer will fire any more
            debug!(key = %key, "Coalescer closed, writing through");
            persist(&*self.store, &self.counters, key, &fields).await;
        } else {
            self.schedule(key, fields);
        }

        self.relay.publish_with_retry(event.topic(), &event).await
    }

    /// Buffer `fields` for `key`, opening a window if none is pending
    fn schedule(&self, key: DebounceKey, fields: MutationFields) {
        match self.pending.entry(key) {
            Entry::Occupied(mut entry) => {
                let pending = entry.get_mut();
                for (name, value) in fields {
                    pending.fields.insert(name, value);
                }
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Edit merged into pending write");
            }
            Entry::Vacant(entry) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let cancel_token = self.cancel_token.child_token();
                entry.insert(Pending {
                    fields,
                    generation,
                    cancel_token: cancel_token.clone(),
                });
                self.counters.scheduled.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, period_ms = self.period.as_millis() as u64, "Write scheduled");

                self.spawn_timer(key, generation, cancel_token);
            }
        }
    }

    fn spawn_timer(&self, key: DebounceKey, generation: u64, cancel_token: CancellationToken) {
        let pending = self.pending.clone();
        let store = self.store.clone();
        let counters = self.counters.clone();
        let period = self.period;

        tokio::spawn(async move {
            // Cancelled early only by shutdown or a flush; either way write
            // what is still buffered
            tokio::select! {
                () = cancel_token.cancelled() => {}
                () = tokio::time::sleep(period) => {}
            }

            // Only this window's entry; a flush may have taken it
            let Some((_, entry)) = pending.remove_if(&key, |_, p| p.generation == generation) else {
                return;
            };

            persist(&*store, &counters, key, &entry.fields).await;
        });
    }

    /// Write every pending entry now. Returns how many were written.
    pub async fn flush_all(&self) -> usize {
        let keys: Vec<DebounceKey> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut flushed = 0;

        for key in keys {
            let Some((_, entry)) = self.pending.remove(&key) else {
                continue;
            };
            entry.cancel_token.cancel();
            persist(&*self.store, &self.counters, key, &entry.fields).await;
            flushed += 1;
        }

        if flushed > 0 {
            info!(count = flushed, "Flushed pending writes");
        }
        flushed
    }

    /// Write whatever is still pending and stop all timers. Edits arriving
    /// afterwards are persisted immediately.
    pub async fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let flushed = self.flush_all().await;
        self.cancel_token.cancel();
        flushed
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_pending(&self, key: &DebounceKey) -> bool {
        self.pending.contains_key(key)
    }

    #[must_use]
    pub fn metrics(&self) -> CoalescerMetrics {
        CoalescerMetrics {
            pending: self.pending.len(),
            scheduled: self.counters.scheduled.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            persist_failures: self.counters.persist_failures.load(Ordering::Relaxed),
        }
    }
}

/// One durable write. Failures are logged and not retried; the next edit for
/// the key opens a fresh window.
async fn persist(store: &dyn MutationStore, counters: &Counters, key: DebounceKey, fields: &MutationFields) {
    match store.persist_mutation(key.kind, &key.id, fields).await {
        Ok(()) => {
            counters.persisted.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, fields = fields.len(), "Coalesced write persisted");
        }
        Err(e) => {
            counters.persist_failures.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, key = %key, "Coalesced write failed, update dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::events::Topic;
    use crate::sync::memory_pubsub::MemoryTransport;
    use crate::sync::relay::{PubSubTransport, RelayConfig, TransportMessage};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use mockall::mock;
    use serde_json::json;
    use taskpulse_core::repository::InMemoryMutationStore;

    mock! {
        pub Store {}

        #[async_trait]
        impl MutationStore for Store {
            async fn persist_mutation(
                &self,
                kind: EntityKind,
                id: &EntityId,
                fields: &MutationFields,
            ) -> taskpulse_core::Result<()>;
        }
    }

    const PERIOD: Duration = Duration::from_secs(1);

    /// In-memory transport that stalls publishes carrying `slow_marker`
    struct StallingTransport {
        inner: MemoryTransport,
        slow_marker: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl PubSubTransport for StallingTransport {
        async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
            if payload.contains(self.slow_marker) {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channels: &[String]) -> Result<BoxStream<'static, TransportMessage>> {
            self.inner.subscribe(channels).await
        }
    }

    fn title(value: &str) -> MutationFields {
        let mut fields = MutationFields::new();
        fields.insert("title".into(), json!(value));
        fields
    }

    fn relay() -> Arc<Relay> {
        Arc::new(Relay::new(
            Arc::new(MemoryTransport::new()),
            RelayConfig::default(),
        ))
    }

    fn task_key() -> DebounceKey {
        DebounceKey::new(EntityKind::Task, EntityId::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_update_is_written_after_period() {
        let store = Arc::new(InMemoryMutationStore::new());
        let coalescer = WriteCoalescer::new(relay(), store.clone(), PERIOD);
        let key = task_key();

        coalescer.request_update(key, title("s1")).await.unwrap();
        assert!(coalescer.is_pending(&key));

        tokio::time::sleep(PERIOD / 2).await;
        assert_eq!(store.write_count(), 0);

        tokio::time::sleep(PERIOD).await;
        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].fields, title("s1"));
        assert_eq!(coalescer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_updates_coalesce_to_latest() {
        let store = Arc::new(InMemoryMutationStore::new());
        let coalescer = WriteCoalescer::new(relay(), store.clone(), PERIOD);
        let key = task_key();

        coalescer.request_update(key, title("s1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        coalescer.request_update(key, title("s2")).await.unwrap();

        tokio::time::sleep(PERIOD * 2).await;

        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].fields["title"], json!("s2"));
        assert_eq!(coalescer.metrics().coalesced, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_is_not_extended_by_later_edits() {
        let store = Arc::new(InMemoryMutationStore::new());
        let coalescer = WriteCoalescer::new(relay(), store.clone(), PERIOD);
        let key = task_key();

        coalescer.request_update(key, title("s1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(900)).await;
        coalescer.request_update(key, title("s2")).await.unwrap();

        // Fires one period after the first edit, not the last
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.writes()[0].fields["title"], json!("s2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fields_merge_within_window() {
        let store = Arc::new(InMemoryMutationStore::new());
        let coalescer = WriteCoalescer::new(relay(), store.clone(), PERIOD);
        let key = task_key();

        let mut status = MutationFields::new();
        status.insert("status".into(), json!("done"));

        coalescer.request_update(key, title("s1")).await.unwrap();
        coalescer.request_update(key, status).await.unwrap();
        coalescer.request_update(key, title("s2")).await.unwrap();
        tokio::time::sleep(PERIOD * 2).await;

        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].fields["title"], json!("s2"));
        assert_eq!(writes[0].fields["status"], json!("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let store = Arc::new(InMemoryMutationStore::new());
        let coalescer = WriteCoalescer::new(relay(), store.clone(), PERIOD);
        let task = task_key();
        let comment = DebounceKey::new(EntityKind::Comment, task.id);

        coalescer.request_update(task, title("t")).await.unwrap();
        let mut body = MutationFields::new();
        body.insert("body".into(), json!("c"));
        coalescer.request_update(comment, body).await.unwrap();
        assert_eq!(coalescer.pending_count(), 2);

        tokio::time::sleep(PERIOD * 2).await;
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_window_after_write() {
        let store = Arc::new(InMemoryMutationStore::new());
        let coalescer = WriteCoalescer::new(relay(), store.clone(), PERIOD);
        let key = task_key();

        coalescer.request_update(key, title("s1")).await.unwrap();
        tokio::time::sleep(PERIOD * 2).await;
        coalescer.request_update(key, title("s2")).await.unwrap();
        tokio::time::sleep(PERIOD * 2).await;

        let titles: Vec<_> = store
            .writes()
            .into_iter()
            .map(|w| w.fields["title"].clone())
            .collect();
        assert_eq!(titles, vec![json!("s1"), json!("s2")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_returns_key_to_idle() {
        let mut store = MockStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_persist_mutation()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(taskpulse_core::Error::Internal("db down".to_string())));
        store
            .expect_persist_mutation()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let coalescer = WriteCoalescer::new(relay(), Arc::new(store), PERIOD);
        let key = task_key();

        coalescer.request_update(key, title("lost")).await.unwrap();
        tokio::time::sleep(PERIOD * 2).await;
        assert!(!coalescer.is_pending(&key));
        assert_eq!(coalescer.metrics().persist_failures, 1);

        // No automatic retry; the next edit opens a new window
        coalescer.request_update(key, title("again")).await.unwrap();
        tokio::time::sleep(PERIOD * 2).await;
        assert_eq!(coalescer.metrics().persisted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_is_published_before_return() {
        let relay = relay();
        let _task = relay.clone().start();
        relay.wait_subscribed().await;
        let mut sub = relay.subscribe(&[Topic::TaskUpdates]);

        let store = Arc::new(InMemoryMutationStore::new());
        let coalescer = WriteCoalescer::new(relay.clone(), store.clone(), PERIOD);
        let key = task_key();

        coalescer.request_update(key, title("live")).await.unwrap();
        assert_eq!(relay.published_count(), 1);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.entity_id().unwrap(), key.id);
        assert_eq!(event.data["title"], json!("live"));
        assert_eq!(store.write_count(), 0);

        relay.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_publish_does_not_reorder_edits() {
        let relay = Arc::new(Relay::new(
            Arc::new(StallingTransport {
                inner: MemoryTransport::new(),
                slow_marker: "\"s1\"",
                delay: Duration::from_millis(500),
            }),
            RelayConfig::default(),
        ));
        let _task = relay.clone().start();
        relay.wait_subscribed().await;
        let mut sub = relay.subscribe(&[Topic::TaskUpdates]);

        let store = Arc::new(InMemoryMutationStore::new());
        let coalescer = Arc::new(WriteCoalescer::new(relay.clone(), store.clone(), PERIOD));
        let key = task_key();

        let first = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move { coalescer.request_update(key, title("s1")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        coalescer.request_update(key, title("s2")).await.unwrap();
        first.await.unwrap().unwrap();

        // Viewers see the edits in the order they were made
        assert_eq!(sub.recv().await.unwrap().data["title"], json!("s1"));
        assert_eq!(sub.recv().await.unwrap().data["title"], json!("s2"));

        tokio::time::sleep(PERIOD * 2).await;
        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].fields["title"], json!("s2"));

        relay.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_after_shutdown_is_written_through() {
        let store = Arc::new(InMemoryMutationStore::new());
        let coalescer = WriteCoalescer::new(relay(), store.clone(), PERIOD);
        let key = task_key();

        assert_eq!(coalescer.shutdown().await, 0);

        coalescer.request_update(key, title("late")).await.unwrap();
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.writes()[0].fields["title"], json!("late"));
        assert_eq!(coalescer.pending_count(), 0);

        tokio::time::sleep(PERIOD * 2).await;
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gates_are_released() {
        let coalescer = WriteCoalescer::new(relay(), Arc::new(InMemoryMutationStore::new()), PERIOD);

        coalescer.request_update(task_key(), title("a")).await.unwrap();
        coalescer.request_update(task_key(), title("b")).await.unwrap();

        assert!(coalescer.gates.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_pending_writes() {
        let store = Arc::new(InMemoryMutationStore::new());
        let coalescer = WriteCoalescer::new(relay(), store.clone(), PERIOD);

        coalescer.request_update(task_key(), title("a")).await.unwrap();
        coalescer.request_update(task_key(), title("b")).await.unwrap();

        assert_eq!(coalescer.shutdown().await, 2);
        assert_eq!(store.write_count(), 2);

        // Cancelled timers must not write again
        tokio::time::sleep(PERIOD * 2).await;
        assert_eq!(store.write_count(), 2);
    }
}
