// Module: sync

pub mod access;
pub mod debounce;
pub mod events;
pub mod memory_pubsub;
pub mod realtime;
pub mod redis_pubsub;
pub mod registry;
pub mod relay;

pub use access::{AccessFilter, DeliveryReport};
pub use debounce::{CoalescerMetrics, DebounceKey, WriteCoalescer};
pub use events::{Action, ClientRequest, Event, Topic};
pub use memory_pubsub::MemoryTransport;
pub use realtime::{HubMetrics, RealtimeHub};
pub use redis_pubsub::RedisTransport;
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, Frame, RegistryMetrics};
pub use relay::{PubSubTransport, Relay, RelayConfig, RelaySubscription, TransportMessage};
