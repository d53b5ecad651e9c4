pub mod error;
pub mod sync;

pub use error::{Error, Result};
pub use sync::{
    AccessFilter, ConnectionHandle, ConnectionRegistry, DebounceKey, Event, HubMetrics,
    MemoryTransport, RealtimeHub, RedisTransport, Relay, Topic, WriteCoalescer,
};
