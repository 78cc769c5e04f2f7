//! Order-event distribution core.
//!
//! Provides the in-process channel registry, the durable append-only log
//! abstraction with its Redis Streams backend, and the broker façade that
//! unifies both delivery paths behind publish/subscribe.

pub mod broker;
pub mod durable;
pub mod registry;

// Re-export main types for convenience
pub use broker::{Broker, Subscription};
pub use durable::{DurableLog, EntryId, LogEntry, MemoryLog, RedisLog};
pub use registry::{ChannelRegistry, Listener, ListenerToken};
