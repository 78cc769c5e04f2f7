//! Real-time order-event distribution for room-service deployments.
//!
//! Order mutations fan out to many concurrently connected clients over
//! long-lived one-way streams: a publish/subscribe broker (in-memory or
//! backed by a durable Redis Streams log), SSE endpoints with heartbeats
//! and idempotent teardown, and a client agent that reconnects with
//! jittered exponential backoff.
//!
//! CRUD storage, credential resolution and rendering live in the host
//! application; they meet this crate at [`realtime::Broker::publish`],
//! the [`http::StreamPolicy`] seam, and the [`client::StreamConsumer`]
//! status feed.

pub mod channels;
pub mod client;
pub mod config;
pub mod errors;
pub mod http;
pub mod orders;
pub mod realtime;

pub use client::{Backoff, ConnectionStatus, SseDecoder, StreamConsumer};
pub use config::RealtimeConfig;
pub use errors::{Error, Result};
pub use http::{router, AllowAll, SseEvent, StreamPolicy, StreamScope, StreamState};
pub use realtime::{Broker, ChannelRegistry, DurableLog, EntryId, LogEntry, MemoryLog, RedisLog, Subscription};
