//! Client-side consumption of a streaming endpoint.
//!
//! A [`StreamConsumer`] keeps one logical subscription alive over a
//! physical connection that can drop at any time: exponential backoff
//! with jitter between attempts, an incremental frame decoder, and a
//! tri-state-plus-unauthorized connectivity signal for the UI.

pub mod agent;
pub mod backoff;
pub mod decoder;

pub use agent::{ConnectionStatus, StreamConsumer};
pub use backoff::Backoff;
pub use decoder::SseDecoder;
