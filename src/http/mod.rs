//! Streaming HTTP boundary.
//!
//! Exposes broker subscriptions as long-lived `text/event-stream`
//! responses: the wire framing and buffered body, the authorization seam,
//! and the axum routes with their connection lifecycle.

pub mod auth;
pub mod endpoint;
pub mod streaming;

pub use auth::{AllowAll, DenyAll, StreamPolicy, StreamScope};
pub use endpoint::{router, StreamState};
pub use streaming::{sse_headers, EventStreamBody, SseEvent, SseSender};
