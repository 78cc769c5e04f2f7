use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use bytes::Bytes;
use futures_core::Stream;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};

/// SSE event structure
#[derive(Clone, Debug)]
pub struct SseEvent {
    /// Event type/name (optional)
    pub event: Option<String>,
    /// Event data (required)
    pub data: String,
}

impl SseEvent {
    /// Create a simple data event
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    /// Create a named event
    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// Create a comment frame (used for keepalive). An empty text yields
    /// the bare `:\n\n` heartbeat frame.
    pub fn comment(text: &str) -> String {
        if text.is_empty() {
            ":\n\n".to_string()
        } else {
            format!(": {}\n\n", text)
        }
    }

    /// Format as SSE wire format
    pub fn format(&self) -> String {
        let mut output = String::with_capacity(self.data.len() + 16);

        if let Some(ref event) = self.event {
            output.push_str("event: ");
            output.push_str(event);
            output.push('\n');
        }

        // Data can be multiline - each line needs "data: " prefix
        for line in self.data.lines() {
            output.push_str("data: ");
            output.push_str(line);
            output.push('\n');
        }

        output.push('\n'); // End of event
        output
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.format())
    }
}

/// Write half of an event stream.
///
/// Frames are pushed into a bounded buffer drained by [`EventStreamBody`].
/// Once the stream is closed every write is silently discarded; a full
/// buffer drops the frame rather than blocking the publisher.
pub struct SseSender {
    sender: Sender<Bytes>,
    closed: Arc<AtomicBool>,
    event_count: Arc<AtomicU64>,
}

impl Clone for SseSender {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            closed: self.closed.clone(),
            event_count: self.event_count.clone(),
        }
    }
}

impl SseSender {
    /// Create a connected sender/receiver pair.
    pub fn channel(buffer_size: usize) -> (Self, Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(buffer_size);
        (
            Self {
                sender,
                closed: Arc::new(AtomicBool::new(false)),
                event_count: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    /// Send a formatted SSE event. Returns false once the stream is gone.
    pub fn send(&self, event: &SseEvent) -> bool {
        let accepted = self.send_bytes(event.to_bytes());
        if accepted {
            self.event_count.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    /// Serialize a JSON payload as one `data:` frame.
    pub fn send_json(&self, payload: &Value) -> bool {
        self.send(&SseEvent::data(payload.to_string()))
    }

    /// Send a keepalive comment frame.
    pub fn send_comment(&self, text: &str) -> bool {
        self.send_bytes(Bytes::from(SseEvent::comment(text)))
    }

    fn send_bytes(&self, bytes: Bytes) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        match self.sender.try_send(bytes) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                // Slow consumer; the frame is dropped, the stream lives on.
                log::debug!("stream buffer full, dropping frame");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Mark the stream closed; subsequent writes are discarded.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.sender.is_closed()
    }

    /// Shared closed flag, handed to the response body and teardown guard.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }

    /// Get event count
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }
}

/// Response body that implements Stream over the buffered frames.
pub struct EventStreamBody {
    receiver: Receiver<Bytes>,
    closed: Arc<AtomicBool>,
}

impl EventStreamBody {
    pub fn new(receiver: Receiver<Bytes>, closed: Arc<AtomicBool>) -> Self {
        Self { receiver, closed }
    }
}

impl Stream for EventStreamBody {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed.load(Ordering::SeqCst) {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.receiver).poll_recv(cx) {
            Poll::Ready(Some(bytes)) => Poll::Ready(Some(Ok(bytes))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create SSE response headers
pub fn sse_headers() -> [(HeaderName, HeaderValue); 3] {
    [
        (
            CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream; charset=utf-8"),
        ),
        (
            CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-transform"),
        ),
        (
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        ),
    ]
}
