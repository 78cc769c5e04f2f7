use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_core::Stream;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::channels;
use crate::config::RealtimeConfig;
use crate::http::auth::{StreamPolicy, StreamScope};
use crate::http::streaming::{sse_headers, EventStreamBody, SseSender};
use crate::realtime::{Broker, Subscription};

/// Shared state for the streaming endpoints.
pub struct StreamState {
    pub broker: Arc<Broker>,
    pub policy: Arc<dyn StreamPolicy>,
    pub config: RealtimeConfig,
}

impl StreamState {
    pub fn new(broker: Arc<Broker>, policy: Arc<dyn StreamPolicy>, config: RealtimeConfig) -> Self {
        Self {
            broker,
            policy,
            config,
        }
    }
}

/// Streaming routes, to be merged into the host application's router.
pub fn router(state: Arc<StreamState>) -> Router {
    Router::new()
        .route("/api/orders/stream", get(orders_stream))
        .route("/api/orders/{id}/stream", get(order_stream))
        .route("/api/rooms/{room}/stream", get(room_stream))
        .with_state(state)
}

async fn orders_stream(State(state): State<Arc<StreamState>>, headers: HeaderMap) -> Response {
    stream_response(
        &state,
        StreamScope::AllOrders,
        &headers,
        channels::ORDERS.to_string(),
        json!({"type": "hello"}),
    )
    .await
}

async fn order_stream(
    State(state): State<Arc<StreamState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let channel = channels::order(&id);
    stream_response(
        &state,
        StreamScope::Order(id),
        &headers,
        channel,
        json!({"ok": true}),
    )
    .await
}

async fn room_stream(
    State(state): State<Arc<StreamState>>,
    Path(room): Path<String>,
    headers: HeaderMap,
) -> Response {
    let channel = channels::room(&room);
    stream_response(
        &state,
        StreamScope::Room(room),
        &headers,
        channel,
        json!({"ok": true}),
    )
    .await
}

/// Open one broker subscription as a one-way framed response.
///
/// Lifecycle: authorize, subscribe, emit the hello frame, arm the
/// heartbeat. Teardown runs when the client disconnects (axum drops the
/// body), exactly once: closed flag, heartbeat cancel, unsubscribe.
async fn stream_response(
    state: &StreamState,
    scope: StreamScope,
    headers: &HeaderMap,
    channel: String,
    hello: Value,
) -> Response {
    if !state.policy.permit(&scope, headers).await {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let (sender, receiver) = SseSender::channel(state.config.stream_buffer);

    let writer = sender.clone();
    let subscription = state
        .broker
        .subscribe(&channel, move |payload| {
            writer.send_json(payload);
        })
        .await;

    // Initial frame so the client can tell "connected" from "hanging".
    sender.send_json(&hello);

    let heartbeat = tokio::spawn(heartbeat_loop(
        sender.clone(),
        state.config.heartbeat_interval,
    ));

    let guard = StreamGuard::new(sender.closed_flag(), heartbeat, subscription);
    let body = GuardedBody {
        inner: EventStreamBody::new(receiver, sender.closed_flag()),
        _guard: guard,
    };

    let mut response = Body::from_stream(body).into_response();
    let response_headers = response.headers_mut();
    for (name, value) in sse_headers() {
        response_headers.insert(name, value);
    }
    response
}

/// Comment-frame keepalive. Each beat is armed only after the previous one
/// fired, so the loop winds down as soon as the stream closes.
async fn heartbeat_loop(sender: SseSender, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if sender.is_closed() || !sender.send_comment("") {
            break;
        }
    }
}

/// Owns the teardown of one streaming connection.
///
/// All three steps happen exactly once regardless of which path triggers
/// them first: explicit close, client disconnect, or server shutdown.
struct StreamGuard {
    closed: Arc<AtomicBool>,
    heartbeat: JoinHandle<()>,
    subscription: Subscription,
    torn_down: AtomicBool,
}

impl StreamGuard {
    fn new(closed: Arc<AtomicBool>, heartbeat: JoinHandle<()>, subscription: Subscription) -> Self {
        Self {
            closed,
            heartbeat,
            subscription,
            torn_down: AtomicBool::new(false),
        }
    }

    fn close(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.store(true, Ordering::SeqCst);
        self.heartbeat.abort();
        self.subscription.unsubscribe();
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.close();
    }
}

struct GuardedBody {
    inner: EventStreamBody,
    _guard: StreamGuard,
}

impl Stream for GuardedBody {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::auth::{AllowAll, DenyAll};
    use axum::body::Body;
    use axum::http::Request;
    use futures_util::StreamExt;
    use tower::util::ServiceExt;

    fn test_state(policy: Arc<dyn StreamPolicy>) -> (Arc<Broker>, Arc<StreamState>) {
        let broker = Arc::new(Broker::in_memory());
        let state = Arc::new(StreamState::new(
            broker.clone(),
            policy,
            RealtimeConfig::default(),
        ));
        (broker, state)
    }

    fn get_stream(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn denied_request_gets_401_and_no_stream() {
        let (broker, state) = test_state(Arc::new(DenyAll));
        let response = router(state)
            .oneshot(get_stream("/api/orders/stream"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(broker.subscriber_count(channels::ORDERS), 0);
    }

    #[tokio::test]
    async fn stream_opens_with_headers_and_hello_frame() {
        let (_broker, state) = test_state(Arc::new(AllowAll));
        let response = router(state)
            .oneshot(get_stream("/api/orders/stream"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream; charset=utf-8"
        );
        assert_eq!(response.headers()["cache-control"], "no-cache, no-transform");

        let mut frames = response.into_body().into_data_stream();
        let first = frames.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"data: {\"type\":\"hello\"}\n\n");
    }

    #[tokio::test]
    async fn published_events_arrive_as_data_frames() {
        let (broker, state) = test_state(Arc::new(AllowAll));
        let response = router(state)
            .oneshot(get_stream("/api/orders/stream"))
            .await
            .unwrap();

        let mut frames = response.into_body().into_data_stream();
        frames.next().await.unwrap().unwrap(); // hello

        let payload = json!({"type": "created", "order": {"id": "1"}});
        broker.publish(channels::ORDERS, payload.clone());

        let frame = frames.next().await.unwrap().unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        let encoded = text
            .strip_prefix("data: ")
            .and_then(|rest| rest.strip_suffix("\n\n"))
            .unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(encoded).unwrap(),
            payload
        );
    }

    #[tokio::test]
    async fn per_order_stream_is_scoped_to_its_channel() {
        let (broker, state) = test_state(Arc::new(AllowAll));
        let response = router(state)
            .oneshot(get_stream("/api/orders/abc/stream"))
            .await
            .unwrap();

        let mut frames = response.into_body().into_data_stream();
        let first = frames.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"data: {\"ok\":true}\n\n");

        assert_eq!(broker.subscriber_count(&channels::order("abc")), 1);
        broker.publish(&channels::order("other"), json!({"status": "ready"}));
        broker.publish(&channels::order("abc"), json!({"status": "preparing"}));

        let frame = frames.next().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"data: {\"status\":\"preparing\"}\n\n");
    }

    #[tokio::test]
    async fn heartbeats_flow_as_comment_frames() {
        let broker = Arc::new(Broker::in_memory());
        let state = Arc::new(StreamState::new(
            broker,
            Arc::new(AllowAll),
            RealtimeConfig {
                heartbeat_interval: Duration::from_millis(50),
                ..RealtimeConfig::default()
            },
        ));
        let response = router(state)
            .oneshot(get_stream("/api/orders/stream"))
            .await
            .unwrap();

        let mut frames = response.into_body().into_data_stream();
        frames.next().await.unwrap().unwrap(); // hello

        // No publish happens; the next two frames must be keepalives.
        for _ in 0..2 {
            let frame = frames.next().await.unwrap().unwrap();
            assert_eq!(&frame[..], b":\n\n");
        }
    }

    #[tokio::test]
    async fn immediate_disconnect_tears_down_exactly_once() {
        let (broker, state) = test_state(Arc::new(AllowAll));
        let response = router(state)
            .oneshot(get_stream("/api/orders/stream"))
            .await
            .unwrap();
        assert_eq!(broker.subscriber_count(channels::ORDERS), 1);

        // Client goes away before any publish: only the hello frame was
        // ever written, and teardown must not panic.
        drop(response);

        assert_eq!(broker.subscriber_count(channels::ORDERS), 0);
        broker.publish(channels::ORDERS, json!({"after": "close"}));
        assert_eq!(broker.subscriber_count(channels::ORDERS), 0);
    }
}
