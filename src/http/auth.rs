use async_trait::async_trait;
use axum::http::HeaderMap;

/// What a streaming connection is asking to observe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamScope {
    /// The global feed of every order mutation (staff surfaces).
    AllOrders,
    /// A single order's status stream.
    Order(String),
    /// A single room's order stream.
    Room(String),
}

/// Authorization decision point for stream opens.
///
/// Resolving identity and role from credentials is the host application's
/// job (session store, JWT, reverse proxy). This layer asks exactly one
/// question, once, before the first frame: may this request observe this
/// scope. A denial closes the attempt with 401 and nothing is streamed.
#[async_trait]
pub trait StreamPolicy: Send + Sync {
    async fn permit(&self, scope: &StreamScope, headers: &HeaderMap) -> bool;
}

/// Permits every request. For open deployments and tests.
pub struct AllowAll;

#[async_trait]
impl StreamPolicy for AllowAll {
    async fn permit(&self, _scope: &StreamScope, _headers: &HeaderMap) -> bool {
        true
    }
}

/// Denies every request.
pub struct DenyAll;

#[async_trait]
impl StreamPolicy for DenyAll {
    async fn permit(&self, _scope: &StreamScope, _headers: &HeaderMap) -> bool {
        false
    }
}
