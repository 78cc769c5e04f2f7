use thiserror::Error;

/// Errors surfaced by the distribution layer.
///
/// Most delivery paths are best-effort and log instead of returning these;
/// the variants below cover the fallible construction and log-access edges.
#[derive(Debug, Error)]
pub enum Error {
    /// Redis-backed log operation failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Durable log backend rejected or could not service a request.
    #[error("durable log unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, Error>;
