use std::env;
use std::time::Duration;

/// Configuration for the realtime distribution layer.
///
/// The delivery mode is decided once from this struct when the broker is
/// built: durable (log-backed) when `redis_url` is present, in-memory
/// otherwise. Nothing re-checks the environment per call.
#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    /// Redis connection URL; `None` keeps delivery in-process.
    pub redis_url: Option<String>,
    /// How often a durable subscription polls the log for new entries.
    /// This bounds staleness for cross-process delivery.
    pub poll_interval: Duration,
    /// Interval between SSE keepalive comment frames.
    pub heartbeat_interval: Duration,
    /// Per-connection frame buffer; frames beyond it are dropped.
    pub stream_buffer: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(15),
            stream_buffer: 256,
        }
    }
}

impl RealtimeConfig {
    /// Build a config from the process environment.
    ///
    /// `REDIS_URL` selects the durable backend. `ROOMCAST_POLL_INTERVAL_MS`
    /// and `ROOMCAST_HEARTBEAT_SECS` override the timer defaults; values
    /// that fail to parse fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let redis_url = env::var("REDIS_URL").ok().filter(|v| !v.is_empty());

        let poll_interval = env::var("ROOMCAST_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let heartbeat_interval = env::var("ROOMCAST_HEARTBEAT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_interval);

        Self {
            redis_url,
            poll_interval,
            heartbeat_interval,
            ..defaults
        }
    }
}
