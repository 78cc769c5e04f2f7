use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::RealtimeConfig;
use crate::realtime::durable::{DurableLog, EntryId, RedisLog};
use crate::realtime::registry::{ChannelRegistry, ListenerToken};

/// Entries fetched per poll tick.
const READ_BATCH: usize = 100;

enum Backend {
    Memory,
    Durable {
        log: Arc<dyn DurableLog>,
        poll_interval: Duration,
        append_tx: mpsc::UnboundedSender<(String, Value)>,
        _appender: JoinHandle<()>,
    },
}

/// Publish/subscribe façade over the two delivery paths.
///
/// The mode is fixed at construction: durable (log-backed, cross-process)
/// when a [`DurableLog`] is supplied, in-memory otherwise. Publishing
/// always delivers to same-process registry listeners; in durable mode it
/// additionally appends to the log, best-effort, so remote subscribers can
/// pick the event up from their cursors.
pub struct Broker {
    registry: Arc<ChannelRegistry>,
    backend: Backend,
}

impl Broker {
    /// Registry-only broker for single-process deployments.
    pub fn in_memory() -> Self {
        Self::with_registry(Arc::new(ChannelRegistry::new()))
    }

    /// Registry-only broker sharing an injected registry instance.
    pub fn with_registry(registry: Arc<ChannelRegistry>) -> Self {
        Self {
            registry,
            backend: Backend::Memory,
        }
    }

    /// Log-backed broker. Must be called from within a tokio runtime; the
    /// background appender task is spawned here.
    pub fn durable(log: Arc<dyn DurableLog>, poll_interval: Duration) -> Self {
        Self::durable_with_registry(Arc::new(ChannelRegistry::new()), log, poll_interval)
    }

    /// Log-backed broker sharing an injected registry instance.
    ///
    /// Appends run on a single background task fed by an in-order queue,
    /// which keeps per-producer publish order intact in the log and makes
    /// `publish` non-blocking for the caller. Append failures are logged
    /// and swallowed; local delivery is unaffected.
    pub fn durable_with_registry(
        registry: Arc<ChannelRegistry>,
        log: Arc<dyn DurableLog>,
        poll_interval: Duration,
    ) -> Self {
        let (append_tx, mut append_rx) = mpsc::unbounded_channel::<(String, Value)>();
        let appender_log = log.clone();
        let appender = tokio::spawn(async move {
            while let Some((channel, payload)) = append_rx.recv().await {
                if let Err(err) = appender_log.append(&channel, &payload).await {
                    log::error!("durable append failed on {}: {}", channel, err);
                }
            }
        });

        Self {
            registry,
            backend: Backend::Durable {
                log,
                poll_interval,
                append_tx,
                _appender: appender,
            },
        }
    }

    /// Resolve the broker mode from configuration, once.
    ///
    /// A configured Redis URL that cannot be reached degrades to in-memory
    /// delivery with a logged warning rather than failing startup, same as
    /// a missing URL.
    pub async fn from_config(config: &RealtimeConfig) -> Self {
        match &config.redis_url {
            Some(url) => match RedisLog::connect(url).await {
                Ok(log) => Self::durable(Arc::new(log), config.poll_interval),
                Err(err) => {
                    log::warn!(
                        "redis unavailable ({}), falling back to in-memory delivery",
                        err
                    );
                    Self::in_memory()
                }
            },
            None => Self::in_memory(),
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self.backend, Backend::Durable { .. })
    }

    /// Shared registry handle, for components that deliver or listen
    /// locally alongside this broker.
    pub fn registry(&self) -> Arc<ChannelRegistry> {
        self.registry.clone()
    }

    /// Publish a payload on a channel. Fire-and-forget.
    ///
    /// In durable mode the payload is queued for the log appender; in all
    /// modes same-process listeners are invoked synchronously, so local
    /// delivery survives a log outage. Returns the number of local
    /// listeners reached.
    pub fn publish(&self, channel: &str, payload: Value) -> usize {
        if let Backend::Durable { append_tx, .. } = &self.backend {
            if append_tx
                .send((channel.to_string(), payload.clone()))
                .is_err()
            {
                log::error!("append queue closed, dropping durable copy on {}", channel);
            }
        }
        self.registry.deliver(channel, &payload)
    }

    /// Subscribe a callback to a channel.
    ///
    /// Memory mode registers directly with the channel registry. Durable
    /// mode captures the log cursor before returning, then polls for newer
    /// entries on a fixed interval; once this resolves, no later publish
    /// can be missed and no existing backlog is replayed.
    pub async fn subscribe<F>(&self, channel: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        match &self.backend {
            Backend::Memory => {
                let token = self.registry.register(channel, Arc::new(callback));
                Subscription::memory(self.registry.clone(), token)
            }
            Backend::Durable {
                log, poll_interval, ..
            } => {
                let cursor = match log.latest_id(channel).await {
                    Ok(cursor) => cursor,
                    Err(err) => {
                        log::warn!(
                            "could not read latest id on {}, starting from log head: {}",
                            channel,
                            err
                        );
                        None
                    }
                };
                Subscription::polling(
                    log.clone(),
                    channel.to_string(),
                    cursor,
                    *poll_interval,
                    callback,
                )
            }
        }
    }

    /// Local listeners currently registered on a channel. Durable poll
    /// subscriptions are not registry listeners and are not counted.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.registry.listener_count(channel)
    }
}

enum SubscriptionMode {
    Memory {
        registry: Arc<ChannelRegistry>,
        token: ListenerToken,
    },
    Durable {
        stop: Arc<AtomicBool>,
        gate: Arc<Mutex<()>>,
        task: JoinHandle<()>,
    },
}

/// Live subscription handle.
///
/// [`Subscription::unsubscribe`] is idempotent and synchronous; when it
/// returns, the callback will never run again, even against a concurrently
/// executing delivery or an in-flight poll batch. Dropping the handle
/// unsubscribes.
pub struct Subscription {
    done: AtomicBool,
    mode: SubscriptionMode,
}

impl Subscription {
    fn memory(registry: Arc<ChannelRegistry>, token: ListenerToken) -> Self {
        Self {
            done: AtomicBool::new(false),
            mode: SubscriptionMode::Memory { registry, token },
        }
    }

    fn polling<F>(
        log: Arc<dyn DurableLog>,
        channel: String,
        cursor: Option<EntryId>,
        poll_interval: Duration,
        callback: F,
    ) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(Mutex::new(()));

        let loop_stop = stop.clone();
        let loop_gate = gate.clone();
        let task = tokio::spawn(async move {
            let mut cursor = cursor;
            loop {
                tokio::time::sleep(poll_interval).await;
                if loop_stop.load(Ordering::Acquire) {
                    break;
                }
                match log.read_after(&channel, cursor.as_ref(), READ_BATCH).await {
                    Ok(entries) => {
                        for entry in entries {
                            {
                                // Delivery gate: unsubscribe blocks on this
                                // lock, so a set stop flag here is final.
                                let _gate = loop_gate.lock();
                                if loop_stop.load(Ordering::Acquire) {
                                    return;
                                }
                                callback(&entry.payload);
                            }
                            cursor = Some(entry.id);
                        }
                    }
                    Err(err) => {
                        // Transient; keep the cursor and retry next tick.
                        log::warn!("poll read failed on {}: {}", channel, err);
                    }
                }
            }
        });

        Self {
            done: AtomicBool::new(false),
            mode: SubscriptionMode::Durable { stop, gate, task },
        }
    }

    /// Stop delivery. Idempotent; no callback invocation happens after
    /// this returns.
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.mode {
            SubscriptionMode::Memory { registry, token } => registry.unregister(token),
            SubscriptionMode::Durable { stop, gate, task } => {
                stop.store(true, Ordering::Release);
                drop(gate.lock());
                task.abort();
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Error, Result};
    use crate::realtime::durable::{LogEntry, MemoryLog};
    use async_trait::async_trait;
    use parking_lot::Mutex as PMutex;
    use serde_json::json;
    use std::sync::atomic::AtomicU64;

    /// Log wrapper that can be switched into an outage.
    struct FlakyLog {
        inner: MemoryLog,
        fail_appends: AtomicBool,
    }

    impl FlakyLog {
        fn new() -> Self {
            Self {
                inner: MemoryLog::new(),
                fail_appends: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl DurableLog for FlakyLog {
        async fn append(&self, channel: &str, payload: &Value) -> Result<EntryId> {
            if self.fail_appends.load(Ordering::Acquire) {
                return Err(Error::Unavailable("simulated outage".into()));
            }
            self.inner.append(channel, payload).await
        }

        async fn read_after(
            &self,
            channel: &str,
            cursor: Option<&EntryId>,
            limit: usize,
        ) -> Result<Vec<LogEntry>> {
            self.inner.read_after(channel, cursor, limit).await
        }

        async fn latest_id(&self, channel: &str) -> Result<Option<EntryId>> {
            self.inner.latest_id(channel).await
        }
    }

    fn fast_poll() -> Duration {
        Duration::from_millis(10)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    #[tokio::test]
    async fn memory_subscriber_sees_exact_payload_once() {
        let broker = Broker::in_memory();
        let seen: Arc<PMutex<Vec<Value>>> = Arc::new(PMutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = broker
            .subscribe("orders", move |payload| sink.lock().push(payload.clone()))
            .await;

        let payload = json!({
            "type": "created",
            "order": {"id": "1", "room_number": "101", "total_amount": 1800}
        });
        broker.publish("orders", payload.clone());

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], payload);
    }

    #[tokio::test]
    async fn memory_delivery_preserves_publish_order() {
        let broker = Broker::in_memory();
        let seen: Arc<PMutex<Vec<Value>>> = Arc::new(PMutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = broker
            .subscribe("order:abc", move |payload| sink.lock().push(payload.clone()))
            .await;

        broker.publish("order:abc", json!({"status": "preparing"}));
        broker.publish("order:abc", json!({"status": "ready"}));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["status"], json!("preparing"));
        assert_eq!(seen[1]["status"], json!("ready"));
    }

    #[tokio::test]
    async fn unsubscribe_is_race_free_against_publishers() {
        let broker = Arc::new(Broker::in_memory());
        let delivered = Arc::new(AtomicU64::new(0));

        let counter = delivered.clone();
        let sub = broker
            .subscribe("orders", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        let publisher = broker.clone();
        let running = Arc::new(AtomicBool::new(true));
        let running_flag = running.clone();
        let pump = std::thread::spawn(move || {
            let mut n = 0u64;
            while running_flag.load(Ordering::Acquire) {
                publisher.publish("orders", json!({"n": n}));
                n += 1;
            }
        });

        // Let some deliveries land, then cut the subscription.
        tokio::time::sleep(Duration::from_millis(50)).await;
        sub.unsubscribe();
        let frozen = delivered.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), frozen);

        running.store(false, Ordering::Release);
        pump.join().unwrap();
    }

    #[tokio::test]
    async fn durable_cursor_starts_at_latest_with_no_backlog_replay() {
        let log = Arc::new(MemoryLog::new());
        log.append("orders", &json!({"old": 1})).await.unwrap();
        log.append("orders", &json!({"old": 2})).await.unwrap();

        let broker = Broker::durable(log.clone(), fast_poll());
        let delivered = Arc::new(AtomicU64::new(0));
        let counter = delivered.clone();
        let _sub = broker
            .subscribe("orders", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        settle().await;
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn durable_subscriber_receives_new_entries_in_log_order() {
        let log = Arc::new(MemoryLog::new());
        let broker = Broker::durable(log.clone(), fast_poll());

        let seen: Arc<PMutex<Vec<Value>>> = Arc::new(PMutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = broker
            .subscribe("order:abc", move |payload| sink.lock().push(payload.clone()))
            .await;

        broker.publish("order:abc", json!({"status": "preparing"}));
        broker.publish("order:abc", json!({"status": "ready"}));

        settle().await;
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["status"], json!("preparing"));
        assert_eq!(seen[1]["status"], json!("ready"));
    }

    #[tokio::test]
    async fn durable_unsubscribe_stops_the_poll_loop() {
        let log = Arc::new(MemoryLog::new());
        let broker = Broker::durable(log.clone(), fast_poll());

        let delivered = Arc::new(AtomicU64::new(0));
        let counter = delivered.clone();
        let sub = broker
            .subscribe("orders", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        broker.publish("orders", json!({"n": 1}));
        settle().await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        broker.publish("orders", json!({"n": 2}));
        settle().await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_append_still_reaches_local_listeners() {
        let log = Arc::new(FlakyLog::new());
        log.fail_appends.store(true, Ordering::Release);

        let registry = Arc::new(ChannelRegistry::new());
        let broker = Broker::durable_with_registry(registry.clone(), log.clone(), fast_poll());

        // A same-process component listening on the shared registry.
        let delivered = Arc::new(AtomicU64::new(0));
        let counter = delivered.clone();
        let token = registry.register(
            "orders",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        broker.publish("orders", json!({"type": "created"}));
        settle().await;

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(log
            .inner
            .latest_id("orders")
            .await
            .unwrap()
            .is_none());

        registry.unregister(&token);
    }

    #[tokio::test]
    async fn from_config_without_redis_is_memory_mode() {
        let broker = Broker::from_config(&RealtimeConfig::default()).await;
        assert!(!broker.is_durable());
    }
}
