use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

/// Callback invoked for every payload delivered on a subscribed channel.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// One registered listener.
///
/// The gate serializes delivery against unregistration: `deliver` holds it
/// while invoking, `unregister` deactivates under it, so once `unregister`
/// returns no further invocation can happen.
struct Slot {
    active: AtomicBool,
    gate: Mutex<()>,
    listener: Listener,
}

/// Handle returned by [`ChannelRegistry::register`]; pass it back to
/// [`ChannelRegistry::unregister`] to stop delivery.
pub struct ListenerToken {
    channel: String,
    id: u64,
    slot: Arc<Slot>,
}

impl ListenerToken {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// In-process fan-out of one channel to many listeners.
///
/// This is the delivery vector for same-process subscribers in every
/// broker mode. Channel sets are created lazily on first registration and
/// dropped when their last listener leaves, so churn does not grow the map.
///
/// The registry is an explicit, injectable instance; components that
/// publish or subscribe receive a shared handle rather than reaching for
/// process-global state.
pub struct ChannelRegistry {
    channels: DashMap<String, HashMap<u64, Arc<Slot>>>,
    next_id: AtomicU64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a listener to a channel. O(1) amortized.
    pub fn register(&self, channel: &str, listener: Listener) -> ListenerToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot {
            active: AtomicBool::new(true),
            gate: Mutex::new(()),
            listener,
        });
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(id, slot.clone());
        ListenerToken {
            channel: channel.to_string(),
            id,
            slot,
        }
    }

    /// Remove a listener. Idempotent; after this returns the listener is
    /// never invoked again, even by a delivery already in flight.
    pub fn unregister(&self, token: &ListenerToken) {
        if let Some(mut listeners) = self.channels.get_mut(&token.channel) {
            listeners.remove(&token.id);
            let empty = listeners.is_empty();
            drop(listeners);
            if empty {
                self.channels.remove_if(&token.channel, |_, m| m.is_empty());
            }
        }

        let _gate = token.slot.gate.lock();
        token.slot.active.store(false, Ordering::Release);
    }

    /// Invoke every listener registered on `channel` with `payload`.
    ///
    /// Iterates over a snapshot, so listeners may register or unregister
    /// concurrently. Invocation order is unspecified. A panicking listener
    /// is logged and does not stop delivery to the rest. Returns the
    /// number of listeners invoked.
    pub fn deliver(&self, channel: &str, payload: &Value) -> usize {
        let slots: Vec<Arc<Slot>> = match self.channels.get(channel) {
            Some(listeners) => listeners.values().cloned().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for slot in slots {
            let _gate = slot.gate.lock();
            if !slot.active.load(Ordering::Acquire) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| (slot.listener)(payload))).is_err() {
                log::warn!("listener panicked on channel {}", channel);
            }
            delivered += 1;
        }
        delivered
    }

    /// Number of listeners currently registered on a channel.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|m| m.len()).unwrap_or(0)
    }

    /// Number of channels with at least one listener.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;
    use serde_json::json;

    fn collecting_listener() -> (Listener, Arc<PMutex<Vec<Value>>>) {
        let seen: Arc<PMutex<Vec<Value>>> = Arc::new(PMutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Listener = Arc::new(move |payload| sink.lock().push(payload.clone()));
        (listener, seen)
    }

    #[test]
    fn delivers_every_payload_in_publish_order() {
        let registry = ChannelRegistry::new();
        let (listener, seen) = collecting_listener();
        let _token = registry.register("orders", listener);

        registry.deliver("orders", &json!({"status": "preparing"}));
        registry.deliver("orders", &json!({"status": "ready"}));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], json!({"status": "preparing"}));
        assert_eq!(seen[1], json!({"status": "ready"}));
    }

    #[test]
    fn late_listener_misses_earlier_events() {
        let registry = ChannelRegistry::new();
        registry.deliver("orders", &json!({"early": true}));

        let (listener, seen) = collecting_listener();
        let _token = registry.register("orders", listener);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn unregister_stops_delivery_and_is_idempotent() {
        let registry = ChannelRegistry::new();
        let (listener, seen) = collecting_listener();
        let token = registry.register("orders", listener);

        registry.deliver("orders", &json!(1));
        registry.unregister(&token);
        registry.unregister(&token);
        registry.deliver("orders", &json!(2));

        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn empty_channel_sets_are_dropped() {
        let registry = ChannelRegistry::new();
        let (listener, _) = collecting_listener();
        let token = registry.register("orders", listener);
        assert_eq!(registry.channel_count(), 1);

        registry.unregister(&token);
        assert_eq!(registry.channel_count(), 0);
        assert_eq!(registry.listener_count("orders"), 0);
    }

    #[test]
    fn panicking_listener_does_not_block_the_rest() {
        let registry = ChannelRegistry::new();
        let bad: Listener = Arc::new(|_| panic!("listener bug"));
        let _bad_token = registry.register("orders", bad);
        let (listener, seen) = collecting_listener();
        let _token = registry.register("orders", listener);

        registry.deliver("orders", &json!({"ok": true}));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn deliver_counts_only_matching_channel() {
        let registry = ChannelRegistry::new();
        let (listener, seen) = collecting_listener();
        let _token = registry.register("order:1", listener);

        assert_eq!(registry.deliver("order:2", &json!({})), 0);
        assert_eq!(registry.deliver("order:1", &json!({})), 1);
        assert_eq!(seen.lock().len(), 1);
    }
}
