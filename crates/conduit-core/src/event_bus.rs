use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// One delivered event: an exact event name plus an arbitrary JSON payload.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

/// Local publish/subscribe bus. `publish` never blocks the caller — each
/// subscriber has its own bounded channel and a full channel just drops
/// the event (counted), the same `try_send` fire-and-forget delivery the
/// teacher's scheduler uses for fired-job notifications. No wildcard
/// matching: subscriptions are on exact event names only.
pub struct EventBus {
    subscribers: DashMap<String, Vec<mpsc::Sender<Event>>>,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
            dropped: AtomicU64::new(0),
        })
    }

    /// Subscribe to an exact event name. Returns a receiver; drop it (or
    /// the whole crate-level component) to unsubscribe — the sender side
    /// simply stops finding a live receiver and the try_send starts
    /// failing silently into the drop counter.
    pub fn subscribe(&self, name: &str) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.subscribers.entry(name.to_string()).or_default().push(tx);
        rx
    }

    pub fn publish(&self, name: &str, payload: Value) {
        let Some(senders) = self.subscribers.get(name) else {
            return;
        };
        let event = Event {
            name: name.to_string(),
            payload,
        };
        for sender in senders.iter() {
            if sender.try_send(event.clone()).is_err() {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(event = name, total_dropped = total, "event dropped: subscriber channel full or closed");
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            subscribers: DashMap::new(),
            dropped: AtomicU64::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("node.up");
        bus.publish("node.up", json!({"nodeId": "n1"}));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "node.up");
        assert_eq!(event.payload["nodeId"], "n1");
    }

    #[tokio::test]
    async fn publish_to_unsubscribed_name_is_a_noop() {
        let bus = EventBus::new();
        bus.publish("nobody.listens", json!({}));
        assert_eq!(bus.dropped_count(), 0);
    }

    #[tokio::test]
    async fn full_subscriber_channel_drops_without_blocking_publisher() {
        let bus = EventBus::new();
        let _rx = bus.subscribe("flood"); // never drained
        for _ in 0..(SUBSCRIBER_CHANNEL_CAPACITY + 10) {
            bus.publish("flood", json!({}));
        }
        assert!(bus.dropped_count() > 0);
    }
}
