//! Event bus (C5): named-event broadcast to subscribers.
//!
//! Delivery is fire-and-forget over a `tokio::sync::broadcast` channel — the
//! mechanism used by `other_examples`' orchestrator event bus, stripped down
//! to the plain `broadcast::Sender`/`subscribe` shape without its narration.
//! Subscribers must tolerate duplicates and out-of-order delivery (spec
//! §4.5); a lagging subscriber just misses the oldest buffered events rather
//! than blocking publishers.

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 1024;

/// One named event with a JSON payload, as listed in spec §6.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: &'static str,
    pub payload: Value,
}

pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Fire-and-forget publish. Ignores the "no subscribers" error — the
    /// core keeps running whether or not anyone is listening.
    pub fn publish(&self, name: &'static str, payload: Value) {
        trace!(event = name, "publishing event");
        let _ = self.sender.send(Event { name, payload });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish("fault:created", json!({"id": "f1"}));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "fault:created");
        assert_eq!(event.payload["id"], "f1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish("fault:created", json!({}));
    }
}
