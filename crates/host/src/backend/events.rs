use serde::Serialize;
use tokio::sync::broadcast;

use super::EventBus;

/// Prefix applied to every event a guest broadcasts.
pub const EVENT_PREFIX: &str = "fn#";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    Public,
    Admin,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub audience: Audience,
    pub event: String,
    pub payload: serde_json::Value,
}

/// In-process fan-out bus. Subscribers that fall behind lose old events.
#[derive(Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<BusEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, audience: Audience, event: &str, payload: serde_json::Value) {
        // no subscribers is not an error
        let _ = self.tx.send(BusEvent {
            audience,
            event: event.to_string(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_published_events() {
        let bus = BroadcastBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(Audience::Admin, "fn#ping", serde_json::json!({ "n": 1 }));
        let event = rx.try_recv().expect("event");
        assert_eq!(event.audience, Audience::Admin);
        assert_eq!(event.event, "fn#ping");
        assert_eq!(event.payload["n"], 1);
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        BroadcastBus::new(1).publish(Audience::Public, "fn#x", serde_json::Value::Null);
    }
}
