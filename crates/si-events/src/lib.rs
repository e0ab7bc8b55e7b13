use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Minimal event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

/// A simple broadcast bus for JSON-serializable events.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        self.publish_envelope(Envelope {
            time: now,
            kind: kind.to_string(),
            payload: val,
        });
    }

    /// Publishes a pre-built envelope, e.g. one that was journaled first.
    pub fn publish_envelope(&self, env: Envelope) {
        let _ = self.tx.send(env);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = Bus::new(8);
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();
        bus.publish("service.test", &json!({"n": 1}));
        let env_a = rx_a.recv().await.expect("subscriber a");
        let env_b = rx_b.recv().await.expect("subscriber b");
        assert_eq!(env_a.kind, "service.test");
        assert_eq!(env_b.payload["n"], 1);
        assert!(!env_a.time.is_empty());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = Bus::new(4);
        bus.publish("service.test", &json!({}));
        let mut rx = bus.subscribe();
        bus.publish("service.test", &json!({"after": true}));
        let env = rx.recv().await.expect("late subscriber");
        assert_eq!(env.payload["after"], true);
    }
}
