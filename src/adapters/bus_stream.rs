//! WebSocket bus-event adapter: republishes `MessageBus` traffic verbatim
//! as the documented `{ topic, payload }` envelope.

use serde::Serialize;
use serde_json::Value;

use crate::bus::{MessageBus, SubscriptionHandle, SubscriptionMode};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BusEventEnvelope {
    pub topic: String,
    pub payload: Value,
}

/// Subscribe `pattern` on `bus` and hand every matching event to `sink` as
/// a `BusEventEnvelope`. `sink` is typically a WebSocket frame writer; it
/// must not block, since it runs inside the bus's delivery path.
pub async fn forward_to_sink<F>(bus: &MessageBus, pattern: impl Into<String>, sink: F) -> SubscriptionHandle
where
    F: Fn(BusEventEnvelope) + Send + Sync + 'static,
{
    bus.subscribe(
        pattern,
        SubscriptionMode::Queued,
        std::sync::Arc::new(move |topic: &str, payload: &Value| {
            sink(BusEventEnvelope {
                topic: topic.to_string(),
                payload: payload.clone(),
            });
        }),
    )
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn forwarded_events_preserve_topic_and_payload() {
        let bus = MessageBus::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();

        forward_to_sink(&bus, "sequencer.*", move |envelope| {
            received_clone.lock().unwrap().push(envelope);
        })
        .await;

        bus.publish("sequencer.target-started", json!({"name": "m31"})).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let envelopes = received.lock().unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].topic, "sequencer.target-started");
        assert_eq!(envelopes[0].payload, json!({"name": "m31"}));
    }
}
