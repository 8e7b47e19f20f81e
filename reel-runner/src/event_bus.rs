use once_cell::sync::OnceCell;
use serde_json::Value;
use tokio::sync::broadcast;

/// Process-wide bus for run events.
///
/// Events are arbitrary JSON values. The runner publishes; side readers such as
/// the CLI's event tail call `subscribe` to receive a stream.
static EVENT_SENDER: OnceCell<broadcast::Sender<Value>> = OnceCell::new();

fn sender() -> broadcast::Sender<Value> {
    EVENT_SENDER
        .get_or_init(|| {
            let (tx, _rx) = broadcast::channel(256);
            tx
        })
        .clone()
}

/// Publish an event to all subscribers. Errors (e.g., no subscribers) are ignored.
pub fn publish(event: Value) {
    let _ = sender().send(event);
}

/// Publish `payload` tagged with its event name and a timestamp.
pub fn emit(kind: &str, payload: Value) {
    let mut event = match payload {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    event.insert("event".to_string(), Value::String(kind.to_string()));
    event.insert(
        "timestamp".to_string(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );
    publish(Value::Object(event));
}

/// Subscribe to the global event stream.
pub fn subscribe() -> broadcast::Receiver<Value> {
    sender().subscribe()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_tags_events() {
        let mut rx = subscribe();
        emit("bus.test", json!({"index": 2}));
        loop {
            let event = rx.recv().await.unwrap();
            if event["event"] == "bus.test" {
                assert_eq!(event["index"], 2);
                assert!(event["timestamp"].is_string());
                break;
            }
        }
    }
}
