//! Subscribable status channel.
//!
//! The lifecycle controller publishes an event on every state transition
//! and a periodic full snapshot. Consumers (a dashboard, a WebSocket
//! adapter) subscribe and render; nothing in the core depends on anyone
//! listening.

use crate::registry::{ModelState, ModelStatus, now_unix_ms};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    Transition {
        model: String,
        state: ModelState,
        at_ms: u64,
    },
    Snapshot {
        at_ms: u64,
        models: BTreeMap<String, ModelStatus>,
    },
}

/// Broadcast hub for status events. Slow subscribers lag and drop old
/// events rather than backpressuring the controller.
#[derive(Clone)]
pub struct StatusHub {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn publish_transition(&self, model: &str, state: ModelState) {
        let _ = self.tx.send(StatusEvent::Transition {
            model: model.to_string(),
            state,
            at_ms: now_unix_ms(),
        });
    }

    pub fn publish_snapshot(&self, models: BTreeMap<String, ModelStatus>) {
        let _ = self.tx.send(StatusEvent::Snapshot {
            at_ms: now_unix_ms(),
            models,
        });
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transition_delivered_to_subscriber() {
        let hub = StatusHub::default();
        let mut rx = hub.subscribe();

        hub.publish_transition("llama", ModelState::Starting);
        hub.publish_transition("llama", ModelState::Ready);

        match rx.recv().await.unwrap() {
            StatusEvent::Transition { model, state, .. } => {
                assert_eq!(model, "llama");
                assert_eq!(state, ModelState::Starting);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            StatusEvent::Transition { state, .. } => assert_eq!(state, ModelState::Ready),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let hub = StatusHub::default();
        hub.publish_transition("llama", ModelState::Stopped);
        hub.publish_snapshot(BTreeMap::new());
    }

    #[tokio::test]
    async fn test_event_serializes_with_tag() {
        let hub = StatusHub::default();
        let mut rx = hub.subscribe();
        hub.publish_transition("llama", ModelState::Ready);

        let event = rx.recv().await.unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "transition");
        assert_eq!(json["model"], "llama");
        assert_eq!(json["state"], "ready");
    }
}
