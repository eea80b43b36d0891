//! Event fan-out.
//!
//! One [`EventPublisher`] per Thing, offering `publish(topic, payload)` to
//! anything holding the Thing (typically its properties/actions, when they
//! want to emit a change notification). Delivery is best-effort and
//! unordered: a lagging subscriber misses events rather than stalling the
//! publisher, mirroring `tokio::sync::broadcast`'s own semantics and the
//! "best-effort, unordered" event model.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::codec::TypedPayload;

/// Default broadcast channel capacity per topic.
const DEFAULT_CAPACITY: usize = 64;

/// A published event: the topic it was published under and its typed
/// payload, flattened to wire parts for subscribers.
pub type EventFrame = Vec<Bytes>;

/// Publishes events for one Thing, keyed by topic.
pub struct EventPublisher {
    topics: RwLock<HashMap<String, broadcast::Sender<EventFrame>>>,
}

impl EventPublisher {
    /// Build an empty publisher. Topics are created lazily on first
    /// publish or subscribe.
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Publish `payload` under `topic`. Creates the topic's channel if this
    /// is the first publish or subscribe for it. A topic with no
    /// subscribers simply drops the event.
    pub fn publish(&self, topic: &str, payload: TypedPayload) {
        let sender = self.sender_for(topic);
        let frame = vec![
            Bytes::copy_from_slice(topic.as_bytes()),
            Bytes::copy_from_slice(payload.content_type.as_bytes()),
            Bytes::from(payload.bytes),
        ];
        // Ignored: zero subscribers is not an error, and a lagging
        // subscriber is handled by broadcast itself (it just misses events).
        let _ = sender.send(frame);
    }

    /// Subscribe to a topic's events, creating it if it doesn't exist yet.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<EventFrame> {
        self.sender_for(topic).subscribe()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<EventFrame> {
        if let Some(sender) = self.topics.read().expect("event publisher lock poisoned").get(topic) {
            return sender.clone();
        }
        let mut topics = self.topics.write().expect("event publisher lock poisoned");
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(DEFAULT_CAPACITY).0)
            .clone()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}
