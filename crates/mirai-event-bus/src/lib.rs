//! Topic-keyed event fanout for the mirai runtime
//!
//! This crate provides the EventBus, the in-process broker between the
//! connectors and everything that consumes events. Delivery never blocks
//! the publisher: each subscriber owns a bounded buffer and a subscriber
//! that falls behind loses its oldest events, observed as a lag error on
//! its receiver.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use mirai_core::Event;

/// Default per-subscriber buffer capacity
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Topics used by the runtime
pub mod topics {
    pub use mirai_core::TOPIC_HA_EVENTS as HA_EVENTS;
    pub use mirai_core::TOPIC_MQTT_EVENTS as MQTT_EVENTS;
}

/// A topic under which subscriptions are grouped
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    /// Create a new topic
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the topic as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The event bus for publishing and subscribing to events
///
/// Within one `(topic, subscriber)` pair events arrive in publish order.
/// There is no ordering across topics.
pub struct EventBus {
    /// Map of topics to their broadcast senders
    channels: DashMap<Topic, broadcast::Sender<Event>>,
    /// Per-subscriber buffer capacity
    capacity: usize,
}

impl EventBus {
    /// Create a new event bus with the default buffer capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the given per-subscriber capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    /// Subscribe to a topic
    ///
    /// Returns a receiver that sees every event published to the topic
    /// from this point on. A receiver that falls more than the buffer
    /// capacity behind loses its oldest events and observes
    /// `RecvError::Lagged`; subscribers are expected to log that and
    /// continue.
    pub fn subscribe(&self, topic: impl Into<Topic>) -> broadcast::Receiver<Event> {
        let topic = topic.into();
        trace!(%topic, "subscribing");

        self.channels
            .entry(topic)
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(self.capacity);
                tx
            })
            .subscribe()
    }

    /// Publish an event to every subscriber of a topic
    ///
    /// Never blocks. An event published to a topic nobody subscribes to
    /// is dropped.
    pub fn publish(&self, topic: impl Into<Topic>, event: Event) {
        let topic = topic.into();
        debug!(%topic, event_id = %event.id, "publishing event");

        if let Some(sender) = self.channels.get(&topic) {
            // Send errors only mean there are no active receivers
            let _ = sender.send(event);
        }
    }

    /// Number of active subscribers on a topic
    pub fn subscriber_count(&self, topic: impl Into<Topic>) -> usize {
        self.channels
            .get(&topic.into())
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for EventBus
pub type SharedEventBus = Arc<EventBus>;
