//! Canonical event record broadcast on the event bus

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

static NEXT_HA_SEQ: AtomicU64 = AtomicU64::new(1);
static NEXT_MQTT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Where an event entered the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    HomeAssistant,
    Mqtt,
    Rest,
}

/// What kind of external occurrence an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateChanged,
    ServiceCalled,
    AutomationTriggered,
    Unknown,
}

/// A point-in-time view of an entity's state as carried by an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// The state value; usually a string, but MQTT payloads that fail JSON
    /// decoding are wrapped as `{"raw": "<text>"}`
    pub state: serde_json::Value,

    /// When the state value last changed
    pub last_changed: Option<DateTime<Utc>>,

    /// When the state was last written, even if unchanged
    pub last_updated: Option<DateTime<Utc>>,
}

impl StateSnapshot {
    /// Create a snapshot carrying only a state value
    pub fn of(state: serde_json::Value) -> Self {
        Self {
            state,
            last_changed: None,
            last_updated: None,
        }
    }
}

/// The canonical event record
///
/// Every external occurrence, whatever its origin, is normalized into this
/// shape before it reaches the event bus. Events are immutable once built;
/// subscribers receive clones and never alias the producer's working memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Stable identifier, `"ha_<n>"` or `"mqtt_<n>"`, unique within a run
    pub id: String,

    /// Origin of the event
    pub source: EventSource,

    /// Classification of the event
    pub kind: EventKind,

    /// When the event was fired (origin timestamp where available)
    pub timestamp: DateTime<Utc>,

    /// Addressed entity, `"<domain>.<object>"`, when the event has one
    pub entity_id: Option<String>,

    /// Domain of the entity or service
    pub domain: Option<String>,

    /// State before the change, for state-changed events
    pub old_state: Option<StateSnapshot>,

    /// State after the change, for state-changed events
    pub new_state: Option<StateSnapshot>,

    /// Attributes attached to the new state, or service call details
    pub attributes: HashMap<String, serde_json::Value>,

    /// Origin context as reported by the source
    pub context: HashMap<String, serde_json::Value>,

    /// The original payload, kept for debugging
    pub raw: serde_json::Value,
}

impl Event {
    /// Create an empty event of the given source and kind, stamped now
    pub fn new(id: String, source: EventSource, kind: EventKind) -> Self {
        Self {
            id,
            source,
            kind,
            timestamp: Utc::now(),
            entity_id: None,
            domain: None,
            old_state: None,
            new_state: None,
            attributes: HashMap::new(),
            context: HashMap::new(),
            raw: serde_json::Value::Null,
        }
    }

    /// Set the entity id, deriving `domain` from the prefix before the
    /// first `.` when one is present
    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        let entity_id = entity_id.into();
        self.domain = domain_of(&entity_id).map(str::to_string);
        self.entity_id = Some(entity_id);
        self
    }

    /// Whether this event reports an entity state change
    pub fn is_state_changed(&self) -> bool {
        self.kind == EventKind::StateChanged
    }
}

/// Domain part of an entity id: the prefix before the first `.`
pub(crate) fn domain_of(entity_id: &str) -> Option<&str> {
    entity_id.split_once('.').map(|(domain, _)| domain)
}

/// Allocate the next `"ha_<n>"` event id
pub(crate) fn next_ha_id() -> String {
    format!("ha_{}", NEXT_HA_SEQ.fetch_add(1, Ordering::Relaxed))
}

/// Allocate the next `"mqtt_<n>"` event id
pub(crate) fn next_mqtt_id() -> String {
    format!("mqtt_{}", NEXT_MQTT_SEQ.fetch_add(1, Ordering::Relaxed))
}
