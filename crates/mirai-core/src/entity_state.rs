//! Cached entity state value

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::StateSnapshot;

/// The current state of one entity as held by the state cache
///
/// Entries are created by the REST bootstrap or the first state-changed
/// event for an entity, and thereafter overwritten wholesale by each
/// subsequent state-changed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    /// The state value (e.g. `"on"`, `"23.5"`, `"unavailable"`)
    pub state: serde_json::Value,

    /// Attributes reported alongside the state
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// When the state value last changed
    pub last_changed: Option<DateTime<Utc>>,

    /// When the state was last written, even if unchanged
    pub last_updated: Option<DateTime<Utc>>,
}

impl EntityState {
    /// Build an entry from an event's new-state snapshot and attributes
    pub fn from_snapshot(
        snapshot: &StateSnapshot,
        attributes: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            state: snapshot.state.clone(),
            attributes,
            last_changed: snapshot.last_changed,
            last_updated: snapshot.last_updated,
        }
    }

    /// The state value as a string slice, when it is a string
    pub fn state_str(&self) -> Option<&str> {
        self.state.as_str()
    }

    /// Whether the entity is in the given string state
    pub fn is_state(&self, state: &str) -> bool {
        self.state_str() == Some(state)
    }

    /// Get an attribute value by key, deserialized to the requested type
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}
