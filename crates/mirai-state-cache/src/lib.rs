//! Live entity state map with REST bootstrap
//!
//! The cache is a concurrent-read map kept current by a single writer
//! task: it subscribes to the HA event topic first, then fetches the
//! `/api/states` snapshot, then applies the (buffered and live) stream of
//! state-changed events in receive order. Late events overwriting the
//! snapshot is the intended resolution of the bootstrap race.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use mirai_config::HaConfig;
use mirai_core::{EntityState, Event};
use mirai_event_bus::{topics, SharedEventBus};

/// Total time allowed for the bootstrap request
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors surfaced by cache lookups
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("no state cached for entity '{entity_id}'")]
    NotFound { entity_id: String },
}

/// One element of the `/api/states` response
#[derive(Debug, Clone, Deserialize)]
pub struct RestState {
    pub entity_id: String,
    pub state: serde_json::Value,
    #[serde(default)]
    pub attributes: std::collections::HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub last_changed: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
}

/// The entity state cache
///
/// Reads are safe concurrently with the writer and never block it.
pub struct StateCache {
    states: DashMap<String, EntityState>,
}

impl StateCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    /// Get the cached state of an entity
    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    /// Get the cached state of an entity, or an error when unknown
    pub fn require(&self, entity_id: &str) -> Result<EntityState, StateError> {
        self.get(entity_id).ok_or_else(|| StateError::NotFound {
            entity_id: entity_id.to_string(),
        })
    }

    /// All cached entities, sorted by entity id
    pub fn all_entities(&self) -> Vec<(String, EntityState)> {
        let mut entries: Vec<(String, EntityState)> = self
            .states
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Number of cached entities
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Overwrite an entry from a state-changed event
    ///
    /// Events without an entity id or a new state are ignored; entries are
    /// never deleted.
    fn apply_event(&self, event: &Event) {
        if !event.is_state_changed() {
            return;
        }
        let (Some(entity_id), Some(new_state)) = (&event.entity_id, &event.new_state) else {
            return;
        };
        let state = EntityState::from_snapshot(new_state, event.attributes.clone());
        self.states.insert(entity_id.clone(), state);
    }

    /// Insert every element of a REST snapshot
    fn apply_snapshot(&self, snapshot: Vec<RestState>) {
        for rest in snapshot {
            let state = EntityState {
                state: rest.state,
                attributes: rest.attributes,
                last_changed: rest.last_changed,
                last_updated: rest.last_updated,
            };
            self.states.insert(rest.entity_id, state);
        }
    }
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for StateCache
pub type SharedStateCache = Arc<StateCache>;

/// Start the cache writer task
///
/// Subscribes to `"ha:events"` before the snapshot request so no event is
/// missed; snapshot failures are logged and the cache fills from the live
/// stream instead.
pub fn start_writer(
    cache: SharedStateCache,
    bus: SharedEventBus,
    config: HaConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = bus.subscribe(topics::HA_EVENTS);

        match fetch_snapshot(&config).await {
            Ok(snapshot) => {
                let count = snapshot.len();
                cache.apply_snapshot(snapshot);
                info!(entities = count, "state cache bootstrapped");
            }
            Err(e) => {
                error!(error = %e, "state bootstrap failed; continuing with live events only");
            }
        }

        loop {
            tokio::select! {
                result = rx.recv() => match result {
                    Ok(event) => cache.apply_event(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "state cache lagged behind the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("event bus closed, stopping state cache writer");
                        break;
                    }
                },
                _ = shutdown.recv() => break,
            }
        }
    })
}

/// Fetch the `/api/states` snapshot
async fn fetch_snapshot(config: &HaConfig) -> Result<Vec<RestState>, String> {
    let client = reqwest::Client::builder()
        .timeout(BOOTSTRAP_TIMEOUT)
        .build()
        .map_err(|e| e.to_string())?;

    let response = client
        .get(config.states_url())
        .header(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", config.token),
        )
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if !response.status().is_success() {
        return Err(format!("unexpected status {}", response.status()));
    }

    response
        .json::<Vec<RestState>>()
        .await
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirai_core::{EventKind, EventSource, StateSnapshot};
    use serde_json::json;

    fn state_event(id: &str, entity_id: &str, state: &str) -> Event {
        let mut event = Event::new(id.to_string(), EventSource::HomeAssistant, EventKind::StateChanged)
            .with_entity_id(entity_id);
        event.new_state = Some(StateSnapshot::of(json!(state)));
        event
    }

    #[test]
    fn test_apply_event_and_get() {
        let cache = StateCache::new();
        cache.apply_event(&state_event("ha_1", "light.kitchen", "on"));

        let state = cache.get("light.kitchen").unwrap();
        assert!(state.is_state("on"));
    }

    #[test]
    fn test_latest_event_wins() {
        let cache = StateCache::new();
        cache.apply_event(&state_event("ha_1", "light.kitchen", "on"));
        cache.apply_event(&state_event("ha_2", "light.kitchen", "off"));

        assert!(cache.get("light.kitchen").unwrap().is_state("off"));
    }

    #[test]
    fn test_event_overwrites_snapshot() {
        let cache = StateCache::new();
        let snapshot: Vec<RestState> = serde_json::from_value(json!([
            {"entity_id": "light.kitchen", "state": "off", "attributes": {}},
            {"entity_id": "sensor.temp", "state": "21.5", "attributes": {"unit_of_measurement": "°C"}}
        ]))
        .unwrap();
        cache.apply_snapshot(snapshot);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("light.kitchen").unwrap().is_state("off"));

        // An event that raced the snapshot is applied after it and wins
        cache.apply_event(&state_event("ha_1", "light.kitchen", "on"));
        assert!(cache.get("light.kitchen").unwrap().is_state("on"));
    }

    #[test]
    fn test_non_state_changed_events_ignored() {
        let cache = StateCache::new();
        let mut event = Event::new("ha_1".into(), EventSource::HomeAssistant, EventKind::ServiceCalled);
        event.domain = Some("light".into());
        cache.apply_event(&event);

        assert!(cache.is_empty());
    }

    #[test]
    fn test_require_not_found() {
        let cache = StateCache::new();
        assert_eq!(
            cache.require("light.nowhere").unwrap_err(),
            StateError::NotFound {
                entity_id: "light.nowhere".to_string()
            }
        );
    }

    #[test]
    fn test_all_entities_sorted() {
        let cache = StateCache::new();
        cache.apply_event(&state_event("ha_1", "switch.b", "on"));
        cache.apply_event(&state_event("ha_2", "light.a", "off"));
        cache.apply_event(&state_event("ha_3", "sensor.c", "3"));

        let ids: Vec<String> = cache.all_entities().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["light.a", "sensor.c", "switch.b"]);
    }
}
