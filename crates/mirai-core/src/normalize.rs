//! Normalizers turning raw connector payloads into canonical events
//!
//! Both normalizers are pure: they never fail, falling back to an
//! `Unknown` classification or a `"raw"`-wrapped payload instead.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::trace;

use crate::event::{next_ha_id, next_mqtt_id};
use crate::{Event, EventKind, EventSource, StateSnapshot};

/// Normalize a decoded Home Assistant WebSocket frame of `type == "event"`
///
/// Classification follows the frame's `event.event_type`; anything
/// unrecognized becomes an [`EventKind::Unknown`] event that still carries
/// the raw payload for debugging.
pub fn normalize_ha(frame: &Value) -> Event {
    let ha_event = frame.get("event").cloned().unwrap_or(Value::Null);
    let event_type = ha_event.get("event_type").and_then(Value::as_str);

    let kind = match event_type {
        Some("state_changed") => EventKind::StateChanged,
        Some("call_service") => EventKind::ServiceCalled,
        Some("automation_triggered") => EventKind::AutomationTriggered,
        _ => {
            trace!(event_type, "unrecognized HA event type");
            EventKind::Unknown
        }
    };

    let id = match ha_event.get("id").and_then(Value::as_u64) {
        Some(n) => format!("ha_{n}"),
        None => next_ha_id(),
    };

    let mut event = Event::new(id, EventSource::HomeAssistant, kind);
    event.timestamp = parse_instant(ha_event.get("time_fired")).unwrap_or_else(Utc::now);
    event.context = object_map(ha_event.get("context"));
    event.raw = frame.clone();

    let data = ha_event.get("data").cloned().unwrap_or(Value::Null);

    match kind {
        EventKind::StateChanged => {
            if let Some(entity_id) = data.get("entity_id").and_then(Value::as_str) {
                event = event.with_entity_id(entity_id);
            }
            event.old_state = data.get("old_state").and_then(snapshot);
            event.new_state = data.get("new_state").and_then(snapshot);
            event.attributes = object_map(data.get("new_state").and_then(|s| s.get("attributes")));
        }
        EventKind::ServiceCalled => {
            event.domain = data
                .get("domain")
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(service) = data.get("service") {
                event.attributes.insert("service".into(), service.clone());
            }
            if let Some(service_data) = data.get("service_data") {
                event
                    .attributes
                    .insert("service_data".into(), service_data.clone());
            }
        }
        EventKind::AutomationTriggered | EventKind::Unknown => {}
    }

    event
}

/// Normalize an inbound MQTT message
///
/// The joined topic becomes the entity id, the payload the new state. A
/// payload that is not valid JSON is kept as lossy UTF-8 text under a
/// `"raw"` key in both the state and the attributes.
pub fn normalize_mqtt(topic_parts: &[&str], payload: &[u8]) -> Event {
    let mut event = Event::new(next_mqtt_id(), EventSource::Mqtt, EventKind::StateChanged)
        .with_entity_id(topic_parts.join("/"));
    event.domain = Some("mqtt".to_string());

    match serde_json::from_slice::<Value>(payload) {
        Ok(decoded) => {
            event.attributes = object_map(Some(&decoded));
            event.raw = decoded.clone();
            event.new_state = Some(StateSnapshot::of(decoded));
        }
        Err(_) => {
            let text = String::from_utf8_lossy(payload).into_owned();
            let wrapped = serde_json::json!({ "raw": text });
            event.attributes = object_map(Some(&wrapped));
            event.raw = wrapped.clone();
            event.new_state = Some(StateSnapshot::of(wrapped));
        }
    }

    event
}

/// Extract a `{state, last_changed, last_updated}` snapshot from an HA
/// state object, or None when the field is absent or null
fn snapshot(value: &Value) -> Option<StateSnapshot> {
    if value.is_null() {
        return None;
    }
    Some(StateSnapshot {
        state: value.get("state").cloned().unwrap_or(Value::Null),
        last_changed: parse_instant(value.get("last_changed")),
        last_updated: parse_instant(value.get("last_updated")),
    })
}

/// Parse an ISO-8601 instant, returning None on any failure
fn parse_instant(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Clone a JSON object into a string-keyed map; anything else is empty
fn object_map(value: Option<&Value>) -> HashMap<String, Value> {
    value
        .and_then(Value::as_object)
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}
