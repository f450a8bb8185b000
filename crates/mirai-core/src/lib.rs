//! Core types for the mirai runtime
//!
//! This crate provides the canonical event record shared by every connector
//! and automation, the cached entity-state value, and the normalizers that
//! turn raw Home Assistant and MQTT payloads into events.

mod entity_state;
mod event;
pub mod normalize;

pub use entity_state::EntityState;
pub use event::{Event, EventKind, EventSource, StateSnapshot};

/// Bus topic carrying normalized Home Assistant events
pub const TOPIC_HA_EVENTS: &str = "ha:events";

/// Bus topic carrying normalized MQTT events
pub const TOPIC_MQTT_EVENTS: &str = "mqtt:events";
