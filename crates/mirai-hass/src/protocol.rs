//! Frame construction and classification for the HA WebSocket protocol

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};

/// Allocator for outbound message ids
///
/// Ids start at 1 and are strictly increasing within one connection. The
/// connector owns the allocator; callers never pick ids themselves.
#[derive(Debug)]
pub struct MessageIdAllocator(AtomicU64);

impl MessageIdAllocator {
    /// Create a fresh allocator for a new connection
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Take the next id
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MessageIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The auth frame; carries no id per the HA protocol
pub fn auth_frame(token: &str) -> Value {
    json!({
        "type": "auth",
        "access_token": token,
    })
}

/// The event subscription frame
pub fn subscribe_events_frame(id: u64, event_type: &str) -> Value {
    json!({
        "id": id,
        "type": "subscribe_events",
        "event_type": event_type,
    })
}

/// Inject the connector-assigned id into an outbound command payload
pub fn with_id(mut payload: Value, id: u64) -> Value {
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("id".to_string(), json!(id));
    }
    payload
}

/// A classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    AuthRequired,
    AuthOk,
    AuthInvalid { message: String },
    /// An event frame; the normalizer wants the whole frame
    Event,
    Result {
        id: Option<u64>,
        success: bool,
        error: Option<Value>,
    },
    Other { message_type: String },
}

/// Classify an inbound frame by its `type` field
pub fn classify(frame: &Value) -> ServerMessage {
    match frame.get("type").and_then(Value::as_str) {
        Some("auth_required") => ServerMessage::AuthRequired,
        Some("auth_ok") => ServerMessage::AuthOk,
        Some("auth_invalid") => ServerMessage::AuthInvalid {
            message: frame
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("authentication rejected")
                .to_string(),
        },
        Some("event") => ServerMessage::Event,
        Some("result") => ServerMessage::Result {
            id: frame.get("id").and_then(Value::as_u64),
            success: frame
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            error: frame.get("error").cloned(),
        },
        other => ServerMessage::Other {
            message_type: other.unwrap_or("<missing>").to_string(),
        },
    }
}
