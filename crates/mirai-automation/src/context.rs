//! Helpers available to automation callbacks

use std::sync::Arc;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use mirai_core::EntityState;
use mirai_hass::CommandSender;
use mirai_state_cache::{SharedStateCache, StateError};
use mirai_store::{GlobalStore, StoreError};

use crate::actor::ActorMessage;
use crate::timers::TimerTable;

/// Service-data keys that address a target rather than parameterize it
const TARGET_KEYS: [&str; 3] = ["entity_id", "device_id", "area_id"];

/// Errors surfaced by context helpers
#[derive(Debug, Error)]
pub enum HelperError {
    #[error("invalid service identifier {0:?}; expected \"domain.service\"")]
    InvalidService(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Build a `call_service` frame from a `"domain.service"` id and data
///
/// Targeting keys (`entity_id`, `device_id`, `area_id`) move from the
/// data into a `target` object; everything else stays as `service_data`.
pub fn build_service_call(service: &str, data: Value) -> Result<Value, HelperError> {
    let (domain, name) = service
        .split_once('.')
        .filter(|(domain, name)| !domain.is_empty() && !name.is_empty())
        .ok_or_else(|| HelperError::InvalidService(service.to_string()))?;

    let (service_data, target) = match data {
        Value::Object(mut fields) => {
            let mut target = Map::new();
            for key in TARGET_KEYS {
                if let Some(value) = fields.remove(key) {
                    target.insert(key.to_string(), value);
                }
            }
            (Value::Object(fields), target)
        }
        Value::Null => (json!({}), Map::new()),
        other => (other, Map::new()),
    };

    let mut frame = json!({
        "type": "call_service",
        "domain": domain,
        "service": name,
        "service_data": service_data,
    });
    if !target.is_empty() {
        frame["target"] = Value::Object(target);
    }
    Ok(frame)
}

/// The runtime surface one automation sees from inside its callbacks
///
/// All helpers are non-blocking except the global-store mutations, which
/// return once the write is durable.
pub struct AutomationContext {
    automation: String,
    commands: CommandSender,
    cache: SharedStateCache,
    store: Arc<GlobalStore>,
    timers: TimerTable,
    mailbox: mpsc::Sender<ActorMessage>,
}

impl AutomationContext {
    pub(crate) fn new(
        automation: String,
        commands: CommandSender,
        cache: SharedStateCache,
        store: Arc<GlobalStore>,
        timers: TimerTable,
        mailbox: mpsc::Sender<ActorMessage>,
    ) -> Self {
        Self {
            automation,
            commands,
            cache,
            store,
            timers,
            mailbox,
        }
    }

    /// Name of the automation this context belongs to
    pub fn automation(&self) -> &str {
        &self.automation
    }

    /// Call a Home Assistant service, fire-and-forget
    ///
    /// `service` is `"domain.service"`. An invalid identifier is reported
    /// without sending anything; delivery of valid calls is best-effort
    /// (dropped with a warning while the connector is reconnecting).
    pub fn call_service(&self, service: &str, data: Value) -> Result<(), HelperError> {
        match build_service_call(service, data) {
            Ok(frame) => {
                self.commands.send_command(frame);
                Ok(())
            }
            Err(e) => {
                warn!(automation = %self.automation, service, error = %e, "rejecting service call");
                Err(e)
            }
        }
    }

    /// Cached state of an entity, if any
    pub fn get_state(&self, entity_id: &str) -> Option<EntityState> {
        self.cache.get(entity_id)
    }

    /// Cached state of an entity, or an error when unknown
    pub fn require_state(&self, entity_id: &str) -> Result<EntityState, HelperError> {
        Ok(self.cache.require(entity_id)?)
    }

    /// Read a global value
    pub fn get_global(&self, key: &str) -> Option<Value> {
        self.store.get(key)
    }

    /// Read a global value with a default
    pub fn get_global_or(&self, key: &str, default: Value) -> Value {
        self.store.get_or(key, default)
    }

    /// Write a global value durably
    pub async fn set_global(&self, key: &str, value: Value) -> Result<(), HelperError> {
        Ok(self.store.set(key, value).await?)
    }

    /// Delete a global value durably
    pub async fn delete_global(&self, key: &str) -> Result<(), HelperError> {
        Ok(self.store.delete(key).await?)
    }

    /// Arm (or replace) a named timer on this automation
    ///
    /// When it fires, `handle_message` receives the timer name.
    pub fn schedule_timer(&self, name: &str, delay_ms: u64) {
        self.timers.arm(name, delay_ms, self.mailbox.clone());
    }

    /// Cancel a named timer; idempotent
    pub fn cancel_timer(&self, name: &str) {
        self.timers.cancel(name);
    }
}
