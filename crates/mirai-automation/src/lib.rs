//! Automation capability trait, registry, and per-automation actors
//!
//! An automation is a user-defined unit: an initial state, an event
//! callback, an optional message callback, and zero or more schedule
//! declarations. Each registered automation runs as an isolated actor
//! with its own mailbox and named timers; a fault in one automation never
//! affects the others.

mod actor;
mod context;
mod timers;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use mirai_core::Event;
use mirai_scheduler::ScheduleDecl;

pub use actor::{Actor, ActorDeps, ActorMessage};
pub use context::{build_service_call, AutomationContext, HelperError};
pub use timers::TimerTable;

/// State owned by one automation, opaque to the runtime
pub type UserState = serde_json::Value;

/// What a callback returns: the next state, or an error that leaves the
/// previous state in place
pub type CallbackResult = Result<UserState, CallbackError>;

/// An error reported by automation user code
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl From<String> for CallbackError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for CallbackError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<HelperError> for CallbackError {
    fn from(error: HelperError) -> Self {
        Self(error.to_string())
    }
}

/// A user-defined automation
///
/// Callbacks run sequentially inside the automation's actor; no two
/// callbacks of the same automation ever run concurrently. Different
/// automations run concurrently with each other.
#[async_trait]
pub trait Automation: Send + Sync + 'static {
    /// Unique name of the automation
    fn name(&self) -> &str;

    /// State the automation starts with (and restarts with after a crash)
    fn initial_state(&self) -> UserState {
        serde_json::json!({})
    }

    /// Schedule declarations, in declaration order
    fn schedules(&self) -> Vec<ScheduleDecl> {
        Vec::new()
    }

    /// Invoked for every event on the subscribed topics
    async fn handle_event(
        &self,
        event: &Event,
        state: UserState,
        cx: &AutomationContext,
    ) -> CallbackResult;

    /// Invoked for timer firings and scheduled messages
    async fn handle_message(
        &self,
        _message: &str,
        state: UserState,
        _cx: &AutomationContext,
    ) -> CallbackResult {
        Ok(state)
    }
}

/// The set of automations the runtime will supervise
///
/// Registration is explicit and happens in full before the supervisor
/// starts any actor; the set is stable for the process run.
pub struct AutomationRegistry {
    automations: Vec<Arc<dyn Automation>>,
}

impl AutomationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            automations: Vec::new(),
        }
    }

    /// Register an automation; a duplicate name keeps the first entry
    pub fn register(&mut self, automation: Arc<dyn Automation>) {
        let name = automation.name().to_string();
        if self.automations.iter().any(|a| a.name() == name) {
            warn!(%name, "duplicate automation name; keeping the first registration");
            return;
        }
        info!(%name, "registered automation");
        self.automations.push(automation);
    }

    /// All registered automations, in registration order
    pub fn all(&self) -> &[Arc<dyn Automation>] {
        &self.automations
    }

    /// Number of registered automations
    pub fn len(&self) -> usize {
        self.automations.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.automations.is_empty()
    }
}

impl Default for AutomationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
