//! Bundled automations
//!
//! Registered at startup; the registry pattern keeps discovery explicit,
//! so adding an automation means adding a `register` call here.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveTime;
use serde_json::json;
use tracing::debug;

use mirai_automation::{
    Automation, AutomationContext, AutomationRegistry, CallbackResult, UserState,
};
use mirai_core::Event;
use mirai_scheduler::ScheduleDecl;

/// Register every bundled automation
pub fn register_all(registry: &mut AutomationRegistry) {
    registry.register(Arc::new(PomodoroGlow));
    registry.register(Arc::new(EveningLights));
}

/// Reacts to pomodoro timer phases published over MQTT: lights the desk
/// lamp when a work session finishes and turns it back off after five
/// minutes (or immediately when the next session starts).
struct PomodoroGlow;

const GLOW_OFF: &str = "glow_off";

#[async_trait]
impl Automation for PomodoroGlow {
    fn name(&self) -> &str {
        "pomodoro_glow"
    }

    fn initial_state(&self) -> UserState {
        json!({"sessions": 0})
    }

    async fn handle_event(
        &self,
        event: &Event,
        state: UserState,
        cx: &AutomationContext,
    ) -> CallbackResult {
        if event.entity_id.as_deref() != Some("pomodoro/timer/state") {
            return Ok(state);
        }

        let phase = event
            .new_state
            .as_ref()
            .and_then(|s| s.state.get("phase"))
            .and_then(|p| p.as_str());

        match phase {
            Some("finished") => {
                let sessions = state["sessions"].as_i64().unwrap_or(0) + 1;
                cx.call_service(
                    "light.turn_on",
                    json!({"entity_id": "light.desk_lamp", "brightness": 200}),
                )?;
                cx.schedule_timer(GLOW_OFF, 5 * 60 * 1000);
                cx.set_global("pomodoro_sessions", json!(sessions)).await?;
                Ok(json!({"sessions": sessions}))
            }
            Some("started") => {
                cx.cancel_timer(GLOW_OFF);
                Ok(state)
            }
            _ => {
                debug!(?phase, "ignoring pomodoro phase");
                Ok(state)
            }
        }
    }

    async fn handle_message(
        &self,
        message: &str,
        state: UserState,
        cx: &AutomationContext,
    ) -> CallbackResult {
        if message == GLOW_OFF {
            cx.call_service("light.turn_off", json!({"entity_id": "light.desk_lamp"}))?;
        }
        Ok(state)
    }
}

/// Turns the porch light on shortly before sunset and off at night,
/// flagging night mode in the global store for other automations.
struct EveningLights;

#[async_trait]
impl Automation for EveningLights {
    fn name(&self) -> &str {
        "evening_lights"
    }

    fn schedules(&self) -> Vec<ScheduleDecl> {
        vec![
            ScheduleDecl::Sunset {
                offset_minutes: -15,
                message: "dusk".to_string(),
            },
            ScheduleDecl::Daily {
                at: NaiveTime::from_hms_opt(23, 30, 0).unwrap_or_default(),
                message: "night".to_string(),
            },
        ]
    }

    async fn handle_event(
        &self,
        _event: &Event,
        state: UserState,
        _cx: &AutomationContext,
    ) -> CallbackResult {
        Ok(state)
    }

    async fn handle_message(
        &self,
        message: &str,
        state: UserState,
        cx: &AutomationContext,
    ) -> CallbackResult {
        match message {
            "dusk" => {
                let already_on = cx
                    .get_state("light.porch")
                    .map(|s| s.is_state("on"))
                    .unwrap_or(false);
                if !already_on {
                    cx.call_service("light.turn_on", json!({"entity_id": "light.porch"}))?;
                }
                cx.set_global("night_mode", json!(false)).await?;
            }
            "night" => {
                cx.call_service("light.turn_off", json!({"entity_id": "light.porch"}))?;
                cx.set_global("night_mode", json!(true)).await?;
            }
            _ => {}
        }
        Ok(state)
    }
}
