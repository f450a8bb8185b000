//! Actor runtime: one mailbox-driven task per automation

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use mirai_core::Event;
use mirai_event_bus::{topics, SharedEventBus};
use mirai_hass::CommandSender;
use mirai_state_cache::SharedStateCache;
use mirai_store::GlobalStore;

use crate::context::AutomationContext;
use crate::timers::TimerTable;
use crate::{Automation, UserState};

/// Mailbox depth for timer and scheduled messages
const MAILBOX_DEPTH: usize = 256;

/// Messages delivered to an actor's own mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorMessage {
    /// A named timer fired
    TimerFired(String),
}

/// Shared runtime services handed to every actor
#[derive(Clone)]
pub struct ActorDeps {
    pub bus: SharedEventBus,
    pub commands: CommandSender,
    pub cache: SharedStateCache,
    pub store: Arc<GlobalStore>,
}

/// One automation's actor
///
/// The actor owns the mailbox receivers across incarnations: when a crash
/// escapes the callback guards and the supervisor respawns the actor,
/// armed schedules keep delivering to the same channels.
pub struct Actor {
    automation: Arc<dyn Automation>,
    cx: AutomationContext,
    bus: SharedEventBus,
    timers: TimerTable,
    mailbox_rx: Mutex<mpsc::Receiver<ActorMessage>>,
    sched_tx: mpsc::Sender<String>,
    sched_rx: Mutex<mpsc::Receiver<String>>,
    shutdown: broadcast::Sender<()>,
}

impl Actor {
    /// Wire up an actor for an automation; nothing runs until
    /// [`Actor::spawn`]
    pub fn new(
        automation: Arc<dyn Automation>,
        deps: &ActorDeps,
        shutdown: broadcast::Sender<()>,
    ) -> Arc<Self> {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX_DEPTH);
        let (sched_tx, sched_rx) = mpsc::channel(MAILBOX_DEPTH);
        let timers = TimerTable::default();

        let cx = AutomationContext::new(
            automation.name().to_string(),
            deps.commands.clone(),
            deps.cache.clone(),
            deps.store.clone(),
            timers.clone(),
            mailbox_tx,
        );

        Arc::new(Self {
            automation,
            cx,
            bus: deps.bus.clone(),
            timers,
            mailbox_rx: Mutex::new(mailbox_rx),
            sched_tx,
            sched_rx: Mutex::new(sched_rx),
            shutdown,
        })
    }

    /// Name of the underlying automation
    pub fn name(&self) -> &str {
        self.automation.name()
    }

    /// Sender the scheduler uses to deliver scheduled messages
    pub fn schedule_sender(&self) -> mpsc::Sender<String> {
        self.sched_tx.clone()
    }

    /// Start one incarnation of the actor
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let actor = self.clone();
        tokio::spawn(async move { actor.run().await })
    }

    async fn run(&self) {
        // Fresh incarnation: timers armed by a crashed run are void
        self.timers.clear();

        let mut state = self.guarded_initial_state();
        let mut ha_rx = self.bus.subscribe(topics::HA_EVENTS);
        let mut mqtt_rx = self.bus.subscribe(topics::MQTT_EVENTS);
        let mut shutdown = self.shutdown.subscribe();
        let mut mailbox = self.mailbox_rx.lock().await;
        let mut scheduled = self.sched_rx.lock().await;

        info!(automation = %self.name(), "automation started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                Some(message) = mailbox.recv() => match message {
                    ActorMessage::TimerFired(name) => {
                        // The timer leaves the table before its callback runs
                        self.timers.take(&name);
                        state = self.invoke_message(&name, state).await;
                    }
                },
                Some(message) = scheduled.recv() => {
                    state = self.invoke_message(&message, state).await;
                }
                event = ha_rx.recv() => match event {
                    Ok(event) => state = self.invoke_event(&event, state).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(automation = %self.name(), topic = topics::HA_EVENTS, missed = n, "mailbox lagged; oldest events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = mqtt_rx.recv() => match event {
                    Ok(event) => state = self.invoke_event(&event, state).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(automation = %self.name(), topic = topics::MQTT_EVENTS, missed = n, "mailbox lagged; oldest events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        debug!(automation = %self.name(), "automation stopped");
    }

    /// Run `handle_event`, keeping the previous state on error or panic
    async fn invoke_event(&self, event: &Event, state: UserState) -> UserState {
        let previous = state.clone();
        let call = AssertUnwindSafe(self.automation.handle_event(event, state, &self.cx));

        match call.catch_unwind().await {
            Ok(Ok(next)) => next,
            Ok(Err(e)) => {
                warn!(
                    automation = %self.name(),
                    event_id = %event.id,
                    error = %e,
                    "handle_event failed; keeping previous state"
                );
                previous
            }
            Err(_) => {
                error!(
                    automation = %self.name(),
                    event_id = %event.id,
                    "handle_event panicked; keeping previous state"
                );
                previous
            }
        }
    }

    /// Run `handle_message`, keeping the previous state on error or panic
    async fn invoke_message(&self, message: &str, state: UserState) -> UserState {
        let previous = state.clone();
        let call = AssertUnwindSafe(self.automation.handle_message(message, state, &self.cx));

        match call.catch_unwind().await {
            Ok(Ok(next)) => next,
            Ok(Err(e)) => {
                warn!(
                    automation = %self.name(),
                    message,
                    error = %e,
                    "handle_message failed; keeping previous state"
                );
                previous
            }
            Err(_) => {
                error!(
                    automation = %self.name(),
                    message,
                    "handle_message panicked; keeping previous state"
                );
                previous
            }
        }
    }

    fn guarded_initial_state(&self) -> UserState {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.automation.initial_state())) {
            Ok(state) => state,
            Err(_) => {
                error!(automation = %self.name(), "initial_state panicked; starting empty");
                serde_json::json!({})
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Automation, CallbackResult};
    use async_trait::async_trait;
    use mirai_config::HaConfig;
    use mirai_event_bus::EventBus;
    use mirai_hass::HaConnector;
    use mirai_state_cache::StateCache;
    use mirai_core::{EventKind, EventSource};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Probe {
        tx: mpsc::UnboundedSender<(String, i64)>,
    }

    #[async_trait]
    impl Automation for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        fn initial_state(&self) -> UserState {
            json!({"count": 0})
        }

        async fn handle_event(
            &self,
            event: &Event,
            state: UserState,
            _cx: &AutomationContext,
        ) -> CallbackResult {
            match event.entity_id.as_deref() {
                Some("panic.now") => panic!("injected crash"),
                Some("fail.now") => Err("injected failure".into()),
                _ => {
                    let count = state["count"].as_i64().unwrap_or(0) + 1;
                    let _ = self.tx.send((event.id.clone(), count));
                    Ok(json!({"count": count}))
                }
            }
        }

        async fn handle_message(
            &self,
            message: &str,
            state: UserState,
            _cx: &AutomationContext,
        ) -> CallbackResult {
            let _ = self.tx.send((format!("msg:{message}"), -1));
            Ok(state)
        }
    }

    async fn make_deps(dir: &TempDir, bus: SharedEventBus) -> ActorDeps {
        let store = Arc::new(GlobalStore::open(dir.path()).await.unwrap());
        let config = HaConfig {
            host: "localhost".to_string(),
            port: 8123,
            token: "T".to_string(),
        };
        let (_connector, commands) = HaConnector::new(config, bus.clone());
        ActorDeps {
            bus,
            commands,
            cache: Arc::new(StateCache::new()),
            store,
        }
    }

    fn event(id: &str, entity_id: &str) -> Event {
        Event::new(id.to_string(), EventSource::HomeAssistant, EventKind::StateChanged)
            .with_entity_id(entity_id)
    }

    async fn wait_for_subscribers(bus: &EventBus, count: usize) {
        for _ in 0..100 {
            if bus.subscriber_count(topics::HA_EVENTS) >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("actor never subscribed");
    }

    #[tokio::test]
    async fn test_events_processed_in_order_and_faults_keep_state() {
        let dir = TempDir::new().unwrap();
        let bus: SharedEventBus = Arc::new(EventBus::new());
        let deps = make_deps(&dir, bus.clone()).await;
        let (shutdown, _) = broadcast::channel(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let actor = Actor::new(Arc::new(Probe { tx }), &deps, shutdown.clone());
        let handle = actor.spawn();
        wait_for_subscribers(&bus, 1).await;

        bus.publish(topics::HA_EVENTS, event("ha_1", "light.a"));
        bus.publish(topics::HA_EVENTS, event("ha_2", "panic.now"));
        bus.publish(topics::HA_EVENTS, event("ha_3", "fail.now"));
        bus.publish(topics::HA_EVENTS, event("ha_4", "light.b"));

        // Faulting callbacks left the counter untouched
        assert_eq!(rx.recv().await.unwrap(), ("ha_1".to_string(), 1));
        assert_eq!(rx.recv().await.unwrap(), ("ha_4".to_string(), 2));

        let _ = shutdown.send(());
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_scheduled_messages_reach_handle_message() {
        let dir = TempDir::new().unwrap();
        let bus: SharedEventBus = Arc::new(EventBus::new());
        let deps = make_deps(&dir, bus.clone()).await;
        let (shutdown, _) = broadcast::channel(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let actor = Actor::new(Arc::new(Probe { tx }), &deps, shutdown.clone());
        let handle = actor.spawn();
        wait_for_subscribers(&bus, 1).await;

        actor.schedule_sender().send("wake_up".to_string()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), ("msg:wake_up".to_string(), -1));

        let _ = shutdown.send(());
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_mqtt_topic_also_delivered() {
        let dir = TempDir::new().unwrap();
        let bus: SharedEventBus = Arc::new(EventBus::new());
        let deps = make_deps(&dir, bus.clone()).await;
        let (shutdown, _) = broadcast::channel(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let actor = Actor::new(Arc::new(Probe { tx }), &deps, shutdown.clone());
        let handle = actor.spawn();
        wait_for_subscribers(&bus, 1).await;

        let mut mqtt_event =
            Event::new("mqtt_1".to_string(), EventSource::Mqtt, EventKind::StateChanged)
                .with_entity_id("pomodoro/timer/state");
        mqtt_event.domain = Some("mqtt".to_string());
        bus.publish(topics::MQTT_EVENTS, mqtt_event);

        assert_eq!(rx.recv().await.unwrap(), ("mqtt_1".to_string(), 1));

        let _ = shutdown.send(());
        let _ = handle.await;
    }
}
