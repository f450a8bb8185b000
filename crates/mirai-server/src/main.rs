//! mirai — home-automation runtime
//!
//! Long-lived process bridging a Home Assistant instance and an MQTT
//! broker onto a fleet of automation actors. Bring-up order matters: the
//! store and cache come first, then the connectors, then the automations
//! and their schedules; shutdown walks the same order in reverse.

mod automations;
mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mirai_automation::{ActorDeps, AutomationRegistry};
use mirai_config::RuntimeConfig;
use mirai_event_bus::{EventBus, SharedEventBus};
use mirai_hass::HaConnector;
use mirai_mqtt::{default_filters, MqttConnector};
use mirai_scheduler::{ArmRequest, Scheduler};
use mirai_state_cache::{start_writer, SharedStateCache, StateCache};
use mirai_store::GlobalStore;

/// Grace period for tasks to finish after the shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting mirai");

    let config = RuntimeConfig::from_env().context("configuration error")?;

    let store = Arc::new(
        GlobalStore::open(&config.data_dir)
            .await
            .context("failed to open the global state store")?,
    );

    let bus: SharedEventBus = Arc::new(EventBus::new());
    let (shutdown_tx, _) = broadcast::channel(8);

    let cache: SharedStateCache = Arc::new(StateCache::new());
    let cache_task = start_writer(
        cache.clone(),
        bus.clone(),
        config.ha.clone(),
        shutdown_tx.subscribe(),
    );

    let (connector, commands) = HaConnector::new(config.ha.clone(), bus.clone());
    let ha_task = connector.start(shutdown_tx.subscribe());

    let mqtt = MqttConnector::new(config.mqtt.clone(), bus.clone(), default_filters());
    let (_mqtt_handle, mqtt_task) = mqtt.start(shutdown_tx.subscribe());

    let mut registry = AutomationRegistry::new();
    automations::register_all(&mut registry);
    info!(count = registry.len(), "automations registered");

    let deps = ActorDeps {
        bus,
        commands,
        cache,
        store: store.clone(),
    };
    let actors = supervisor::build_actors(&registry, &deps, shutdown_tx.clone());

    let scheduler = Scheduler::new(&config.timezone, config.location);
    info!(timezone = %scheduler.timezone(), "scheduler timezone resolved");

    let arm_requests: Vec<ArmRequest> = registry
        .all()
        .iter()
        .zip(actors.iter())
        .map(|(automation, actor)| ArmRequest {
            automation: automation.name().to_string(),
            decls: automation.schedules(),
            mailbox: actor.schedule_sender(),
        })
        .collect();
    let schedule_tasks = scheduler.start(arm_requests, &shutdown_tx);

    let actor_tasks = supervisor::supervise(actors, shutdown_tx.clone());

    info!("mirai initialized");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(());

    for task in actor_tasks
        .into_iter()
        .chain(schedule_tasks)
        .chain([cache_task, ha_task, mqtt_task])
    {
        let _ = timeout(SHUTDOWN_GRACE, task).await;
    }

    store
        .close()
        .await
        .context("failed to close the global state store")?;

    info!("mirai stopped");
    Ok(())
}
