//! MQTT broker session and ingress
//!
//! Opens a session to the configured broker, subscribes a static topic
//! filter list, and normalizes every inbound message onto the
//! `"mqtt:events"` topic. Reconnection is the client library's job; this
//! crate logs the up/down/terminating transitions and re-subscribes after
//! every reconnect.

use std::time::Duration;

use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use mirai_config::MqttConfig;
use mirai_core::normalize::normalize_mqtt;
use mirai_event_bus::{topics, SharedEventBus};

/// Delay before re-polling the event loop after a connection error
const RECOVERY_DELAY: Duration = Duration::from_secs(5);

/// Keep-alive interval for the broker session
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Default topic filter list
pub fn default_filters() -> Vec<String> {
    vec!["pomodoro/timer/+".to_string()]
}

/// Handle for publishing to the broker, cast-style
#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
}

impl MqttHandle {
    /// Publish a payload at QoS 0 without waiting
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        if let Err(e) = self
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload.into())
        {
            warn!(topic, error = %e, "dropping MQTT publish");
        }
    }
}

/// The MQTT connector
pub struct MqttConnector {
    config: MqttConfig,
    bus: SharedEventBus,
    filters: Vec<String>,
}

impl MqttConnector {
    /// Create a connector with the given topic filter list
    pub fn new(config: MqttConfig, bus: SharedEventBus, filters: Vec<String>) -> Self {
        Self {
            config,
            bus,
            filters,
        }
    }

    /// Start the session loop; returns the publish handle and the task
    pub fn start(self, mut shutdown: broadcast::Receiver<()>) -> (MqttHandle, JoinHandle<()>) {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(KEEP_ALIVE);

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let handle = MqttHandle {
            client: client.clone(),
        };

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    polled = event_loop.poll() => match polled {
                        Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                            info!(
                                host = %self.config.host,
                                port = self.config.port,
                                "MQTT connection up"
                            );
                            for filter in &self.filters {
                                if let Err(e) = client.subscribe(filter.as_str(), QoS::AtMostOnce).await {
                                    warn!(filter, error = %e, "MQTT subscribe failed");
                                }
                            }
                        }
                        Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                            debug!(topic = %publish.topic, "MQTT message received");
                            let parts: Vec<&str> = publish.topic.split('/').collect();
                            let event = normalize_mqtt(&parts, &publish.payload);
                            self.bus.publish(topics::MQTT_EVENTS, event);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "MQTT connection down");
                            sleep(RECOVERY_DELAY).await;
                        }
                    },
                    _ = shutdown.recv() => {
                        info!("MQTT connection terminating");
                        let _ = client.disconnect().await;
                        return;
                    }
                }
            }
        });

        (handle, task)
    }
}
