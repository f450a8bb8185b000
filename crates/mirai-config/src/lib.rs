//! Runtime configuration from environment variables
//!
//! All knobs of the runtime come from the environment; there is no config
//! file. A missing `HA_TOKEN` is the only fatal condition, everything else
//! has a default or degrades with a warning.

mod error;

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub use error::{ConfigError, ConfigResult};

/// Home Assistant connection settings
#[derive(Debug, Clone)]
pub struct HaConfig {
    /// Hostname of the HA instance
    pub host: String,
    /// Port of the HA instance
    pub port: u16,
    /// Long-lived access token
    pub token: String,
}

impl HaConfig {
    /// WebSocket endpoint of the HA control channel
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/api/websocket", self.host, self.port)
    }

    /// REST endpoint listing all entity states
    pub fn states_url(&self) -> String {
        format!("http://{}:{}/api/states", self.host, self.port)
    }
}

/// MQTT broker connection settings
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker hostname
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Client identifier presented to the broker
    pub client_id: String,
}

/// Geographic location for solar schedules
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
}

/// The complete runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub ha: HaConfig,
    pub mqtt: MqttConfig,
    /// IANA timezone name; resolution (and the UTC fallback on a bad
    /// name) happens in the scheduler
    pub timezone: String,
    /// Location for sunrise/sunset schedules, when configured
    pub location: Option<Location>,
    /// Directory holding the persistent global state file
    pub data_dir: PathBuf,
}

impl RuntimeConfig {
    /// Read the full configuration from the process environment
    ///
    /// Fails only when `HA_TOKEN` is missing or a set variable cannot be
    /// parsed; unset optional variables take their documented defaults.
    pub fn from_env() -> ConfigResult<Self> {
        let ha = HaConfig {
            host: env_or("HA_HOST", "homeassistant.local"),
            port: env_parsed("HA_PORT", 8123)?,
            token: env_required("HA_TOKEN")?,
        };

        let mqtt = MqttConfig {
            host: env_or("MQTT_HOST", "localhost"),
            port: env_parsed("MQTT_PORT", 1883)?,
            client_id: env_or("MQTT_CLIENT_ID", "mirai"),
        };

        let location = match (
            env_opt_parsed::<f64>("MIRAI_LATITUDE")?,
            env_opt_parsed::<f64>("MIRAI_LONGITUDE")?,
        ) {
            (Some(latitude), Some(longitude)) => Some(Location {
                latitude,
                longitude,
            }),
            (None, None) => None,
            _ => {
                warn!("only one of MIRAI_LATITUDE/MIRAI_LONGITUDE is set; ignoring location");
                None
            }
        };

        Ok(Self {
            ha,
            mqtt,
            timezone: env_or("MIRAI_TIMEZONE", "Europe/Prague"),
            location,
            data_dir: PathBuf::from(env_or("MIRAI_DATA_DIR", "./data")),
        })
    }
}

fn env_or(var: &'static str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn env_required(var: &'static str) -> ConfigResult<String> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingVar { var })
}

fn env_parsed<T: FromStr>(var: &'static str, default: T) -> ConfigResult<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidVar {
            var,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_opt_parsed<T: FromStr>(var: &'static str) -> ConfigResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidVar {
                var,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment mutation is process-global; serialize these tests.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for var in [
            "HA_HOST",
            "HA_PORT",
            "HA_TOKEN",
            "MQTT_HOST",
            "MQTT_PORT",
            "MQTT_CLIENT_ID",
            "MIRAI_TIMEZONE",
            "MIRAI_LATITUDE",
            "MIRAI_LONGITUDE",
            "MIRAI_DATA_DIR",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_missing_token_fails_fast() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();

        let err = RuntimeConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar { var: "HA_TOKEN" }));
    }

    #[test]
    fn test_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("HA_TOKEN", "secret");

        let config = RuntimeConfig::from_env().unwrap();

        assert_eq!(config.ha.host, "homeassistant.local");
        assert_eq!(config.ha.port, 8123);
        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.client_id, "mirai");
        assert_eq!(config.timezone, "Europe/Prague");
        assert_eq!(config.location, None);
        assert_eq!(
            config.ha.ws_url(),
            "ws://homeassistant.local:8123/api/websocket"
        );
        assert_eq!(
            config.ha.states_url(),
            "http://homeassistant.local:8123/api/states"
        );

        clear_all();
    }

    #[test]
    fn test_location_and_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("HA_TOKEN", "secret");
        std::env::set_var("HA_HOST", "ha.lan");
        std::env::set_var("HA_PORT", "18123");
        std::env::set_var("MIRAI_LATITUDE", "50.08");
        std::env::set_var("MIRAI_LONGITUDE", "14.43");

        let config = RuntimeConfig::from_env().unwrap();

        assert_eq!(config.ha.host, "ha.lan");
        assert_eq!(config.ha.port, 18123);
        let location = config.location.unwrap();
        assert_eq!(location.latitude, 50.08);
        assert_eq!(location.longitude, 14.43);

        clear_all();
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("HA_TOKEN", "secret");
        std::env::set_var("HA_PORT", "not-a-port");

        let err = RuntimeConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { var: "HA_PORT", .. }));

        clear_all();
    }
}
