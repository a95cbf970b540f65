//! HomeKit bridge configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use hkz2m_bridge_framework::{BridgeConfig, BridgeError, LoggingConfig, MqttConfig};
use hkz2m_common::topic::DEFAULT_BASE_TOPIC;

use crate::accessory::{AccessoryInfo, BRIDGE_AID};

/// Complete HomeKit bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HomekitBridgeConfig {
    /// MQTT broker connection settings.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Zigbee2MQTT settings.
    #[serde(default)]
    pub zigbee2mqtt: Zigbee2MqttConfig,

    /// Accessory server settings.
    #[serde(default)]
    pub homekit: HomekitConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Zigbee2MQTT settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zigbee2MqttConfig {
    /// Base topic Zigbee2MQTT publishes under.
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
}

impl Default for Zigbee2MqttConfig {
    fn default() -> Self {
        Self {
            base_topic: default_base_topic(),
        }
    }
}

fn default_base_topic() -> String {
    DEFAULT_BASE_TOPIC.to_string()
}

/// Accessory server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomekitConfig {
    /// Eight digit setup code.
    #[serde(default = "default_pin")]
    pub pin: String,

    /// Directory for persistent pairing data.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// Address the accessory server listens on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Bridge accessory name.
    #[serde(default = "default_name")]
    pub name: String,

    /// Bridge accessory model.
    #[serde(default = "default_model")]
    pub model: String,

    /// Bridge accessory manufacturer.
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,
}

impl Default for HomekitConfig {
    fn default() -> Self {
        Self {
            pin: default_pin(),
            storage_path: default_storage_path(),
            listen: default_listen(),
            name: default_name(),
            model: default_model(),
            manufacturer: default_manufacturer(),
        }
    }
}

impl HomekitConfig {
    /// Identity of the bridge accessory.
    pub fn bridge_accessory(&self, version: &str) -> AccessoryInfo {
        AccessoryInfo {
            name: self.name.clone(),
            model: self.model.clone(),
            manufacturer: self.manufacturer.clone(),
            serial_number: self.model.clone(),
            firmware_revision: version.to_string(),
            id: BRIDGE_AID,
        }
    }
}

fn default_pin() -> String {
    "11223399".to_string()
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./.db")
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 51826))
}

fn default_name() -> String {
    "Casa Terraza Zigbee".to_string()
}

fn default_model() -> String {
    "hkz2m".to_string()
}

fn default_manufacturer() -> String {
    "Jens-Uwe Mager".to_string()
}

impl HomekitBridgeConfig {
    /// Validate the HomeKit specific settings.
    pub fn validate_config(&self) -> anyhow::Result<()> {
        let pin = &self.homekit.pin;
        if pin.len() != 8 || !pin.chars().all(|c| c.is_ascii_digit()) {
            anyhow::bail!("homekit.pin must be exactly 8 digits, got '{}'", pin);
        }

        if self.homekit.name.trim().is_empty() {
            anyhow::bail!("homekit.name must not be empty");
        }

        if self.homekit.storage_path.as_os_str().is_empty() {
            anyhow::bail!("homekit.storage_path must not be empty");
        }

        Ok(())
    }
}

impl BridgeConfig for HomekitBridgeConfig {
    fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn base_topic(&self) -> &str {
        &self.zigbee2mqtt.base_topic
    }

    fn validate(&self) -> hkz2m_bridge_framework::Result<()> {
        self.validate_common()?;
        self.validate_config()
            .map_err(|e| BridgeError::validation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HomekitBridgeConfig::parse("{}").unwrap();
        assert_eq!(config.mqtt.host, "127.0.0.1");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.zigbee2mqtt.base_topic, "zigbee2mqtt");
        assert_eq!(config.homekit.pin, "11223399");
        assert_eq!(config.homekit.storage_path, PathBuf::from("./.db"));
        assert_eq!(config.homekit.listen.port(), 51826);
        assert_eq!(config.homekit.name, "Casa Terraza Zigbee");
        assert_eq!(config.homekit.model, "hkz2m");
        assert_eq!(config.homekit.manufacturer, "Jens-Uwe Mager");
    }

    #[test]
    fn test_parse_json5() {
        let config = HomekitBridgeConfig::parse(
            r#"{
                // broker on the home server
                mqtt: { host: "nas.local", port: 1884, username: "hk" },
                zigbee2mqtt: { base_topic: "z2m/" },
                homekit: { pin: "87654321", listen: "127.0.0.1:0" },
                logging: { level: "debug" },
            }"#,
        )
        .unwrap();

        assert_eq!(config.mqtt.host, "nas.local");
        assert_eq!(config.mqtt.username.as_deref(), Some("hk"));
        assert_eq!(config.homekit.pin, "87654321");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.topics().unwrap().bridge_devices(), "z2m/bridge/devices");
    }

    #[test]
    fn test_invalid_pin() {
        for pin in ["1234", "1234567a", "123456789"] {
            let content = format!(r#"{{ homekit: {{ pin: "{}" }} }}"#, pin);
            let result = HomekitBridgeConfig::parse(&content);
            assert!(
                matches!(result, Err(BridgeError::ConfigValidation(_))),
                "pin {pin} should be rejected"
            );
        }
    }

    #[test]
    fn test_bridge_accessory() {
        let info = HomekitConfig::default().bridge_accessory("0.1.0");
        assert_eq!(info.name, "Casa Terraza Zigbee");
        assert_eq!(info.manufacturer, "Jens-Uwe Mager");
        assert_eq!(info.firmware_revision, "0.1.0");
        assert_eq!(info.id, BRIDGE_AID);
    }

    #[test]
    fn test_invalid_base_topic() {
        let result = HomekitBridgeConfig::parse(r#"{ zigbee2mqtt: { base_topic: "z2m/#" } }"#);
        assert!(matches!(result, Err(BridgeError::ConfigValidation(_))));
    }
}
