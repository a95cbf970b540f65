//! Configuration sections shared by every hkz2m binary.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// MQTT broker connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client identifier presented to the broker.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Optional user name for broker authentication.
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password for broker authentication.
    #[serde(default)]
    pub password: Option<String>,

    /// Delay before the first reconnect attempt after a connection loss.
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    /// Delay between subsequent reconnect attempts.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "hkz2m".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_reconnect_initial() -> u64 {
    1000
}

fn default_reconnect_interval() -> u64 {
    5
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive(),
            username: None,
            password: None,
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_interval_secs: default_reconnect_interval(),
        }
    }
}

impl MqttConfig {
    /// Broker address in `tcp://host:port` form, for logging.
    pub fn server(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    /// Delay before the first reconnect attempt.
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    /// Steady delay between reconnect attempts.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    /// Validate the connection settings.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("mqtt.host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("mqtt.port must be > 0".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(Error::Config("mqtt.client_id must not be empty".to_string()));
        }
        if self.reconnect_initial_ms == 0 || self.reconnect_interval_secs == 0 {
            return Err(Error::Config(
                "mqtt reconnect intervals must be > 0".to_string(),
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::Config(
                "mqtt.password requires mqtt.username".to_string(),
            ));
        }
        Ok(())
    }
}

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// `logging` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive; `RUST_LOG` wins when set.
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_level() -> String {
    String::from("info")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::Text,
        }
    }
}

/// Read and deserialize a JSON5 file.
pub fn load_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    json5::from_str(&content).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

/// Deserialize JSON5 text.
pub fn parse_config<T: DeserializeOwned>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sections {
        #[serde(default)]
        mqtt: MqttConfig,
        #[serde(default)]
        logging: LoggingConfig,
    }

    #[test]
    fn test_parse_mqtt_config() {
        let json5 = r#"
        {
            mqtt: {
                host: "broker.local",
                port: 8883,
                username: "hk",
                password: "secret",
            },
            logging: {
                level: "debug",
            },
        }
        "#;

        let config: Sections = parse_config(json5).unwrap();

        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.username.as_deref(), Some("hk"));
        assert_eq!(config.mqtt.client_id, "hkz2m");
        assert_eq!(config.mqtt.server(), "tcp://broker.local:8883");
        assert_eq!(config.logging.level, "debug");
        assert!(config.mqtt.validate().is_ok());
    }

    #[test]
    fn test_default_config() {
        let config: Sections = parse_config("{}").unwrap();

        assert_eq!(config.mqtt, MqttConfig::default());
        assert_eq!(config.mqtt.reconnect_initial(), Duration::from_secs(1));
        assert_eq!(config.mqtt.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_json_logging_format() {
        let json5 = r#"{ logging: { level: "debug", format: "json" } }"#;
        let config: Sections = parse_config(json5).unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_mqtt_validation() {
        let mut config = MqttConfig::default();
        config.port = 0;
        assert!(config.validate().is_err());

        let mut config = MqttConfig::default();
        config.password = Some("orphan".to_string());
        assert!(config.validate().is_err());

        let mut config = MqttConfig::default();
        config.reconnect_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let result: Result<Sections> = load_config("/nonexistent/hkz2m.json5");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
