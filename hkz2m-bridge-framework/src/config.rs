//! The configuration contract every bridge binary implements.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::{BridgeError, Result};
use crate::{LoggingConfig, MqttConfig, TopicBuilder};

/// A bridge's configuration file.
///
/// Implementors expose the shared sections; loading, JSON5 parsing and the
/// common validation come for free.
///
/// ```ignore
/// #[derive(Debug, Deserialize)]
/// pub struct LampBridgeConfig {
///     pub mqtt: MqttConfig,
///     pub logging: LoggingConfig,
///     pub base_topic: String,
/// }
///
/// impl BridgeConfig for LampBridgeConfig {
///     fn mqtt(&self) -> &MqttConfig { &self.mqtt }
///     fn logging(&self) -> &LoggingConfig { &self.logging }
///     fn base_topic(&self) -> &str { &self.base_topic }
/// }
/// ```
pub trait BridgeConfig: Sized + DeserializeOwned {
    fn mqtt(&self) -> &MqttConfig;

    fn logging(&self) -> &LoggingConfig;

    /// Zigbee2MQTT base topic, without trailing slash.
    fn base_topic(&self) -> &str;

    /// Topic builder for the configured base topic.
    fn topics(&self) -> Result<TopicBuilder> {
        TopicBuilder::new(self.base_topic()).map_err(|e| BridgeError::validation(e.to_string()))
    }

    /// Checked by [`parse`](Self::parse). Overrides should still call
    /// [`validate_common`](Self::validate_common).
    fn validate(&self) -> Result<()> {
        self.validate_common()
    }

    /// Broker settings and a usable base topic.
    fn validate_common(&self) -> Result<()> {
        self.mqtt()
            .validate()
            .map_err(|e| BridgeError::validation(e.to_string()))?;
        self.topics()?;
        Ok(())
    }

    /// Read, parse and validate a JSON5 file.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BridgeError::ConfigNotFound {
                    path: path.display().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(&content)
    }

    /// Parse and validate JSON5 text.
    fn parse(content: &str) -> Result<Self> {
        let config: Self = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}
