//! Zigbee2MQTT topic builders and parsers.
//!
//! Topics follow the layout used by Zigbee2MQTT:
//!
//! ```text
//! <base>/bridge/state            bridge availability ("online"/"offline")
//! <base>/bridge/info             bridge and network configuration
//! <base>/bridge/devices          full device inventory
//! <base>/<friendly_name>         device state
//! <base>/<friendly_name>/set/<a> device command for attribute <a>
//! ```
//!
//! Friendly names may themselves contain `/`.

use crate::error::{Error, Result};

/// Default Zigbee2MQTT base topic.
pub const DEFAULT_BASE_TOPIC: &str = "zigbee2mqtt";

/// Builder for Zigbee2MQTT topics under a base topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    base: String,
}

impl Default for TopicBuilder {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_TOPIC.to_string(),
        }
    }
}

impl TopicBuilder {
    /// Create a builder for a base topic.
    ///
    /// Trailing slashes are stripped; wildcards are rejected.
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let base = base.into();
        let base = base.trim_end_matches('/').to_string();

        if base.is_empty() {
            return Err(Error::Topic("base topic must not be empty".to_string()));
        }
        if base.contains(['+', '#']) {
            return Err(Error::Topic(format!(
                "base topic '{}' must not contain wildcards",
                base
            )));
        }

        Ok(Self { base })
    }

    /// The base topic.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// `<base>/bridge/state`
    pub fn bridge_state(&self) -> String {
        format!("{}/bridge/state", self.base)
    }

    /// `<base>/bridge/info`
    pub fn bridge_info(&self) -> String {
        format!("{}/bridge/info", self.base)
    }

    /// `<base>/bridge/devices`
    pub fn bridge_devices(&self) -> String {
        format!("{}/bridge/devices", self.base)
    }

    /// State topic of a device.
    ///
    /// # Example
    /// ```
    /// use hkz2m_common::topic::TopicBuilder;
    ///
    /// let topics = TopicBuilder::default();
    /// assert_eq!(topics.device("kitchen"), "zigbee2mqtt/kitchen");
    /// ```
    pub fn device(&self, friendly_name: &str) -> String {
        format!("{}/{}", self.base, friendly_name)
    }

    /// Command topic for one attribute of a device.
    ///
    /// # Example
    /// ```
    /// use hkz2m_common::topic::TopicBuilder;
    ///
    /// let topics = TopicBuilder::default();
    /// assert_eq!(
    ///     topics.device_set("kitchen", "brightness"),
    ///     "zigbee2mqtt/kitchen/set/brightness"
    /// );
    /// ```
    pub fn device_set(&self, friendly_name: &str, attribute: &str) -> String {
        format!("{}/{}/set/{}", self.base, friendly_name, attribute)
    }

    /// Classify a topic relative to this base.
    ///
    /// Returns `None` for topics outside the base.
    pub fn parse(&self, topic: &str) -> Option<ParsedTopic> {
        let rest = topic.strip_prefix(&self.base)?.strip_prefix('/')?;
        if rest.is_empty() {
            return None;
        }

        if let Some(bridge) = rest.strip_prefix("bridge/") {
            return Some(match bridge {
                "state" => ParsedTopic::BridgeState,
                "info" => ParsedTopic::BridgeInfo,
                "devices" => ParsedTopic::BridgeDevices,
                other => ParsedTopic::Bridge(other.to_string()),
            });
        }

        if let Some((device, attribute)) = rest.rsplit_once("/set/") {
            if !device.is_empty() && !attribute.is_empty() && !attribute.contains('/') {
                return Some(ParsedTopic::DeviceSet {
                    device: device.to_string(),
                    attribute: attribute.to_string(),
                });
            }
        }

        Some(ParsedTopic::Device(rest.to_string()))
    }
}

/// A topic classified relative to the base topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTopic {
    /// `bridge/state`
    BridgeState,
    /// `bridge/info`
    BridgeInfo,
    /// `bridge/devices`
    BridgeDevices,
    /// Any other `bridge/...` topic.
    Bridge(String),
    /// Device state topic carrying the friendly name.
    Device(String),
    /// Device command topic.
    DeviceSet { device: String, attribute: String },
}
