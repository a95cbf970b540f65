//! Zigbee2MQTT payload model.
//!
//! Only the fields the bridge acts on are decoded; unknown fields are
//! ignored so newer Zigbee2MQTT releases keep working.

use serde::{Deserialize, Deserializer};

/// Access bits of an exposed feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct AccessMask(pub u8);

impl AccessMask {
    /// The feature value is published in the device state.
    pub const PUBLISHED: u8 = 1 << 0;
    /// The feature can be set through `/set`.
    pub const SET: u8 = 1 << 1;
    /// The feature can be read through `/get`.
    pub const GET: u8 = 1 << 2;

    pub fn is_published(self) -> bool {
        self.0 & Self::PUBLISHED != 0
    }

    pub fn is_settable(self) -> bool {
        self.0 & Self::SET != 0
    }

    pub fn is_gettable(self) -> bool {
        self.0 & Self::GET != 0
    }
}

impl std::fmt::Display for AccessMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (Self::PUBLISHED, "Published"),
            (Self::SET, "Set"),
            (Self::GET, "Get"),
        ];
        let flags: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "0b{:03b} [{}]", self.0, flags.join("|"))
    }
}

/// One node of a device's capability description tree.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub access: AccessMask,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub property: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub value_min: Option<f64>,
    #[serde(default)]
    pub value_max: Option<f64>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl Feature {
    /// Composite features (lights, switches, covers, ...) carry nested
    /// features; plain exposed properties do not.
    pub fn is_composite(&self) -> bool {
        !self.features.is_empty()
    }
}

/// First composite feature of a capability tree, in order.
pub fn find_composite_feature(features: &[Feature]) -> Option<&Feature> {
    features.iter().find(|feature| feature.is_composite())
}

/// Device definition as matched by Zigbee2MQTT.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Definition {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub exposes: Vec<Feature>,
}

/// Role of a device in the mesh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeviceType {
    Coordinator,
    Router,
    EndDevice,
    #[default]
    Unknown,
    Other(String),
}

impl<'de> Deserialize<'de> for DeviceType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "Coordinator" => DeviceType::Coordinator,
            "Router" => DeviceType::Router,
            "EndDevice" => DeviceType::EndDevice,
            "" => DeviceType::Unknown,
            _ => DeviceType::Other(raw),
        })
    }
}

/// One entry of the `bridge/devices` inventory.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceDescriptor {
    #[serde(rename = "type", default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub friendly_name: String,
    #[serde(default)]
    pub ieee_address: String,
    #[serde(default)]
    pub interview_completed: bool,
    #[serde(default)]
    pub interviewing: bool,
    #[serde(default)]
    pub supported: bool,
    #[serde(default)]
    pub network_address: Option<u32>,
    #[serde(default)]
    pub power_source: Option<String>,
    #[serde(default)]
    pub date_code: Option<String>,
    #[serde(default)]
    pub software_build_id: Option<String>,
    /// Absent for unsupported devices.
    #[serde(default, deserialize_with = "null_as_default")]
    pub definition: Definition,
}

impl DeviceDescriptor {
    /// Whether the device may become an accessory: not the coordinator and
    /// fully interviewed and supported.
    pub fn is_eligible(&self) -> bool {
        self.device_type != DeviceType::Coordinator
            && !self.interviewing
            && self.interview_completed
            && self.supported
    }

    /// Numeric identity parsed from the IEEE address.
    pub fn numeric_id(&self) -> Result<u64, IdentityError> {
        parse_ieee_address(&self.ieee_address)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Decode a `bridge/devices` payload, preserving order.
pub fn decode_inventory(payload: &[u8]) -> Result<Vec<DeviceDescriptor>, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// IEEE address that is not `0x` followed by hex digits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot parse IEEE address '{address}': {reason}")]
pub struct IdentityError {
    pub address: String,
    pub reason: String,
}

/// Parse an IEEE address such as `0x00158d0001a2b3c4` into a `u64`.
pub fn parse_ieee_address(address: &str) -> Result<u64, IdentityError> {
    let error = |reason: String| IdentityError {
        address: address.to_string(),
        reason,
    };

    let hex = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .ok_or_else(|| error("missing 0x prefix".to_string()))?;

    u64::from_str_radix(hex, 16).map_err(|e| error(e.to_string()))
}

/// State payload published by lights on `<base>/<friendly_name>`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LightState {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub brightness: Option<i64>,
    #[serde(default)]
    pub color_temp: Option<i64>,
    #[serde(default)]
    pub color: Option<ColorXy>,
    #[serde(default)]
    pub linkquality: Option<i64>,
}

impl LightState {
    /// Decode a state payload.
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// `Some(true)` for `ON`, `Some(false)` for any other reported state.
    pub fn is_on(&self) -> Option<bool> {
        self.state.as_deref().map(|state| state == "ON")
    }
}

/// CIE 1931 color coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct ColorXy {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

/// Subset of the `bridge/info` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BridgeInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub log_level: String,
    #[serde(default)]
    pub permit_join: bool,
    #[serde(default)]
    pub coordinator: CoordinatorInfo,
    #[serde(default)]
    pub network: NetworkInfo,
    #[serde(default)]
    pub config: BridgeSettings,
}

impl BridgeInfo {
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Base topic Zigbee2MQTT reports it publishes under, if any.
    pub fn base_topic(&self) -> Option<&str> {
        self.config
            .mqtt
            .base_topic
            .as_deref()
            .filter(|topic| !topic.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CoordinatorInfo {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl CoordinatorInfo {
    /// Firmware revision, when the adapter reports one.
    pub fn revision(&self) -> Option<String> {
        self.meta.get("revision").map(|rev| match rev {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NetworkInfo {
    #[serde(default)]
    pub channel: u8,
    #[serde(default)]
    pub pan_id: u32,
    #[serde(default)]
    pub extended_pan_id: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BridgeSettings {
    #[serde(default)]
    pub mqtt: BridgeMqttSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BridgeMqttSettings {
    #[serde(default)]
    pub base_topic: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
}
