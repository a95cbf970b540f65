//! HomeKit accessory model.
//!
//! Accessories expose services made of characteristics, each addressed by
//! an instance id (`iid`) that is fixed per characteristic kind. The
//! accessory id (`aid`) is assigned when a set of accessories is published;
//! the bridge accessory is always `aid` 1.

mod server;
mod storage;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

pub use server::{AccessoryTransport, HttpAccessoryTransport, HttpTransportConfig, RunningServer};
pub use storage::{BridgeStore, StoredBridge};

/// Accessory id of the bridge accessory.
pub const BRIDGE_AID: u64 = 1;

/// Errors raised by the accessory layer.
#[derive(Debug, thiserror::Error)]
pub enum AccessoryError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid storage file {path}: {source}")]
    Storage {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Accessory server task failed: {0}")]
    Task(String),
}

/// HAP service kinds used by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    AccessoryInformation,
    Lightbulb,
}

impl ServiceKind {
    pub fn iid(self) -> u64 {
        match self {
            ServiceKind::AccessoryInformation => 1,
            ServiceKind::Lightbulb => 8,
        }
    }

    /// Short form of the HAP type UUID.
    pub fn type_code(self) -> &'static str {
        match self {
            ServiceKind::AccessoryInformation => "3E",
            ServiceKind::Lightbulb => "43",
        }
    }

    pub fn characteristics(self) -> &'static [CharacteristicKind] {
        use CharacteristicKind::*;
        match self {
            ServiceKind::AccessoryInformation => &[
                Identify,
                Manufacturer,
                Model,
                Name,
                SerialNumber,
                FirmwareRevision,
            ],
            ServiceKind::Lightbulb => &[On, Brightness, Hue, Saturation],
        }
    }
}

/// HAP characteristic kinds used by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicKind {
    Identify,
    Manufacturer,
    Model,
    Name,
    SerialNumber,
    FirmwareRevision,
    On,
    Brightness,
    Hue,
    Saturation,
}

/// Value bounds of a numeric characteristic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub unit: &'static str,
}

impl CharacteristicKind {
    pub const ALL: [CharacteristicKind; 10] = [
        CharacteristicKind::Identify,
        CharacteristicKind::Manufacturer,
        CharacteristicKind::Model,
        CharacteristicKind::Name,
        CharacteristicKind::SerialNumber,
        CharacteristicKind::FirmwareRevision,
        CharacteristicKind::On,
        CharacteristicKind::Brightness,
        CharacteristicKind::Hue,
        CharacteristicKind::Saturation,
    ];

    pub fn iid(self) -> u64 {
        match self {
            CharacteristicKind::Identify => 2,
            CharacteristicKind::Manufacturer => 3,
            CharacteristicKind::Model => 4,
            CharacteristicKind::Name => 5,
            CharacteristicKind::SerialNumber => 6,
            CharacteristicKind::FirmwareRevision => 7,
            CharacteristicKind::On => 9,
            CharacteristicKind::Brightness => 10,
            CharacteristicKind::Hue => 11,
            CharacteristicKind::Saturation => 12,
        }
    }

    pub fn from_iid(iid: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.iid() == iid)
    }

    pub fn type_code(self) -> &'static str {
        match self {
            CharacteristicKind::Identify => "14",
            CharacteristicKind::Manufacturer => "20",
            CharacteristicKind::Model => "21",
            CharacteristicKind::Name => "23",
            CharacteristicKind::SerialNumber => "30",
            CharacteristicKind::FirmwareRevision => "52",
            CharacteristicKind::On => "25",
            CharacteristicKind::Brightness => "8",
            CharacteristicKind::Hue => "13",
            CharacteristicKind::Saturation => "2F",
        }
    }

    pub fn format(self) -> &'static str {
        match self {
            CharacteristicKind::Identify | CharacteristicKind::On => "bool",
            CharacteristicKind::Brightness => "int",
            CharacteristicKind::Hue | CharacteristicKind::Saturation => "float",
            _ => "string",
        }
    }

    pub fn perms(self) -> &'static [&'static str] {
        match self {
            CharacteristicKind::Identify => &["pw"],
            CharacteristicKind::On
            | CharacteristicKind::Brightness
            | CharacteristicKind::Hue
            | CharacteristicKind::Saturation => &["pr", "pw", "ev"],
            _ => &["pr"],
        }
    }

    pub fn is_readable(self) -> bool {
        self.perms().contains(&"pr")
    }

    pub fn is_writable(self) -> bool {
        self.perms().contains(&"pw")
    }

    pub fn bounds(self) -> Option<Bounds> {
        match self {
            CharacteristicKind::Brightness => Some(Bounds {
                min: 0.0,
                max: 100.0,
                step: 1.0,
                unit: "percentage",
            }),
            CharacteristicKind::Hue => Some(Bounds {
                min: 0.0,
                max: 360.0,
                step: 1.0,
                unit: "arcdegrees",
            }),
            CharacteristicKind::Saturation => Some(Bounds {
                min: 0.0,
                max: 100.0,
                step: 1.0,
                unit: "percentage",
            }),
            _ => None,
        }
    }
}

/// Static identity of an accessory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessoryInfo {
    pub name: String,
    pub model: String,
    pub manufacturer: String,
    pub serial_number: String,
    pub firmware_revision: String,
    /// Requested accessory id; 0 asks for the next free one.
    pub id: u64,
}

/// What an accessory represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessoryKind {
    Bridge,
    Lightbulb,
}

impl AccessoryKind {
    pub fn services(self) -> &'static [ServiceKind] {
        match self {
            AccessoryKind::Bridge => &[ServiceKind::AccessoryInformation],
            AccessoryKind::Lightbulb => {
                &[ServiceKind::AccessoryInformation, ServiceKind::Lightbulb]
            }
        }
    }
}

/// Local values of a colored lightbulb.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LightbulbValues {
    pub on: bool,
    pub brightness: i64,
    pub hue: f64,
    pub saturation: f64,
}

/// A HomeKit accessory with its locally held characteristic values.
#[derive(Debug)]
pub struct Accessory {
    info: AccessoryInfo,
    kind: AccessoryKind,
    values: RwLock<LightbulbValues>,
}

impl Accessory {
    pub fn bridge(info: AccessoryInfo) -> Self {
        Self::new(info, AccessoryKind::Bridge)
    }

    pub fn lightbulb(info: AccessoryInfo) -> Self {
        Self::new(info, AccessoryKind::Lightbulb)
    }

    fn new(info: AccessoryInfo, kind: AccessoryKind) -> Self {
        Self {
            info,
            kind,
            values: RwLock::new(LightbulbValues::default()),
        }
    }

    pub fn info(&self) -> &AccessoryInfo {
        &self.info
    }

    pub fn kind(&self) -> AccessoryKind {
        self.kind
    }

    pub fn values(&self) -> LightbulbValues {
        *self.values.read()
    }

    pub fn set_on(&self, on: bool) {
        self.values.write().on = on;
    }

    /// Set brightness, clamped to the characteristic bounds.
    pub fn set_brightness(&self, brightness: i64) {
        self.values.write().brightness = brightness.clamp(0, 100);
    }

    pub fn has_characteristic(&self, kind: CharacteristicKind) -> bool {
        self.kind
            .services()
            .iter()
            .any(|service| service.characteristics().contains(&kind))
    }

    /// Current value of a readable characteristic.
    pub fn read(&self, kind: CharacteristicKind) -> Option<Value> {
        if !self.has_characteristic(kind) || !kind.is_readable() {
            return None;
        }
        let values = self.values();
        Some(match kind {
            CharacteristicKind::Manufacturer => Value::from(self.info.manufacturer.clone()),
            CharacteristicKind::Model => Value::from(self.info.model.clone()),
            CharacteristicKind::Name => Value::from(self.info.name.clone()),
            CharacteristicKind::SerialNumber => Value::from(self.info.serial_number.clone()),
            CharacteristicKind::FirmwareRevision => {
                Value::from(self.info.firmware_revision.clone())
            }
            CharacteristicKind::On => Value::from(values.on),
            CharacteristicKind::Brightness => Value::from(values.brightness),
            CharacteristicKind::Hue => Value::from(values.hue),
            CharacteristicKind::Saturation => Value::from(values.saturation),
            CharacteristicKind::Identify => return None,
        })
    }

    /// Attribute database entry for this accessory under `aid`.
    pub fn describe(&self, aid: u64) -> AccessoryDescription {
        let services = self
            .kind
            .services()
            .iter()
            .map(|service| ServiceDescription {
                iid: service.iid(),
                kind: service.type_code(),
                characteristics: service
                    .characteristics()
                    .iter()
                    .map(|&kind| {
                        let bounds = kind.bounds();
                        CharacteristicDescription {
                            iid: kind.iid(),
                            kind: kind.type_code(),
                            perms: kind.perms(),
                            format: kind.format(),
                            value: self.read(kind),
                            min_value: bounds.map(|b| b.min),
                            max_value: bounds.map(|b| b.max),
                            min_step: bounds.map(|b| b.step),
                            unit: bounds.map(|b| b.unit),
                        }
                    })
                    .collect(),
            })
            .collect();

        AccessoryDescription { aid, services }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessoryDescription {
    pub aid: u64,
    pub services: Vec<ServiceDescription>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceDescription {
    pub iid: u64,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub characteristics: Vec<CharacteristicDescription>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacteristicDescription {
    pub iid: u64,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub perms: &'static [&'static str],
    pub format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_step: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
}

/// The bridge accessory plus the device accessories, keyed by assigned id.
#[derive(Debug, Clone)]
pub struct AccessorySet {
    accessories: BTreeMap<u64, Arc<Accessory>>,
}

impl AccessorySet {
    /// Assign accessory ids: the bridge gets [`BRIDGE_AID`], each device
    /// keeps its requested id unless it is 0, reserved, or already taken,
    /// in which case it gets the next free id.
    pub fn new(bridge: Arc<Accessory>, devices: impl IntoIterator<Item = Arc<Accessory>>) -> Self {
        let devices: Vec<Arc<Accessory>> = devices.into_iter().collect();
        let mut accessories = BTreeMap::new();
        accessories.insert(BRIDGE_AID, bridge);

        let mut wanted = BTreeSet::new();
        let mut deferred = Vec::new();
        for accessory in devices {
            let id = accessory.info().id;
            if id > BRIDGE_AID && wanted.insert(id) {
                accessories.insert(id, accessory);
            } else {
                deferred.push(accessory);
            }
        }

        let mut next = BRIDGE_AID + 1;
        for accessory in deferred {
            while accessories.contains_key(&next) {
                next += 1;
            }
            accessories.insert(next, accessory);
        }

        Self { accessories }
    }

    pub fn get(&self, aid: u64) -> Option<&Arc<Accessory>> {
        self.accessories.get(&aid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &Arc<Accessory>)> {
        self.accessories.iter().map(|(aid, accessory)| (*aid, accessory))
    }

    /// Number of accessories including the bridge.
    pub fn len(&self) -> usize {
        self.accessories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accessories.is_empty()
    }

    pub fn describe(&self) -> Vec<AccessoryDescription> {
        self.iter()
            .map(|(aid, accessory)| accessory.describe(aid))
            .collect()
    }
}

/// A characteristic change requested by a controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CharacteristicChange {
    On(bool),
    Brightness(i64),
    Hue(f64),
    Saturation(f64),
}

impl CharacteristicChange {
    /// Interpret a written value for a characteristic kind.
    pub fn from_value(kind: CharacteristicKind, value: &Value) -> Option<Self> {
        let in_bounds = |v: f64| {
            kind.bounds()
                .is_none_or(|b| v >= b.min && v <= b.max)
        };
        match kind {
            CharacteristicKind::On => match value {
                Value::Bool(on) => Some(CharacteristicChange::On(*on)),
                Value::Number(n) => match n.as_u64() {
                    Some(0) => Some(CharacteristicChange::On(false)),
                    Some(1) => Some(CharacteristicChange::On(true)),
                    _ => None,
                },
                _ => None,
            },
            CharacteristicKind::Brightness => value
                .as_i64()
                .filter(|v| in_bounds(*v as f64))
                .map(CharacteristicChange::Brightness),
            CharacteristicKind::Hue => value
                .as_f64()
                .filter(|v| in_bounds(*v))
                .map(CharacteristicChange::Hue),
            CharacteristicKind::Saturation => value
                .as_f64()
                .filter(|v| in_bounds(*v))
                .map(CharacteristicChange::Saturation),
            _ => None,
        }
    }

    pub fn kind(&self) -> CharacteristicKind {
        match self {
            CharacteristicChange::On(_) => CharacteristicKind::On,
            CharacteristicChange::Brightness(_) => CharacteristicKind::Brightness,
            CharacteristicChange::Hue(_) => CharacteristicKind::Hue,
            CharacteristicChange::Saturation(_) => CharacteristicKind::Saturation,
        }
    }
}

/// A change request forwarded from the accessory server to the dispatch
/// loop. The accessory itself is left untouched; its values only follow
/// the device state reported on the bus.
#[derive(Debug, Clone)]
pub struct AccessoryCommand {
    pub accessory: Arc<Accessory>,
    pub change: CharacteristicChange,
}
