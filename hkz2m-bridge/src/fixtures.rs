//! Shared test fixtures.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::accessory::{AccessoryError, AccessorySet, AccessoryTransport};
use crate::inventory::{Definition, DeviceDescriptor, DeviceType, Feature};

pub fn light_descriptor(name: &str, ieee: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        device_type: DeviceType::Router,
        friendly_name: name.to_string(),
        ieee_address: ieee.to_string(),
        interview_completed: true,
        supported: true,
        definition: Definition {
            model: "LED1545G12".to_string(),
            vendor: "IKEA".to_string(),
            description: "TRADFRI bulb".to_string(),
            exposes: vec![Feature {
                kind: "light".to_string(),
                features: vec![Feature {
                    kind: "binary".to_string(),
                    name: "state".to_string(),
                    ..Feature::default()
                }],
                ..Feature::default()
            }],
        },
        ..DeviceDescriptor::default()
    }
}

/// Inventory JSON as published on `bridge/devices`.
pub fn inventory_json(devices: &[(&str, &str, &str)]) -> Vec<u8> {
    let entries: Vec<serde_json::Value> = devices
        .iter()
        .map(|(name, ieee, kind)| {
            serde_json::json!({
                "type": "Router",
                "friendly_name": name,
                "ieee_address": ieee,
                "interview_completed": true,
                "interviewing": false,
                "supported": true,
                "definition": {
                    "model": "LED1545G12",
                    "vendor": "IKEA",
                    "description": "TRADFRI bulb",
                    "exposes": [
                        {"type": kind, "features": [{"type": "binary", "name": "state", "access": 7}]}
                    ]
                }
            })
        })
        .collect();
    serde_json::to_vec(&entries).unwrap()
}

/// What happened to a [`FakeTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Started with the accessory names of the set, bridge first.
    Started(u32, Vec<String>),
    Stopped(u32),
}

/// Transport that records start/stop calls.
#[derive(Debug, Clone, Default)]
pub struct FakeTransport {
    inner: Arc<Mutex<FakeState>>,
}

#[derive(Debug, Default)]
struct FakeState {
    events: Vec<TransportEvent>,
    next: u32,
    fail_start: bool,
    last_set: Option<AccessorySet>,
}

impl FakeTransport {
    pub fn events(&self) -> Vec<TransportEvent> {
        self.inner.lock().events.clone()
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.inner.lock().fail_start = fail;
    }

    pub fn last_set(&self) -> Option<AccessorySet> {
        self.inner.lock().last_set.clone()
    }
}

impl AccessoryTransport for FakeTransport {
    type Running = u32;

    async fn start(&self, set: AccessorySet) -> Result<u32, AccessoryError> {
        let mut state = self.inner.lock();
        if state.fail_start {
            return Err(AccessoryError::Task("injected failure".to_string()));
        }
        state.next += 1;
        let id = state.next;
        let names = set
            .iter()
            .map(|(_, accessory)| accessory.info().name.clone())
            .collect();
        state.events.push(TransportEvent::Started(id, names));
        state.last_set = Some(set);
        Ok(id)
    }

    async fn stop(&self, running: u32) -> Result<(), AccessoryError> {
        self.inner.lock().events.push(TransportEvent::Stopped(running));
        Ok(())
    }
}
