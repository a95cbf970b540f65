//! Zigbee2MQTT to HomeKit bridge.
//!
//! Watches the Zigbee2MQTT device inventory on the MQTT bus, turns every
//! eligible light into a HomeKit lightbulb accessory, mirrors reported
//! device state into the accessories and forwards controller changes back
//! to the devices.
//!
//! The pieces, in data-flow order:
//!
//! - [`router`] maps inbound topics to handlers
//! - [`inventory`] decodes Zigbee2MQTT payloads
//! - [`adapter`] builds accessories and translates state and commands
//! - [`reconciler`] rebuilds the accessory set on every inventory
//! - [`accessory`] holds the accessory model and the server publishing it
//! - [`bridge`] owns all of the above and runs the dispatch loop

pub mod accessory;
pub mod adapter;
pub mod bridge;
pub mod config;
pub mod inventory;
pub mod reconciler;
pub mod router;

#[cfg(test)]
mod fixtures;

pub use accessory::{
    Accessory, AccessoryCommand, AccessoryError, AccessoryInfo, AccessorySet, AccessoryTransport,
    CharacteristicChange, HttpAccessoryTransport, HttpTransportConfig,
};
pub use adapter::{ActiveDevice, Capability, DeviceAdapter};
pub use bridge::Bridge;
pub use config::HomekitBridgeConfig;
pub use reconciler::{ReconcileReport, Reconciler};
pub use router::{BridgeRoute, Route, TopicRouter};
