//! Rebuilds the accessory set from the device inventory.
//!
//! Every inventory message replaces the whole set: the running transport
//! is stopped, the previous devices are unsubscribed, and the new set is
//! subscribed and published. Accessories are never modified while a
//! transport serves them.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::accessory::{Accessory, AccessorySet, AccessoryTransport};
use crate::adapter::{ActiveDevice, DeviceAdapter};
use crate::inventory::decode_inventory;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Devices in the inventory.
    pub listed: usize,
    /// Devices passing the eligibility filter.
    pub eligible: usize,
    /// Devices that became accessories.
    pub active: usize,
    /// Previous devices unsubscribed.
    pub unsubscribed: usize,
    /// Whether the new set is being served.
    pub serving: bool,
}

/// Owns the active device set and the transport publishing it.
pub struct Reconciler<T: AccessoryTransport> {
    adapter: DeviceAdapter,
    transport: T,
    bridge: Arc<Accessory>,
    devices: Vec<ActiveDevice>,
    running: Option<T::Running>,
    pending: Vec<JoinHandle<()>>,
}

impl<T: AccessoryTransport> std::fmt::Debug for Reconciler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("devices", &self.devices.len())
            .field("serving", &self.running.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: AccessoryTransport> Reconciler<T> {
    pub fn new(adapter: DeviceAdapter, transport: T, bridge: Arc<Accessory>) -> Self {
        Self {
            adapter,
            transport,
            bridge,
            devices: Vec::new(),
            running: None,
            pending: Vec::new(),
        }
    }

    pub fn adapter(&self) -> &DeviceAdapter {
        &self.adapter
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn devices(&self) -> &[ActiveDevice] {
        &self.devices
    }

    pub fn is_serving(&self) -> bool {
        self.running.is_some()
    }

    /// Handle of the running transport, if any.
    pub fn running(&self) -> Option<&T::Running> {
        self.running.as_ref()
    }

    pub fn device_by_name(&self, friendly_name: &str) -> Option<&ActiveDevice> {
        self.devices
            .iter()
            .find(|device| device.friendly_name() == friendly_name)
    }

    /// The active device owning `accessory`, if it belongs to the current
    /// set.
    pub fn device_for(&self, accessory: &Arc<Accessory>) -> Option<&ActiveDevice> {
        self.devices
            .iter()
            .find(|device| Arc::ptr_eq(device.accessory(), accessory))
    }

    /// Apply an inventory payload.
    ///
    /// A payload that does not decode leaves everything untouched.
    pub async fn reconcile(&mut self, payload: &[u8]) -> Result<ReconcileReport, serde_json::Error> {
        let descriptors = decode_inventory(payload)?;
        let mut report = ReconcileReport {
            listed: descriptors.len(),
            ..ReconcileReport::default()
        };

        let mut seen = HashSet::new();
        let mut next = Vec::new();
        for descriptor in descriptors {
            if !descriptor.is_eligible() {
                debug!(
                    device = %descriptor.friendly_name,
                    device_type = ?descriptor.device_type,
                    "Ignoring ineligible device"
                );
                continue;
            }
            report.eligible += 1;

            if !seen.insert(descriptor.ieee_address.clone()) {
                warn!(
                    device = %descriptor.friendly_name,
                    ieee = %descriptor.ieee_address,
                    "Duplicate device in inventory"
                );
                continue;
            }

            if let Some(device) = self.adapter.build(descriptor) {
                next.push(device);
            }
        }
        report.active = next.len();

        self.stop_transport().await;

        for device in self.devices.iter().filter(|device| device.is_subscribed()) {
            match self.adapter.bus().unsubscribe(device.state_topic()).await {
                Ok(()) => {
                    device.clear_subscribed();
                    report.unsubscribed += 1;
                }
                Err(e) => warn!(topic = %device.state_topic(), error = %e, "Unsubscribe failed"),
            }
        }

        self.devices = next;

        // Subscribing after the teardown keeps the unsubscribe of a
        // device that is still present from cancelling its new
        // subscription.
        self.pending = self
            .devices
            .iter()
            .map(|device| self.adapter.subscribe(device))
            .collect();

        let set = AccessorySet::new(
            Arc::clone(&self.bridge),
            self.devices.iter().map(|device| Arc::clone(device.accessory())),
        );
        match self.transport.start(set).await {
            Ok(running) => self.running = Some(running),
            Err(e) => error!(error = %e, "Failed to start accessory transport"),
        }
        report.serving = self.running.is_some();

        info!(
            listed = report.listed,
            eligible = report.eligible,
            active = report.active,
            serving = report.serving,
            "Device inventory applied"
        );
        Ok(report)
    }

    /// Wait until the subscriptions of the current set were acknowledged
    /// or failed.
    pub async fn settle(&mut self) {
        for handle in self.pending.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Subscription task failed");
            }
        }
    }

    /// The broker dropped the session and with it every subscription.
    pub fn connection_lost(&self) {
        for device in &self.devices {
            device.clear_subscribed();
        }
    }

    /// Stop the transport, if running.
    pub async fn shutdown(&mut self) {
        self.stop_transport().await;
        for handle in self.pending.drain(..) {
            handle.abort();
        }
    }

    async fn stop_transport(&mut self) {
        if let Some(running) = self.running.take() {
            if let Err(e) = self.transport.stop(running).await {
                warn!(error = %e, "Failed to stop accessory transport");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessory::AccessoryInfo;
    use crate::fixtures::{FakeTransport, TransportEvent, inventory_json};
    use hkz2m_bridge_framework::{MemoryBus, TopicBuilder};

    fn reconciler() -> (Reconciler<FakeTransport>, MemoryBus, FakeTransport) {
        let bus = MemoryBus::new();
        let transport = FakeTransport::default();
        let bridge = Arc::new(Accessory::bridge(AccessoryInfo {
            name: "Bridge".to_string(),
            ..AccessoryInfo::default()
        }));
        let adapter = DeviceAdapter::new(Arc::new(bus.clone()), TopicBuilder::default());
        (Reconciler::new(adapter, transport.clone(), bridge), bus, transport)
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_first_inventory() {
        let (mut reconciler, bus, transport) = reconciler();
        let payload = inventory_json(&[
            ("lamp", "0x0000000000000010", "light"),
            ("plug", "0x0000000000000020", "switch"),
            ("desk", "0x0000000000000030", "light"),
        ]);

        let report = reconciler.reconcile(&payload).await.unwrap();
        reconciler.settle().await;

        assert_eq!(report.listed, 3);
        assert_eq!(report.eligible, 3);
        assert_eq!(report.active, 2);
        assert!(report.serving);
        assert_eq!(
            transport.events(),
            vec![TransportEvent::Started(1, names(&["Bridge", "lamp", "desk"]))]
        );
        assert_eq!(bus.subscriptions(), vec!["zigbee2mqtt/lamp", "zigbee2mqtt/desk"]);
        assert!(bus.unsubscriptions().is_empty());
        assert!(reconciler.devices().iter().all(ActiveDevice::is_subscribed));
    }

    #[tokio::test]
    async fn test_second_inventory_rebuilds() {
        let (mut reconciler, bus, transport) = reconciler();
        let payload = inventory_json(&[("lamp", "0x0000000000000010", "light")]);

        reconciler.reconcile(&payload).await.unwrap();
        reconciler.settle().await;
        let first = Arc::clone(reconciler.devices()[0].accessory());

        let report = reconciler.reconcile(&payload).await.unwrap();
        reconciler.settle().await;

        assert_eq!(report.unsubscribed, 1);
        assert_eq!(
            transport.events(),
            vec![
                TransportEvent::Started(1, names(&["Bridge", "lamp"])),
                TransportEvent::Stopped(1),
                TransportEvent::Started(2, names(&["Bridge", "lamp"])),
            ]
        );
        assert_eq!(bus.subscriptions(), vec!["zigbee2mqtt/lamp", "zigbee2mqtt/lamp"]);
        assert_eq!(bus.unsubscriptions(), vec!["zigbee2mqtt/lamp"]);

        let current = reconciler.devices()[0].accessory();
        assert!(!Arc::ptr_eq(&first, current));
        assert!(reconciler.device_for(&first).is_none());
        assert!(reconciler.devices()[0].is_subscribed());
    }

    #[tokio::test]
    async fn test_malformed_inventory_keeps_state() {
        let (mut reconciler, _bus, transport) = reconciler();
        reconciler
            .reconcile(&inventory_json(&[("lamp", "0x0000000000000010", "light")]))
            .await
            .unwrap();

        assert!(reconciler.reconcile(b"{ not an array").await.is_err());

        assert_eq!(reconciler.devices().len(), 1);
        assert!(reconciler.is_serving());
        assert_eq!(transport.events().len(), 1);
    }

    #[tokio::test]
    async fn test_ineligible_and_duplicate_devices() {
        let (mut reconciler, _bus, transport) = reconciler();
        let payload = br#"[
            {"type": "Coordinator", "friendly_name": "Coordinator", "ieee_address": "0x01",
             "interview_completed": true, "supported": true, "definition": null},
            {"type": "EndDevice", "friendly_name": "new", "ieee_address": "0x02",
             "interview_completed": false, "interviewing": true, "supported": true},
            {"type": "Router", "friendly_name": "lamp", "ieee_address": "0x10",
             "interview_completed": true, "supported": true,
             "definition": {"exposes": [{"type": "light", "features": [{"type": "binary"}]}]}},
            {"type": "Router", "friendly_name": "lamp copy", "ieee_address": "0x10",
             "interview_completed": true, "supported": true,
             "definition": {"exposes": [{"type": "light", "features": [{"type": "binary"}]}]}}
        ]"#;

        let report = reconciler.reconcile(payload).await.unwrap();
        assert_eq!(report.listed, 4);
        assert_eq!(report.eligible, 2);
        assert_eq!(report.active, 1);
        assert_eq!(
            transport.events(),
            vec![TransportEvent::Started(1, names(&["Bridge", "lamp"]))]
        );
    }

    #[tokio::test]
    async fn test_empty_inventory_serves_bridge_only() {
        let (mut reconciler, _bus, transport) = reconciler();
        let report = reconciler.reconcile(b"[]").await.unwrap();
        assert_eq!(report.active, 0);
        assert_eq!(
            transport.events(),
            vec![TransportEvent::Started(1, names(&["Bridge"]))]
        );
    }

    #[tokio::test]
    async fn test_unacknowledged_devices_not_unsubscribed() {
        let (mut reconciler, bus, _transport) = reconciler();
        let payload = inventory_json(&[("lamp", "0x0000000000000010", "light")]);

        bus.hold_acks();
        reconciler.reconcile(&payload).await.unwrap();
        assert!(!reconciler.devices()[0].is_subscribed());

        // Release so the second pass is not held up, then drop the flag
        // as if the ack had never come.
        bus.release_acks();
        reconciler.settle().await;
        reconciler.connection_lost();

        let report = reconciler.reconcile(&payload).await.unwrap();
        assert_eq!(report.unsubscribed, 0);
        assert!(bus.unsubscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_failure_is_not_fatal() {
        let (mut reconciler, bus, transport) = reconciler();
        let payload = inventory_json(&[("lamp", "0x0000000000000010", "light")]);
        reconciler.reconcile(&payload).await.unwrap();
        reconciler.settle().await;

        bus.set_fail_unsubscribe(true);
        let report = reconciler.reconcile(&payload).await.unwrap();

        assert_eq!(report.unsubscribed, 0);
        assert!(report.serving);
        assert_eq!(transport.events().len(), 3);
    }

    #[tokio::test]
    async fn test_start_failure_leaves_nothing_running() {
        let (mut reconciler, _bus, transport) = reconciler();
        let payload = inventory_json(&[("lamp", "0x0000000000000010", "light")]);

        transport.set_fail_start(true);
        let report = reconciler.reconcile(&payload).await.unwrap();
        assert!(!report.serving);
        assert!(!reconciler.is_serving());
        assert_eq!(reconciler.devices().len(), 1);

        transport.set_fail_start(false);
        reconciler.reconcile(&payload).await.unwrap();
        // Nothing was running, so nothing to stop.
        assert_eq!(
            transport.events(),
            vec![TransportEvent::Started(1, names(&["Bridge", "lamp"]))]
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_transport() {
        let (mut reconciler, _bus, transport) = reconciler();
        reconciler.reconcile(b"[]").await.unwrap();
        reconciler.shutdown().await;
        reconciler.shutdown().await;

        assert!(!reconciler.is_serving());
        assert_eq!(
            transport.events(),
            vec![TransportEvent::Started(1, names(&["Bridge"])), TransportEvent::Stopped(1)]
        );
    }
}
