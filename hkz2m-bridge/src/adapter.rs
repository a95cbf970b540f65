//! Turns Zigbee2MQTT devices into accessories and relays between them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use hkz2m_bridge_framework::{Bus, TopicBuilder};

use crate::accessory::{Accessory, AccessoryInfo, CharacteristicChange};
use crate::inventory::{DeviceDescriptor, LightState, find_composite_feature};

/// Accessory kinds the bridge can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Colored lightbulb: on/off, brightness, hue, saturation.
    Light,
}

impl Capability {
    /// Classify a device by the first composite feature it exposes.
    pub fn classify(descriptor: &DeviceDescriptor) -> Option<Self> {
        let feature = find_composite_feature(&descriptor.definition.exposes)?;
        match feature.kind.as_str() {
            "light" => Some(Capability::Light),
            _ => None,
        }
    }
}

/// An eligible device with its accessory.
#[derive(Debug)]
pub struct ActiveDevice {
    descriptor: DeviceDescriptor,
    capability: Capability,
    accessory: Arc<Accessory>,
    state_topic: String,
    subscribed: Arc<AtomicBool>,
}

impl ActiveDevice {
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn friendly_name(&self) -> &str {
        &self.descriptor.friendly_name
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn accessory(&self) -> &Arc<Accessory> {
        &self.accessory
    }

    pub fn state_topic(&self) -> &str {
        &self.state_topic
    }

    /// Whether the broker acknowledged the state subscription.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    /// Forget the subscription, e.g. after the broker dropped the session.
    pub fn clear_subscribed(&self) {
        self.subscribed.store(false, Ordering::Release);
    }
}

/// Builds accessories and translates between accessory changes and bus
/// traffic.
#[derive(Clone)]
pub struct DeviceAdapter {
    bus: Arc<dyn Bus>,
    topics: TopicBuilder,
}

impl std::fmt::Debug for DeviceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAdapter")
            .field("base_topic", &self.topics.base())
            .finish_non_exhaustive()
    }
}

impl DeviceAdapter {
    pub fn new(bus: Arc<dyn Bus>, topics: TopicBuilder) -> Self {
        Self { bus, topics }
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    /// Build the accessory for an eligible device.
    ///
    /// Returns `None` for devices without a supported capability. The
    /// device is not subscribed yet; see [`subscribe`](Self::subscribe).
    pub fn build(&self, descriptor: DeviceDescriptor) -> Option<ActiveDevice> {
        let Some(capability) = Capability::classify(&descriptor) else {
            info!(
                device = %descriptor.friendly_name,
                model = %descriptor.definition.model,
                description = %descriptor.definition.description,
                "Skipping device without supported capability"
            );
            return None;
        };

        let id = match descriptor.numeric_id() {
            Ok(id) => id,
            Err(e) => {
                warn!(device = %descriptor.friendly_name, error = %e, "Using next free accessory id");
                0
            }
        };

        let definition = &descriptor.definition;
        let info = AccessoryInfo {
            name: descriptor.friendly_name.clone(),
            model: definition.model.clone(),
            manufacturer: definition.vendor.clone(),
            serial_number: descriptor.ieee_address.clone(),
            firmware_revision: descriptor.software_build_id.clone().unwrap_or_default(),
            id,
        };

        let accessory = match capability {
            Capability::Light => Accessory::lightbulb(info),
        };

        debug!(
            device = %descriptor.friendly_name,
            ieee = %descriptor.ieee_address,
            capability = ?capability,
            "Built accessory"
        );
        if let Some(composite) = find_composite_feature(&descriptor.definition.exposes) {
            for feature in &composite.features {
                trace!(
                    device = %descriptor.friendly_name,
                    feature = %feature.name,
                    published = feature.access.is_published(),
                    settable = feature.access.is_settable(),
                    gettable = feature.access.is_gettable(),
                    "Exposed feature"
                );
            }
        }

        Some(ActiveDevice {
            state_topic: self.topics.device(&descriptor.friendly_name),
            descriptor,
            capability,
            accessory: Arc::new(accessory),
            subscribed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Subscribe the device's state topic without blocking.
    ///
    /// The subscribed flag is set once the broker acknowledges; the
    /// returned handle resolves after that.
    pub fn subscribe(&self, device: &ActiveDevice) -> JoinHandle<()> {
        let ack = self.bus.subscribe(&device.state_topic);
        let subscribed = Arc::clone(&device.subscribed);
        let topic = device.state_topic.clone();

        tokio::spawn(async move {
            match ack.await {
                Ok(()) => {
                    subscribed.store(true, Ordering::Release);
                    debug!(topic = %topic, "Subscribed device state");
                }
                Err(e) => warn!(topic = %topic, error = %e, "Device state subscription failed"),
            }
        })
    }

    /// Translate a controller change into a device command.
    ///
    /// Returns the task waiting for the publish acknowledgement, or `None`
    /// when nothing is published.
    pub fn handle_command(
        &self,
        device: &ActiveDevice,
        change: CharacteristicChange,
    ) -> Option<JoinHandle<()>> {
        let name = device.friendly_name();
        match change {
            CharacteristicChange::On(on) => {
                debug!(device = %name, on, "Switching");
                let payload = if on { "ON" } else { "OFF" };
                Some(self.publish(name, "state", payload.to_string()))
            }
            CharacteristicChange::Brightness(brightness) => {
                debug!(device = %name, brightness, "Setting brightness");
                Some(self.publish(name, "brightness", brightness.to_string()))
            }
            CharacteristicChange::Hue(hue) => {
                info!(device = %name, hue, "Hue change not forwarded");
                None
            }
            CharacteristicChange::Saturation(saturation) => {
                info!(device = %name, saturation, "Saturation change not forwarded");
                None
            }
        }
    }

    fn publish(&self, name: &str, attribute: &str, payload: String) -> JoinHandle<()> {
        let topic = self.topics.device_set(name, attribute);
        let ack = self.bus.publish(&topic, payload.into_bytes());

        tokio::spawn(async move {
            if let Err(e) = ack.await {
                warn!(topic = %topic, error = %e, "Command publish failed");
            }
        })
    }

    /// Push a reported device state into the accessory.
    ///
    /// Fields missing from the payload leave their values unchanged; a
    /// malformed payload changes nothing.
    pub fn apply_state(&self, device: &ActiveDevice, payload: &[u8]) {
        let state = match LightState::decode(payload) {
            Ok(state) => state,
            Err(e) => {
                warn!(device = %device.friendly_name(), error = %e, "Malformed state payload");
                return;
            }
        };

        match device.capability {
            Capability::Light => {
                if let Some(on) = state.is_on() {
                    device.accessory.set_on(on);
                }
                if let Some(brightness) = state.brightness {
                    device.accessory.set_brightness(brightness);
                }
            }
        }

        debug!(
            device = %device.friendly_name(),
            state = ?state.state,
            brightness = ?state.brightness,
            color_temp = ?state.color_temp,
            linkquality = ?state.linkquality,
            "State updated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::light_descriptor;
    use hkz2m_bridge_framework::{BusMessage, MemoryBus};

    fn adapter() -> (DeviceAdapter, MemoryBus) {
        let bus = MemoryBus::new();
        let adapter = DeviceAdapter::new(Arc::new(bus.clone()), TopicBuilder::default());
        (adapter, bus)
    }

    #[test]
    fn test_classify() {
        let lamp = light_descriptor("lamp", "0x01");
        assert_eq!(Capability::classify(&lamp), Some(Capability::Light));

        let mut switch = lamp.clone();
        switch.definition.exposes[0].kind = "switch".to_string();
        assert_eq!(Capability::classify(&switch), None);

        let mut sensor = lamp;
        sensor.definition.exposes[0].features.clear();
        assert_eq!(Capability::classify(&sensor), None);
    }

    #[tokio::test]
    async fn test_build_light() {
        let (adapter, bus) = adapter();
        let device = adapter
            .build(light_descriptor("living/lamp", "0x0017880104e45517"))
            .unwrap();

        let info = device.accessory().info();
        assert_eq!(info.id, 0x0017880104e45517);
        assert_eq!(info.name, "living/lamp");
        assert_eq!(info.manufacturer, "IKEA");
        assert_eq!(device.state_topic(), "zigbee2mqtt/living/lamp");
        assert!(!device.is_subscribed());
        assert!(bus.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_build_with_bad_address() {
        let (adapter, _bus) = adapter();
        let device = adapter.build(light_descriptor("lamp", "garbage")).unwrap();
        assert_eq!(device.accessory().info().id, 0);
    }

    #[tokio::test]
    async fn test_subscribe_sets_flag_on_ack() {
        let (adapter, bus) = adapter();
        let device = adapter.build(light_descriptor("lamp", "0x02")).unwrap();

        bus.hold_acks();
        let pending = adapter.subscribe(&device);
        assert_eq!(bus.subscriptions(), vec!["zigbee2mqtt/lamp"]);
        assert!(!device.is_subscribed());

        bus.release_acks();
        pending.await.unwrap();
        assert!(device.is_subscribed());
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaves_flag_clear() {
        let (adapter, bus) = adapter();
        bus.set_fail_subscribe(true);
        let device = adapter.build(light_descriptor("lamp", "0x02")).unwrap();
        adapter.subscribe(&device).await.unwrap();
        assert!(!device.is_subscribed());
    }

    #[tokio::test]
    async fn test_commands() {
        let (adapter, bus) = adapter();
        let device = adapter.build(light_descriptor("lamp", "0x02")).unwrap();

        adapter
            .handle_command(&device, CharacteristicChange::On(true))
            .unwrap()
            .await
            .unwrap();
        adapter
            .handle_command(&device, CharacteristicChange::On(false))
            .unwrap()
            .await
            .unwrap();
        adapter
            .handle_command(&device, CharacteristicChange::Brightness(70))
            .unwrap()
            .await
            .unwrap();
        assert!(
            adapter
                .handle_command(&device, CharacteristicChange::Hue(120.0))
                .is_none()
        );
        assert!(
            adapter
                .handle_command(&device, CharacteristicChange::Saturation(50.0))
                .is_none()
        );

        assert_eq!(
            bus.published(),
            vec![
                BusMessage::new("zigbee2mqtt/lamp/set/state", "ON"),
                BusMessage::new("zigbee2mqtt/lamp/set/state", "OFF"),
                BusMessage::new("zigbee2mqtt/lamp/set/brightness", "70"),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_publish_is_not_fatal() {
        let (adapter, bus) = adapter();
        bus.set_fail_publish(true);
        let device = adapter.build(light_descriptor("lamp", "0x02")).unwrap();
        let handle = adapter
            .handle_command(&device, CharacteristicChange::On(true))
            .unwrap();
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_apply_state() {
        let (adapter, _bus) = adapter();
        let device = adapter.build(light_descriptor("lamp", "0x02")).unwrap();

        adapter.apply_state(&device, br#"{"state":"ON","brightness":80}"#);
        let values = device.accessory().values();
        assert!(values.on);
        assert_eq!(values.brightness, 80);

        adapter.apply_state(&device, br#"{"linkquality":40}"#);
        assert_eq!(device.accessory().values(), values);

        adapter.apply_state(&device, b"{ broken");
        assert_eq!(device.accessory().values(), values);

        adapter.apply_state(&device, br#"{"state":"OFF"}"#);
        assert!(!device.accessory().values().on);
        assert_eq!(device.accessory().values().brightness, 80);
    }
}
