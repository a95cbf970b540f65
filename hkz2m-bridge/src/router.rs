//! Routes inbound bus messages to their handlers.
//!
//! The three bridge topics are bound once at construction; every other
//! topic under the base is treated as a device state topic and resolved by
//! friendly name against the active device set at dispatch time. An exact
//! active name wins over the `/set/` command form, since friendly names may
//! contain slashes.

use hkz2m_bridge_framework::{ParsedTopic, TopicBuilder};

/// Handlers for the fixed bridge topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeRoute {
    /// `bridge/state`: upstream availability.
    State,
    /// `bridge/info`: bridge and network configuration.
    Info,
    /// `bridge/devices`: the device inventory.
    Devices,
}

/// Where a topic goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Bridge(BridgeRoute),
    /// State of the device with this friendly name.
    DeviceState(String),
    /// Our own command topics, other bridge topics, or foreign topics.
    Ignored,
}

/// Static topic to handler bindings.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    topics: TopicBuilder,
    bindings: Vec<(String, BridgeRoute)>,
}

impl TopicRouter {
    pub fn new(topics: TopicBuilder) -> Self {
        let bindings = vec![
            (topics.bridge_state(), BridgeRoute::State),
            (topics.bridge_info(), BridgeRoute::Info),
            (topics.bridge_devices(), BridgeRoute::Devices),
        ];
        Self { topics, bindings }
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    /// Topics to subscribe on every connect, in registration order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.bindings.iter().map(|(topic, _)| topic.clone()).collect()
    }

    /// Route `topic`. `is_active` tells whether a friendly name belongs to
    /// the active device set.
    pub fn route(&self, topic: &str, is_active: impl Fn(&str) -> bool) -> Route {
        if let Some((_, route)) = self.bindings.iter().find(|(bound, _)| bound == topic) {
            return Route::Bridge(*route);
        }

        let name = topic
            .strip_prefix(self.topics.base())
            .and_then(|rest| rest.strip_prefix('/'));
        if let Some(name) = name.filter(|&name| is_active(name)) {
            return Route::DeviceState(name.to_string());
        }

        match self.topics.parse(topic) {
            Some(ParsedTopic::Device(name)) => Route::DeviceState(name),
            _ => Route::Ignored,
        }
    }
}
