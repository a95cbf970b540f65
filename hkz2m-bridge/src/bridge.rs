//! The dispatch loop.
//!
//! One task owns the router, the reconciler and the upstream status, and
//! handles bus events and accessory commands strictly one at a time.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use hkz2m_bridge_framework::{BridgeStatus, Bus, BusEvent, BusMessage, TopicBuilder};

use crate::accessory::{Accessory, AccessoryCommand, AccessoryInfo, AccessoryTransport};
use crate::adapter::DeviceAdapter;
use crate::inventory::BridgeInfo;
use crate::reconciler::Reconciler;
use crate::router::{BridgeRoute, Route, TopicRouter};

/// Bridge state shared by every handler.
#[derive(Debug)]
pub struct Bridge<T: AccessoryTransport> {
    router: TopicRouter,
    reconciler: Reconciler<T>,
    status: BridgeStatus,
    info: Option<BridgeInfo>,
}

impl<T: AccessoryTransport> Bridge<T> {
    pub fn new(
        bus: Arc<dyn Bus>,
        topics: TopicBuilder,
        transport: T,
        bridge_info: AccessoryInfo,
    ) -> Self {
        let adapter = DeviceAdapter::new(bus, topics.clone());
        let bridge = Arc::new(Accessory::bridge(bridge_info));
        Self {
            router: TopicRouter::new(topics),
            reconciler: Reconciler::new(adapter, transport, bridge),
            status: BridgeStatus::default(),
            info: None,
        }
    }

    /// Topics the connection supervisor subscribes on every connect.
    pub fn subscriptions(&self) -> Vec<String> {
        self.router.subscriptions()
    }

    /// Last reported upstream availability. Informational only.
    pub fn status(&self) -> BridgeStatus {
        self.status
    }

    pub fn info(&self) -> Option<&BridgeInfo> {
        self.info.as_ref()
    }

    pub fn reconciler(&self) -> &Reconciler<T> {
        &self.reconciler
    }

    pub fn reconciler_mut(&mut self) -> &mut Reconciler<T> {
        &mut self.reconciler
    }

    /// Handle events and commands until the event stream ends, then stop
    /// the transport.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<BusEvent>,
        mut commands: mpsc::UnboundedReceiver<AccessoryCommand>,
    ) {
        info!("Dispatch loop started");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                Some(command) = commands.recv() => {
                    self.handle_command(command);
                }
            }
        }

        self.shutdown().await;
        info!("Dispatch loop stopped");
    }

    pub async fn handle_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Connected => debug!("Bus connected"),
            BusEvent::Disconnected { reason } => {
                debug!(reason = %reason, "Bus disconnected, device subscriptions dropped");
                self.reconciler.connection_lost();
            }
            BusEvent::Message(message) => self.handle_message(message).await,
        }
    }

    async fn handle_message(&mut self, message: BusMessage) {
        let route = self
            .router
            .route(&message.topic, |name| self.reconciler.device_by_name(name).is_some());
        match route {
            Route::Bridge(BridgeRoute::State) => self.handle_bridge_state(&message),
            Route::Bridge(BridgeRoute::Info) => self.handle_bridge_info(&message),
            Route::Bridge(BridgeRoute::Devices) => {
                if let Err(e) = self.reconciler.reconcile(&message.payload).await {
                    warn!(topic = %message.topic, error = %e, "Malformed device inventory");
                }
            }
            Route::DeviceState(name) => match self.reconciler.device_by_name(&name) {
                Some(device) => self.reconciler.adapter().apply_state(device, &message.payload),
                None => trace!(device = %name, "State for inactive device"),
            },
            Route::Ignored => trace!(topic = %message.topic, "Ignoring message"),
        }
    }

    fn handle_bridge_state(&mut self, message: &BusMessage) {
        let status = BridgeStatus::from_payload(&message.payload);
        if status != self.status {
            info!(status = %status, "Zigbee2MQTT bridge status");
            self.status = status;
        }
    }

    fn handle_bridge_info(&mut self, message: &BusMessage) {
        let info = match BridgeInfo::decode(&message.payload) {
            Ok(info) => info,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "Malformed bridge info");
                return;
            }
        };

        info!(
            version = %info.version,
            coordinator = %info.coordinator.kind,
            revision = ?info.coordinator.revision(),
            channel = info.network.channel,
            permit_join = info.permit_join,
            "Zigbee2MQTT bridge info"
        );

        let ours = self.router.topics().base();
        if let Some(theirs) = info.base_topic() {
            if theirs.trim_end_matches('/') != ours {
                warn!(configured = %ours, reported = %theirs, "Zigbee2MQTT reports a different base topic");
            }
        }

        self.info = Some(info);
    }

    /// Forward a controller change to the device owning the accessory.
    ///
    /// Commands for accessories of a replaced set are dropped.
    pub fn handle_command(&self, command: AccessoryCommand) -> Option<JoinHandle<()>> {
        let Some(device) = self.reconciler.device_for(&command.accessory) else {
            debug!(
                accessory = %command.accessory.info().name,
                "Dropping command for inactive accessory"
            );
            return None;
        };
        self.reconciler.adapter().handle_command(device, command.change)
    }

    /// Stop serving accessories.
    pub async fn shutdown(&mut self) {
        self.reconciler.shutdown().await;
    }
}
