//! Zigbee2MQTT to HomeKit bridge.
//!
//! Subscribes to the Zigbee2MQTT bridge topics, publishes eligible lights
//! as HomeKit accessories and relays state and commands between them.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use hkz2m_bridge::{Bridge, HomekitBridgeConfig, HttpAccessoryTransport, HttpTransportConfig};
use hkz2m_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = BridgeArgs::parse_with_default("hkz2m.json5");

    // Load configuration
    let config = HomekitBridgeConfig::load(&args.config)?;

    // Create the connection supervisor (also sets up logging)
    let runner = BridgeRunner::new_with_args("hkz2m", config, Some(&args))?;
    let config = runner.config();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    let transport =
        HttpAccessoryTransport::new(HttpTransportConfig::from(&config.homekit), commands_tx);
    let bridge = Bridge::new(
        Arc::new(runner.bus()),
        config.topics()?,
        transport,
        config.homekit.bridge_accessory(runner.version()),
    );

    tracing::info!(
        base_topic = %config.zigbee2mqtt.base_topic,
        listen = %config.homekit.listen,
        storage = %config.homekit.storage_path.display(),
        "Starting HomeKit bridge"
    );

    let subscriptions = bridge.subscriptions();
    let dispatch = tokio::spawn(bridge.run(events_rx, commands_rx));

    // Run until Ctrl+C or SIGTERM; the dispatch loop stops once the
    // supervisor drops its event sender.
    let outcome = runner.run(subscriptions, events_tx).await;

    if let Err(e) = dispatch.await {
        tracing::error!(error = %e, "Dispatch loop failed");
    }

    tracing::info!("HomeKit bridge stopped");
    outcome.map_err(Into::into)
}
