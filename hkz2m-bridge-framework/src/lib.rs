//! Plumbing shared by hkz2m bridge binaries.
//!
//! - [`Bus`]: publish/subscribe with [`Ack`] tokens, over rumqttc
//!   ([`MqttBus`]) or in process ([`MemoryBus`])
//! - [`BridgeRunner`]: the connection supervisor
//! - [`BridgeConfig`], [`BridgeArgs`]: config file and command line
//! - [`BridgeStatus`]: what Zigbee2MQTT reports on `bridge/state`
//!
//! A binary loads its config, builds a runner, spawns a dispatch task
//! reading the [`BusEvent`] channel and then awaits
//! [`BridgeRunner::run`]:
//!
//! ```ignore
//! let args = BridgeArgs::parse_with_default("hkz2m.json5");
//! let config = HomekitBridgeConfig::load(&args.config)?;
//! let runner = BridgeRunner::new_with_args("hkz2m", config, Some(&args))?;
//! let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
//! tokio::spawn(dispatch(runner.bus(), events_rx));
//! runner.run(topics, events_tx).await?;
//! ```

mod args;
pub mod bus;
mod config;
mod error;
mod runner;
mod status;

pub use args::BridgeArgs;
pub use bus::{Ack, AckSender, Bus, BusEvent, BusMessage, MemoryBus, MqttBus};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use runner::{BridgeRunner, ConnectionState, EventSource, ReconnectPolicy, shutdown_signal};
pub use status::BridgeStatus;

pub use hkz2m_common::{LogFormat, LoggingConfig, MqttConfig, ParsedTopic, TopicBuilder};
