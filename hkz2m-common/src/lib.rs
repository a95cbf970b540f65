//! Shared building blocks of the Zigbee2MQTT HomeKit bridge: broker and
//! logging settings, JSON5 loading, MQTT client options and the
//! Zigbee2MQTT topic layout.

pub mod config;
pub mod error;
pub mod session;
pub mod topic;

pub use config::{LogFormat, LoggingConfig, MqttConfig, load_config, parse_config};
pub use error::{Error, Result};
pub use session::mqtt_options;
pub use topic::{DEFAULT_BASE_TOPIC, ParsedTopic, TopicBuilder};

/// Install the global tracing subscriber.
///
/// Text output by default, one JSON object per line with
/// [`LogFormat::Json`]. A set `RUST_LOG` wins over `config.level`.
///
/// Fails if a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };

    installed.map_err(|e| Error::Config(format!("tracing subscriber: {}", e)))
}
