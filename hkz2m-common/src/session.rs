use std::time::Duration;

use rumqttc::MqttOptions;

use crate::config::MqttConfig;
use crate::error::Result;

/// Build rumqttc client options from the provided configuration.
///
/// Sessions are always clean: subscriptions are re-established by the
/// bridge after every (re)connect.
pub fn mqtt_options(config: &MqttConfig) -> Result<MqttOptions> {
    config.validate()?;

    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    options.set_clean_session(true);

    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or_default());
    }

    tracing::debug!(
        server = %config.server(),
        client_id = %config.client_id,
        "Built MQTT client options"
    );

    Ok(options)
}
