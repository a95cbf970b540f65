//! Integration tests for hkz2m-common library.

use hkz2m_common::{LogFormat, LoggingConfig, MqttConfig, ParsedTopic, TopicBuilder, mqtt_options};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct FileConfig {
    mqtt: MqttConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[test]
fn test_config_file_to_mqtt_options() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("hkz2m.json5");
    std::fs::write(
        &path,
        r#"
        // broker on the local host
        {
            mqtt: { host: "localhost", client_id: "hkz2m-test" },
            logging: { level: "trace", format: "json" },
        }
        "#,
    )
    .expect("write config");

    let config: FileConfig = hkz2m_common::load_config(&path).expect("load config");
    assert_eq!(config.logging.format, LogFormat::Json);

    let options = mqtt_options(&config.mqtt).expect("options");
    assert_eq!(options.client_id(), "hkz2m-test");
    assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
}

#[test]
fn test_topic_building_and_parsing() {
    let topics = TopicBuilder::new("zigbee2mqtt").expect("base topic");

    let state = topics.device("hall/ceiling");
    assert_eq!(topics.parse(&state), Some(ParsedTopic::Device("hall/ceiling".to_string())));

    let set = topics.device_set("hall/ceiling", "brightness");
    assert_eq!(
        topics.parse(&set),
        Some(ParsedTopic::DeviceSet {
            device: "hall/ceiling".to_string(),
            attribute: "brightness".to_string(),
        })
    );

    for (topic, expected) in [
        (topics.bridge_state(), ParsedTopic::BridgeState),
        (topics.bridge_info(), ParsedTopic::BridgeInfo),
        (topics.bridge_devices(), ParsedTopic::BridgeDevices),
    ] {
        assert_eq!(topics.parse(&topic), Some(expected));
    }
}
