//! Pure connection configuration for the MQTT bus
//!
//! This module contains pure functions for building client options
//! and topic names from configuration.

use crate::config::MqttSection;
use crate::transport::BusError;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

/// Broker endpoint parsed from a broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `mqtt://host:port` or `mqtts://host:port` into an endpoint
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerEndpoint, BusError> {
    let url =
        Url::parse(broker_url).map_err(|_| BusError::InvalidBrokerUrl(broker_url.to_string()))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(BusError::InvalidBrokerUrl(broker_url.to_string())),
    };

    let host = url
        .host_str()
        .ok_or_else(|| BusError::InvalidBrokerUrl(broker_url.to_string()))?
        .to_string();
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerEndpoint { host, port, tls })
}

/// Build client options for one connection attempt
///
/// A fresh client id is generated per attempt so a reconnect never collides
/// with a session the broker has not yet expired.
pub fn configure_mqtt_options(
    agent_id: &str,
    config: &MqttSection,
) -> Result<MqttOptions, BusError> {
    let endpoint = parse_broker_url(&config.broker_url)?;

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let client_id = format!("busagent-{agent_id}-{timestamp}");
    let mut mqtt_options = MqttOptions::new(client_id, endpoint.host, endpoint.port);

    if endpoint.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some((username, password)) = config.credentials() {
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_clean_start(true);

    Ok(mqtt_options)
}

/// Topic construction for agent traffic
pub struct TopicBuilder;

impl TopicBuilder {
    /// Build keepalive topic: `keepalives/{agent_id}`
    pub fn build_keepalive_topic(agent_id: &str) -> String {
        format!("keepalives/{agent_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mqtt_config() -> MqttSection {
        MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: 60,
            connect_retry_ms: 1000,
            connack_timeout_secs: 10,
        }
    }

    #[test]
    fn test_parse_plain_broker_url() {
        let endpoint = parse_broker_url("mqtt://broker.local:1884").unwrap();
        assert_eq!(endpoint.host, "broker.local");
        assert_eq!(endpoint.port, 1884);
        assert!(!endpoint.tls);
    }

    #[test]
    fn test_parse_default_ports() {
        assert_eq!(parse_broker_url("mqtt://localhost").unwrap().port, 1883);

        let tls = parse_broker_url("mqtts://localhost").unwrap();
        assert_eq!(tls.port, 8883);
        assert!(tls.tls);
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        let result = parse_broker_url("amqp://localhost:5672");
        assert!(matches!(result, Err(BusError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = configure_mqtt_options("test-agent", &test_mqtt_config()).unwrap();
        assert!(options.client_id().starts_with("busagent-test-agent-"));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_broker_url() {
        let mut config = test_mqtt_config();
        config.broker_url = "invalid-url".to_string();

        let result = configure_mqtt_options("test-agent", &config);
        assert!(matches!(result, Err(BusError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_keepalive_topic() {
        assert_eq!(
            TopicBuilder::build_keepalive_topic("web-01"),
            "keepalives/web-01"
        );
    }
}
