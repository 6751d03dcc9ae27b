//! MQTT implementation of the bus connection
//!
//! The module is split in two:
//!
//! - [`connection`] - pure option building and topic construction
//! - [`client`] - impure I/O: the rumqttc client, event loop polling and
//!   disconnection reporting
//!
//! # Usage
//!
//! ```rust,no_run
//! use busagent::config::MqttSection;
//! use busagent::transport::mqtt::MqttConnection;
//! use busagent::transport::BusConnection;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     keep_alive_secs: 60,
//!     connect_retry_ms: 1000,
//!     connack_timeout_secs: 10,
//! };
//!
//! let connection = MqttConnection::new("my-agent", config)?;
//! connection.connect().await?;
//! let mut drops = connection.disconnections();
//! let lost = drops.recv().await?;
//! println!("{lost}");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;

pub use client::MqttConnection;
pub use connection::{configure_mqtt_options, parse_broker_url, BrokerEndpoint, TopicBuilder};
