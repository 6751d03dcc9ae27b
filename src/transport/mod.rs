//! Transport layer for the message bus
//!
//! This module provides the connection abstraction the supervisor drives
//! and the MQTT implementation used by the agent binary.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod mqtt;

/// Receiver half of a disconnection notification source.
///
/// Holding one means the source is armed; dropping it disarms the source.
/// A fresh receiver only observes drops that happen after it was created.
pub type DisconnectionSource = broadcast::Receiver<ConnectionLost>;

/// Bus connection contract driven by the supervisor
///
/// Implementations own their own transient retry behaviour: `connect`
/// resolves once the connection is ready, or fails with an error the
/// transport cannot retry itself (bad configuration and the like).
#[async_trait]
pub trait BusConnection: Send + Sync + 'static {
    /// Establish a connection to the broker
    async fn connect(&self) -> Result<(), BusError>;

    /// Subscribe to drops of the live connection
    ///
    /// The supervisor calls this right after `connect` resolves. A drop of
    /// the new link that lands in between must still reach the returned
    /// receiver.
    fn disconnections(&self) -> DisconnectionSource;
}

/// Publishing half of the bus, used by workers
#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    /// Publish a payload to a topic (QoS 1, not retained)
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

/// Notification carried by a disconnection source
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Connection lost: {reason}")]
pub struct ConnectionLost {
    pub reason: String,
}

impl ConnectionLost {
    pub fn new<S: Into<String>>(reason: S) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Bus transport errors
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Not connected to broker")]
    NotConnected,
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error")]
    Serialization(#[source] serde_json::Error),
}

/// Create the sending side of a disconnection notification source
pub fn disconnection_channel() -> broadcast::Sender<ConnectionLost> {
    let (tx, _) = broadcast::channel(16);
    tx
}
