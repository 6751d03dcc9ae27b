//! Impure I/O operations for the MQTT bus connection
//!
//! This module owns the rumqttc client and event loop. It only ever holds one
//! live connection; reconnection policy belongs to the supervisor, so a dropped
//! connection is reported once on the disconnection source and then left alone.

use super::connection::configure_mqtt_options;
use crate::config::MqttSection;
use crate::error::redact_url;
use crate::observability::metrics::metrics;
use crate::transport::{
    disconnection_channel, BusConnection, BusError, ConnectionLost, DisconnectionSource,
    Publisher,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, Event, EventLoop};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// MQTT implementation of the bus connection
pub struct MqttConnection {
    agent_id: String,
    config: MqttSection,
    client: Arc<Mutex<Option<AsyncClient>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    lost_tx: broadcast::Sender<ConnectionLost>,
    /// Receiver taken before the poll task of the current link started
    link_source: StdMutex<Option<DisconnectionSource>>,
}

impl MqttConnection {
    /// Create a connection handle; the broker URL is validated eagerly
    pub fn new(agent_id: &str, config: MqttSection) -> Result<Self, BusError> {
        configure_mqtt_options(agent_id, &config)?;

        Ok(Self {
            agent_id: agent_id.to_string(),
            config,
            client: Arc::new(Mutex::new(None)),
            poll_task: Mutex::new(None),
            lost_tx: disconnection_channel(),
            link_source: StdMutex::new(None),
        })
    }

    /// Whether a live client is currently installed
    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }

    /// Poll a fresh event loop until the broker acknowledges the connection
    async fn wait_for_connack(event_loop: &mut EventLoop, timeout: Duration) -> Result<(), String> {
        let result = tokio::time::timeout(timeout, async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(Event::Incoming(Packet::Disconnect(_))) => {
                        return Err("Broker rejected connection".to_string());
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(e.to_string()),
                }
            }
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err("ConnAck timeout - no connection confirmation received".to_string()),
        }
    }

    /// Keep polling a live event loop and report the first failure
    async fn watch_connection(
        agent_id: String,
        mut event_loop: EventLoop,
        client: Arc<Mutex<Option<AsyncClient>>>,
        lost_tx: broadcast::Sender<ConnectionLost>,
    ) {
        let reason = loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Disconnect(_))) => {
                    break "Broker disconnected".to_string();
                }
                Ok(event) => {
                    debug!(target: "bus_transport", "MQTT event: {:?}", event);
                }
                Err(e) => break e.to_string(),
            }
        };

        warn!(agent_id = %agent_id, reason = %reason, "MQTT connection dropped");

        // No receivers just means the supervisor has disarmed the source
        let _ = lost_tx.send(ConnectionLost::new(reason));
        client.lock().await.take();
    }

    /// Keep a receiver for the link about to be watched
    fn hold_link_source(&self) {
        if let Ok(mut slot) = self.link_source.lock() {
            *slot = Some(self.lost_tx.subscribe());
        }
    }

    /// Disconnect from the broker and stop the poll task
    pub async fn close(&self) {
        if let Some(client) = self.client.lock().await.take() {
            if let Err(e) = client.disconnect().await {
                debug!(target: "bus_transport", "Disconnect request not delivered: {}", e);
            }
        }

        if let Some(handle) = self.poll_task.lock().await.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(_) => info!("MQTT poll task stopped"),
                Err(_) => warn!("MQTT poll task didn't stop in time, dropping it"),
            }
        }

        info!(agent_id = %self.agent_id, "MQTT connection closed");
    }
}

#[async_trait]
impl BusConnection for MqttConnection {
    async fn connect(&self) -> Result<(), BusError> {
        let retry_delay = Duration::from_millis(self.config.connect_retry_ms);
        let connack_timeout = Duration::from_secs(self.config.connack_timeout_secs);

        // The previous link must not report into the next one
        if let Some(previous) = self.poll_task.lock().await.take() {
            previous.abort();
        }
        if let Ok(mut slot) = self.link_source.lock() {
            slot.take();
        }

        loop {
            // Configuration problems are not something a retry can fix
            let options = configure_mqtt_options(&self.agent_id, &self.config)?;
            let (client, mut event_loop) = AsyncClient::new(options, 10);

            info!(
                agent_id = %self.agent_id,
                broker_url = %redact_url(&self.config.broker_url),
                "Connecting to MQTT broker"
            );

            match Self::wait_for_connack(&mut event_loop, connack_timeout).await {
                Ok(()) => {
                    *self.client.lock().await = Some(client);
                    self.hold_link_source();

                    let handle = tokio::spawn(Self::watch_connection(
                        self.agent_id.clone(),
                        event_loop,
                        self.client.clone(),
                        self.lost_tx.clone(),
                    ));
                    *self.poll_task.lock().await = Some(handle);

                    info!(agent_id = %self.agent_id, "MQTT connection established");
                    return Ok(());
                }
                Err(reason) => {
                    warn!(
                        agent_id = %self.agent_id,
                        reason = %reason,
                        retry_ms = self.config.connect_retry_ms,
                        "MQTT connection attempt failed, retrying"
                    );
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }

    fn disconnections(&self) -> DisconnectionSource {
        let held = self.link_source.lock().ok().and_then(|mut slot| slot.take());
        held.unwrap_or_else(|| self.lost_tx.subscribe())
    }
}

#[async_trait]
impl Publisher for MqttConnection {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        // Cloned out so a parked publish never blocks drop reporting
        let client = self
            .client
            .lock()
            .await
            .clone()
            .ok_or(BusError::NotConnected)?;

        match client.publish(topic, QoS::AtLeastOnce, false, payload).await {
            Ok(()) => {
                metrics().bus_message_published();
                Ok(())
            }
            Err(e) => {
                metrics().bus_publish_failed();
                Err(BusError::PublishFailed(Box::new(e)))
            }
        }
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if let Ok(mut poll_task) = self.poll_task.try_lock() {
            if let Some(handle) = poll_task.take() {
                handle.abort();
            }
        }
    }
}
