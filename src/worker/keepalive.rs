//! Periodic keepalive publisher
//!
//! Publishes a small JSON document on the agent's keepalive topic right after
//! start and then once per interval, so the backend knows the agent is alive.

use super::{Worker, WorkerError};
use crate::observability::metrics::metrics;
use crate::transport::Publisher;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Keepalive document published on every tick
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeepaliveMessage {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscriptions: Vec<String>,
    pub version: String,
    /// Unix timestamp in seconds
    pub timestamp: i64,
}

impl KeepaliveMessage {
    /// Build a keepalive stamped with the current time (pure construction)
    pub fn now(agent_id: &str, subscriptions: &[String]) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            subscriptions: subscriptions.to_vec(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Keepalive worker settings
#[derive(Debug, Clone, PartialEq)]
pub struct KeepaliveSettings {
    pub agent_id: String,
    pub topic: String,
    pub interval: Duration,
    pub subscriptions: Vec<String>,
}

/// Worker publishing keepalives while the bus is connected
pub struct KeepaliveWorker<P: Publisher> {
    publisher: Arc<P>,
    settings: KeepaliveSettings,
    ticker: Option<JoinHandle<()>>,
    closed: bool,
}

impl<P: Publisher> KeepaliveWorker<P> {
    pub fn new(publisher: Arc<P>, settings: KeepaliveSettings) -> Self {
        Self {
            publisher,
            settings,
            ticker: None,
            closed: false,
        }
    }

    /// Whether the ticker task is currently running
    pub fn is_running(&self) -> bool {
        self.ticker
            .as_ref()
            .is_some_and(|ticker| !ticker.is_finished())
    }

    fn spawn_ticker(publisher: Arc<P>, settings: KeepaliveSettings) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(settings.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                // First tick completes immediately
                interval.tick().await;
                Self::publish_once(publisher.as_ref(), &settings).await;
            }
        })
    }

    async fn publish_once(publisher: &P, settings: &KeepaliveSettings) {
        let message = KeepaliveMessage::now(&settings.agent_id, &settings.subscriptions);
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Keepalive: failed to serialize message");
                metrics().keepalive_failed();
                return;
            }
        };

        match publisher.publish(&settings.topic, payload).await {
            Ok(()) => {
                debug!(topic = %settings.topic, "Keepalive: published");
                metrics().keepalive_published();
            }
            Err(e) => {
                // Keep ticking; the supervisor decides when the bus is gone
                warn!(topic = %settings.topic, error = %e, "Keepalive: failed to publish");
                metrics().keepalive_failed();
            }
        }
    }

    fn halt(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

#[async_trait]
impl<P: Publisher> Worker for KeepaliveWorker<P> {
    fn name(&self) -> &str {
        "keepalive"
    }

    async fn start(&mut self) -> Result<(), WorkerError> {
        if self.closed {
            return Err(WorkerError::Closed);
        }
        if self.is_running() {
            return Ok(());
        }

        self.ticker = Some(Self::spawn_ticker(
            self.publisher.clone(),
            self.settings.clone(),
        ));
        info!(
            interval_secs = self.settings.interval.as_secs_f64(),
            topic = %self.settings.topic,
            "Keepalive started"
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), WorkerError> {
        if self.ticker.is_some() {
            self.halt();
            info!("Keepalive stopped");
        }
        Ok(())
    }

    async fn restart(&mut self) -> Result<(), WorkerError> {
        self.stop().await?;
        self.start().await
    }

    async fn close(&mut self) -> Result<(), WorkerError> {
        self.halt();
        self.closed = true;
        info!("Keepalive closed");
        Ok(())
    }
}

impl<P: Publisher> Drop for KeepaliveWorker<P> {
    fn drop(&mut self) {
        self.halt();
    }
}
