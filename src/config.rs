//! Agent configuration
//!
//! Loaded from a TOML file. Credentials never live in the file itself: the
//! `[mqtt]` section names the environment variables holding them, and they
//! are read at connect time.
//!
//! ```toml
//! [agent]
//! id = "web-01"
//! subscriptions = ["linux", "webserver"]
//!
//! [mqtt]
//! broker_url = "mqtt://localhost:1883"
//! username_env = "BUSAGENT_MQTT_USERNAME"
//! password_env = "BUSAGENT_MQTT_PASSWORD"
//!
//! [keepalive]
//! interval_secs = 5
//!
//! [reconnect]
//! strategy = "exponential"
//! delay_ms = 1000
//! max_delay_ms = 60000
//! jitter = "equal"
//!
//! [health]
//! enabled = true
//! port = 8080
//! ```

use crate::supervisor::backoff::{BackoffPolicy, Jitter, Jittered};
use crate::transport::mqtt::{parse_broker_url, TopicBuilder};
use crate::worker::KeepaliveSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main agent configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusAgentConfig {
    pub agent: AgentSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub keepalive: KeepaliveSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub health: HealthSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    /// Agent identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Subscriptions advertised in keepalives
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// MQTT keep-alive in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Pause between transient connect failures inside one connect attempt
    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,
    /// How long to wait for the broker's ConnAck
    #[serde(default = "default_connack_timeout_secs")]
    pub connack_timeout_secs: u64,
}

impl MqttSection {
    /// Username and password read from the configured env vars
    ///
    /// `None` without a username; a missing password is sent as empty.
    pub fn credentials(&self) -> Option<(String, String)> {
        let username = env_var_optional(self.username_env.as_deref())?;
        let password = env_var_optional(self.password_env.as_deref()).unwrap_or_default();
        Some((username, password))
    }
}

fn env_var_optional(name: Option<&str>) -> Option<String> {
    name.and_then(|name| std::env::var(name).ok())
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_retry_ms() -> u64 {
    1000
}

fn default_connack_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeepaliveSection {
    #[serde(default = "default_keepalive_interval_secs")]
    pub interval_secs: u64,
    /// Defaults to `keepalives/{agent.id}`
    pub topic: Option<String>,
}

fn default_keepalive_interval_secs() -> u64 {
    5
}

impl Default for KeepaliveSection {
    fn default() -> Self {
        Self {
            interval_secs: default_keepalive_interval_secs(),
            topic: None,
        }
    }
}

/// Reconnect delay shape
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectStrategy {
    #[default]
    Constant,
    Exponential,
    Pattern,
}

/// Jitter applied to reconnect delays
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JitterMode {
    #[default]
    None,
    Full,
    Equal,
}

impl From<JitterMode> for Jitter {
    fn from(mode: JitterMode) -> Self {
        match mode {
            JitterMode::None => Jitter::None,
            JitterMode::Full => Jitter::Full,
            JitterMode::Equal => Jitter::Equal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default)]
    pub strategy: ReconnectStrategy,
    /// Constant delay, or the first delay of an exponential policy
    #[serde(default = "default_reconnect_delay_ms")]
    pub delay_ms: u64,
    /// Cap for exponential delays; sustained delay once a pattern runs out
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Delays walked through by the pattern strategy
    #[serde(default)]
    pub steps_ms: Vec<u64>,
    #[serde(default)]
    pub jitter: JitterMode,
}

fn default_reconnect_delay_ms() -> u64 {
    10_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_factor() -> f64 {
    2.0
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            strategy: ReconnectStrategy::default(),
            delay_ms: default_reconnect_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
            steps_ms: Vec::new(),
            jitter: JitterMode::default(),
        }
    }
}

impl ReconnectSection {
    /// Check the fields the chosen strategy relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.strategy {
            ReconnectStrategy::Constant => {}
            ReconnectStrategy::Exponential => {
                if !self.factor.is_finite() || self.factor < 1.0 {
                    return Err(ConfigError::InvalidConfig(format!(
                        "reconnect.factor must be a finite number >= 1.0, got {}",
                        self.factor
                    )));
                }
                if self.max_delay_ms < self.delay_ms {
                    return Err(ConfigError::InvalidConfig(
                        "reconnect.max_delay_ms must not be below reconnect.delay_ms".to_string(),
                    ));
                }
            }
            ReconnectStrategy::Pattern => {
                if self.steps_ms.is_empty() {
                    return Err(ConfigError::InvalidConfig(
                        "pattern reconnect strategy requires reconnect.steps_ms".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Build the backoff this section describes
    pub fn backoff(&self) -> Jittered<BackoffPolicy> {
        let policy = match self.strategy {
            ReconnectStrategy::Constant => BackoffPolicy::Constant {
                delay: Duration::from_millis(self.delay_ms),
            },
            ReconnectStrategy::Exponential => BackoffPolicy::Exponential {
                first: Duration::from_millis(self.delay_ms),
                max: Duration::from_millis(self.max_delay_ms),
                factor: self.factor,
            },
            ReconnectStrategy::Pattern => BackoffPolicy::Pattern {
                steps: self
                    .steps_ms
                    .iter()
                    .copied()
                    .map(Duration::from_millis)
                    .collect(),
                sustained: Duration::from_millis(self.max_delay_ms),
            },
        };

        policy.with_jitter(self.jitter.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

fn default_health_port() -> u16 {
    8080
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_health_port(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid agent ID format: {0}")]
    InvalidAgentId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BusAgentConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: BusAgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_agent_id(&self.agent.id)?;

        parse_broker_url(&self.mqtt.broker_url)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        if self.keepalive.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "keepalive.interval_secs must be greater than zero".to_string(),
            ));
        }

        self.reconnect.validate()
    }

    /// Settings for the keepalive worker
    pub fn keepalive_settings(&self) -> KeepaliveSettings {
        KeepaliveSettings {
            agent_id: self.agent.id.clone(),
            topic: self
                .keepalive
                .topic
                .clone()
                .unwrap_or_else(|| TopicBuilder::build_keepalive_topic(&self.agent.id)),
            interval: Duration::from_secs(self.keepalive.interval_secs),
            subscriptions: self.agent.subscriptions.clone(),
        }
    }
}

/// Validate agent ID format
pub fn validate_agent_id(agent_id: &str) -> Result<(), ConfigError> {
    let valid_chars = agent_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if agent_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidAgentId(format!(
            "Agent ID '{agent_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
