//! Top-level error type for the agent
//!
//! Each module owns its own error enum; [`AgentError`] gathers them for the
//! binary and for callers that drive several modules at once.

use crate::config::ConfigError;
use crate::supervisor::SupervisorError;
use crate::transport::BusError;
use crate::worker::WorkerError;
use thiserror::Error;
use url::Url;

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Health server error: {message}")]
    Health { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AgentError {
    /// Create health server error
    pub fn health<S: Into<String>>(message: S) -> Self {
        Self::Health {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::Config(_) => 2,
            AgentError::Bus(_) => 3,
            _ => 1,
        }
    }
}

/// Result type alias for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Mask the password of a URL before it reaches a log line
///
/// Strings that do not parse as URLs are returned unchanged.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            if url.set_password(Some("***")).is_err() {
                return raw.to_string();
            }
            url.to_string()
        }
        _ => raw.to_string(),
    }
}
