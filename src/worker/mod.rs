//! Supervised background workers
//!
//! A worker is a background task whose lifecycle is bound to bus availability.
//! The supervisor is the only caller of its lifecycle operations; each worker
//! is driven through a [`WorkerHandle`] that serializes those calls.

use async_trait::async_trait;
use thiserror::Error;

pub mod handle;
pub mod keepalive;

pub use handle::WorkerHandle;
pub use keepalive::{KeepaliveMessage, KeepaliveSettings, KeepaliveWorker};

/// Lifecycle capability set of a supervised worker
///
/// Calls never overlap on one worker: the handle runs them one at a time in
/// the order the supervisor issued them.
#[async_trait]
pub trait Worker: Send + 'static {
    /// Name used in logs and error reports
    fn name(&self) -> &str;

    /// Begin work after the first successful connection
    async fn start(&mut self) -> Result<(), WorkerError>;

    /// Halt work; must tolerate being called while already stopped
    async fn stop(&mut self) -> Result<(), WorkerError>;

    /// Resume work after a reconnection
    async fn restart(&mut self) -> Result<(), WorkerError>;

    /// Release timers and other resources for good
    async fn close(&mut self) -> Result<(), WorkerError>;
}

/// Worker lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("Worker operation failed: {message}")]
    Failed { message: String },
    #[error("Worker is closed")]
    Closed,
}

impl WorkerError {
    /// Create a failed-operation error
    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_constructor() {
        let error = WorkerError::failed("timer unavailable");
        assert!(matches!(error, WorkerError::Failed { .. }));
        assert_eq!(
            error.to_string(),
            "Worker operation failed: timer unavailable"
        );
    }

    #[test]
    fn test_closed_display() {
        assert_eq!(WorkerError::Closed.to_string(), "Worker is closed");
    }
}
