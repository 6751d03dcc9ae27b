//! busagent
//!
//! A long-running agent that keeps background workers alive against an
//! unreliable message-bus connection: connect, start workers, stop them when
//! the connection drops, wait out a backoff, reconnect and restart them.
//!
//! # Overview
//!
//! - [`supervisor`] - the connection/worker state machine and backoff policies
//! - [`worker`] - the worker contract, per-worker command queues and the
//!   keepalive worker
//! - [`transport`] - the bus connection contract and its MQTT implementation
//! - [`config`], [`error`], [`observability`] - the ambient stack
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use busagent::supervisor::{BackoffPolicy, Supervisor};
//! use busagent::testing::mocks::{MockConnection, RecordingWorker};
//! use std::sync::Arc;
//! use tokio::sync::{mpsc, watch};
//!
//! # async fn demo() -> Result<(), busagent::supervisor::SupervisorError> {
//! let connection = Arc::new(MockConnection::new());
//! let mut supervisor = Supervisor::new(connection, BackoffPolicy::default());
//!
//! let (worker, _trace) = RecordingWorker::new("reporter");
//! supervisor.register(worker)?;
//!
//! let (errors, _fatal) = mpsc::unbounded_channel();
//! let (_stop, shutdown) = watch::channel(false);
//! supervisor.start(errors, shutdown).await?;
//! supervisor.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod supervisor;
pub mod testing;
pub mod transport;
pub mod worker;

pub use config::BusAgentConfig;
pub use error::{AgentError, AgentResult};
pub use supervisor::{ConnectionState, Supervisor, SupervisorError, SupervisorStatus};
pub use transport::mqtt::MqttConnection;
pub use transport::{BusConnection, BusError, ConnectionLost, Publisher};
pub use worker::{KeepaliveWorker, Worker, WorkerError, WorkerHandle};
