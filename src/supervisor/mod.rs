//! Connection supervision and worker lifecycle
//!
//! The [`Supervisor`] keeps a set of workers alive against an unreliable bus:
//!
//! ```text
//! connect -> start workers -> (disconnected) -> stop workers -> backoff
//!    ^                                                            |
//!    +------------------ reconnect, restart workers <-------------+
//! ```
//!
//! Exactly one connect attempt is in flight at a time, and the disconnection
//! source is armed only while the connection is up. Workers are driven
//! through [`WorkerHandle`]s, so lifecycle calls on one worker never overlap.

use crate::observability::metrics::metrics;
use crate::transport::{BusConnection, BusError, ConnectionLost, DisconnectionSource};
use crate::worker::{Worker, WorkerError, WorkerHandle};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

pub mod backoff;

pub use backoff::{Backoff, BackoffPolicy, Jitter, Jittered};

/// Connection state as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published on every state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub state: ConnectionState,
    /// Consecutive reconnect attempts since the last successful connect
    pub reconnect_attempt: u32,
    pub workers: usize,
    /// Whether workers have received their first start
    pub started: bool,
}

/// A lifecycle call that failed on one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub worker: String,
    pub error: WorkerError,
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.worker, self.error)
    }
}

/// Supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Worker lifecycle failed: {}", describe_failures(.failures))]
    WorkerLifecycle { failures: Vec<WorkerFailure> },
    #[error("Supervisor has been shut down")]
    ShutDown,
}

fn describe_failures(failures: &[WorkerFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Owns the bus connection and every registered worker
pub struct Supervisor<C: BusConnection> {
    connection: Arc<C>,
    workers: Vec<WorkerHandle>,
    backoff: Box<dyn Backoff>,
    status: watch::Sender<SupervisorStatus>,
    closed: bool,
}

impl<C: BusConnection> Supervisor<C> {
    pub fn new<B: Backoff + 'static>(connection: Arc<C>, backoff: B) -> Self {
        let (status, _) = watch::channel(SupervisorStatus {
            state: ConnectionState::Disconnected,
            reconnect_attempt: 0,
            workers: 0,
            started: false,
        });

        Self {
            connection,
            workers: Vec::new(),
            backoff: Box::new(backoff),
            status,
            closed: false,
        }
    }

    /// Register a worker; registration order is start and stop order
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register<W: Worker>(&mut self, worker: W) -> Result<(), SupervisorError> {
        if self.closed {
            return Err(SupervisorError::ShutDown);
        }

        info!(worker = %worker.name(), "Registering worker");
        self.workers.push(WorkerHandle::spawn(Box::new(worker)));
        let count = self.workers.len();
        self.status.send_modify(|status| status.workers = count);
        Ok(())
    }

    /// Names of the registered workers, in registration order
    pub fn worker_names(&self) -> Vec<&str> {
        self.workers.iter().map(WorkerHandle::name).collect()
    }

    /// Subscribe to status changes
    pub fn status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    /// Run the supervision loop
    ///
    /// Fatal connect errors are forwarded to `errors` and are not retried.
    /// Returns once `shutdown` turns `true` or its sender goes away; workers
    /// are left as they are, call [`Supervisor::shutdown`] to close them.
    pub async fn start(
        &mut self,
        errors: mpsc::UnboundedSender<BusError>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), SupervisorError> {
        if self.closed {
            return Err(SupervisorError::ShutDown);
        }

        let span = crate::supervisor_span!(workers = self.workers.len());
        self.run(errors, shutdown).instrument(span).await;
        Ok(())
    }

    async fn run(
        &mut self,
        errors: mpsc::UnboundedSender<BusError>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<DisconnectionSource>();
        let mut first_start = !self.status.borrow().started;
        let mut attempt: u32 = 0;

        info!("Supervisor starting");
        self.publish(ConnectionState::Connecting, attempt);

        let mut armed: Option<DisconnectionSource> = None;
        let mut connect_task = Some(self.spawn_connect(ready_tx.clone(), errors.clone()));

        loop {
            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => {
                    info!("Shutdown requested, leaving supervision loop");
                    break;
                }

                Some(source) = ready_rx.recv() => {
                    connect_task = None;
                    attempt = 0;
                    metrics().connection_established();
                    metrics().reconnect_cleared();
                    info!("Bus connected");

                    for worker in &self.workers {
                        if first_start {
                            worker.start();
                        } else {
                            worker.restart();
                        }
                    }
                    first_start = false;

                    debug_assert!(armed.is_none(), "disconnection source armed twice");
                    armed = Some(source);
                    self.status.send_modify(|status| status.started = true);
                    self.publish(ConnectionState::Connected, attempt);
                }

                lost = next_disconnection(&mut armed) => {
                    // Disarm before anything else can observe the drop
                    armed = None;
                    metrics().disconnection();
                    warn!(reason = %lost.reason, "Bus connection lost, stopping workers");
                    self.publish(ConnectionState::Disconnected, attempt);

                    if let Err(e) = self.reset().await {
                        warn!(error = %e, "Some workers failed to stop");
                    }

                    attempt = attempt.saturating_add(1);
                    self.status.send_modify(|status| status.reconnect_attempt = attempt);
                    let delay = self.backoff.delay(attempt);
                    metrics().reconnect_scheduled(attempt);
                    info!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Waiting before reconnecting"
                    );

                    if !interruptible_sleep(&mut shutdown, delay).await {
                        info!("Shutdown requested during reconnect backoff");
                        break;
                    }

                    self.publish(ConnectionState::Connecting, attempt);
                    connect_task = Some(self.spawn_connect(ready_tx.clone(), errors.clone()));
                }
            }
        }

        if let Some(task) = connect_task.take() {
            task.abort();
        }
        self.publish(ConnectionState::Disconnected, attempt);
        info!("Supervisor stopped");
    }

    fn spawn_connect(
        &self,
        ready: mpsc::UnboundedSender<DisconnectionSource>,
        errors: mpsc::UnboundedSender<BusError>,
    ) -> JoinHandle<()> {
        let connection = self.connection.clone();
        metrics().connection_attempt();

        let span = crate::bus_span!(operation = "connect");
        tokio::spawn(
            async move {
                match connection.connect().await {
                    Ok(()) => {
                        // Subscribed only once connected; anything sent
                        // while connecting belongs to an older link
                        let _ = ready.send(connection.disconnections());
                    }
                    Err(e) => {
                        metrics().connection_failed();
                        error!(error = %e, "Fatal bus connection error");
                        if errors.send(e).is_err() {
                            debug!("Error sink closed, fatal connect error dropped");
                        }
                    }
                }
            }
            .instrument(span),
        )
    }

    fn publish(&self, state: ConnectionState, attempt: u32) {
        metrics().set_supervisor_state(state.as_str());
        self.status.send_modify(|status| {
            status.state = state;
            status.reconnect_attempt = attempt;
        });
    }

    /// Stop every worker in registration order, waiting for each stop
    ///
    /// Keeps going past failures and reports all of them together.
    pub async fn reset(&self) -> Result<(), SupervisorError> {
        if self.closed {
            return Ok(());
        }

        let mut failures = Vec::new();
        for worker in &self.workers {
            if let Err(error) = worker.stop().await {
                warn!(worker = %worker.name(), error = %error, "Failed to stop worker");
                failures.push(WorkerFailure {
                    worker: worker.name().to_string(),
                    error,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::WorkerLifecycle { failures })
        }
    }

    /// Close every worker exactly once; later calls are no-ops
    pub async fn shutdown(&mut self) -> Result<(), SupervisorError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!(workers = self.workers.len(), "Shutting down workers");

        let mut failures = Vec::new();
        for worker in &self.workers {
            if let Err(error) = worker.close().await {
                error!(worker = %worker.name(), error = %error, "Failed to close worker");
                failures.push(WorkerFailure {
                    worker: worker.name().to_string(),
                    error,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::WorkerLifecycle { failures })
        }
    }

    /// Whether `shutdown` has run
    pub fn is_shut_down(&self) -> bool {
        self.closed
    }
}

/// Resolve with the next notification of an armed source; pend while disarmed
async fn next_disconnection(source: &mut Option<DisconnectionSource>) -> ConnectionLost {
    let Some(receiver) = source.as_mut() else {
        return std::future::pending().await;
    };

    loop {
        match receiver.recv().await {
            Ok(lost) => return lost,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Disconnection source lagged");
            }
            Err(RecvError::Closed) => return ConnectionLost::new("Disconnection source closed"),
        }
    }
}

/// Resolve once shutdown is requested; a dropped sender counts as a request
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `delay`; returns false if shutdown was requested first
async fn interruptible_sleep(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown_requested(shutdown) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
