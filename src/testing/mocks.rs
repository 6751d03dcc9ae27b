//! Mock implementations for testing
//!
//! Provides a scripted bus connection, a recording worker and an in-memory
//! publisher, so supervision can be tested without an MQTT broker.

use crate::transport::{
    disconnection_channel, BusConnection, BusError, ConnectionLost, DisconnectionSource,
    Publisher,
};
use crate::worker::{Worker, WorkerError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

pub type PublishedMessage = (String, Vec<u8>);

/// Lifecycle call observed on a [`RecordingWorker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCall {
    Start,
    Stop,
    Restart,
    Close,
}

/// One entry of a shared [`CallTrace`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Worker { name: String, call: WorkerCall },
    Connect,
}

/// Ordered log shared between mocks
#[derive(Debug, Clone, Default)]
pub struct CallTrace {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl CallTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: TraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Calls seen by one worker, in order
    pub fn calls_for(&self, name: &str) -> Vec<WorkerCall> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TraceEvent::Worker { name: n, call } if n == name => Some(call),
                _ => None,
            })
            .collect()
    }

    /// How many times `call` was seen across all workers
    pub fn count(&self, call: WorkerCall) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, TraceEvent::Worker { call: c, .. } if *c == call))
            .count()
    }

    pub fn connects(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, TraceEvent::Connect))
            .count()
    }
}

/// Worker that records every lifecycle call
pub struct RecordingWorker {
    name: String,
    trace: CallTrace,
    delay: Option<Duration>,
    fail_on: Option<WorkerCall>,
}

impl RecordingWorker {
    /// Create a worker with its own trace
    pub fn new(name: &str) -> (Self, CallTrace) {
        let trace = CallTrace::new();
        (Self::with_trace(name, &trace), trace)
    }

    /// Create a worker recording into a shared trace
    pub fn with_trace(name: &str, trace: &CallTrace) -> Self {
        Self {
            name: name.to_string(),
            trace: trace.clone(),
            delay: None,
            fail_on: None,
        }
    }

    /// Take `delay` to complete every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every call of this kind
    pub fn failing_on(mut self, call: WorkerCall) -> Self {
        self.fail_on = Some(call);
        self
    }

    async fn handle(&mut self, call: WorkerCall) -> Result<(), WorkerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.trace.record(TraceEvent::Worker {
            name: self.name.clone(),
            call,
        });

        if self.fail_on == Some(call) {
            Err(WorkerError::failed(format!("{call:?} failed on purpose")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Worker for RecordingWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<(), WorkerError> {
        self.handle(WorkerCall::Start).await
    }

    async fn stop(&mut self) -> Result<(), WorkerError> {
        self.handle(WorkerCall::Stop).await
    }

    async fn restart(&mut self) -> Result<(), WorkerError> {
        self.handle(WorkerCall::Restart).await
    }

    async fn close(&mut self) -> Result<(), WorkerError> {
        self.handle(WorkerCall::Close).await
    }
}

/// Scripted result of one connect attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Ready,
    Fatal(String),
    /// Never resolves
    Hang,
}

/// Bus connection driven by the test
///
/// Connect attempts consume scripted outcomes, falling back to `Ready`.
#[derive(Debug)]
pub struct MockConnection {
    outcomes: Mutex<VecDeque<ConnectOutcome>>,
    attempts: Mutex<Vec<Instant>>,
    lost_tx: broadcast::Sender<ConnectionLost>,
    trace: Option<CallTrace>,
    connect_delay: Option<Duration>,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(Vec::new()),
            lost_tx: disconnection_channel(),
            trace: None,
            connect_delay: None,
        }
    }

    pub fn with_outcomes(outcomes: Vec<ConnectOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            ..Self::new()
        }
    }

    /// Record connect attempts into a shared trace
    pub fn with_trace(mut self, trace: &CallTrace) -> Self {
        self.trace = Some(trace.clone());
        self
    }

    /// Take `delay` before every connect attempt resolves
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn connect_count(&self) -> usize {
        self.attempts.lock().map(|a| a.len()).unwrap_or_default()
    }

    /// When each connect attempt started (Tokio clock)
    pub fn connect_instants(&self) -> Vec<Instant> {
        self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Drop the connection; returns how many sources observed it
    pub fn disconnect(&self, reason: &str) -> usize {
        self.lost_tx
            .send(ConnectionLost::new(reason))
            .unwrap_or_default()
    }

    /// Number of live disconnection sources
    pub fn source_count(&self) -> usize {
        self.lost_tx.receiver_count()
    }
}

#[async_trait]
impl BusConnection for MockConnection {
    async fn connect(&self) -> Result<(), BusError> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(Instant::now());
        }
        if let Some(trace) = &self.trace {
            trace.record(TraceEvent::Connect);
        }

        let outcome = self
            .outcomes
            .lock()
            .ok()
            .and_then(|mut outcomes| outcomes.pop_front())
            .unwrap_or(ConnectOutcome::Ready);

        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            ConnectOutcome::Ready => Ok(()),
            ConnectOutcome::Fatal(message) => Err(BusError::ConnectionFailed(message)),
            ConnectOutcome::Hang => std::future::pending().await,
        }
    }

    fn disconnections(&self) -> DisconnectionSource {
        self.lost_tx.subscribe()
    }
}

/// In-memory publisher
#[derive(Debug, Default)]
pub struct MockPublisher {
    published: Mutex<Vec<PublishedMessage>>,
    attempts: AtomicUsize,
    should_fail: bool,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publisher whose every publish fails
    pub fn failing() -> Self {
        Self {
            should_fail: true,
            ..Self::default()
        }
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().map(|p| p.len()).unwrap_or_default()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.should_fail {
            return Err(BusError::NotConnected);
        }

        if let Ok(mut published) = self.published.lock() {
            published.push((topic.to_string(), payload));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_connection_scripted_outcomes() {
        let connection = MockConnection::with_outcomes(vec![ConnectOutcome::Fatal(
            "bad credentials".to_string(),
        )]);

        assert!(matches!(
            connection.connect().await,
            Err(BusError::ConnectionFailed(_))
        ));
        assert!(connection.connect().await.is_ok());
        assert_eq!(connection.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_connection_disconnect_reaches_sources() {
        let connection = MockConnection::new();
        assert_eq!(connection.disconnect("nobody listening"), 0);

        let mut source = connection.disconnections();
        assert_eq!(connection.source_count(), 1);
        assert_eq!(connection.disconnect("broker restart"), 1);
        assert_eq!(source.recv().await.unwrap().reason, "broker restart");
    }

    #[tokio::test]
    async fn test_recording_worker_shares_trace() {
        let trace = CallTrace::new();
        let mut a = RecordingWorker::with_trace("a", &trace);
        let mut b = RecordingWorker::with_trace("b", &trace).failing_on(WorkerCall::Stop);

        a.start().await.unwrap();
        assert!(b.stop().await.is_err());

        assert_eq!(trace.calls_for("a"), vec![WorkerCall::Start]);
        assert_eq!(trace.calls_for("b"), vec![WorkerCall::Stop]);
        assert_eq!(trace.count(WorkerCall::Stop), 1);
    }

    #[tokio::test]
    async fn test_mock_publisher_records() {
        let publisher = MockPublisher::new();
        publisher.publish("keepalives/a", b"{}".to_vec()).await.unwrap();

        assert_eq!(publisher.published_count(), 1);
        assert_eq!(publisher.published()[0].0, "keepalives/a");
    }
}
