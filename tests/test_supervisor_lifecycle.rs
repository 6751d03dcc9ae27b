//! Supervision lifecycle tests
//!
//! Drive a supervisor against a scripted connection on a paused clock and
//! check the order of worker lifecycle calls across connect, disconnect,
//! backoff and shutdown.


use busagent::supervisor::{BackoffPolicy, ConnectionState, SupervisorError};
use busagent::testing::mocks::{ConnectOutcome, MockConnection, TraceEvent, WorkerCall};
use busagent::transport::BusError;
use std::time::Duration;
use test_helpers::{settle, spawn_supervisor};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use ConnectionState::{Connected, Connecting, Disconnected};
use WorkerCall::{Close, Restart, Start, Stop};

fn position(events: &[TraceEvent], wanted: &TraceEvent) -> usize {
    events
        .iter()
        .position(|event| event == wanted)
        .unwrap_or_else(|| panic!("{wanted:?} not in trace: {events:?}"))
}

fn worker_event(name: &str, call: WorkerCall) -> TraceEvent {
    TraceEvent::Worker {
        name: name.to_string(),
        call,
    }
}

#[tokio::test(start_paused = true)]
async fn test_first_connect_starts_every_worker() {
    let mut h = spawn_supervisor(MockConnection::new(), &["a", "b", "c"], BackoffPolicy::default());

    h.wait_for_state(Connected).await;
    settle().await;

    for name in ["a", "b", "c"] {
        assert_eq!(h.trace.calls_for(name), vec![Start]);
    }
    assert!(h.status.borrow().started);
    assert_eq!(h.connection.connect_count(), 1);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_single_worker_sees_start_stop_restart() {
    let mut h = spawn_supervisor(MockConnection::new(), &["keepalive"], BackoffPolicy::default());

    h.wait_for_state(Connected).await;
    h.connection.disconnect("broker restart");
    h.wait_for_state(Disconnected).await;
    h.wait_for_state(Connected).await;
    settle().await;

    assert_eq!(h.trace.calls_for("keepalive"), vec![Start, Stop, Restart]);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_later_connects_only_restart() {
    let mut h = spawn_supervisor(MockConnection::new(), &["a", "b", "c"], BackoffPolicy::default());

    h.wait_for_state(Connected).await;
    for _ in 0..2 {
        settle().await;
        h.connection.disconnect("link down");
        h.wait_for_state(Disconnected).await;
        h.wait_for_state(Connected).await;
    }
    settle().await;

    for name in ["a", "b", "c"] {
        assert_eq!(
            h.trace.calls_for(name),
            vec![Start, Stop, Restart, Stop, Restart]
        );
    }
    assert_eq!(h.connection.connect_count(), 3);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_workers_stop_in_order_before_reconnect() {
    let mut h = spawn_supervisor(MockConnection::new(), &["a", "b"], BackoffPolicy::default());

    h.wait_for_state(Connected).await;
    settle().await;
    h.connection.disconnect("broker restart");
    h.wait_for_state(Disconnected).await;
    h.wait_for_state(Connected).await;
    settle().await;

    let events = h.trace.events();
    let connects: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, event)| **event == TraceEvent::Connect)
        .map(|(index, _)| index)
        .collect();
    assert_eq!(connects.len(), 2);

    let stop_a = position(&events, &worker_event("a", Stop));
    let stop_b = position(&events, &worker_event("b", Stop));
    assert!(stop_a < stop_b, "stops out of registration order: {events:?}");
    assert!(stop_b < connects[1], "reconnected before stops finished: {events:?}");
    assert!(position(&events, &worker_event("a", Restart)) > connects[1]);
    assert!(position(&events, &worker_event("b", Restart)) > connects[1]);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_reconnect_before_backoff_elapses() {
    let mut h = spawn_supervisor(MockConnection::new(), &["a"], BackoffPolicy::default());

    h.wait_for_state(Connected).await;
    let dropped_at = Instant::now();
    h.connection.disconnect("broker restart");
    h.wait_for_state(Disconnected).await;

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(h.connection.connect_count(), 1);
    assert_eq!(h.status.borrow().state, Disconnected);
    assert_eq!(h.status.borrow().reconnect_attempt, 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.connection.connect_count(), 2);

    let instants = h.connection.connect_instants();
    assert!(instants[1] - dropped_at >= Duration::from_secs(10));

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_custom_backoff_is_consulted_per_attempt() {
    let schedule = |attempt: u32| Duration::from_secs(u64::from(attempt));
    let mut h = spawn_supervisor(MockConnection::new(), &["a"], schedule);

    h.wait_for_state(Connected).await;
    h.connection.disconnect("first");
    h.wait_for_state(Disconnected).await;
    h.wait_for_state(Connected).await;

    // Attempt counter resets once connected, so the next delay is one second again
    assert_eq!(h.status.borrow().reconnect_attempt, 0);
    settle().await;
    h.connection.disconnect("second");
    h.wait_for_state(Disconnected).await;
    h.wait_for_state(Connected).await;

    let instants = h.connection.connect_instants();
    assert_eq!(instants.len(), 3);
    assert_eq!(instants[1] - instants[0], Duration::from_secs(1));
    assert_eq!(instants[2] - instants[1], Duration::from_secs(1));

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnection_source_armed_only_while_connected() {
    let mut h = spawn_supervisor(MockConnection::new(), &["a"], BackoffPolicy::default());

    h.wait_for_state(Connected).await;
    assert_eq!(h.connection.source_count(), 1);

    h.connection.disconnect("broker restart");
    h.wait_for_state(Disconnected).await;
    settle().await;
    assert_eq!(h.connection.source_count(), 0);

    h.wait_for_state(Connected).await;
    assert_eq!(h.connection.source_count(), 1);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_rapid_disconnects_produce_one_stop_cycle() {
    let mut h = spawn_supervisor(MockConnection::new(), &["a"], BackoffPolicy::default());

    h.wait_for_state(Connected).await;
    settle().await;
    assert_eq!(h.connection.disconnect("first"), 1);
    h.connection.disconnect("second");
    h.wait_for_state(Disconnected).await;
    h.wait_for_state(Connected).await;
    settle().await;

    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.trace.count(Stop), 1);
    assert_eq!(h.connection.connect_count(), 2);
    assert_eq!(h.status.borrow().state, Connected);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_drop_while_connecting_is_ignored() {
    let connection = MockConnection::new().with_connect_delay(Duration::from_secs(2));
    let mut h = spawn_supervisor(connection, &["a"], BackoffPolicy::default());

    h.wait_for_state(Connected).await;
    settle().await;
    h.connection.disconnect("broker restart");
    h.wait_for_state(Disconnected).await;
    h.wait_for_state(Connecting).await;

    // Halfway through the second connect attempt
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.connection.source_count(), 0);
    assert_eq!(h.connection.disconnect("stale duplicate"), 0);

    h.wait_for_state(Connected).await;
    settle().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.trace.calls_for("a"), vec![Start, Stop, Restart]);
    assert_eq!(h.connection.connect_count(), 2);
    assert_eq!(h.status.borrow().state, Connected);
    assert_eq!(h.connection.source_count(), 1);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_zero_workers_cycle() {
    let mut h = spawn_supervisor(MockConnection::new(), &[], BackoffPolicy::default());

    h.wait_for_state(Connected).await;
    h.connection.disconnect("broker restart");
    h.wait_for_state(Disconnected).await;
    h.wait_for_state(Connected).await;

    assert_eq!(h.connection.connect_count(), 2);
    assert!(h.trace.calls_for("anything").is_empty());

    let mut supervisor = h.stop().await;
    supervisor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fatal_connect_error_reaches_sink() {
    let connection = MockConnection::with_outcomes(vec![ConnectOutcome::Fatal(
        "not authorized".to_string(),
    )]);
    let mut h = spawn_supervisor(connection, &["a"], BackoffPolicy::default());

    let error = h.errors.recv().await.unwrap();
    assert!(matches!(error, BusError::ConnectionFailed(ref m) if m == "not authorized"));

    // Not retried; workers never started
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connection.connect_count(), 1);
    assert_eq!(h.status.borrow().state, Connecting);
    assert!(h.trace.calls_for("a").is_empty());

    let mut supervisor = h.stop().await;
    supervisor.shutdown().await.unwrap();
    assert_eq!(supervisor.worker_names(), vec!["a"]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_each_worker_once() {
    let mut h = spawn_supervisor(MockConnection::new(), &["a", "b"], BackoffPolicy::default());

    h.wait_for_state(Connected).await;
    settle().await;
    let trace = h.trace.clone();
    let mut status = h.status.clone();

    let mut supervisor = h.stop().await;
    assert_eq!(status.borrow_and_update().state, Disconnected);

    supervisor.shutdown().await.unwrap();
    supervisor.shutdown().await.unwrap();

    assert_eq!(trace.calls_for("a"), vec![Start, Close]);
    assert_eq!(trace.calls_for("b"), vec![Start, Close]);
    assert!(supervisor.is_shut_down());

    let (errors, _fatal) = mpsc::unbounded_channel();
    let (_stop, shutdown) = watch::channel(false);
    assert!(matches!(
        supervisor.start(errors, shutdown).await,
        Err(SupervisorError::ShutDown)
    ));
    // Reset after shutdown does not touch closed workers
    supervisor.reset().await.unwrap();
    assert_eq!(trace.count(Close), 2);
    assert_eq!(trace.count(Stop), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_backoff() {
    let mut h = spawn_supervisor(MockConnection::new(), &["a"], BackoffPolicy::default());

    h.wait_for_state(Connected).await;
    h.connection.disconnect("broker restart");
    h.wait_for_state(Disconnected).await;
    settle().await;

    let connection = h.connection.clone();
    let trace = h.trace.clone();
    let before = Instant::now();
    let mut supervisor = h.stop().await;

    assert!(Instant::now() - before < Duration::from_secs(10));
    assert_eq!(connection.connect_count(), 1);

    supervisor.shutdown().await.unwrap();
    assert_eq!(trace.calls_for("a"), vec![Start, Stop, Close]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_connect_in_flight() {
    let connection = MockConnection::with_outcomes(vec![ConnectOutcome::Hang]);
    let mut h = spawn_supervisor(connection, &["a"], BackoffPolicy::default());

    h.wait_for_state(Connecting).await;
    settle().await;
    let trace = h.trace.clone();

    let mut supervisor = h.stop().await;
    supervisor.shutdown().await.unwrap();

    assert_eq!(trace.calls_for("a"), vec![Close]);
    assert_eq!(trace.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_shutdown_sender_stops_loop() {
    let trace = busagent::testing::mocks::CallTrace::new();
    let connection = std::sync::Arc::new(MockConnection::new());
    let mut supervisor = busagent::Supervisor::new(connection, BackoffPolicy::default());
    supervisor
        .register(busagent::testing::mocks::RecordingWorker::with_trace("a", &trace))
        .unwrap();

    let (errors, _fatal) = mpsc::unbounded_channel();
    let (stop, shutdown) = watch::channel(false);
    drop(stop);

    supervisor.start(errors, shutdown).await.unwrap();
    supervisor.shutdown().await.unwrap();
    assert_eq!(trace.calls_for("a").last(), Some(&Close));
}

#[tokio::test(start_paused = true)]
async fn test_reset_with_idle_workers_is_harmless() {
    let mut h = spawn_supervisor(
        MockConnection::with_outcomes(vec![ConnectOutcome::Hang]),
        &["a", "b"],
        BackoffPolicy::default(),
    );
    h.wait_for_state(Connecting).await;
    let trace = h.trace.clone();

    let mut supervisor = h.stop().await;
    supervisor.reset().await.unwrap();
    supervisor.reset().await.unwrap();

    assert_eq!(trace.calls_for("a"), vec![Stop, Stop]);
    assert_eq!(trace.calls_for("b"), vec![Stop, Stop]);

    supervisor.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_loop_returns_resumes_with_restart() {
    let mut h = spawn_supervisor(MockConnection::new(), &["a"], BackoffPolicy::default());
    h.wait_for_state(Connected).await;
    settle().await;
    let trace = h.trace.clone();

    let mut supervisor = h.stop().await;
    let mut status = supervisor.status();

    let (errors, _fatal) = mpsc::unbounded_channel();
    let (stop, shutdown) = watch::channel(false);
    let task = tokio::spawn(async move {
        let outcome = supervisor.start(errors, shutdown).await;
        (supervisor, outcome)
    });

    status.wait_for(|s| s.state == Connected).await.unwrap();
    settle().await;
    stop.send(true).unwrap();
    let (mut supervisor, outcome) = task.await.unwrap();
    outcome.unwrap();
    supervisor.shutdown().await.unwrap();

    assert_eq!(trace.calls_for("a"), vec![Start, Restart, Close]);
}
