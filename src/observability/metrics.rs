//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! operational statistics across the bus connection, the supervisor and its
//! workers.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Bus connection metrics
    bus_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    disconnections: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    connection_start_time: AtomicU64,

    // Reconnection metrics
    reconnect_attempt: AtomicU64,
    reconnects: AtomicU64,

    // Keepalive metrics
    keepalives_published: AtomicU64,
    keepalive_failures: AtomicU64,
    last_keepalive: AtomicU64,

    // Per-worker lifecycle counters, keyed by worker name
    worker_stats: Mutex<BTreeMap<String, WorkerStats>>,

    // Lifecycle metrics
    supervisor_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
}

/// Lifecycle operation counted per worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    Started,
    Restarted,
    Stopped,
    Closed,
    Failed,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let now = current_timestamp();

        Self {
            bus_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            disconnections: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            reconnect_attempt: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            keepalives_published: AtomicU64::new(0),
            keepalive_failures: AtomicU64::new(0),
            last_keepalive: AtomicU64::new(0),
            worker_stats: Mutex::new(BTreeMap::new()),
            supervisor_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(now),
            state_transitions: AtomicU64::new(0),
        }
    }

    // Bus connection metrics
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.bus_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.bus_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn disconnection(&self) {
        self.disconnections.fetch_add(1, Ordering::Relaxed);
        self.bus_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn bus_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bus_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Reconnection metrics
    /// Record the attempt number of the reconnect about to be scheduled
    pub fn reconnect_scheduled(&self, attempt: u32) {
        self.reconnect_attempt
            .store(u64::from(attempt), Ordering::Relaxed);
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_cleared(&self) {
        self.reconnect_attempt.store(0, Ordering::Relaxed);
    }

    // Keepalive metrics
    pub fn keepalive_published(&self) {
        self.keepalives_published.fetch_add(1, Ordering::Relaxed);
        self.last_keepalive
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn keepalive_failed(&self) {
        self.keepalive_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Worker metrics
    pub fn worker_event(&self, worker: &str, event: WorkerEvent) {
        if let Ok(mut stats) = self.worker_stats.lock() {
            let entry = stats.entry(worker.to_string()).or_default();
            match event {
                WorkerEvent::Started => entry.starts += 1,
                WorkerEvent::Restarted => entry.restarts += 1,
                WorkerEvent::Stopped => entry.stops += 1,
                WorkerEvent::Closed => entry.closes += 1,
                WorkerEvent::Failed => entry.failures += 1,
            }
        }
    }

    // Lifecycle metrics
    pub fn set_supervisor_state(&self, state: &str) {
        if let Ok(mut current_state) = self.supervisor_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        self.bus_connected.store(false, Ordering::Relaxed);
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.disconnections,
            &self.messages_published,
            &self.publish_failures,
            &self.connection_start_time,
            &self.reconnect_attempt,
            &self.reconnects,
            &self.keepalives_published,
            &self.keepalive_failures,
            &self.last_keepalive,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);

        if let Ok(mut stats) = self.worker_stats.lock() {
            stats.clear();
        }
        if let Ok(mut state) = self.supervisor_state.lock() {
            *state = "initializing".to_string();
        }
    }

    /// Calculate connection duration (pure function)
    fn calculate_connection_duration(&self, now: u64) -> u64 {
        if !self.bus_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    fn build_worker_metrics(&self) -> WorkerMetrics {
        let per_worker = self
            .worker_stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default();

        let mut totals = WorkerStats::default();
        for stats in per_worker.values() {
            totals.starts += stats.starts;
            totals.restarts += stats.restarts;
            totals.stops += stats.stops;
            totals.closes += stats.closes;
            totals.failures += stats.failures;
        }

        WorkerMetrics { per_worker, totals }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();

        let current_state = self
            .supervisor_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string());

        MetricsSnapshot {
            bus: BusMetrics {
                connected: self.bus_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                disconnections: self.disconnections.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            reconnect: ReconnectMetrics {
                current_attempt: self.reconnect_attempt.load(Ordering::Relaxed),
                total_reconnects: self.reconnects.load(Ordering::Relaxed),
            },
            keepalive: KeepaliveMetrics {
                published: self.keepalives_published.load(Ordering::Relaxed),
                failures: self.keepalive_failures.load(Ordering::Relaxed),
                last_published: self.last_keepalive.load(Ordering::Relaxed),
            },
            workers: self.build_worker_metrics(),
            lifecycle: LifecycleMetrics {
                current_state,
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub bus: BusMetrics,
    pub reconnect: ReconnectMetrics,
    pub keepalive: KeepaliveMetrics,
    pub workers: WorkerMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct BusMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub disconnections: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct ReconnectMetrics {
    /// Consecutive attempts since the last successful connect
    pub current_attempt: u64,
    pub total_reconnects: u64,
}

#[derive(Debug, Serialize)]
pub struct KeepaliveMetrics {
    pub published: u64,
    pub failures: u64,
    pub last_published: u64,
}

#[derive(Debug, Serialize)]
pub struct WorkerMetrics {
    pub per_worker: BTreeMap<String, WorkerStats>,
    pub totals: WorkerStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub starts: u64,
    pub restarts: u64,
    pub stops: u64,
    pub closes: u64,
    pub failures: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
