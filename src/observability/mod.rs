//! Observability: structured logging, process metrics and the health endpoint

pub mod health;
pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot, WorkerEvent};

// Span macros for structured logging
pub use logging::{bus_span, supervisor_span, worker_span};
