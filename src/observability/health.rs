//! Health check HTTP server for container orchestration
//!
//! Serves the supervisor's view of the bus connection and the process
//! metrics. Readiness follows the connection state; liveness is always true
//! while the process answers.

use crate::error::{AgentError, AgentResult};
use crate::observability::metrics::metrics;
use crate::supervisor::{ConnectionState, SupervisorStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    agent_id: String,
    port: u16,
    status: watch::Receiver<SupervisorStatus>,
    keepalive_staleness: Option<Duration>,
}

impl HealthServer {
    pub fn new(agent_id: String, port: u16, status: watch::Receiver<SupervisorStatus>) -> Self {
        Self {
            agent_id,
            port,
            status,
            keepalive_staleness: None,
        }
    }

    /// Report keepalives as stale when none was published for this long
    pub fn with_keepalive_staleness(mut self, threshold: Duration) -> Self {
        self.keepalive_staleness = Some(threshold);
        self
    }

    /// Build the route tree
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self.clone();

        // GET /health - overall status with per-component checks
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = health_server.clone();
                async move {
                    let status = server.get_health_status();
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        // GET /ready - readiness probe
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let ready = ready_server.status.borrow().state == ConnectionState::Connected;
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&response), code)
            });

        // GET /live - liveness probe
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
    }

    /// Bind the listening socket and return the bound address with the
    /// serving future; spawn the future to serve until the process exits
    pub fn bind(
        self: Arc<Self>,
    ) -> AgentResult<(SocketAddr, impl Future<Output = ()> + Send + 'static)> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let (bound, serving) = warp::serve(self.routes())
            .try_bind_ephemeral(addr)
            .map_err(|e| AgentError::health(format!("Failed to bind {addr}: {e}")))?;

        tracing::info!(addr = %bound, "Health server listening");
        Ok((bound, serving))
    }

    fn get_health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let snapshot = metrics().get_metrics();
        let supervisor = self.status.borrow().clone();

        let mut checks = BTreeMap::new();
        checks.insert("bus".to_string(), Self::check_bus(&supervisor, now));
        if let Some(threshold) = self.keepalive_staleness {
            checks.insert(
                "keepalive".to_string(),
                Self::check_keepalive(
                    &supervisor,
                    snapshot.keepalive.last_published,
                    threshold,
                    now,
                ),
            );
        }

        let overall = if checks.values().all(|check| check.status == "healthy") {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: overall.to_string(),
            timestamp: now,
            agent_id: self.agent_id.clone(),
            uptime_seconds: snapshot.lifecycle.uptime_seconds,
            supervisor,
            checks,
        }
    }

    fn check_bus(status: &SupervisorStatus, now: u64) -> HealthCheck {
        let (state, message) = match status.state {
            ConnectionState::Connected => ("healthy", "Bus connection established".to_string()),
            ConnectionState::Connecting => (
                "unhealthy",
                format!("Connecting (reconnect attempt {})", status.reconnect_attempt),
            ),
            ConnectionState::Disconnected => ("unhealthy", "Bus disconnected".to_string()),
        };

        HealthCheck {
            status: state.to_string(),
            message: Some(message),
            last_check: now,
        }
    }

    fn check_keepalive(
        status: &SupervisorStatus,
        last_published: u64,
        threshold: Duration,
        now: u64,
    ) -> HealthCheck {
        let (state, message) = if status.state != ConnectionState::Connected {
            ("healthy", "Keepalives paused while disconnected".to_string())
        } else if last_published == 0 {
            ("healthy", "No keepalive published yet".to_string())
        } else {
            let age = now.saturating_sub(last_published);
            if age > threshold.as_secs() {
                ("stale", format!("No keepalive for {age} seconds"))
            } else {
                ("healthy", "Recent keepalive".to_string())
            }
        };

        HealthCheck {
            status: state.to_string(),
            message: Some(message),
            last_check: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    agent_id: String,
    uptime_seconds: u64,
    supervisor: SupervisorStatus,
    checks: BTreeMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: ConnectionState) -> SupervisorStatus {
        SupervisorStatus {
            state,
            reconnect_attempt: 0,
            workers: 1,
            started: true,
        }
    }

    fn server(
        state: ConnectionState,
    ) -> (Arc<HealthServer>, watch::Sender<SupervisorStatus>) {
        let (tx, rx) = watch::channel(status(state));
        (
            Arc::new(HealthServer::new("web-01".to_string(), 8080, rx)),
            tx,
        )
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let (_tx, rx) = watch::channel(status(ConnectionState::Connected));
        let server = Arc::new(HealthServer::new("web-01".to_string(), 0, rx));

        let (addr, serving) = server.bind().unwrap();
        assert_ne!(addr.port(), 0);
        drop(serving);
    }

    #[tokio::test]
    async fn test_bind_port_in_use_is_health_error() {
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let (_tx, rx) = watch::channel(status(ConnectionState::Connected));
        let server = Arc::new(HealthServer::new("web-01".to_string(), port, rx));

        match server.bind() {
            Err(error @ AgentError::Health { .. }) => assert_eq!(error.exit_code(), 1),
            Err(other) => panic!("expected health error, got {other}"),
            Ok(_) => panic!("bind should fail while the port is taken"),
        }
    }

    #[tokio::test]
    async fn test_ready_follows_connection_state() {
        let (server, tx) = server(ConnectionState::Connecting);
        let routes = server.routes();

        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        tx.send(status(ConnectionState::Connected)).unwrap();
        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_live_always_ok() {
        let (server, _tx) = server(ConnectionState::Disconnected);
        let response = warp::test::request()
            .path("/live")
            .reply(&server.routes())
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["alive"], true);
    }

    #[tokio::test]
    async fn test_health_reports_supervisor_status() {
        let (server, _tx) = server(ConnectionState::Connected);
        let response = warp::test::request()
            .path("/health")
            .reply(&server.routes())
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["agent_id"], "web-01");
        assert_eq!(body["supervisor"]["state"], "connected");
        assert_eq!(body["checks"]["bus"]["status"], "healthy");
    }

    #[tokio::test]
    async fn test_health_degraded_while_disconnected() {
        let (server, _tx) = server(ConnectionState::Disconnected);
        let response = warp::test::request()
            .path("/health")
            .reply(&server.routes())
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (server, _tx) = server(ConnectionState::Connected);
        let response = warp::test::request()
            .path("/metrics")
            .reply(&server.routes())
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body.get("bus").is_some());
        assert!(body.get("workers").is_some());
    }

    #[test]
    fn test_keepalive_check() {
        let now = 10_000;
        let threshold = Duration::from_secs(15);
        let connected = status(ConnectionState::Connected);

        let fresh = HealthServer::check_keepalive(&connected, now - 5, threshold, now);
        assert_eq!(fresh.status, "healthy");

        let stale = HealthServer::check_keepalive(&connected, now - 60, threshold, now);
        assert_eq!(stale.status, "stale");

        let disconnected = status(ConnectionState::Disconnected);
        let paused = HealthServer::check_keepalive(&disconnected, now - 60, threshold, now);
        assert_eq!(paused.status, "healthy");
    }
}
