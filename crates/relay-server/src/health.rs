//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live pooled connections.
    pub connections: usize,
    /// State machines tracked by the registry.
    pub tracked_connections: usize,
    /// Users currently in degraded mode.
    pub degraded_users: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    connections: usize,
    tracked_connections: usize,
    degraded_users: usize,
) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        tracked_connections,
        degraded_users,
    }
}
