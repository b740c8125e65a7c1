//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at server startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Upgrades refused (counter, labels: reason).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "ws_connections_rejected_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connection lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Successful state transitions (counter, labels: to).
pub const WS_STATE_TRANSITIONS_TOTAL: &str = "ws_state_transitions_total";
/// Rejected state transitions (counter).
pub const WS_STATE_TRANSITIONS_REJECTED_TOTAL: &str = "ws_state_transitions_rejected_total";
/// Live user emitters (gauge).
pub const EMITTERS_ACTIVE: &str = "emitters_active";
/// Events accepted onto an emitter queue (counter, labels: event_type).
pub const EMITTER_EVENTS_ENQUEUED_TOTAL: &str = "emitter_events_enqueued_total";
/// Events written to the transport (counter).
pub const EMITTER_EVENTS_DELIVERED_TOTAL: &str = "emitter_events_delivered_total";
/// Events that exhausted their delivery attempts (counter).
pub const EMITTER_DELIVERY_FAILURES_TOTAL: &str = "emitter_delivery_failures_total";
/// Events refused because the queue was full or closed (counter).
pub const EMITTER_EVENTS_DROPPED_TOTAL: &str = "emitter_events_dropped_total";
/// Recovery attempts (counter, labels: kind, outcome).
pub const RECOVERY_ATTEMPTS_TOTAL: &str = "recovery_attempts_total";
/// Recoveries refused by an open breaker (counter).
pub const CIRCUIT_BREAKER_REJECTIONS_TOTAL: &str = "circuit_breaker_rejections_total";
/// Breakers that opened (counter).
pub const CIRCUIT_BREAKER_OPENED_TOTAL: &str = "circuit_breaker_opened_total";
/// Messages held in degraded-mode buffers (counter).
pub const DEGRADED_MESSAGES_BUFFERED_TOTAL: &str = "degraded_messages_buffered_total";
/// Users currently degraded (gauge).
pub const DEGRADED_USERS: &str = "degraded_users";
/// Active agent runs (gauge).
pub const AGENT_RUNS_ACTIVE: &str = "agent_runs_active";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_REJECTED_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTION_DURATION_SECONDS,
            WS_STATE_TRANSITIONS_TOTAL,
            WS_STATE_TRANSITIONS_REJECTED_TOTAL,
            EMITTERS_ACTIVE,
            EMITTER_EVENTS_ENQUEUED_TOTAL,
            EMITTER_EVENTS_DELIVERED_TOTAL,
            EMITTER_DELIVERY_FAILURES_TOTAL,
            EMITTER_EVENTS_DROPPED_TOTAL,
            RECOVERY_ATTEMPTS_TOTAL,
            CIRCUIT_BREAKER_REJECTIONS_TOTAL,
            CIRCUIT_BREAKER_OPENED_TOTAL,
            DEGRADED_MESSAGES_BUFFERED_TOTAL,
            DEGRADED_USERS,
            AGENT_RUNS_ACTIVE,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
