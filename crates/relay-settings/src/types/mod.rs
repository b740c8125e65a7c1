//! Settings type tree.
//!
//! Every struct uses `#[serde(default)]` so a partial user file only needs to
//! name the keys it overrides.

mod delivery;
mod server;

pub use delivery::{EmitterSettings, RecoverySettings, default_redacted_keys};
pub use server::{AuthSettings, LoggingSettings, ServerSettings};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Network and connection limits.
    pub server: ServerSettings,
    /// Per-user emitter queue and delivery policy.
    pub emitter: EmitterSettings,
    /// Error recovery and circuit breaker policy.
    pub recovery: RecoverySettings,
    /// Token table for the WebSocket handshake.
    pub auth: AuthSettings,
    /// Log level and format.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject combinations that would make the server misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            return Err(invalid("server.maxConnections must be at least 1"));
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err(invalid("server.heartbeatIntervalSecs must be at least 1"));
        }
        if self.server.heartbeat_timeout_secs < self.server.heartbeat_interval_secs {
            return Err(invalid(
                "server.heartbeatTimeoutSecs must not be shorter than heartbeatIntervalSecs",
            ));
        }
        if self.emitter.max_events_per_user == 0 {
            return Err(invalid("emitter.maxEventsPerUser must be at least 1"));
        }
        if self.emitter.delivery_retries == 0 {
            return Err(invalid("emitter.deliveryRetries must be at least 1"));
        }
        if self.emitter.delivery_timeout_ms == 0 {
            return Err(invalid("emitter.deliveryTimeoutMs must be at least 1"));
        }
        if self.recovery.circuit_breaker_threshold == 0 {
            return Err(invalid("recovery.circuitBreakerThreshold must be at least 1"));
        }
        if self.recovery.max_concurrent_recoveries == 0 {
            return Err(invalid("recovery.maxConcurrentRecoveries must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.recovery.backoff.jitter_factor) {
            return Err(invalid("recovery.backoff.jitterFactor must be within 0.0..=1.0"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> SettingsError {
    SettingsError::InvalidValue(msg.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"emitter":{"deliveryRetries":7}}"#;
        let settings: RelaySettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.emitter.delivery_retries, 7);
        assert_eq!(settings.emitter.max_events_per_user, 1000);
        assert_eq!(settings.server.port, 8765);
    }

    #[test]
    fn camel_case_keys() {
        let value = serde_json::to_value(RelaySettings::default()).unwrap();
        assert!(value["emitter"]["maxEventsPerUser"].is_number());
        assert!(value["recovery"]["circuitBreakerThreshold"].is_number());
        assert!(value["server"]["heartbeatIntervalSecs"].is_number());
    }

    #[test]
    fn zero_queue_rejected() {
        let mut settings = RelaySettings::default();
        settings.emitter.max_events_per_user = 0;
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(msg)) if msg.contains("maxEventsPerUser"));
    }

    #[test]
    fn zero_retries_rejected() {
        let mut settings = RelaySettings::default();
        settings.emitter.delivery_retries = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn heartbeat_timeout_shorter_than_interval_rejected() {
        let mut settings = RelaySettings::default();
        settings.server.heartbeat_interval_secs = 60;
        settings.server.heartbeat_timeout_secs = 30;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_breaker_threshold_rejected() {
        let mut settings = RelaySettings::default();
        settings.recovery.circuit_breaker_threshold = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn jitter_out_of_range_rejected() {
        let mut settings = RelaySettings::default();
        settings.recovery.backoff.jitter_factor = 1.5;
        assert!(settings.validate().is_err());
    }
}
