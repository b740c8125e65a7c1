//! Runtime configuration derived from [`relay_settings::RelaySettings`].
//!
//! Settings carry raw numbers as they appear in JSON; the types here carry
//! `Duration`s and whatever else the server wants pre-computed.

use std::time::Duration;

use relay_core::BackoffConfig;
use relay_settings::{AuthSettings, EmitterSettings, RecoverySettings, RelaySettings, ServerSettings};

use crate::websocket::sanitize::Sanitizer;

/// Listener and per-connection limits.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is timed out.
    pub heartbeat_timeout: Duration,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound frame channel capacity per connection.
    pub send_buffer: usize,
}

impl ServerConfig {
    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            max_connections: s.max_connections,
            heartbeat_interval: Duration::from_secs(s.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(s.heartbeat_timeout_secs),
            max_message_size: s.max_message_size,
            send_buffer: s.send_buffer.max(1),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            ..Self::from(&ServerSettings::default())
        }
    }
}

/// Per-user emitter behaviour.
#[derive(Clone, Debug)]
pub struct EmitterConfig {
    /// Capacity of each context's private queue.
    pub max_events_per_user: usize,
    /// Total send attempts per event (at least 1).
    pub delivery_retries: u32,
    /// Deadline for a single send attempt.
    pub delivery_timeout: Duration,
    /// Backoff between send attempts.
    pub retry_backoff: BackoffConfig,
    /// Payload redaction and truncation.
    pub sanitizer: Sanitizer,
}

impl From<&EmitterSettings> for EmitterConfig {
    fn from(s: &EmitterSettings) -> Self {
        Self {
            max_events_per_user: s.max_events_per_user.max(1),
            delivery_retries: s.delivery_retries.max(1),
            delivery_timeout: Duration::from_millis(s.delivery_timeout_ms),
            retry_backoff: s.retry_backoff.clone(),
            sanitizer: Sanitizer::new(&s.redacted_keys, s.max_field_chars),
        }
    }
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self::from(&EmitterSettings::default())
    }
}

/// Error recovery policy.
#[derive(Clone, Debug)]
pub struct RecoveryConfig {
    /// Attempts made by the retrying strategies.
    pub max_recovery_attempts: u32,
    /// Backoff between recovery attempts.
    pub backoff: BackoffConfig,
    /// Consecutive failed recoveries before a breaker opens.
    pub circuit_breaker_threshold: u32,
    /// How long an open breaker rejects before allowing a trial.
    pub circuit_breaker_timeout: Duration,
    /// Buffer outbound events for users whose recovery failed.
    pub enable_graceful_degradation: bool,
    /// Per-user buffer bound; oldest entries are dropped first.
    pub degraded_buffer_limit: usize,
    /// Recoveries allowed to run at once across all connections.
    pub max_concurrent_recoveries: usize,
    /// How long an isolated connection stays isolated.
    pub isolation_timeout: Duration,
}

impl From<&RecoverySettings> for RecoveryConfig {
    fn from(s: &RecoverySettings) -> Self {
        Self {
            max_recovery_attempts: s.max_recovery_attempts.max(1),
            backoff: s.backoff.clone(),
            circuit_breaker_threshold: s.circuit_breaker_threshold.max(1),
            circuit_breaker_timeout: Duration::from_millis(s.circuit_breaker_timeout_ms),
            enable_graceful_degradation: s.enable_graceful_degradation,
            degraded_buffer_limit: s.degraded_buffer_limit.max(1),
            max_concurrent_recoveries: s.max_concurrent_recoveries.max(1),
            isolation_timeout: Duration::from_millis(s.isolation_timeout_ms),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self::from(&RecoverySettings::default())
    }
}

/// Everything the server needs at startup.
#[derive(Clone, Debug, Default)]
pub struct RelayConfig {
    /// Listener settings.
    pub server: ServerConfig,
    /// Emitter settings.
    pub emitter: EmitterConfig,
    /// Recovery settings.
    pub recovery: RecoveryConfig,
    /// Token table and dev-mode switch.
    pub auth: AuthSettings,
}

impl From<&RelaySettings> for RelayConfig {
    fn from(s: &RelaySettings) -> Self {
        Self {
            server: ServerConfig::from(&s.server),
            emitter: EmitterConfig::from(&s.emitter),
            recovery: RecoveryConfig::from(&s.recovery),
            auth: s.auth.clone(),
        }
    }
}
