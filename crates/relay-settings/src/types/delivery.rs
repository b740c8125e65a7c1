//! Emitter and error-recovery settings.

use relay_core::BackoffConfig;
use serde::{Deserialize, Serialize};

/// Payload keys whose values are replaced with `[REDACTED]` by default.
pub fn default_redacted_keys() -> Vec<String> {
    [
        "api_key",
        "apikey",
        "password",
        "secret",
        "token",
        "access_token",
        "refresh_token",
        "authorization",
        "private_key",
        "credentials",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

/// Per-user emitter settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmitterSettings {
    /// Capacity of each user's private event queue.
    pub max_events_per_user: usize,
    /// Send attempts per event before it is handed to recovery.
    pub delivery_retries: u32,
    /// Timeout for a single send attempt, in ms.
    pub delivery_timeout_ms: u64,
    /// Strings longer than this many characters are truncated.
    pub max_field_chars: usize,
    /// Keys redacted from event payloads (case-insensitive).
    pub redacted_keys: Vec<String>,
    /// Delay between send attempts.
    pub retry_backoff: BackoffConfig,
}

impl Default for EmitterSettings {
    fn default() -> Self {
        Self {
            max_events_per_user: 1000,
            delivery_retries: 3,
            delivery_timeout_ms: 5_000,
            max_field_chars: 200,
            redacted_keys: default_redacted_keys(),
            retry_backoff: BackoffConfig {
                base_delay_ms: 50,
                max_delay_ms: 1_000,
                jitter_factor: 0.2,
            },
        }
    }
}

/// Error recovery settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecoverySettings {
    /// Attempts per recovery strategy.
    pub max_recovery_attempts: u32,
    /// Delay between recovery attempts.
    pub backoff: BackoffConfig,
    /// Consecutive failed recoveries that open a connection's breaker.
    pub circuit_breaker_threshold: u32,
    /// How long an open breaker rejects calls, in ms.
    pub circuit_breaker_timeout_ms: u64,
    /// Buffer outbound messages for users whose recovery failed.
    pub enable_graceful_degradation: bool,
    /// Messages kept per degraded user (oldest dropped first).
    pub degraded_buffer_limit: usize,
    /// Recovery operations allowed to run at once across all connections.
    pub max_concurrent_recoveries: usize,
    /// How long a resource-exhausted connection stays isolated, in ms.
    pub isolation_timeout_ms: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 3,
            backoff: BackoffConfig::default(),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_ms: 30_000,
            enable_graceful_degradation: true,
            degraded_buffer_limit: 500,
            max_concurrent_recoveries: 32,
            isolation_timeout_ms: 60_000,
        }
    }
}
