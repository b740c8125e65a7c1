//! Exponential backoff with jitter.
//!
//! Shared by the emitter's per-event delivery retries and by the error
//! recovery strategies:
//!
//! - [`BackoffConfig`]: base/max delay and jitter factor
//! - [`calculate_backoff_delay`]: deterministic upper-bound delay
//! - [`calculate_backoff_delay_with_random`]: jittered delay from a caller-supplied sample

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Backoff parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    /// Delay before the first retry, in ms.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in ms.
    pub max_delay_ms: u64,
    /// Symmetric jitter range, 0.0–1.0.
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl BackoffConfig {
    /// Jittered delay for a zero-based retry index.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = calculate_backoff_delay_with_random(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
            rand::random::<f64>(),
        );
        Duration::from_millis(ms)
    }
}

/// Exponential delay without randomness.
///
/// Formula: `min(max_delay, base_delay * 2^attempt) * (1 + jitter)`, i.e. the
/// largest value [`calculate_backoff_delay_with_random`] can return.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn calculate_backoff_delay(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_delay_ms);
    let with_jitter = (capped as f64) * (1.0 + jitter_factor);
    with_jitter.round() as u64
}

/// Exponential delay with jitter drawn from `random` in `[0.0, 1.0)`.
///
/// `random` maps onto `[-jitter, +jitter]` around the capped exponential value.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn calculate_backoff_delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_delay_ms);
    let jitter = 1.0 + (random * 2.0 - 1.0) * jitter_factor;
    ((capped as f64) * jitter).round().max(0.0) as u64
}
