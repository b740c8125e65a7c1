//! Per-connection circuit breaker.
//!
//! `threshold` consecutive failures open the breaker; while open every call is
//! rejected. After the cooldown one trial is admitted (half-open): success
//! closes the breaker, failure re-opens it for another cooldown. A trial that
//! never reports back stops blocking once another cooldown has passed.

use std::time::Duration;

use tokio::time::Instant;

/// Breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until `since + cooldown`.
    Open {
        /// When the breaker opened.
        since: Instant,
        /// How long it stays open.
        cooldown: Duration,
    },
    /// One trial call is in flight.
    HalfOpen {
        /// When the trial was admitted.
        since: Instant,
    },
}

/// Consecutive-failure circuit breaker.
#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    /// Breaker opening after `threshold` failures for `cooldown`.
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            threshold: threshold.max(1),
            cooldown,
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether a call may proceed now.
    ///
    /// An expired open breaker moves to half-open and admits exactly one
    /// trial; further calls are rejected until that trial reports back or
    /// goes stale after a cooldown, in which case a new trial is admitted.
    pub fn admit(&mut self, now: Instant) -> bool {
        if self.is_rejecting(now) {
            return false;
        }
        if !matches!(self.state, CircuitState::Closed) {
            self.state = CircuitState::HalfOpen { since: now };
        }
        true
    }

    /// Whether [`admit`](Self::admit) would refuse a call at `now`.
    pub fn is_rejecting(&self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen { since } => now.saturating_duration_since(since) < self.cooldown,
            CircuitState::Open { since, cooldown } => now.saturating_duration_since(since) < cooldown,
        }
    }

    /// The admitted trial was dropped before reporting: re-open for a full
    /// cooldown. No-op unless half-open.
    pub fn abandon_trial(&mut self, now: Instant) {
        if matches!(self.state, CircuitState::HalfOpen { .. }) {
            self.state = CircuitState::Open {
                since: now,
                cooldown: self.cooldown,
            };
        }
    }

    /// Record a successful call and close the breaker.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
    }

    /// Record a failed call. Returns `true` if this call opened the breaker.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let trips = match self.state {
            CircuitState::HalfOpen { .. } => true,
            CircuitState::Closed => self.consecutive_failures >= self.threshold,
            CircuitState::Open { .. } => false,
        };
        if trips {
            self.state = CircuitState::Open {
                since: now,
                cooldown: self.cooldown,
            };
        }
        trips
    }

    /// Open immediately for `cooldown`, regardless of the failure count.
    pub fn force_open(&mut self, now: Instant, cooldown: Duration) {
        self.state = CircuitState::Open {
            since: now,
            cooldown,
        };
    }

    /// `closed`, `open`, or `half_open`.
    pub fn state_name(&self) -> &'static str {
        match self.state {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }
}
