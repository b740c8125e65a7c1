//! Error recovery for transport failures.
//!
//! Each failure is classified into an [`ErrorKind`] and handled by a fixed
//! [`RecoveryStrategy`]. Around every strategy sit three guards:
//!
//! - a per-connection [`CircuitBreaker`] counting failed recoveries
//! - isolation: a `ResourceExhausted` connection is cut off without touching
//!   anyone else, and later calls for it are rejected without doing work
//! - a shared permit pool bounding concurrent recoveries, plus at most one
//!   recovery in flight per connection
//!
//! When a recovery fails and graceful degradation is enabled, the user enters
//! degraded mode: the undelivered message is buffered (bounded, oldest dropped
//! first) and flushed in order by [`ErrorRecoveryHandler::restore`], which
//! passes through the same breaker. A drained buffer is dropped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use relay_core::{ConnectionId, UserId};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::circuit::CircuitBreaker;
use super::transport::WebSocketTransport;
use crate::config::RecoveryConfig;
use crate::errors::{ErrorKind, RestoreError, TransportError};
use crate::metrics::{
    CIRCUIT_BREAKER_OPENED_TOTAL, CIRCUIT_BREAKER_REJECTIONS_TOTAL, DEGRADED_MESSAGES_BUFFERED_TOTAL,
    DEGRADED_USERS, RECOVERY_ATTEMPTS_TOTAL,
};

/// How a failure is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Ping the connection with backoff, then resend.
    ReconnectWithBackoff,
    /// Resend the message with backoff.
    RetryWithBackoff,
    /// Resend a minimal re-encoded envelope.
    FallbackFormat,
    /// Wait out the rate limit, then send once; queue on failure.
    BackoffAndQueue,
    /// Ask the [`Reauthenticator`] to refresh credentials, then resend.
    Reauthenticate,
    /// Cut the connection off.
    IsolateConnection,
}

impl RecoveryStrategy {
    /// Strategy for an error kind.
    pub fn for_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::ConnectionLost => Self::ReconnectWithBackoff,
            ErrorKind::MessageDeliveryFailed => Self::RetryWithBackoff,
            ErrorKind::MessageSerializationFailed => Self::FallbackFormat,
            ErrorKind::RateLimitExceeded => Self::BackoffAndQueue,
            ErrorKind::AuthenticationFailed => Self::Reauthenticate,
            ErrorKind::ResourceExhausted => Self::IsolateConnection,
        }
    }

    /// Wire name, e.g. `retry_with_backoff`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReconnectWithBackoff => "reconnect_with_backoff",
            Self::RetryWithBackoff => "retry_with_backoff",
            Self::FallbackFormat => "fallback_format",
            Self::BackoffAndQueue => "backoff_and_queue",
            Self::Reauthenticate => "reauthenticate",
            Self::IsolateConnection => "isolate_connection",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure handed to [`ErrorRecoveryHandler::handle_error`].
#[derive(Clone, Debug)]
pub struct ErrorContext {
    /// Classified failure.
    pub kind: ErrorKind,
    /// Connection the failure happened on.
    pub connection_id: ConnectionId,
    /// Owner of that connection.
    pub user_id: UserId,
    /// Undelivered outbound message, if any.
    pub message: Option<Value>,
    /// Human-readable cause.
    pub detail: String,
    /// Peer-suggested wait before retrying.
    pub retry_after: Option<Duration>,
}

impl ErrorContext {
    /// Context with no message or detail.
    pub fn new(kind: ErrorKind, connection_id: ConnectionId, user_id: UserId) -> Self {
        Self {
            kind,
            connection_id,
            user_id,
            message: None,
            detail: String::new(),
            retry_after: None,
        }
    }

    /// Context classified from a transport error.
    pub fn from_transport_error(
        err: &TransportError,
        connection_id: ConnectionId,
        user_id: UserId,
    ) -> Self {
        let retry_after = match err {
            TransportError::RateLimited {
                retry_after_ms: Some(ms),
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        };
        Self {
            detail: err.to_string(),
            retry_after,
            ..Self::new(err.kind(), connection_id, user_id)
        }
    }

    /// Attach the undelivered message.
    #[must_use]
    pub fn with_message(mut self, message: Value) -> Self {
        self.message = Some(message);
        self
    }
}

/// Outcome of one [`ErrorRecoveryHandler::handle_error`] call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecoveryResult {
    /// The message (if any) reached the peer and the connection is usable.
    pub success: bool,
    /// Strategy selected for the error kind.
    pub strategy: RecoveryStrategy,
    /// Transport operations attempted.
    pub attempts_made: u32,
    /// Refused by an open breaker or isolation, without touching the transport.
    pub rejected_by_circuit_breaker: bool,
    /// The user is now degraded and the message was buffered.
    pub degraded_mode_activated: bool,
    /// What happened.
    pub message: String,
}

/// Refreshes a user's credentials for the `Reauthenticate` strategy.
#[async_trait]
pub trait Reauthenticator: Send + Sync {
    /// Refresh credentials for the user on `connection_id`.
    async fn reauthenticate(
        &self,
        user_id: &UserId,
        connection_id: &ConnectionId,
    ) -> Result<(), TransportError>;
}

struct Outcome {
    success: bool,
    attempts: u32,
    message: String,
}

impl Outcome {
    fn ok(attempts: u32, message: impl Into<String>) -> Self {
        Self {
            success: true,
            attempts,
            message: message.into(),
        }
    }

    fn failed(attempts: u32, message: impl Into<String>) -> Self {
        Self {
            success: false,
            attempts,
            message: message.into(),
        }
    }
}

#[derive(Default)]
struct DegradedQueue {
    active: bool,
    messages: VecDeque<Value>,
    dropped: u64,
}

impl DegradedQueue {
    fn activate(&mut self, user_id: &UserId) {
        if !self.active {
            self.active = true;
            gauge!(DEGRADED_USERS).increment(1.0);
            info!(%user_id, "user entered degraded mode");
        }
    }

    fn push(&mut self, user_id: &UserId, message: Value, limit: usize) {
        if self.messages.len() >= limit {
            let _ = self.messages.pop_front();
            self.dropped += 1;
            debug!(%user_id, dropped = self.dropped, "degraded buffer full, dropped oldest");
        }
        self.messages.push_back(message);
        counter!(DEGRADED_MESSAGES_BUFFERED_TOTAL).increment(1);
    }

    fn is_drained(&self) -> bool {
        !self.active && self.messages.is_empty()
    }
}

#[derive(Default)]
struct DegradedBuffer {
    queue: Mutex<DegradedQueue>,
    flush_lock: tokio::sync::Mutex<()>,
}

struct InFlightGuard<'a> {
    set: &'a DashSet<ConnectionId>,
    id: ConnectionId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let _ = self.set.remove(&self.id);
    }
}

/// Re-opens the breaker if an admitted call is dropped before its outcome
/// is recorded.
struct TrialGuard<'a> {
    breakers: &'a DashMap<ConnectionId, CircuitBreaker>,
    id: &'a ConnectionId,
    armed: bool,
}

impl TrialGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(mut breaker) = self.breakers.get_mut(self.id) {
            breaker.abandon_trial(Instant::now());
        }
    }
}

/// Recovery coordinator shared by every emitter.
pub struct ErrorRecoveryHandler {
    config: RecoveryConfig,
    breakers: DashMap<ConnectionId, CircuitBreaker>,
    isolated: DashMap<ConnectionId, Instant>,
    in_flight: DashSet<ConnectionId>,
    degraded: DashMap<UserId, Arc<DegradedBuffer>>,
    permits: Semaphore,
    reauthenticator: Option<Arc<dyn Reauthenticator>>,
}

impl ErrorRecoveryHandler {
    /// Handler without a reauthenticator.
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            permits: Semaphore::new(config.max_concurrent_recoveries),
            config,
            breakers: DashMap::new(),
            isolated: DashMap::new(),
            in_flight: DashSet::new(),
            degraded: DashMap::new(),
            reauthenticator: None,
        }
    }

    /// Install the credential refresher used by `Reauthenticate`.
    #[must_use]
    pub fn with_reauthenticator(mut self, reauthenticator: Arc<dyn Reauthenticator>) -> Self {
        self.reauthenticator = Some(reauthenticator);
        self
    }

    /// Active policy.
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Classify, guard, and run the recovery strategy for one failure.
    #[instrument(skip_all, fields(
        connection_id = %ctx.connection_id,
        user_id = %ctx.user_id,
        kind = %ctx.kind,
    ))]
    pub async fn handle_error(
        &self,
        ctx: ErrorContext,
        transport: &dyn WebSocketTransport,
    ) -> RecoveryResult {
        let strategy = RecoveryStrategy::for_kind(ctx.kind);
        let result = self.guarded_recovery(strategy, &ctx, transport).await;
        let outcome = if result.success {
            "recovered"
        } else if result.rejected_by_circuit_breaker {
            "rejected"
        } else {
            "failed"
        };
        counter!(RECOVERY_ATTEMPTS_TOTAL, "kind" => ctx.kind.as_str(), "outcome" => outcome)
            .increment(1);
        debug!(
            strategy = %result.strategy,
            success = result.success,
            attempts = result.attempts_made,
            degraded = result.degraded_mode_activated,
            message = %result.message,
            "recovery finished"
        );
        result
    }

    async fn guarded_recovery(
        &self,
        strategy: RecoveryStrategy,
        ctx: &ErrorContext,
        transport: &dyn WebSocketTransport,
    ) -> RecoveryResult {
        let result = |success, attempts_made, rejected, message: String| RecoveryResult {
            success,
            strategy,
            attempts_made,
            rejected_by_circuit_breaker: rejected,
            degraded_mode_activated: false,
            message,
        };

        if self.is_isolated(&ctx.connection_id) {
            counter!(CIRCUIT_BREAKER_REJECTIONS_TOTAL).increment(1);
            return result(false, 0, true, "connection is isolated".into());
        }

        if !self.in_flight.insert(ctx.connection_id.clone()) {
            let mut r = result(false, 0, false, "recovery already in progress".into());
            r.degraded_mode_activated = self.degrade(ctx);
            return r;
        }
        let _guard = InFlightGuard {
            set: &self.in_flight,
            id: ctx.connection_id.clone(),
        };

        let Some(trial) = self.admit(&ctx.connection_id) else {
            counter!(CIRCUIT_BREAKER_REJECTIONS_TOTAL).increment(1);
            let mut r = result(false, 0, true, "circuit breaker open".into());
            r.degraded_mode_activated = self.degrade(ctx);
            return r;
        };

        let isolating = strategy == RecoveryStrategy::IsolateConnection;
        let _permit = if isolating {
            None
        } else {
            match self.permits.acquire().await {
                Ok(permit) => Some(permit),
                Err(_) => return result(false, 0, false, "recovery permits unavailable".into()),
            }
        };

        let outcome = match strategy {
            RecoveryStrategy::ReconnectWithBackoff => self.reconnect_with_backoff(ctx, transport).await,
            RecoveryStrategy::RetryWithBackoff => self.retry_with_backoff(ctx, transport).await,
            RecoveryStrategy::FallbackFormat => self.fallback_format(ctx, transport).await,
            RecoveryStrategy::BackoffAndQueue => self.backoff_and_queue(ctx, transport).await,
            RecoveryStrategy::Reauthenticate => self.reauthenticate(ctx, transport).await,
            RecoveryStrategy::IsolateConnection => {
                self.isolate(&ctx.connection_id, transport).await;
                Outcome::failed(0, format!("connection isolated: {}", ctx.detail))
            }
        };

        trial.disarm();
        let mut r = result(outcome.success, outcome.attempts, false, outcome.message);
        if !isolating {
            self.record_outcome(&ctx.connection_id, outcome.success);
            if !outcome.success {
                r.degraded_mode_activated = self.degrade(ctx);
            }
        }
        r
    }

    /// Ask the connection's breaker for a call slot. The returned guard must be
    /// disarmed once the outcome is recorded.
    fn admit<'a>(&'a self, connection_id: &'a ConnectionId) -> Option<TrialGuard<'a>> {
        let admitted = self
            .breakers
            .entry(connection_id.clone())
            .or_insert_with(|| {
                CircuitBreaker::new(
                    self.config.circuit_breaker_threshold,
                    self.config.circuit_breaker_timeout,
                )
            })
            .admit(Instant::now());
        admitted.then_some(TrialGuard {
            breakers: &self.breakers,
            id: connection_id,
            armed: true,
        })
    }

    fn record_outcome(&self, connection_id: &ConnectionId, success: bool) {
        let Some(mut breaker) = self.breakers.get_mut(connection_id) else {
            return;
        };
        if success {
            breaker.record_success();
        } else if breaker.record_failure(Instant::now()) {
            counter!(CIRCUIT_BREAKER_OPENED_TOTAL).increment(1);
            warn!(
                %connection_id,
                failures = breaker.consecutive_failures(),
                cooldown_ms = self.config.circuit_breaker_timeout.as_millis(),
                "circuit breaker opened"
            );
        }
    }

    async fn reconnect_with_backoff(
        &self,
        ctx: &ErrorContext,
        transport: &dyn WebSocketTransport,
    ) -> Outcome {
        for attempt in 0..self.config.max_recovery_attempts {
            tokio::time::sleep(self.config.backoff.delay(attempt)).await;
            if !transport.is_open() {
                continue;
            }
            if transport.ping().await.is_err() {
                continue;
            }
            let attempts = attempt + 1;
            return match &ctx.message {
                Some(message) => match transport.send_json(message).await {
                    Ok(()) => Outcome::ok(attempts, "connection alive, message redelivered"),
                    Err(e) => Outcome::failed(attempts, format!("ping ok but resend failed: {e}")),
                },
                None => Outcome::ok(attempts, "connection alive"),
            };
        }
        Outcome::failed(self.config.max_recovery_attempts, "connection did not come back")
    }

    async fn retry_with_backoff(
        &self,
        ctx: &ErrorContext,
        transport: &dyn WebSocketTransport,
    ) -> Outcome {
        let Some(message) = &ctx.message else {
            return self.reconnect_with_backoff(ctx, transport).await;
        };
        let mut attempts = 0;
        let mut last_error = String::from("no attempt made");
        for attempt in 0..self.config.max_recovery_attempts {
            tokio::time::sleep(self.config.backoff.delay(attempt)).await;
            if !transport.is_open() {
                return Outcome::failed(attempts, "transport closed");
            }
            attempts += 1;
            match transport.send_json(message).await {
                Ok(()) => return Outcome::ok(attempts, "message redelivered"),
                Err(e) => last_error = e.to_string(),
            }
        }
        Outcome::failed(attempts, format!("retries exhausted: {last_error}"))
    }

    async fn fallback_format(
        &self,
        ctx: &ErrorContext,
        transport: &dyn WebSocketTransport,
    ) -> Outcome {
        let Some(message) = &ctx.message else {
            return Outcome::failed(0, "no message to re-encode");
        };
        let text = fallback_text(message);
        let mut attempts = 0;
        for attempt in 0..self.config.max_recovery_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.backoff.delay(attempt - 1)).await;
            }
            if !transport.is_open() {
                return Outcome::failed(attempts, "transport closed");
            }
            attempts += 1;
            if transport.send_text(text.clone()).await.is_ok() {
                return Outcome::ok(attempts, "fallback envelope delivered");
            }
        }
        Outcome::failed(attempts, "fallback envelope not delivered")
    }

    async fn backoff_and_queue(
        &self,
        ctx: &ErrorContext,
        transport: &dyn WebSocketTransport,
    ) -> Outcome {
        let wait = ctx
            .retry_after
            .unwrap_or_else(|| self.config.backoff.delay(0));
        tokio::time::sleep(wait).await;
        let Some(message) = &ctx.message else {
            return Outcome::ok(0, format!("waited {}ms", wait.as_millis()));
        };
        match transport.send_json(message).await {
            Ok(()) => Outcome::ok(1, "delivered after rate-limit backoff"),
            Err(e) => Outcome::failed(1, format!("still limited after backoff: {e}")),
        }
    }

    async fn reauthenticate(
        &self,
        ctx: &ErrorContext,
        transport: &dyn WebSocketTransport,
    ) -> Outcome {
        let Some(reauth) = &self.reauthenticator else {
            return Outcome::failed(0, "no reauthenticator configured");
        };
        if let Err(e) = reauth.reauthenticate(&ctx.user_id, &ctx.connection_id).await {
            return Outcome::failed(1, format!("reauthentication failed: {e}"));
        }
        match &ctx.message {
            Some(message) => match transport.send_json(message).await {
                Ok(()) => Outcome::ok(2, "reauthenticated, message redelivered"),
                Err(e) => Outcome::failed(2, format!("reauthenticated but resend failed: {e}")),
            },
            None => Outcome::ok(1, "reauthenticated"),
        }
    }

    async fn isolate(&self, connection_id: &ConnectionId, transport: &dyn WebSocketTransport) {
        let now = Instant::now();
        let _ = self
            .isolated
            .insert(connection_id.clone(), now + self.config.isolation_timeout);
        if let Some(mut breaker) = self.breakers.get_mut(connection_id) {
            breaker.force_open(now, self.config.isolation_timeout);
        }
        if let Err(e) = transport.close().await {
            debug!(%connection_id, error = %e, "close during isolation failed");
        }
        warn!(
            %connection_id,
            isolation_ms = self.config.isolation_timeout.as_millis(),
            "connection isolated"
        );
    }

    /// Whether `connection_id` is currently isolated.
    pub fn is_isolated(&self, connection_id: &ConnectionId) -> bool {
        let now = Instant::now();
        let expired = match self.isolated.get(connection_id) {
            Some(until) if *until > now => return true,
            Some(_) => true,
            None => false,
        };
        if expired {
            let _ = self.isolated.remove(connection_id);
        }
        false
    }

    /// Whether calls on `connection_id` would be refused right now, by
    /// isolation or an open breaker. Does not start a half-open trial.
    pub fn is_circuit_open(&self, connection_id: &ConnectionId) -> bool {
        self.is_isolated(connection_id)
            || self
                .breakers
                .get(connection_id)
                .is_some_and(|b| b.is_rejecting(Instant::now()))
    }

    /// `closed`, `open`, or `half_open` for a connection that has seen errors.
    pub fn breaker_state(&self, connection_id: &ConnectionId) -> Option<&'static str> {
        self.breakers.get(connection_id).map(|b| b.state_name())
    }

    /// Forget breaker and isolation state for a connection that went away.
    pub fn forget_connection(&self, connection_id: &ConnectionId) {
        let _ = self.breakers.remove(connection_id);
        let _ = self.isolated.remove(connection_id);
    }

    fn degrade(&self, ctx: &ErrorContext) -> bool {
        if !self.config.enable_graceful_degradation {
            return false;
        }
        // Activate and buffer under the map entry so a concurrent restore
        // cannot drop the buffer in between.
        let entry = self.degraded.entry(ctx.user_id.clone()).or_default();
        let mut queue = entry.queue.lock();
        queue.activate(&ctx.user_id);
        if let Some(message) = &ctx.message {
            queue.push(&ctx.user_id, message.clone(), self.config.degraded_buffer_limit);
        }
        true
    }

    /// Put `user_id` in degraded mode. A no-op if already degraded.
    pub fn enter_degraded_mode(&self, user_id: &UserId) {
        let entry = self.degraded.entry(user_id.clone()).or_default();
        entry.queue.lock().activate(user_id);
    }

    /// Whether `user_id` is degraded.
    pub fn is_degraded(&self, user_id: &UserId) -> bool {
        self.degraded
            .get(user_id)
            .is_some_and(|b| b.queue.lock().active)
    }

    /// Number of degraded users.
    pub fn degraded_user_count(&self) -> usize {
        self.degraded
            .iter()
            .filter(|e| e.value().queue.lock().active)
            .count()
    }

    /// Buffer a message for a degraded user.
    ///
    /// Returns `false` (and drops the message) if the user is not degraded.
    /// At the buffer limit the oldest message is dropped to make room.
    pub fn buffer_message(&self, user_id: &UserId, message: Value) -> bool {
        let Some(entry) = self.degraded.get(user_id) else {
            return false;
        };
        let mut queue = entry.queue.lock();
        if !queue.active {
            return false;
        }
        queue.push(user_id, message, self.config.degraded_buffer_limit);
        true
    }

    /// Messages currently buffered for `user_id`.
    pub fn buffered_count(&self, user_id: &UserId) -> usize {
        self.degraded
            .get(user_id)
            .map_or(0, |b| b.queue.lock().messages.len())
    }

    /// Flush `user_id`'s buffer through `transport` in order and leave
    /// degraded mode once it is empty.
    ///
    /// The flush is a call on `connection_id` like any recovery: an open
    /// breaker or an isolated connection refuses it without touching the
    /// transport, and the result is recorded on the breaker. Each send is
    /// bounded by `send_timeout`. On a send failure the unsent message stays
    /// at the head of the buffer and the user stays degraded. Returns the
    /// number of messages flushed; `Ok(0)` if the user was not degraded.
    #[instrument(skip_all, fields(user_id = %user_id, connection_id = %connection_id))]
    pub async fn restore(
        &self,
        user_id: &UserId,
        connection_id: &ConnectionId,
        transport: &dyn WebSocketTransport,
        send_timeout: Duration,
    ) -> Result<usize, RestoreError> {
        let Some(buffer) = self.degraded.get(user_id).map(|b| Arc::clone(b.value())) else {
            return Ok(0);
        };
        if !buffer.queue.lock().active {
            return Ok(0);
        }
        if self.is_isolated(connection_id) {
            counter!(CIRCUIT_BREAKER_REJECTIONS_TOTAL).increment(1);
            return Err(RestoreError::CircuitOpen(connection_id.clone()));
        }
        let Some(trial) = self.admit(connection_id) else {
            counter!(CIRCUIT_BREAKER_REJECTIONS_TOTAL).increment(1);
            return Err(RestoreError::CircuitOpen(connection_id.clone()));
        };

        let flushed = Self::flush(&buffer, user_id, transport, send_timeout).await;
        trial.disarm();
        self.record_outcome(connection_id, flushed.is_ok());
        if flushed.is_ok() {
            let _ = self
                .degraded
                .remove_if(user_id, |_, b| b.queue.lock().is_drained());
        }
        flushed.map_err(RestoreError::from)
    }

    async fn flush(
        buffer: &DegradedBuffer,
        user_id: &UserId,
        transport: &dyn WebSocketTransport,
        send_timeout: Duration,
    ) -> Result<usize, TransportError> {
        let _flush = buffer.flush_lock.lock().await;
        let mut flushed = 0;
        loop {
            let next = {
                let mut queue = buffer.queue.lock();
                if !queue.active {
                    return Ok(flushed);
                }
                match queue.messages.pop_front() {
                    Some(message) => message,
                    None => {
                        queue.active = false;
                        gauge!(DEGRADED_USERS).decrement(1.0);
                        info!(%user_id, flushed, "user left degraded mode");
                        return Ok(flushed);
                    }
                }
            };
            let sent = tokio::time::timeout(send_timeout, transport.send_json(&next))
                .await
                .unwrap_or(Err(TransportError::Timeout));
            if let Err(e) = sent {
                buffer.queue.lock().messages.push_front(next);
                return Err(e);
            }
            flushed += 1;
        }
    }
}

/// Minimal envelope that always serializes: identifiers only, no payload.
fn fallback_text(message: &Value) -> String {
    let pick = |pointer: &str| message.pointer(pointer).cloned().unwrap_or(Value::Null);
    json!({
        "event_type": pick("/event_type"),
        "thread_id": pick("/thread_id"),
        "timestamp": pick("/timestamp"),
        "data": {
            "run_id": pick("/data/run_id"),
            "agent_name": pick("/data/agent_name"),
            "fallback": true,
        },
    })
    .to_string()
}
