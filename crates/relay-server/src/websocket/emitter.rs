//! Per-user event emitter.
//!
//! Each [`UserWebSocketEmitter`] owns one bounded FIFO queue and one delivery
//! task. `notify_*` calls sanitize the payload, bind it to the context's
//! user and thread, and enqueue without waiting. The delivery task writes
//! events, in order, to the context's own transport handle and nowhere else.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use relay_core::{ConnectionId, RunId, ThreadId, UserId};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::events::{EventType, WebSocketEvent};
use super::recovery::{ErrorContext, ErrorRecoveryHandler};
use super::state::{ConnectionState, ConnectionStateMachine};
use super::transport::WebSocketTransport;
use crate::config::EmitterConfig;
use crate::errors::{EmitError, ErrorKind, RestoreError, TransportError};
use crate::metrics::{
    EMITTER_DELIVERY_FAILURES_TOTAL, EMITTER_EVENTS_DELIVERED_TOTAL, EMITTER_EVENTS_DROPPED_TOTAL,
    EMITTER_EVENTS_ENQUEUED_TOTAL, EMITTERS_ACTIVE,
};

/// Identity of one emitter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserWebSocketContext {
    /// Recipient user.
    pub user_id: UserId,
    /// Recipient thread.
    pub thread_id: ThreadId,
    /// Connection events are written to.
    pub connection_id: ConnectionId,
    /// When the context was created.
    pub created_at: DateTime<Utc>,
}

impl UserWebSocketContext {
    /// Context created now.
    pub fn new(user_id: UserId, thread_id: ThreadId, connection_id: ConnectionId) -> Self {
        Self {
            user_id,
            thread_id,
            connection_id,
            created_at: Utc::now(),
        }
    }
}

/// Point-in-time emitter counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EmitterStats {
    /// Accepted onto the queue.
    pub enqueued: u64,
    /// Written to the transport.
    pub delivered: u64,
    /// Send attempts that failed: live delivery exhausted its retries, a
    /// degraded flush failed, or an open breaker refused an unbuffered event.
    pub failed: u64,
    /// Refused at enqueue (queue full or closed).
    pub dropped: u64,
    /// Held in the user's degraded-mode buffer.
    pub buffered: u64,
}

#[derive(Default)]
struct StatCounters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    buffered: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64) {
        let _ = counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EmitterStats {
        EmitterStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
        }
    }
}

/// Isolated event emitter for one (user, thread, connection).
pub struct UserWebSocketEmitter {
    context: UserWebSocketContext,
    config: Arc<EmitterConfig>,
    tx: Mutex<Option<mpsc::Sender<WebSocketEvent>>>,
    transport: Arc<dyn WebSocketTransport>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<StatCounters>,
}

impl UserWebSocketEmitter {
    /// Create the emitter and start its delivery task.
    ///
    /// `transport` must be private to this context. When `state` is given,
    /// degraded-mode entry and exit are reflected on it.
    pub fn spawn(
        context: UserWebSocketContext,
        transport: Arc<dyn WebSocketTransport>,
        config: Arc<EmitterConfig>,
        recovery: Arc<ErrorRecoveryHandler>,
        state: Option<Arc<ConnectionStateMachine>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.max_events_per_user);
        let cancel = CancellationToken::new();
        let stats = Arc::new(StatCounters::default());

        let worker = DeliveryWorker {
            context: context.clone(),
            transport: transport.clone(),
            config: config.clone(),
            recovery,
            state,
            stats: stats.clone(),
            cancel: cancel.clone(),
        };
        let span = info_span!(
            "delivery",
            user_id = %context.user_id,
            thread_id = %context.thread_id,
            connection_id = %context.connection_id,
        );
        let task = tokio::spawn(worker.run(rx).instrument(span));

        gauge!(EMITTERS_ACTIVE).increment(1.0);
        debug!(
            user_id = %context.user_id,
            thread_id = %context.thread_id,
            connection_id = %context.connection_id,
            "emitter created"
        );

        Self {
            context,
            config,
            tx: Mutex::new(Some(tx)),
            transport,
            cancel,
            task: Mutex::new(Some(task)),
            stats,
        }
    }

    /// Identity this emitter is bound to.
    pub fn context(&self) -> &UserWebSocketContext {
        &self.context
    }

    /// Counter snapshot.
    pub fn stats(&self) -> EmitterStats {
        self.stats.snapshot()
    }

    /// `false` once [`cleanup`](Self::cleanup) has run.
    pub fn is_active(&self) -> bool {
        self.tx.lock().is_some() && !self.cancel.is_cancelled()
    }

    /// An agent run began.
    pub fn notify_agent_started(
        &self,
        run_id: &RunId,
        agent_name: &str,
        context: Map<String, Value>,
    ) -> Result<(), EmitError> {
        let mut data = Map::new();
        let _ = data.insert("status".into(), json!("started"));
        let _ = data.insert("context".into(), Value::Object(context));
        self.enqueue(EventType::AgentStarted, run_id, agent_name, data)
    }

    /// Intermediate reasoning from the agent.
    pub fn notify_agent_thinking(
        &self,
        run_id: &RunId,
        agent_name: &str,
        thought: &str,
        step: Option<u32>,
    ) -> Result<(), EmitError> {
        let mut data = Map::new();
        let _ = data.insert("thought".into(), json!(thought));
        if let Some(step) = step {
            let _ = data.insert("step".into(), json!(step));
        }
        self.enqueue(EventType::AgentThinking, run_id, agent_name, data)
    }

    /// A tool call is starting.
    pub fn notify_tool_executing(
        &self,
        run_id: &RunId,
        agent_name: &str,
        tool_name: &str,
        parameters: Value,
    ) -> Result<(), EmitError> {
        let mut data = Map::new();
        let _ = data.insert("tool_name".into(), json!(tool_name));
        let _ = data.insert("parameters".into(), parameters);
        self.enqueue(EventType::ToolExecuting, run_id, agent_name, data)
    }

    /// A tool call finished.
    pub fn notify_tool_completed(
        &self,
        run_id: &RunId,
        agent_name: &str,
        tool_name: &str,
        result: Value,
        duration_ms: Option<u64>,
    ) -> Result<(), EmitError> {
        let mut data = Map::new();
        let _ = data.insert("tool_name".into(), json!(tool_name));
        let _ = data.insert("result".into(), result);
        if let Some(ms) = duration_ms {
            let _ = data.insert("duration_ms".into(), json!(ms));
        }
        self.enqueue(EventType::ToolCompleted, run_id, agent_name, data)
    }

    /// The run finished.
    pub fn notify_agent_completed(
        &self,
        run_id: &RunId,
        agent_name: &str,
        result: Value,
        duration_ms: Option<u64>,
    ) -> Result<(), EmitError> {
        let mut data = Map::new();
        let _ = data.insert("status".into(), json!("completed"));
        let _ = data.insert("result".into(), result);
        if let Some(ms) = duration_ms {
            let _ = data.insert("duration_ms".into(), json!(ms));
        }
        self.enqueue(EventType::AgentCompleted, run_id, agent_name, data)
    }

    fn enqueue(
        &self,
        event_type: EventType,
        run_id: &RunId,
        agent_name: &str,
        data: Map<String, Value>,
    ) -> Result<(), EmitError> {
        let event = WebSocketEvent {
            event_type,
            user_id: self.context.user_id.clone(),
            thread_id: self.context.thread_id.clone(),
            run_id: run_id.clone(),
            agent_name: agent_name.to_owned(),
            data: self.config.sanitizer.sanitize_map(data),
            timestamp: Utc::now(),
        };

        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            StatCounters::bump(&self.stats.dropped);
            return Err(EmitError::Closed(self.context.connection_id.clone()));
        };
        match tx.try_send(event) {
            Ok(()) => {
                StatCounters::bump(&self.stats.enqueued);
                counter!(EMITTER_EVENTS_ENQUEUED_TOTAL, "event_type" => event_type.as_str())
                    .increment(1);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                StatCounters::bump(&self.stats.dropped);
                counter!(EMITTER_EVENTS_DROPPED_TOTAL).increment(1);
                warn!(
                    user_id = %self.context.user_id,
                    %event_type,
                    capacity = self.config.max_events_per_user,
                    "emitter queue full, event dropped"
                );
                Err(EmitError::QueueFull {
                    capacity: self.config.max_events_per_user,
                })
            }
            Err(TrySendError::Closed(_)) => {
                StatCounters::bump(&self.stats.dropped);
                Err(EmitError::Closed(self.context.connection_id.clone()))
            }
        }
    }

    /// Stop delivery and release this context's queue and transport handle.
    ///
    /// An in-flight send is abandoned, not retried or handed elsewhere.
    /// Queued events are discarded. Calling it again is a no-op, and no other
    /// context is affected.
    pub async fn cleanup(&self) {
        let Some(tx) = self.tx.lock().take() else {
            return;
        };
        self.cancel.cancel();
        drop(tx);

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if let Err(e) = self.transport.close().await {
            debug!(connection_id = %self.context.connection_id, error = %e, "transport close failed");
        }
        gauge!(EMITTERS_ACTIVE).decrement(1.0);

        let stats = self.stats.snapshot();
        info!(
            user_id = %self.context.user_id,
            thread_id = %self.context.thread_id,
            connection_id = %self.context.connection_id,
            delivered = stats.delivered,
            failed = stats.failed,
            dropped = stats.dropped,
            "emitter cleaned up"
        );
    }
}

impl Drop for UserWebSocketEmitter {
    fn drop(&mut self) {
        if self.tx.get_mut().take().is_some() {
            self.cancel.cancel();
            gauge!(EMITTERS_ACTIVE).decrement(1.0);
        }
    }
}

struct DeliveryWorker {
    context: UserWebSocketContext,
    transport: Arc<dyn WebSocketTransport>,
    config: Arc<EmitterConfig>,
    recovery: Arc<ErrorRecoveryHandler>,
    state: Option<Arc<ConnectionStateMachine>>,
    stats: Arc<StatCounters>,
    cancel: CancellationToken,
}

impl DeliveryWorker {
    async fn run(self, mut rx: mpsc::Receiver<WebSocketEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = self.deliver(event) => {}
            }
        }
        debug!("delivery task stopped");
    }

    async fn deliver(&self, event: WebSocketEvent) {
        let message = event.to_message();

        if self.recovery.is_degraded(&self.context.user_id) && !self.try_restore().await {
            if self.recovery.buffer_message(&self.context.user_id, message) {
                StatCounters::bump(&self.stats.buffered);
            }
            return;
        }

        let circuit_open = self.recovery.is_circuit_open(&self.context.connection_id);
        let ctx = if circuit_open {
            debug!(event_type = %event.event_type, "circuit open, live send skipped");
            ErrorContext {
                detail: "circuit open".into(),
                ..ErrorContext::new(
                    ErrorKind::MessageDeliveryFailed,
                    self.context.connection_id.clone(),
                    self.context.user_id.clone(),
                )
            }
        } else {
            match self.send_with_retries(&message).await {
                Ok(()) => {
                    StatCounters::bump(&self.stats.delivered);
                    counter!(EMITTER_EVENTS_DELIVERED_TOTAL).increment(1);
                    return;
                }
                Err(e) => {
                    self.record_failure();
                    warn!(
                        event_type = %event.event_type,
                        run_id = %event.run_id,
                        error = %e,
                        "event delivery failed, handing to recovery"
                    );
                    ErrorContext::from_transport_error(
                        &e,
                        self.context.connection_id.clone(),
                        self.context.user_id.clone(),
                    )
                }
            }
        };

        let result = self
            .recovery
            .handle_error(ctx.with_message(message), self.transport.as_ref())
            .await;
        if result.degraded_mode_activated {
            StatCounters::bump(&self.stats.buffered);
            self.transition(ConnectionState::Degraded, "delivery failed; buffering");
        } else if circuit_open {
            self.record_failure();
        }
    }

    /// Up to `delivery_retries` sends, each bounded by `delivery_timeout`.
    async fn send_with_retries(&self, message: &Value) -> Result<(), TransportError> {
        let mut last_error = TransportError::Timeout;
        for attempt in 0..self.config.delivery_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_backoff.delay(attempt - 1)).await;
            }
            match tokio::time::timeout(self.config.delivery_timeout, self.transport.send_json(message)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = TransportError::Timeout,
            }
            if !self.transport.is_open() {
                break;
            }
        }
        Err(last_error)
    }

    fn record_failure(&self) {
        StatCounters::bump(&self.stats.failed);
        counter!(EMITTER_DELIVERY_FAILURES_TOTAL).increment(1);
    }

    async fn try_restore(&self) -> bool {
        if !self.transport.is_open() {
            return false;
        }
        let restored = self
            .recovery
            .restore(
                &self.context.user_id,
                &self.context.connection_id,
                self.transport.as_ref(),
                self.config.delivery_timeout,
            )
            .await;
        match restored {
            Ok(flushed) => {
                debug!(flushed, "degraded buffer flushed");
                if self
                    .state
                    .as_ref()
                    .is_some_and(|s| s.current_state() == ConnectionState::Degraded)
                {
                    self.transition(ConnectionState::ProcessingReady, "degraded buffer flushed");
                }
                true
            }
            Err(RestoreError::CircuitOpen(_)) => false,
            Err(RestoreError::Transport(e)) => {
                self.record_failure();
                debug!(error = %e, "degraded flush failed");
                false
            }
        }
    }

    fn transition(&self, target: ConnectionState, reason: &str) {
        if let Some(state) = &self.state {
            if let Err(e) = state.transition(target, reason) {
                debug!(error = %e, "state not updated");
            }
        }
    }
}
