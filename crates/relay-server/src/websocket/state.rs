//! Per-connection lifecycle state machine.
//!
//! ```text
//! Connecting ─► Accepted ─► Authenticated ─► ServicesReady ─► ProcessingReady ◄─► Processing
//!                                  │                │               │   ▲              │
//!                                  └───────┬────────┘               ▼   │              │
//!                                          └──────────────────► Degraded ◄─────────────┘
//!
//! every non-terminal state ─► Failed | Closed
//! ProcessingReady | Processing | Degraded ─► Timeout
//! ```
//!
//! `Timeout`, `Failed`, and `Closed` are terminal. A transition attempt from a
//! terminal state, or along an edge not in the table, is rejected and leaves
//! both the current state and the history untouched.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use relay_core::ConnectionId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics::{WS_STATE_TRANSITIONS_REJECTED_TOTAL, WS_STATE_TRANSITIONS_TOTAL};

/// Lifecycle state of one WebSocket connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// TCP accepted, upgrade in progress.
    Connecting,
    /// WebSocket handshake complete.
    Accepted,
    /// Identity established.
    Authenticated,
    /// Pool registration done.
    ServicesReady,
    /// Emitter attached; idle and able to process.
    ProcessingReady,
    /// An agent run is in flight.
    Processing,
    /// Delivery is failing; outbound events are being buffered.
    Degraded,
    /// Heartbeat expired. Terminal.
    Timeout,
    /// Unrecoverable error. Terminal.
    Failed,
    /// Orderly close. Terminal.
    Closed,
}

use ConnectionState::{
    Accepted, Authenticated, Closed, Connecting, Degraded, Failed, Processing, ProcessingReady,
    ServicesReady, Timeout,
};

impl ConnectionState {
    /// Every state, in lifecycle order.
    pub const ALL: [Self; 10] = [
        Connecting,
        Accepted,
        Authenticated,
        ServicesReady,
        ProcessingReady,
        Processing,
        Degraded,
        Timeout,
        Failed,
        Closed,
    ];

    /// States reachable in one step from `self`.
    pub fn allowed_targets(self) -> &'static [Self] {
        match self {
            Connecting => &[Accepted, Failed, Closed],
            Accepted => &[Authenticated, Failed, Closed],
            Authenticated => &[ServicesReady, Degraded, Failed, Closed],
            ServicesReady => &[ProcessingReady, Degraded, Failed, Closed],
            ProcessingReady => &[Processing, Degraded, Timeout, Failed, Closed],
            Processing => &[ProcessingReady, Degraded, Timeout, Failed, Closed],
            Degraded => &[ProcessingReady, Timeout, Failed, Closed],
            Timeout | Failed | Closed => &[],
        }
    }

    /// Whether `self → target` is an edge of the graph.
    pub fn can_transition_to(self, target: Self) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// No outgoing edges.
    pub fn is_terminal(self) -> bool {
        matches!(self, Timeout | Failed | Closed)
    }

    /// Events may be emitted to the connection.
    pub fn is_operational(self) -> bool {
        matches!(self, ProcessingReady | Processing | Degraded)
    }

    /// Wire name, e.g. `services_ready`.
    pub fn as_str(self) -> &'static str {
        match self {
            Connecting => "connecting",
            Accepted => "accepted",
            Authenticated => "authenticated",
            ServicesReady => "services_ready",
            ProcessingReady => "processing_ready",
            Processing => "processing",
            Degraded => "degraded",
            Timeout => "timeout",
            Failed => "failed",
            Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded transition.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StateTransitionInfo {
    /// State before the transition.
    pub from_state: ConnectionState,
    /// State after the transition.
    pub to_state: ConnectionState,
    /// Why the transition happened.
    pub reason: String,
    /// When it was recorded.
    pub timestamp: DateTime<Utc>,
    /// Caller-supplied context.
    pub metadata: Map<String, Value>,
}

/// A rejected transition attempt.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The edge is not in the transition table.
    #[error("invalid transition {from} -> {to}")]
    Invalid {
        /// Current state.
        from: ConnectionState,
        /// Requested state.
        to: ConnectionState,
    },
    /// The machine is already in a terminal state.
    #[error("connection is in terminal state {state}; cannot move to {to}")]
    Terminal {
        /// Current (terminal) state.
        state: ConnectionState,
        /// Requested state.
        to: ConnectionState,
    },
}

/// Observer invoked after every successful transition.
pub type StateChangeCallback = Arc<dyn Fn(&StateTransitionInfo) + Send + Sync>;

struct Inner {
    current: ConnectionState,
    entered_at: Instant,
    history: Vec<StateTransitionInfo>,
    /// Committed transitions whose callbacks have not run yet.
    pending: VecDeque<StateTransitionInfo>,
}

/// Authoritative lifecycle state for one connection.
pub struct ConnectionStateMachine {
    connection_id: ConnectionId,
    inner: Mutex<Inner>,
    callbacks: RwLock<Vec<StateChangeCallback>>,
    /// Held by the thread currently delivering `pending` to callbacks.
    notifier: Mutex<()>,
}

impl ConnectionStateMachine {
    /// Create a machine in [`ConnectionState::Connecting`].
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            inner: Mutex::new(Inner {
                current: Connecting,
                entered_at: Instant::now(),
                history: Vec::new(),
                pending: VecDeque::new(),
            }),
            callbacks: RwLock::new(Vec::new()),
            notifier: Mutex::new(()),
        }
    }

    /// Connection this machine belongs to.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Current state.
    pub fn current_state(&self) -> ConnectionState {
        self.inner.lock().current
    }

    /// Time spent in the current state.
    pub fn time_in_state(&self) -> Duration {
        self.inner.lock().entered_at.elapsed()
    }

    /// Whether the machine has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.current_state().is_terminal()
    }

    /// Whether events may currently be emitted.
    pub fn is_operational(&self) -> bool {
        self.current_state().is_operational()
    }

    /// Transition with no metadata.
    pub fn transition(
        &self,
        target: ConnectionState,
        reason: impl Into<String>,
    ) -> Result<StateTransitionInfo, TransitionError> {
        self.transition_to(target, reason, Map::new())
    }

    /// Move to `target` if the edge is allowed.
    ///
    /// The check and the update happen under one lock, so of several racing
    /// attempts from the same state exactly one wins. Callbacks run after the
    /// lock is released, in registration order, and observe transitions in
    /// history order. Uncontended, they run before this returns; otherwise the
    /// thread already notifying delivers this transition after its own. A
    /// transition made from inside a callback is delivered once that callback
    /// round finishes.
    pub fn transition_to(
        &self,
        target: ConnectionState,
        reason: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Result<StateTransitionInfo, TransitionError> {
        let info = {
            let mut inner = self.inner.lock();
            let from = inner.current;
            if from.is_terminal() {
                drop(inner);
                return Err(self.reject(TransitionError::Terminal { state: from, to: target }));
            }
            if !from.can_transition_to(target) {
                drop(inner);
                return Err(self.reject(TransitionError::Invalid { from, to: target }));
            }
            let info = StateTransitionInfo {
                from_state: from,
                to_state: target,
                reason: reason.into(),
                timestamp: Utc::now(),
                metadata,
            };
            inner.current = target;
            inner.entered_at = Instant::now();
            inner.history.push(info.clone());
            inner.pending.push_back(info.clone());
            info
        };

        debug!(
            connection_id = %self.connection_id,
            from = %info.from_state,
            to = %info.to_state,
            reason = %info.reason,
            "connection state changed"
        );
        counter!(WS_STATE_TRANSITIONS_TOTAL, "to" => info.to_state.as_str()).increment(1);

        self.notify_pending();
        Ok(info)
    }

    /// Deliver queued transitions unless another caller already is.
    fn notify_pending(&self) {
        loop {
            let Some(notifier) = self.notifier.try_lock() else {
                return;
            };
            loop {
                let next = self.inner.lock().pending.pop_front();
                let Some(info) = next else { break };
                let callbacks = self.callbacks.read().clone();
                for callback in &callbacks {
                    callback(&info);
                }
            }
            drop(notifier);
            // A transition queued after the last pop whose caller lost the
            // try_lock race is ours to deliver.
            if self.inner.lock().pending.is_empty() {
                return;
            }
        }
    }

    fn reject(&self, err: TransitionError) -> TransitionError {
        warn!(connection_id = %self.connection_id, error = %err, "state transition rejected");
        counter!(WS_STATE_TRANSITIONS_REJECTED_TOTAL).increment(1);
        err
    }

    /// Snapshot of every transition so far, oldest first.
    pub fn state_history(&self) -> Vec<StateTransitionInfo> {
        self.inner.lock().history.clone()
    }

    /// Register an observer for successful transitions.
    pub fn add_state_change_callback(&self, callback: StateChangeCallback) {
        self.callbacks.write().push(callback);
    }
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("connection_id", &self.connection_id)
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}
