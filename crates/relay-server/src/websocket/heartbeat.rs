//! Heartbeat ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::state::{ConnectionState, ConnectionStateMachine};
use super::transport::{ChannelTransport, WebSocketTransport};

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The peer stayed silent for the whole timeout window.
    TimedOut,
    /// The outbound side closed under us.
    TransportClosed,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Ping the peer every `interval` and time the connection out once it has
/// been silent for `timeout`.
///
/// Any inbound frame counts as a pong (see [`ChannelTransport::mark_alive`]).
/// `timeout / interval` consecutive silent ticks (at least 1) move the state
/// machine to [`ConnectionState::Timeout`].
pub async fn run_heartbeat(
    transport: Arc<ChannelTransport>,
    state: Arc<ConnectionStateMachine>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut check_interval = time::interval(interval);
    let max_missed = u32::try_from(timeout.as_millis() / interval.as_millis().max(1))
        .unwrap_or(u32::MAX)
        .max(1);
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            _ = check_interval.tick() => {
                if transport.check_alive() {
                    missed_pongs = 0;
                } else {
                    missed_pongs += 1;
                    if missed_pongs >= max_missed {
                        warn!(
                            connection_id = %transport.connection_id(),
                            idle_secs = transport.idle_for().as_secs(),
                            "heartbeat timed out"
                        );
                        if let Err(e) = state.transition(ConnectionState::Timeout, "heartbeat timed out") {
                            debug!(error = %e, "timeout not recorded");
                        }
                        return HeartbeatResult::TimedOut;
                    }
                }
                if transport.ping().await.is_err() {
                    return HeartbeatResult::TransportClosed;
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
