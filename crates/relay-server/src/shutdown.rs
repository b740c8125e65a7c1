//! Server lifecycle.
//!
//! One root token stops the accept loop and every WebSocket session. Upgraded
//! sessions run detached from the HTTP server, so each is registered with a
//! [`TaskTracker`]; [`ShutdownCoordinator::drain`] waits for them to finish
//! their teardown (emitter cleanup, pool removal, registry unregister) before
//! the process exits.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TrackedFuture;
use tracing::{info, warn};

/// Stops the server and tracks the sessions that must drain.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    sessions: TaskTracker,
}

impl ShutdownCoordinator {
    /// Coordinator with no sessions.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            sessions: TaskTracker::new(),
        }
    }

    /// The root token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// A token cancelled with the root but cancellable on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Cancel the root token.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wrap a session so [`drain`](Self::drain) waits for it.
    pub fn track_session<F: Future>(&self, session: F) -> TrackedFuture<F> {
        self.sessions.track_future(session)
    }

    /// Sessions that have not finished yet.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Cancel everything, then wait up to `grace` for the server task and
    /// every tracked session to finish.
    ///
    /// Returns `false` if the grace period ran out first.
    pub async fn drain(&self, server: JoinHandle<()>, grace: Duration) -> bool {
        self.shutdown();
        let _ = self.sessions.close();
        info!(
            sessions = self.sessions.len(),
            grace_ms = grace.as_millis(),
            "draining sessions"
        );

        let finished = async {
            if let Err(e) = server.await {
                warn!(error = %e, "server task failed");
            }
            self.sessions.wait().await;
        };
        if tokio::time::timeout(grace, finished).await.is_err() {
            warn!(
                sessions = self.sessions.len(),
                "grace period elapsed with sessions still closing"
            );
            return false;
        }
        true
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
