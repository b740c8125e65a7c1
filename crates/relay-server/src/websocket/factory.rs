//! Creates isolated emitters for authenticated connections.

use std::sync::Arc;

use relay_core::{ConnectionId, ThreadId, UserId};
use tracing::{info, instrument, warn};

use super::emitter::{UserWebSocketContext, UserWebSocketEmitter};
use super::pool::WebSocketConnectionPool;
use super::recovery::ErrorRecoveryHandler;
use super::registry::ConnectionStateMachineRegistry;
use super::transport::{ScopedTransport, WebSocketTransport};
use crate::config::EmitterConfig;
use crate::errors::FactoryError;

/// Builds one [`UserWebSocketEmitter`] per (user, thread, connection).
pub struct WebSocketBridgeFactory {
    pool: Arc<WebSocketConnectionPool>,
    registry: Arc<ConnectionStateMachineRegistry>,
    recovery: Arc<ErrorRecoveryHandler>,
    config: Arc<EmitterConfig>,
}

impl WebSocketBridgeFactory {
    /// Factory over shared pool, registry, and recovery handler.
    pub fn new(
        pool: Arc<WebSocketConnectionPool>,
        registry: Arc<ConnectionStateMachineRegistry>,
        recovery: Arc<ErrorRecoveryHandler>,
        config: EmitterConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            recovery,
            config: Arc::new(config),
        }
    }

    /// Shared recovery handler.
    pub fn recovery(&self) -> &Arc<ErrorRecoveryHandler> {
        &self.recovery
    }

    /// Create an emitter bound to `connection_id`, which must be pooled,
    /// open, and owned by `user_id`.
    ///
    /// The emitter gets its own transport handle and queue. If the user was
    /// left degraded by an earlier connection, the buffered messages are
    /// flushed to this one first.
    #[instrument(skip_all, fields(user_id = %user_id, thread_id = %thread_id, connection_id = %connection_id))]
    pub async fn create_user_emitter(
        &self,
        user_id: &UserId,
        thread_id: &ThreadId,
        connection_id: &ConnectionId,
    ) -> Result<UserWebSocketEmitter, FactoryError> {
        let info = self
            .pool
            .get(connection_id)
            .await
            .ok_or_else(|| FactoryError::UnknownConnection(connection_id.clone()))?;
        if &info.user_id != user_id {
            warn!(owner = %info.user_id, "emitter requested for another user's connection");
            return Err(FactoryError::OwnershipMismatch {
                connection_id: connection_id.clone(),
                user_id: user_id.clone(),
            });
        }
        if !info.transport.is_open() {
            return Err(FactoryError::ConnectionClosed(connection_id.clone()));
        }

        let transport: Arc<dyn WebSocketTransport> =
            Arc::new(ScopedTransport::new(info.transport.clone()));

        if self.recovery.is_degraded(user_id) {
            match self
                .recovery
                .restore(user_id, connection_id, transport.as_ref(), self.config.delivery_timeout)
                .await
            {
                Ok(flushed) => info!(flushed, "flushed degraded buffer to new connection"),
                Err(e) => warn!(error = %e, "degraded flush failed; user stays degraded"),
            }
        }

        Ok(UserWebSocketEmitter::spawn(
            UserWebSocketContext::new(user_id.clone(), thread_id.clone(), connection_id.clone()),
            transport,
            self.config.clone(),
            self.recovery.clone(),
            self.registry.get(connection_id),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoveryConfig;
    use crate::websocket::pool::ConnectionInfo;
    use crate::websocket::transport::{ChannelTransport, OutboundFrame};
    use assert_matches::assert_matches;
    use relay_core::RunId;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        factory: WebSocketBridgeFactory,
        pool: Arc<WebSocketConnectionPool>,
        recovery: Arc<ErrorRecoveryHandler>,
    }

    fn fixture() -> Fixture {
        let pool = Arc::new(WebSocketConnectionPool::new(16));
        let recovery = Arc::new(ErrorRecoveryHandler::new(RecoveryConfig::default()));
        let factory = WebSocketBridgeFactory::new(
            pool.clone(),
            Arc::new(ConnectionStateMachineRegistry::new()),
            recovery.clone(),
            EmitterConfig::default(),
        );
        Fixture {
            factory,
            pool,
            recovery,
        }
    }

    async fn pooled(
        pool: &WebSocketConnectionPool,
        conn: &str,
        user: &str,
    ) -> (Arc<ConnectionInfo>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(16);
        let transport = Arc::new(ChannelTransport::new(ConnectionId::from(conn), tx));
        let info = pool
            .add(ConnectionInfo::new(ConnectionId::from(conn), UserId::from(user), transport))
            .await
            .unwrap();
        (info, rx)
    }

    #[tokio::test]
    async fn unknown_connection_rejected() {
        let f = fixture();
        let err = f
            .factory
            .create_user_emitter(&UserId::from("alice"), &ThreadId::from("t"), &ConnectionId::from("nope"))
            .await
            .err()
            .unwrap();
        assert_matches!(err, FactoryError::UnknownConnection(_));
    }

    #[tokio::test]
    async fn other_users_connection_rejected() {
        let f = fixture();
        let (_info, _rx) = pooled(&f.pool, "c-bob", "bob").await;
        let err = f
            .factory
            .create_user_emitter(&UserId::from("alice"), &ThreadId::from("t"), &ConnectionId::from("c-bob"))
            .await
            .err()
            .unwrap();
        assert_matches!(err, FactoryError::OwnershipMismatch { .. });
    }

    #[tokio::test]
    async fn closed_connection_rejected() {
        let f = fixture();
        let (info, _rx) = pooled(&f.pool, "c1", "alice").await;
        info.transport.close().await.unwrap();
        let err = f
            .factory
            .create_user_emitter(&UserId::from("alice"), &ThreadId::from("t"), &ConnectionId::from("c1"))
            .await
            .err()
            .unwrap();
        assert_matches!(err, FactoryError::ConnectionClosed(_));
    }

    #[tokio::test]
    async fn sibling_emitters_on_one_connection_are_independent() {
        let f = fixture();
        let (info, mut rx) = pooled(&f.pool, "c1", "alice").await;
        let user = UserId::from("alice");
        let conn = ConnectionId::from("c1");

        let a = f.factory.create_user_emitter(&user, &ThreadId::from("t-a"), &conn).await.unwrap();
        let b = f.factory.create_user_emitter(&user, &ThreadId::from("t-b"), &conn).await.unwrap();

        a.cleanup().await;
        assert!(info.transport.is_open());

        b.notify_agent_thinking(&RunId::from("r"), "x", "still", None).unwrap();
        let OutboundFrame::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected text");
        };
        assert!(text.contains("t-b"));
    }

    #[tokio::test]
    async fn degraded_buffer_flushed_on_new_emitter() {
        let f = fixture();
        let user = UserId::from("alice");
        f.recovery.enter_degraded_mode(&user);
        let _ = f.recovery.buffer_message(&user, json!({"seq": 1}));
        let _ = f.recovery.buffer_message(&user, json!({"seq": 2}));

        let (_info, mut rx) = pooled(&f.pool, "c2", "alice").await;
        let _em = f
            .factory
            .create_user_emitter(&user, &ThreadId::from("t"), &ConnectionId::from("c2"))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), OutboundFrame::Text(r#"{"seq":1}"#.into()));
        assert_eq!(rx.recv().await.unwrap(), OutboundFrame::Text(r#"{"seq":2}"#.into()));
        assert!(!f.recovery.is_degraded(&user));
    }
}
