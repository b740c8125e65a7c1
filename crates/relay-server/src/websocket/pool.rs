//! Connection ID → live transport handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_core::{ConnectionId, UserId};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::transport::WebSocketTransport;
use crate::errors::PoolError;

/// A pooled connection.
pub struct ConnectionInfo {
    /// Connection ID.
    pub connection_id: ConnectionId,
    /// Authenticated owner.
    pub user_id: UserId,
    /// Handle used to write to the peer.
    pub transport: Arc<dyn WebSocketTransport>,
    /// When the connection was pooled.
    pub created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
}

impl ConnectionInfo {
    /// Wrap a transport owned by `user_id`.
    pub fn new(
        connection_id: ConnectionId,
        user_id: UserId,
        transport: Arc<dyn WebSocketTransport>,
    ) -> Self {
        Self {
            connection_id,
            user_id,
            transport,
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

impl std::fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("connection_id", &self.connection_id)
            .field("user_id", &self.user_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Live connections indexed by ID.
pub struct WebSocketConnectionPool {
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionInfo>>>,
    capacity: usize,
}

impl WebSocketConnectionPool {
    /// Pool holding at most `capacity` connections.
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a connection.
    pub async fn add(&self, info: ConnectionInfo) -> Result<Arc<ConnectionInfo>, PoolError> {
        let mut conns = self.connections.write().await;
        if conns.contains_key(&info.connection_id) {
            return Err(PoolError::Duplicate(info.connection_id));
        }
        if conns.len() >= self.capacity {
            return Err(PoolError::Full {
                capacity: self.capacity,
            });
        }
        let info = Arc::new(info);
        let _ = conns.insert(info.connection_id.clone(), info.clone());
        debug!(
            connection_id = %info.connection_id,
            user_id = %info.user_id,
            pooled = conns.len(),
            "connection pooled"
        );
        Ok(info)
    }

    /// Remove a connection by ID.
    pub async fn remove(&self, connection_id: &ConnectionId) -> Option<Arc<ConnectionInfo>> {
        self.connections.write().await.remove(connection_id)
    }

    /// Look up a connection.
    pub async fn get(&self, connection_id: &ConnectionId) -> Option<Arc<ConnectionInfo>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    /// Every connection owned by `user_id`.
    pub async fn user_connections(&self, user_id: &UserId) -> Vec<Arc<ConnectionInfo>> {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| &c.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Record activity on a connection. Returns `false` if it is not pooled.
    pub async fn touch(&self, connection_id: &ConnectionId) -> bool {
        match self.connections.read().await.get(connection_id) {
            Some(info) => {
                info.touch();
                true
            }
            None => false,
        }
    }

    /// Number of pooled connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// IDs idle for longer than `max_idle`.
    pub async fn idle_connections(&self, max_idle: Duration) -> Vec<ConnectionId> {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.idle_for() > max_idle)
            .map(|c| c.connection_id.clone())
            .collect()
    }

    /// Close and remove every connection. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<_> = self.connections.write().await.drain().map(|(_, c)| c).collect();
        for conn in &drained {
            if let Err(e) = conn.transport.close().await {
                warn!(connection_id = %conn.connection_id, error = %e, "close failed");
            }
        }
        info!(closed = drained.len(), "connection pool drained");
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::transport::{ChannelTransport, OutboundFrame};
    use assert_matches::assert_matches;
    use tokio::sync::mpsc;

    fn info(conn: &str, user: &str) -> (ConnectionInfo, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(8);
        let transport = Arc::new(ChannelTransport::new(ConnectionId::from(conn), tx));
        (
            ConnectionInfo::new(ConnectionId::from(conn), UserId::from(user), transport),
            rx,
        )
    }

    #[tokio::test]
    async fn add_get_remove() {
        let pool = WebSocketConnectionPool::new(10);
        let (i, _rx) = info("c1", "alice");
        let _ = pool.add(i).await.unwrap();
        assert_eq!(pool.connection_count().await, 1);
        assert_eq!(pool.get(&ConnectionId::from("c1")).await.unwrap().user_id, UserId::from("alice"));

        assert!(pool.remove(&ConnectionId::from("c1")).await.is_some());
        assert!(pool.get(&ConnectionId::from("c1")).await.is_none());
    }

    #[tokio::test]
    async fn duplicate_and_full_rejected() {
        let pool = WebSocketConnectionPool::new(1);
        let (a, _ra) = info("c1", "alice");
        let (dup, _rd) = info("c1", "alice");
        let (b, _rb) = info("c2", "bob");
        let _ = pool.add(a).await.unwrap();
        assert_matches!(pool.add(dup).await, Err(PoolError::Duplicate(_)));
        assert_matches!(pool.add(b).await, Err(PoolError::Full { capacity: 1 }));
    }

    #[tokio::test]
    async fn user_connections_filters_by_owner() {
        let pool = WebSocketConnectionPool::new(10);
        let mut rxs = Vec::new();
        for (c, u) in [("c1", "alice"), ("c2", "bob"), ("c3", "alice")] {
            let (i, rx) = info(c, u);
            rxs.push(rx);
            let _ = pool.add(i).await.unwrap();
        }
        let mut ids: Vec<_> = pool
            .user_connections(&UserId::from("alice"))
            .await
            .iter()
            .map(|c| c.connection_id.to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["c1", "c3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_and_touch() {
        let pool = WebSocketConnectionPool::new(10);
        let (a, _ra) = info("c1", "alice");
        let (b, _rb) = info("c2", "bob");
        let _ = pool.add(a).await.unwrap();
        let _ = pool.add(b).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(pool.touch(&ConnectionId::from("c1")).await);
        assert!(!pool.touch(&ConnectionId::from("missing")).await);

        let idle = pool.idle_connections(Duration::from_secs(5)).await;
        assert_eq!(idle, vec![ConnectionId::from("c2")]);
    }

    #[tokio::test]
    async fn close_all_closes_transports() {
        let pool = WebSocketConnectionPool::new(10);
        let (a, mut ra) = info("c1", "alice");
        let transport = a.transport.clone();
        let _ = pool.add(a).await.unwrap();

        assert_eq!(pool.close_all().await, 1);
        assert_eq!(pool.connection_count().await, 0);
        assert!(!transport.is_open());
        assert_eq!(ra.recv().await.unwrap(), OutboundFrame::Close);
    }
}
