//! Transport abstraction over a single WebSocket connection.
//!
//! [`ChannelTransport`] is the production implementation: it feeds a bounded
//! channel drained by the session's writer task, which owns the socket sink.
//! [`ScopedTransport`] is the per-context handle emitters write through; closing
//! it detaches that one context and leaves the connection alone.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::ConnectionId;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use crate::errors::TransportError;

/// Operations the delivery layer needs from a connection.
///
/// Any error is a transport failure and is fed to error recovery.
#[async_trait]
pub trait WebSocketTransport: Send + Sync {
    /// Send a text frame.
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Serialize `value` and send it as a text frame.
    async fn send_json(&self, value: &Value) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(value).map_err(|e| TransportError::Serialization(e.to_string()))?;
        self.send_text(text).await
    }

    /// Send a ping frame.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&self) -> Result<(), TransportError>;

    /// Whether frames can still be sent.
    fn is_open(&self) -> bool;
}

/// Frame handed to the session writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Text payload.
    Text(String),
    /// Server ping.
    Ping,
    /// Close the socket and stop writing.
    Close,
}

/// Channel-backed transport for a live connection.
pub struct ChannelTransport {
    connection_id: ConnectionId,
    tx: mpsc::Sender<OutboundFrame>,
    open: AtomicBool,
    connected_at: Instant,
    /// Set on any inbound traffic, cleared by the heartbeat.
    is_alive: AtomicBool,
    last_activity: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl ChannelTransport {
    /// Create a transport writing into `tx`.
    pub fn new(connection_id: ConnectionId, tx: mpsc::Sender<OutboundFrame>) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            tx,
            open: AtomicBool::new(true),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_activity: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Connection this transport writes to.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Enqueue a text frame without waiting.
    ///
    /// Used for control replies (pong, errors) from the receive loop, which
    /// must never block on a slow writer.
    pub fn try_send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        match self.tx.try_send(OutboundFrame::Text(text)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::ResourceExhausted("outbound buffer full".into()))
            }
            Err(TrySendError::Closed(_)) => {
                self.open.store(false, Ordering::Release);
                Err(TransportError::Closed)
            }
        }
    }

    /// Frames refused because the outbound buffer was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record inbound traffic.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the peer was heard from since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last inbound traffic (or connection establishment).
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    async fn push(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.tx.send(frame).await.map_err(|_| {
            self.open.store(false, Ordering::Release);
            TransportError::Closed
        })
    }
}

#[async_trait]
impl WebSocketTransport for ChannelTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.push(OutboundFrame::Text(text)).await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.push(OutboundFrame::Ping).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.open.swap(false, Ordering::AcqRel) {
            // Writer may already be gone; the flag is what matters.
            let _ = self.tx.try_send(OutboundFrame::Close);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }
}

/// A context's private handle onto a shared connection.
pub struct ScopedTransport {
    inner: Arc<dyn WebSocketTransport>,
    open: AtomicBool,
}

impl ScopedTransport {
    /// New open handle onto `inner`.
    pub fn new(inner: Arc<dyn WebSocketTransport>) -> Self {
        Self {
            inner,
            open: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl WebSocketTransport for ScopedTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.inner.send_text(text).await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.inner.ping().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.inner.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_transport(cap: usize) -> (ChannelTransport, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(cap);
        (ChannelTransport::new(ConnectionId::from("conn_1"), tx), rx)
    }

    #[tokio::test]
    async fn send_json_arrives_as_text() {
        let (t, mut rx) = make_transport(8);
        t.send_json(&serde_json::json!({"key": "value"})).await.unwrap();
        let OutboundFrame::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["key"], "value");
    }

    #[tokio::test]
    async fn frames_keep_order() {
        let (t, mut rx) = make_transport(8);
        for i in 0..3 {
            t.send_text(format!("m{i}")).await.unwrap();
        }
        t.ping().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), OutboundFrame::Text("m0".into()));
        assert_eq!(rx.recv().await.unwrap(), OutboundFrame::Text("m1".into()));
        assert_eq!(rx.recv().await.unwrap(), OutboundFrame::Text("m2".into()));
        assert_eq!(rx.recv().await.unwrap(), OutboundFrame::Ping);
    }

    #[tokio::test]
    async fn dropped_receiver_means_closed() {
        let (t, rx) = make_transport(8);
        drop(rx);
        assert!(!t.is_open());
        assert_matches!(t.send_text("x".into()).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_sends_one_close_frame() {
        let (t, mut rx) = make_transport(8);
        t.close().await.unwrap();
        t.close().await.unwrap();
        assert!(!t.is_open());
        assert_eq!(rx.recv().await.unwrap(), OutboundFrame::Close);
        assert!(rx.try_recv().is_err());
        assert_matches!(t.ping().await, Err(TransportError::Closed));
    }

    #[test]
    fn try_send_full_counts_drop() {
        let (t, _rx) = make_transport(1);
        t.try_send_text("a".into()).unwrap();
        assert_matches!(
            t.try_send_text("b".into()),
            Err(TransportError::ResourceExhausted(_))
        );
        assert_eq!(t.drop_count(), 1);
    }

    #[tokio::test]
    async fn closing_scoped_handle_leaves_connection_open() {
        let (t, mut rx) = make_transport(8);
        let conn: Arc<dyn WebSocketTransport> = Arc::new(t);
        let a = ScopedTransport::new(conn.clone());
        let b = ScopedTransport::new(conn.clone());

        a.close().await.unwrap();
        assert!(!a.is_open());
        assert_matches!(a.send_text("x".into()).await, Err(TransportError::Closed));

        assert!(conn.is_open());
        b.send_text("still here".into()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), OutboundFrame::Text("still here".into()));
    }

    #[tokio::test]
    async fn scoped_handle_follows_connection_close() {
        let (t, _rx) = make_transport(8);
        let conn: Arc<dyn WebSocketTransport> = Arc::new(t);
        let scoped = ScopedTransport::new(conn.clone());
        conn.close().await.unwrap();
        assert!(!scoped.is_open());
    }

    #[test]
    fn mark_alive_and_check() {
        let (t, _rx) = make_transport(1);
        assert!(t.check_alive());
        assert!(!t.check_alive());
        t.mark_alive();
        assert!(t.check_alive());
        assert!(t.idle_for() < Duration::from_secs(1));
    }
}
