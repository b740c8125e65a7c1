//! In-process delivery scenarios with mock transports: cross-user isolation,
//! sanitization, circuit breaking, and cleanup.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use relay_core::{ConnectionId, RunId, ThreadId, UserId};
use relay_server::errors::{EmitError, ErrorKind, TransportError};
use relay_server::websocket::{
    ConnectionInfo, ConnectionStateMachineRegistry, ErrorContext, ErrorRecoveryHandler,
    UserWebSocketEmitter, WebSocketBridgeFactory, WebSocketConnectionPool, WebSocketTransport,
};
use relay_server::{EmitterConfig, RecoveryConfig};

/// Records every text frame it is given.
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<Value>>,
    closed: AtomicBool,
}

impl RecordingTransport {
    fn messages(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl WebSocketTransport for RecordingTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let value = serde_json::from_str(&text)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        self.sent.lock().push(value);
        Ok(())
    }

    async fn ping(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

/// Fails every send and counts the attempts.
#[derive(Default)]
struct FailingTransport {
    sends: AtomicU32,
}

#[async_trait]
impl WebSocketTransport for FailingTransport {
    async fn send_text(&self, _text: String) -> Result<(), TransportError> {
        let _ = self.sends.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::SendFailed("peer reset".into()))
    }

    async fn ping(&self) -> Result<(), TransportError> {
        Err(TransportError::SendFailed("peer reset".into()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }
}

struct Harness {
    pool: Arc<WebSocketConnectionPool>,
    factory: WebSocketBridgeFactory,
}

fn harness(emitter: EmitterConfig) -> Harness {
    let pool = Arc::new(WebSocketConnectionPool::new(64));
    let registry = Arc::new(ConnectionStateMachineRegistry::new());
    let recovery = Arc::new(ErrorRecoveryHandler::new(RecoveryConfig::default()));
    let factory = WebSocketBridgeFactory::new(pool.clone(), registry, recovery, emitter);
    Harness { pool, factory }
}

async fn attach(
    h: &Harness,
    user: &str,
    thread: &str,
) -> (UserWebSocketEmitter, Arc<RecordingTransport>) {
    let connection_id = ConnectionId::from(format!("conn-{user}"));
    let transport = Arc::new(RecordingTransport::default());
    let _ = h
        .pool
        .add(ConnectionInfo::new(
            connection_id.clone(),
            UserId::from(user),
            transport.clone(),
        ))
        .await
        .unwrap();
    let emitter = h
        .factory
        .create_user_emitter(&UserId::from(user), &ThreadId::from(thread), &connection_id)
        .await
        .unwrap();
    (emitter, transport)
}

async fn wait_for(transport: &RecordingTransport, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while transport.messages().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("messages not delivered in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn five_users_each_receive_exactly_their_own_events() {
    let h = harness(EmitterConfig::default());
    let mut users = Vec::new();
    for i in 0..5 {
        let (emitter, transport) = attach(&h, &format!("user-{i}"), &format!("thread-{i}")).await;
        users.push((i, Arc::new(emitter), transport));
    }

    let mut tasks = Vec::new();
    for (i, emitter, _) in &users {
        let (i, emitter) = (*i, emitter.clone());
        tasks.push(tokio::spawn(async move {
            let run = RunId::from(format!("run-{i}"));
            for step in 0..10u32 {
                emitter
                    .notify_agent_thinking(&run, "planner", &format!("user-{i} step {step}"), Some(step))
                    .unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for (i, emitter, transport) in &users {
        wait_for(transport, 10).await;
        let messages = transport.messages();
        assert_eq!(messages.len(), 10, "user-{i} got a foreign or missing event");
        for (step, msg) in messages.iter().enumerate() {
            assert_eq!(msg["event_type"], "agent_thinking");
            assert_eq!(msg["thread_id"], format!("thread-{i}"));
            assert_eq!(msg["data"]["run_id"], format!("run-{i}"));
            assert_eq!(msg["data"]["step"], step);
            assert_eq!(msg["data"]["thought"], format!("user-{i} step {step}"));
        }
        assert_eq!(emitter.stats().delivered, 10);
    }
}

#[tokio::test]
async fn sibling_contexts_on_one_connection_are_independent() {
    let h = harness(EmitterConfig::default());
    let connection_id = ConnectionId::from("shared");
    let transport = Arc::new(RecordingTransport::default());
    let _ = h
        .pool
        .add(ConnectionInfo::new(
            connection_id.clone(),
            UserId::from("alice"),
            transport.clone(),
        ))
        .await
        .unwrap();

    let user = UserId::from("alice");
    let first = h
        .factory
        .create_user_emitter(&user, &ThreadId::from("t1"), &connection_id)
        .await
        .unwrap();
    let second = h
        .factory
        .create_user_emitter(&user, &ThreadId::from("t2"), &connection_id)
        .await
        .unwrap();

    first.cleanup().await;
    assert!(transport.is_open());

    second
        .notify_agent_thinking(&RunId::from("r2"), "a", "still here", None)
        .unwrap();
    wait_for(&transport, 1).await;
    assert_eq!(transport.messages()[0]["thread_id"], "t2");
}

#[tokio::test]
async fn sensitive_fields_are_redacted_and_long_strings_truncated() {
    let h = harness(EmitterConfig::default());
    let (emitter, transport) = attach(&h, "alice", "t1").await;

    let long = "x".repeat(501);
    emitter
        .notify_tool_executing(
            &RunId::from("r1"),
            "coder",
            "http",
            json!({"api_key": "sk-123", "password": "hunter2", "safe": "ok", "body": long}),
        )
        .unwrap();

    wait_for(&transport, 1).await;
    let params = &transport.messages()[0]["data"]["parameters"];
    assert_eq!(params["api_key"], "[REDACTED]");
    assert_eq!(params["password"], "[REDACTED]");
    assert_eq!(params["safe"], "ok");
    let body = params["body"].as_str().unwrap();
    assert_eq!(body.chars().count(), 203);
    assert!(body.ends_with("..."));
}

#[tokio::test(start_paused = true)]
async fn breaker_rejects_sixth_call_without_touching_transport() {
    let recovery = ErrorRecoveryHandler::new(RecoveryConfig::default());
    let transport = FailingTransport::default();
    let ctx = || {
        ErrorContext::new(
            ErrorKind::MessageDeliveryFailed,
            ConnectionId::from("c1"),
            UserId::from("alice"),
        )
        .with_message(json!({"event_type": "agent_thinking"}))
    };

    for _ in 0..5 {
        let result = recovery.handle_error(ctx(), &transport).await;
        assert!(!result.success);
        assert!(!result.rejected_by_circuit_breaker);
    }
    let sends_before = transport.sends.load(Ordering::SeqCst);
    assert!(sends_before > 0);

    let sixth = recovery.handle_error(ctx(), &transport).await;
    assert!(!sixth.success);
    assert!(sixth.rejected_by_circuit_breaker);
    assert_eq!(sixth.attempts_made, 0);
    assert_eq!(transport.sends.load(Ordering::SeqCst), sends_before);
    assert_eq!(recovery.breaker_state(&ConnectionId::from("c1")), Some("open"));
}

#[tokio::test]
async fn cleanup_is_idempotent_and_closes_the_emitter() {
    let h = harness(EmitterConfig::default());
    let (emitter, transport) = attach(&h, "alice", "t1").await;

    emitter.cleanup().await;
    emitter.cleanup().await;

    assert!(!emitter.is_active());
    assert_matches!(
        emitter.notify_agent_thinking(&RunId::from("r"), "a", "late", None),
        Err(EmitError::Closed(_))
    );
    // The pooled connection belongs to the session, not the emitter.
    assert!(transport.is_open());
}
