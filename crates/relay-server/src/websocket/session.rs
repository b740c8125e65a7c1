//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use relay_core::{ConnectionId, ThreadId, UserId};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::emitter::UserWebSocketEmitter;
use super::handler::{Dispatch, error_reply, handle_message};
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use super::pool::ConnectionInfo;
use super::state::{ConnectionState, ConnectionStateMachine};
use super::transport::{ChannelTransport, OutboundFrame, WebSocketTransport};
use crate::agent::AgentRequest;
use crate::metrics::{
    AGENT_RUNS_ACTIVE, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::server::AppState;

/// How long the writer gets to flush after the session ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Why the receive loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    ClientClosed,
    ReceiveError,
    HeartbeatTimeout,
    TransportClosed,
    Shutdown,
}

/// Run a WebSocket session for an authenticated client.
///
/// 1. Walks the state machine `Connecting → … → ProcessingReady`
/// 2. Pools the connection and attaches an emitter for `(user, thread)`
/// 3. Sends `connection.established`
/// 4. Dispatches inbound frames; agent runs execute on their own tasks
/// 5. Pings on an interval and times out silent clients
/// 6. Cleans up on disconnect, timeout, or shutdown
#[instrument(skip_all, fields(connection_id = %connection_id, user_id = %user_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    connection_id: ConnectionId,
    user_id: UserId,
    thread_id: ThreadId,
    app: AppState,
) {
    let started = Instant::now();
    let machine = app.registry.get_or_create(&connection_id);
    let (ws_tx, mut ws_rx) = ws.split();

    let (send_tx, send_rx) = mpsc::channel::<OutboundFrame>(app.config.server.send_buffer);
    let transport = Arc::new(ChannelTransport::new(connection_id.clone(), send_tx));
    let writer = tokio::spawn(write_loop(ws_tx, send_rx));

    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!(%thread_id, "client connected");

    let emitter = match establish(&app, &machine, &transport, &user_id, &thread_id).await {
        Ok(emitter) => Arc::new(emitter),
        Err(reason) => {
            warn!(%reason, "session setup failed");
            let _ = transport.try_send_text(error_reply("setup_failed", &reason).to_string());
            let _ = machine.transition(ConnectionState::Failed, reason);
            finish(&app, &machine, &transport, None, writer, started).await;
            return;
        }
    };

    let established = json!({
        "type": "connection.established",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "data": {
            "connectionId": connection_id,
            "userId": user_id,
            "threadId": thread_id,
        },
    });
    let _ = transport.try_send_text(established.to_string());

    let heartbeat_cancel = app.shutdown.child_token();
    let mut heartbeat = tokio::spawn(run_heartbeat(
        transport.clone(),
        machine.clone(),
        app.config.server.heartbeat_interval,
        app.config.server.heartbeat_timeout,
        heartbeat_cancel.clone(),
    ));
    let shutdown = app.shutdown.token();
    let active_runs = Arc::new(AtomicUsize::new(0));
    let mut runs = JoinSet::new();

    let exit = loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(t))) => t.as_str().to_owned(),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(s) => s,
                        Err(_) => {
                            debug!(len = data.len(), "non-UTF8 binary frame ignored");
                            transport.mark_alive();
                            continue;
                        }
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        transport.mark_alive();
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break Exit::ClientClosed,
                    Some(Err(e)) => {
                        debug!(error = %e, "receive failed");
                        break Exit::ReceiveError;
                    }
                };
                transport.mark_alive();
                let _ = app.pool.touch(&connection_id).await;

                match handle_message(&text) {
                    Dispatch::Reply(reply) => {
                        if let Err(e) = transport.try_send_text(reply.to_string()) {
                            debug!(error = %e, "reply not sent");
                        }
                    }
                    Dispatch::RunAgent { request, ack } => {
                        let _ = transport.try_send_text(ack.to_string());
                        let _ = runs.spawn(run_agent(
                            app.clone(),
                            request,
                            emitter.clone(),
                            machine.clone(),
                            transport.clone(),
                            active_runs.clone(),
                        ));
                    }
                }
            }
            result = &mut heartbeat => {
                break match result {
                    Ok(HeartbeatResult::TimedOut) => Exit::HeartbeatTimeout,
                    Ok(HeartbeatResult::Cancelled) => Exit::Shutdown,
                    Ok(HeartbeatResult::TransportClosed) | Err(_) => Exit::TransportClosed,
                };
            }
            () = shutdown.cancelled() => break Exit::Shutdown,
            Some(_) = runs.join_next() => {}
        }
    };

    heartbeat_cancel.cancel();
    heartbeat.abort();
    runs.abort_all();

    let (target, reason) = match exit {
        Exit::ClientClosed => (ConnectionState::Closed, "client closed"),
        Exit::Shutdown => (ConnectionState::Closed, "server shutting down"),
        Exit::ReceiveError => (ConnectionState::Failed, "receive error"),
        Exit::TransportClosed => (ConnectionState::Failed, "outbound transport closed"),
        Exit::HeartbeatTimeout => (ConnectionState::Timeout, "heartbeat timed out"),
    };
    if !machine.is_terminal() {
        let _ = machine.transition(target, reason);
    }
    info!(?exit, "client disconnected");

    finish(&app, &machine, &transport, Some(emitter), writer, started).await;
}

/// Walk the handshake states, pool the connection, and build the emitter.
async fn establish(
    app: &AppState,
    machine: &Arc<ConnectionStateMachine>,
    transport: &Arc<ChannelTransport>,
    user_id: &UserId,
    thread_id: &ThreadId,
) -> Result<UserWebSocketEmitter, String> {
    let connection_id = transport.connection_id().clone();
    let step = |target, reason: &str, metadata: Map<String, Value>| {
        machine
            .transition_to(target, reason, metadata)
            .map(|_| ())
            .map_err(|e| e.to_string())
    };

    step(ConnectionState::Accepted, "websocket upgrade complete", Map::new())?;

    let mut who = Map::new();
    let _ = who.insert("user_id".into(), json!(user_id));
    step(ConnectionState::Authenticated, "credentials accepted", who)?;

    let info = ConnectionInfo::new(connection_id.clone(), user_id.clone(), transport.clone());
    let _ = app.pool.add(info).await.map_err(|e| e.to_string())?;
    step(ConnectionState::ServicesReady, "connection pooled", Map::new())?;

    let emitter = app
        .factory
        .create_user_emitter(user_id, thread_id, &connection_id)
        .await
        .map_err(|e| e.to_string())?;

    let mut thread = Map::new();
    let _ = thread.insert("thread_id".into(), json!(thread_id));
    step(ConnectionState::ProcessingReady, "emitter attached", thread)?;
    Ok(emitter)
}

async fn run_agent(
    app: AppState,
    request: AgentRequest,
    emitter: Arc<UserWebSocketEmitter>,
    machine: Arc<ConnectionStateMachine>,
    transport: Arc<ChannelTransport>,
    active_runs: Arc<AtomicUsize>,
) {
    if active_runs.fetch_add(1, Ordering::AcqRel) == 0
        && machine.current_state() == ConnectionState::ProcessingReady
    {
        let _ = machine.transition(ConnectionState::Processing, "agent run started");
    }
    gauge!(AGENT_RUNS_ACTIVE).increment(1.0);
    debug!(run_id = %request.run_id, agent = %request.agent_name, "agent run started");

    if let Err(e) = app.agent.run(&request, &emitter).await {
        warn!(run_id = %request.run_id, error = %e, "agent run aborted");
        let _ = transport.try_send_text(error_reply("agent_run_failed", &e.to_string()).to_string());
    }

    gauge!(AGENT_RUNS_ACTIVE).decrement(1.0);
    if active_runs.fetch_sub(1, Ordering::AcqRel) == 1
        && machine.current_state() == ConnectionState::Processing
    {
        let _ = machine.transition(ConnectionState::ProcessingReady, "agent run finished");
    }
}

/// Release everything the session registered.
async fn finish(
    app: &AppState,
    machine: &Arc<ConnectionStateMachine>,
    transport: &Arc<ChannelTransport>,
    emitter: Option<Arc<UserWebSocketEmitter>>,
    writer: tokio::task::JoinHandle<()>,
    started: Instant,
) {
    let connection_id = transport.connection_id();
    if let Some(emitter) = emitter {
        emitter.cleanup().await;
    }
    let _ = app.pool.remove(connection_id).await;
    let _ = transport.close().await;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!("writer did not drain in time");
    }
    let _ = app.registry.unregister(machine.connection_id());
    app.recovery.forget_connection(connection_id);

    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}

/// Drain outbound frames into the socket until closed.
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<OutboundFrame>) {
    while let Some(frame) = rx.recv().await {
        let message = match frame {
            OutboundFrame::Text(text) => Message::Text(text.into()),
            OutboundFrame::Ping => Message::Ping(Bytes::new()),
            OutboundFrame::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        };
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
