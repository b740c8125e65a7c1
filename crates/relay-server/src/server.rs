//! `RelayServer`: axum HTTP + WebSocket gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::{ConnectionId, ThreadId};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::agent::{AgentRunner, EchoAgent};
use crate::auth::{self, AuthRequest, Authenticator};
use crate::config::RelayConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_CONNECTIONS_REJECTED_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::factory::WebSocketBridgeFactory;
use crate::websocket::pool::WebSocketConnectionPool;
use crate::websocket::recovery::ErrorRecoveryHandler;
use crate::websocket::registry::ConnectionStateMachineRegistry;
use crate::websocket::session;

/// Shared state accessible from axum handlers and sessions.
#[derive(Clone)]
pub struct AppState {
    /// Runtime configuration.
    pub config: Arc<RelayConfig>,
    /// Live connections.
    pub pool: Arc<WebSocketConnectionPool>,
    /// Per-connection lifecycle state.
    pub registry: Arc<ConnectionStateMachineRegistry>,
    /// Error recovery shared by every emitter.
    pub recovery: Arc<ErrorRecoveryHandler>,
    /// Builds per-user emitters.
    pub factory: Arc<WebSocketBridgeFactory>,
    /// Resolves credentials to a user.
    pub authenticator: Arc<dyn Authenticator>,
    /// Executes `agent.run` requests.
    pub agent: Arc<dyn AgentRunner>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The relay server.
pub struct RelayServer {
    state: AppState,
}

impl RelayServer {
    /// Build a server with the echo agent and no metrics endpoint.
    pub fn new(config: RelayConfig) -> Result<Self, ServerError> {
        let authenticator = auth::from_settings(&config.auth)?;
        let pool = Arc::new(WebSocketConnectionPool::new(config.server.max_connections));
        let registry = Arc::new(ConnectionStateMachineRegistry::new());
        let recovery = Arc::new(ErrorRecoveryHandler::new(config.recovery.clone()));
        let factory = Arc::new(WebSocketBridgeFactory::new(
            pool.clone(),
            registry.clone(),
            recovery.clone(),
            config.emitter.clone(),
        ));

        Ok(Self {
            state: AppState {
                config: Arc::new(config),
                pool,
                registry,
                recovery,
                factory,
                authenticator,
                agent: Arc::new(EchoAgent::default()),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                start_time: Instant::now(),
                metrics: None,
            },
        })
    }

    /// Replace the agent runner.
    #[must_use]
    pub fn with_agent(mut self, agent: Arc<dyn AgentRunner>) -> Self {
        self.state.agent = agent;
        self
    }

    /// Replace the authenticator.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.state.authenticator = authenticator;
        self
    }

    /// Serve `/metrics` from this handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind, then serve until the shutdown token fires.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = self.state.config.server.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "relay server listening");

        let router = self.router();
        let token = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "server stopped with error");
            }
        });

        Ok((local_addr, handle))
    }

    /// Shared state handed to handlers.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &Arc<WebSocketConnectionPool> {
        &self.state.pool
    }

    /// Get the state-machine registry.
    pub fn registry(&self) -> &Arc<ConnectionStateMachineRegistry> {
        &self.state.registry
    }

    /// Get the recovery handler.
    pub fn recovery(&self) -> &Arc<ErrorRecoveryHandler> {
        &self.state.recovery
    }

    /// Get the emitter factory.
    pub fn factory(&self) -> &Arc<WebSocketBridgeFactory> {
        &self.state.factory
    }

    /// Get the runtime configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.state.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.pool.connection_count().await;
    Json(health::health_check(
        state.start_time,
        connections,
        state.registry.len(),
        state.recovery.degraded_user_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Query parameters accepted by `/ws`.
#[derive(Debug, Default, Deserialize)]
struct WsParams {
    token: Option<String>,
    user_id: Option<String>,
    thread_id: Option<String>,
}

/// GET /ws: authenticate, check capacity, then upgrade.
///
/// The upgrade is extracted fallibly so credentials are checked first.
async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return reject(StatusCode::SERVICE_UNAVAILABLE, "shutting_down");
    }

    let request = AuthRequest {
        token: params.token,
        user_id: params.user_id,
    };
    let user_id = match state.authenticator.authenticate(&request).await {
        Ok(user) => user,
        Err(e) => {
            debug!(error = %e, "websocket authentication failed");
            return reject(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    };

    let thread_id = match params.thread_id.as_deref() {
        Some(raw) => match ThreadId::parse(raw) {
            Ok(id) => id,
            Err(_) => return reject(StatusCode::BAD_REQUEST, "invalid_thread_id"),
        },
        None => ThreadId::new(),
    };

    let max = state.pool.capacity();
    if state.pool.connection_count().await >= max {
        warn!(max, "connection limit reached");
        return reject(StatusCode::SERVICE_UNAVAILABLE, "capacity");
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let connection_id = ConnectionId::new();
    let max_message_size = state.config.server.max_message_size;
    let shutdown = state.shutdown.clone();
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| {
            shutdown.track_session(session::run_ws_session(
                socket,
                connection_id,
                user_id,
                thread_id,
                state,
            ))
        })
        .into_response()
}

fn reject(status: StatusCode, reason: &'static str) -> Response {
    counter!(WS_CONNECTIONS_REJECTED_TOTAL, "reason" => reason).increment(1);
    (status, reason).into_response()
}
