//! # relay-server
//!
//! Per-user isolated WebSocket event delivery.
//!
//! - Connection lifecycle state machine and its registry
//! - Per-user emitters with private queues and a single delivery task each
//! - Connection pool mapping connection IDs to live transports
//! - Error recovery: circuit breaker, backoff, degraded-mode buffering
//! - Axum gateway: `/health`, `/metrics`, `/ws`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod agent;
pub mod auth;
pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::{EmitterConfig, RecoveryConfig, RelayConfig, ServerConfig};
pub use errors::{
    AuthError, EmitError, ErrorKind, FactoryError, PoolError, RestoreError, ServerError,
    TransportError,
};
pub use server::{AppState, RelayServer};
