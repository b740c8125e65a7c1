//! Error types for the delivery subsystem.
//!
//! [`TransportError`] is what a socket operation can fail with;
//! [`ErrorKind`] is the recovery taxonomy those failures are classified into.

use std::fmt;

use relay_core::{ConnectionId, InvalidId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Recovery taxonomy for transport-level failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The peer went away or the socket was closed.
    ConnectionLost,
    /// A send failed or timed out.
    MessageDeliveryFailed,
    /// The outbound payload could not be serialized.
    MessageSerializationFailed,
    /// The peer or an upstream asked us to slow down.
    RateLimitExceeded,
    /// The peer's credentials were rejected or expired.
    AuthenticationFailed,
    /// Memory, queue, or descriptor limits were hit.
    ResourceExhausted,
}

impl ErrorKind {
    /// Wire name, e.g. `connection_lost`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionLost => "connection_lost",
            Self::MessageDeliveryFailed => "message_delivery_failed",
            Self::MessageSerializationFailed => "message_serialization_failed",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::AuthenticationFailed => "authentication_failed",
            Self::ResourceExhausted => "resource_exhausted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single transport operation.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection is closed.
    #[error("connection closed")]
    Closed,
    /// The operation did not finish within its deadline.
    #[error("send timed out")]
    Timeout,
    /// The underlying socket rejected the frame.
    #[error("send failed: {0}")]
    SendFailed(String),
    /// The payload could not be encoded.
    #[error("serialization failed: {0}")]
    Serialization(String),
    /// The peer is rate limiting us.
    #[error("rate limited")]
    RateLimited {
        /// Server-suggested wait, if any.
        retry_after_ms: Option<u64>,
    },
    /// Credentials were rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// A resource limit was hit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl TransportError {
    /// Classify into the recovery taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Closed => ErrorKind::ConnectionLost,
            Self::Timeout | Self::SendFailed(_) => ErrorKind::MessageDeliveryFailed,
            Self::Serialization(_) => ErrorKind::MessageSerializationFailed,
            Self::RateLimited { .. } => ErrorKind::RateLimitExceeded,
            Self::Unauthorized(_) => ErrorKind::AuthenticationFailed,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
        }
    }
}

/// Failure to flush a degraded user's buffer.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RestoreError {
    /// The connection's breaker is open or the connection is isolated; the
    /// transport was not touched.
    #[error("circuit open for connection {0}")]
    CircuitOpen(ConnectionId),
    /// A flush send failed or timed out.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure to enqueue an event on a user's emitter.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmitError {
    /// `cleanup()` already ran for this context.
    #[error("emitter for connection {0} is closed")]
    Closed(ConnectionId),
    /// The private queue is at capacity.
    #[error("event queue full ({capacity} events)")]
    QueueFull {
        /// Configured `max_events_per_user`.
        capacity: usize,
    },
}

/// Failure to create a user emitter.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FactoryError {
    /// No live connection is registered under this ID.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    /// The connection belongs to a different user.
    #[error("connection {connection_id} is not owned by user {user_id}")]
    OwnershipMismatch {
        /// Requested connection.
        connection_id: ConnectionId,
        /// User that asked for it.
        user_id: UserId,
    },
    /// The connection exists but its transport is no longer open.
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),
}

/// Rejected WebSocket credentials.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Neither a token nor a user ID was supplied.
    #[error("missing credentials")]
    MissingCredentials,
    /// The token is not recognised.
    #[error("invalid token")]
    InvalidToken,
    /// The supplied user ID is malformed.
    #[error("invalid user id: {0}")]
    InvalidUserId(#[from] InvalidId),
}

/// Failure to register a connection with the pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// `max_connections` live connections are already registered.
    #[error("connection pool full ({capacity} connections)")]
    Full {
        /// Configured capacity.
        capacity: usize,
    },
    /// The ID is already registered.
    #[error("connection {0} already registered")]
    Duplicate(ConnectionId),
}

/// Failure starting or running the HTTP server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not bind the listen address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address we tried to bind.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The accept loop failed.
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
    /// A user ID in the token table is malformed.
    #[error("invalid auth configuration: {0}")]
    AuthConfig(#[from] InvalidId),
}
