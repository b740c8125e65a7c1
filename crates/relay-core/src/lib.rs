//! # relay-core
//!
//! Foundation types shared by every relay crate:
//!
//! - **Branded IDs**: `UserId`, `ThreadId`, `ConnectionId`, `RequestId`, `RunId`
//!   as distinct newtypes so that swapping one for another is a compile error
//! - **Backoff**: exponential delay math with jitter used by delivery retries
//!   and error recovery
//! - **Logging**: `tracing` subscriber initialisation

#![deny(unsafe_code)]

pub mod backoff;
pub mod ids;
pub mod logging;

pub use backoff::BackoffConfig;
pub use ids::{ConnectionId, InvalidId, RequestId, RunId, ThreadId, UserId};
pub use logging::{LogFormat, init_subscriber};
