//! Branded ID newtypes.
//!
//! Users, threads, connections, requests, and runs each get a distinct
//! wrapper around `String`. A `ThreadId` can never be passed where a `UserId`
//! is expected, which is the whole point: mixing identifiers up is how one
//! user's events end up on another user's socket.
//!
//! Fresh IDs are UUID v7 (time-ordered) generated via [`uuid::Uuid::now_v7`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Longest identifier accepted from the outside world.
pub const MAX_ID_LEN: usize = 128;

/// Rejection reason for an externally supplied identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidId {
    /// The value was empty or whitespace only.
    #[error("{kind} must not be empty")]
    Empty {
        /// Which ID type was being parsed.
        kind: &'static str,
    },
    /// The value exceeded [`MAX_ID_LEN`] bytes.
    #[error("{kind} exceeds {MAX_ID_LEN} bytes")]
    TooLong {
        /// Which ID type was being parsed.
        kind: &'static str,
    },
    /// The value contained whitespace or control characters.
    #[error("{kind} contains whitespace or control characters")]
    BadCharacter {
        /// Which ID type was being parsed.
        kind: &'static str,
    },
}

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

fn validate(kind: &'static str, s: &str) -> Result<(), InvalidId> {
    if s.trim().is_empty() {
        return Err(InvalidId::Empty { kind });
    }
    if s.len() > MAX_ID_LEN {
        return Err(InvalidId::TooLong { kind });
    }
    if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(InvalidId::BadCharacter { kind });
    }
    Ok(())
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Validate an externally supplied value.
            pub fn parse(s: &str) -> Result<Self, InvalidId> {
                validate($kind, s)?;
                Ok(Self(s.to_owned()))
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Authenticated end user.
    UserId, "user id"
}

branded_id! {
    /// Conversation thread owned by a user.
    ThreadId, "thread id"
}

branded_id! {
    /// One physical WebSocket connection.
    ConnectionId, "connection id"
}

branded_id! {
    /// Inbound client request.
    RequestId, "request id"
}

branded_id! {
    /// One agent run inside a thread.
    RunId, "run id"
}
