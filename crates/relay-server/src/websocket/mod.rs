//! Per-user delivery: lifecycle state, transports, emitters, recovery, and the
//! WebSocket session that ties them together.

pub mod circuit;
pub mod emitter;
pub mod events;
pub mod factory;
pub mod handler;
pub mod heartbeat;
pub mod pool;
pub mod recovery;
pub mod registry;
pub mod sanitize;
pub mod session;
pub mod state;
pub mod transport;

pub use emitter::{EmitterStats, UserWebSocketContext, UserWebSocketEmitter};
pub use events::{EventType, WebSocketEvent};
pub use factory::WebSocketBridgeFactory;
pub use pool::{ConnectionInfo, WebSocketConnectionPool};
pub use recovery::{ErrorContext, ErrorRecoveryHandler, RecoveryResult, RecoveryStrategy};
pub use registry::ConnectionStateMachineRegistry;
pub use state::{ConnectionState, ConnectionStateMachine, StateTransitionInfo, TransitionError};
pub use transport::{ChannelTransport, OutboundFrame, ScopedTransport, WebSocketTransport};
