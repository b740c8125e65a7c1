//! Pluggable agent execution driven by inbound `agent.run` frames.
//!
//! The relay does not host agent logic. An [`AgentRunner`] receives the
//! request plus the caller's emitter and reports progress through it;
//! [`EchoAgent`] is the built-in runner that walks through the full event
//! lifecycle and echoes the message back.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use relay_core::RunId;
use serde_json::{Map, Value, json};

use crate::errors::EmitError;
use crate::websocket::emitter::UserWebSocketEmitter;

/// One `agent.run` request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentRequest {
    /// Run identifier (client-supplied or generated).
    pub run_id: RunId,
    /// Agent to run.
    pub agent_name: String,
    /// User message.
    pub message: String,
}

/// Executes agent runs, emitting lifecycle events as it goes.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run to completion and return the final result.
    async fn run(
        &self,
        request: &AgentRequest,
        emitter: &UserWebSocketEmitter,
    ) -> Result<Value, EmitError>;
}

/// Emits all five lifecycle events and echoes the message back.
#[derive(Clone, Debug, Default)]
pub struct EchoAgent {
    step_delay: Duration,
}

impl EchoAgent {
    /// Echo agent pausing `step_delay` between events.
    pub fn with_step_delay(step_delay: Duration) -> Self {
        Self { step_delay }
    }

    async fn pause(&self) {
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }
    }
}

#[async_trait]
impl AgentRunner for EchoAgent {
    async fn run(
        &self,
        request: &AgentRequest,
        emitter: &UserWebSocketEmitter,
    ) -> Result<Value, EmitError> {
        let started = Instant::now();
        let (run, agent) = (&request.run_id, request.agent_name.as_str());

        let mut context = Map::new();
        let _ = context.insert("message_chars".into(), json!(request.message.chars().count()));
        emitter.notify_agent_started(run, agent, context)?;
        self.pause().await;

        emitter.notify_agent_thinking(run, agent, &format!("Echoing: {}", request.message), Some(1))?;
        self.pause().await;

        let tool_started = Instant::now();
        emitter.notify_tool_executing(run, agent, "echo", json!({"text": request.message}))?;
        self.pause().await;
        let output = json!({"text": request.message});
        emitter.notify_tool_completed(
            run,
            agent,
            "echo",
            output,
            Some(elapsed_ms(tool_started)),
        )?;

        let result = json!({"reply": request.message});
        emitter.notify_agent_completed(run, agent, result.clone(), Some(elapsed_ms(started)))?;
        Ok(result)
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use relay_core::{ConnectionId, ThreadId, UserId};
    use tokio::sync::mpsc;

    use crate::config::{EmitterConfig, RecoveryConfig};
    use crate::websocket::emitter::UserWebSocketContext;
    use crate::websocket::recovery::ErrorRecoveryHandler;
    use crate::websocket::transport::{ChannelTransport, OutboundFrame};

    #[tokio::test]
    async fn echo_agent_emits_full_lifecycle() {
        let (tx, mut rx) = mpsc::channel(16);
        let emitter = UserWebSocketEmitter::spawn(
            UserWebSocketContext::new(UserId::from("u"), ThreadId::from("t"), ConnectionId::from("c")),
            Arc::new(ChannelTransport::new(ConnectionId::from("c"), tx)),
            Arc::new(EmitterConfig::default()),
            Arc::new(ErrorRecoveryHandler::new(RecoveryConfig::default())),
            None,
        );
        let request = AgentRequest {
            run_id: RunId::from("run-9"),
            agent_name: "echo".into(),
            message: "hello".into(),
        };

        let result = EchoAgent::default().run(&request, &emitter).await.unwrap();
        assert_eq!(result["reply"], "hello");

        let mut types = Vec::new();
        for _ in 0..5 {
            let OutboundFrame::Text(text) = rx.recv().await.unwrap() else {
                panic!("expected text frame");
            };
            let msg: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(msg["data"]["run_id"], "run-9");
            types.push(msg["event_type"].as_str().unwrap().to_owned());
        }
        assert_eq!(
            types,
            [
                "agent_started",
                "agent_thinking",
                "tool_executing",
                "tool_completed",
                "agent_completed"
            ]
        );
    }
}
