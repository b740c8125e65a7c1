//! Inbound client frame parsing and dispatch.
//!
//! Clients send JSON text frames tagged by `type`:
//!
//! - `{"type":"ping"}` → `{"type":"pong"}`
//! - `{"type":"agent.run","agentName":..,"message":..,"runId"?:..}` → an agent
//!   run whose lifecycle events flow through the caller's emitter
//!
//! Anything else is answered with `{"type":"error"}`.

use chrono::Utc;
use relay_core::RunId;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::agent::AgentRequest;

/// A parsed client frame.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum InboundFrame {
    /// Application-level ping.
    #[serde(rename = "ping")]
    Ping,
    /// Start an agent run.
    #[serde(rename = "agent.run", rename_all = "camelCase")]
    AgentRun {
        /// Agent to run.
        agent_name: String,
        /// User message.
        message: String,
        /// Client-chosen run ID.
        #[serde(default)]
        run_id: Option<String>,
    },
}

/// What the session should do with a frame.
#[derive(Debug, PartialEq)]
pub enum Dispatch {
    /// Send this JSON straight back.
    Reply(Value),
    /// Acknowledge with `ack`, then run the agent.
    RunAgent {
        /// Parsed request.
        request: AgentRequest,
        /// Acknowledgement sent before the run starts.
        ack: Value,
    },
}

/// `{"type":"error",..}` reply.
pub fn error_reply(code: &str, message: &str) -> Value {
    json!({
        "type": "error",
        "timestamp": Utc::now().to_rfc3339(),
        "data": {"code": code, "message": message},
    })
}

/// Parse one text frame and decide what to do with it.
#[instrument(skip_all, fields(frame_type))]
pub fn handle_message(text: &str) -> Dispatch {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("invalid JSON received");
            return Dispatch::Reply(error_reply("invalid_json", &e.to_string()));
        }
    };
    let frame_type = value.get("type").and_then(Value::as_str).unwrap_or_default().to_owned();
    let _ = tracing::Span::current().record("frame_type", frame_type.as_str());

    let frame = match serde_json::from_value::<InboundFrame>(value) {
        Ok(f) => f,
        Err(e) => {
            return if matches!(frame_type.as_str(), "ping" | "agent.run") {
                Dispatch::Reply(error_reply("invalid_frame", &e.to_string()))
            } else {
                debug!("unknown frame type");
                Dispatch::Reply(error_reply(
                    "unknown_type",
                    &format!("unknown frame type '{frame_type}'"),
                ))
            };
        }
    };

    match frame {
        InboundFrame::Ping => Dispatch::Reply(json!({
            "type": "pong",
            "timestamp": Utc::now().to_rfc3339(),
        })),
        InboundFrame::AgentRun {
            agent_name,
            message,
            run_id,
        } => {
            let run_id = match run_id.as_deref().map(RunId::parse).transpose() {
                Ok(id) => id.unwrap_or_default(),
                Err(e) => return Dispatch::Reply(error_reply("invalid_run_id", &e.to_string())),
            };
            if agent_name.trim().is_empty() {
                return Dispatch::Reply(error_reply("invalid_frame", "agentName must not be empty"));
            }
            let ack = json!({
                "type": "agent.run.accepted",
                "timestamp": Utc::now().to_rfc3339(),
                "data": {"runId": run_id, "agentName": agent_name},
            });
            Dispatch::RunAgent {
                request: AgentRequest {
                    run_id,
                    agent_name,
                    message,
                },
                ack,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn reply(d: Dispatch) -> Value {
        match d {
            Dispatch::Reply(v) => v,
            Dispatch::RunAgent { .. } => panic!("expected reply"),
        }
    }

    #[test]
    fn ping_gets_pong() {
        let v = reply(handle_message(r#"{"type":"ping"}"#));
        assert_eq!(v["type"], "pong");
    }

    #[test]
    fn agent_run_with_run_id() {
        let d = handle_message(r#"{"type":"agent.run","agentName":"echo","message":"hi","runId":"run-1"}"#);
        assert_matches!(d, Dispatch::RunAgent { ref request, ref ack } => {
            assert_eq!(request.run_id, RunId::from("run-1"));
            assert_eq!(request.agent_name, "echo");
            assert_eq!(request.message, "hi");
            assert_eq!(ack["type"], "agent.run.accepted");
            assert_eq!(ack["data"]["runId"], "run-1");
        });
    }

    #[test]
    fn agent_run_generates_run_id() {
        let d = handle_message(r#"{"type":"agent.run","agentName":"echo","message":"hi"}"#);
        assert_matches!(d, Dispatch::RunAgent { request, .. } => {
            assert!(!request.run_id.as_str().is_empty());
        });
    }

    #[test]
    fn unknown_type_is_error() {
        let v = reply(handle_message(r#"{"type":"session.create"}"#));
        assert_eq!(v["type"], "error");
        assert_eq!(v["data"]["code"], "unknown_type");
    }

    #[test]
    fn invalid_json_is_error() {
        let v = reply(handle_message("{not json"));
        assert_eq!(v["data"]["code"], "invalid_json");
    }

    #[test]
    fn agent_run_missing_fields_is_invalid() {
        let v = reply(handle_message(r#"{"type":"agent.run","message":"hi"}"#));
        assert_eq!(v["data"]["code"], "invalid_frame");
    }

    #[test]
    fn bad_run_id_rejected() {
        let v = reply(handle_message(r#"{"type":"agent.run","agentName":"a","message":"m","runId":""}"#));
        assert_eq!(v["data"]["code"], "invalid_run_id");
    }
}
