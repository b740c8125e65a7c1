//! The five chat lifecycle events and their wire envelope.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use relay_core::{RunId, ThreadId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Lifecycle event kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// An agent run began.
    AgentStarted,
    /// Intermediate reasoning.
    AgentThinking,
    /// A tool call is starting.
    ToolExecuting,
    /// A tool call finished.
    ToolCompleted,
    /// The run finished.
    AgentCompleted,
}

impl EventType {
    /// Wire name, e.g. `tool_executing`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentStarted => "agent_started",
            Self::AgentThinking => "agent_thinking",
            Self::ToolExecuting => "tool_executing",
            Self::ToolCompleted => "tool_completed",
            Self::AgentCompleted => "agent_completed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event bound to exactly one recipient.
#[derive(Clone, Debug, PartialEq)]
pub struct WebSocketEvent {
    /// Kind of event.
    pub event_type: EventType,
    /// Recipient user.
    pub user_id: UserId,
    /// Recipient thread.
    pub thread_id: ThreadId,
    /// Run that produced it.
    pub run_id: RunId,
    /// Agent that produced it.
    pub agent_name: String,
    /// Sanitized payload.
    pub data: Map<String, Value>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl WebSocketEvent {
    /// Outbound envelope:
    /// `{"event_type","thread_id","timestamp","data":{"run_id","agent_name",..}}`.
    ///
    /// `run_id` and `agent_name` always come from the event itself, never from
    /// a same-named payload key.
    pub fn to_message(&self) -> Value {
        let mut data = self.data.clone();
        let _ = data.insert("run_id".into(), Value::String(self.run_id.to_string()));
        let _ = data.insert("agent_name".into(), Value::String(self.agent_name.clone()));
        json!({
            "event_type": self.event_type,
            "thread_id": self.thread_id,
            "timestamp": self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            "data": data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: Map<String, Value>) -> WebSocketEvent {
        WebSocketEvent {
            event_type: EventType::ToolExecuting,
            user_id: UserId::from("u1"),
            thread_id: ThreadId::from("t1"),
            run_id: RunId::from("r1"),
            agent_name: "triage".into(),
            data,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn envelope_shape() {
        let mut data = Map::new();
        let _ = data.insert("tool_name".into(), json!("search"));
        let msg = event(data).to_message();

        assert_eq!(msg["event_type"], "tool_executing");
        assert_eq!(msg["thread_id"], "t1");
        assert_eq!(msg["data"]["run_id"], "r1");
        assert_eq!(msg["data"]["agent_name"], "triage");
        assert_eq!(msg["data"]["tool_name"], "search");
        let ts = msg["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
        assert!(msg.get("user_id").is_none());
    }

    #[test]
    fn payload_cannot_spoof_identifiers() {
        let mut data = Map::new();
        let _ = data.insert("run_id".into(), json!("someone-elses-run"));
        let _ = data.insert("agent_name".into(), json!("impostor"));
        let msg = event(data).to_message();
        assert_eq!(msg["data"]["run_id"], "r1");
        assert_eq!(msg["data"]["agent_name"], "triage");
    }

    #[test]
    fn event_type_names() {
        assert_eq!(EventType::AgentStarted.to_string(), "agent_started");
        assert_eq!(
            serde_json::to_value(EventType::AgentCompleted).unwrap(),
            json!("agent_completed")
        );
    }
}
