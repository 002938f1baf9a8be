//! Wire events for the client ↔ server channel.
//!
//! Every message is a JSON object `{event, payload}`. Inbound messages are
//! decoded through a raw envelope first so an unknown event name or a
//! malformed payload produces a precise error instead of a serde puzzle.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::AgentError;

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    StartTask { prompt: String },
    UserConfirmation { response: String },
    RequestSessionList,
    RequestSessionName,
    LogAuditEvent(AuditEvent),
    RequestDbCollections,
    RequestDbCollectionData { collection: String },
    RequestTraceLog,
    RequestHavenTraceLog,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub control_flow: Option<String>,
}

fn field_str(payload: &Value, key: &str) -> Result<String, AgentError> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            AgentError::InvalidArgument(format!("missing or non-string field '{}'", key))
        })
}

pub fn parse_inbound(text: &str) -> Result<InboundEvent, AgentError> {
    let envelope: InboundEnvelope = serde_json::from_str(text)
        .map_err(|e| AgentError::ParseError(format!("malformed event message: {}", e)))?;
    let payload = envelope.payload;
    let event = match envelope.event.as_str() {
        "start_task" => InboundEvent::StartTask {
            prompt: field_str(&payload, "prompt")?,
        },
        "user_confirmation" => InboundEvent::UserConfirmation {
            response: field_str(&payload, "response")?,
        },
        "request_session_list" => InboundEvent::RequestSessionList,
        "request_session_name" => InboundEvent::RequestSessionName,
        "log_audit_event" => InboundEvent::LogAuditEvent(
            serde_json::from_value(payload)
                .map_err(|e| AgentError::ParseError(format!("malformed audit event: {}", e)))?,
        ),
        "request_db_collections" => InboundEvent::RequestDbCollections,
        "request_db_collection_data" => InboundEvent::RequestDbCollectionData {
            collection: field_str(&payload, "collection")?,
        },
        "request_trace_log" => InboundEvent::RequestTraceLog,
        "request_haven_trace_log" => InboundEvent::RequestHavenTraceLog,
        other => {
            return Err(AgentError::InvalidArgument(format!(
                "unknown event: {}",
                other
            )))
        }
    };
    Ok(event)
}

/// Categories of `log_message` renderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    User,
    FinalAnswer,
    Info,
    SystemConfirm,
    SystemConfirmReplayed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    LogMessage { kind: LogKind, data: String },
    ToolLog { data: String },
    DisplayUserPrompt { prompt: String },
    RequestUserConfirmation { prompt: String },
    SessionListUpdate { status: String, content: Value },
    SessionNameUpdate { name: String },
    SessionConfigUpdate { max_buffer_size: usize },
    ClearChatHistory,
    DbCollectionsList { collections: Value },
    DbCollectionData { collection: String, records: Value },
    TraceLogResponse { trace: Value },
    HavenTraceLogResponse { trace: Value },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::LogMessage { .. } => "log_message",
            OutboundEvent::ToolLog { .. } => "tool_log",
            OutboundEvent::DisplayUserPrompt { .. } => "display_user_prompt",
            OutboundEvent::RequestUserConfirmation { .. } => "request_user_confirmation",
            OutboundEvent::SessionListUpdate { .. } => "session_list_update",
            OutboundEvent::SessionNameUpdate { .. } => "session_name_update",
            OutboundEvent::SessionConfigUpdate { .. } => "session_config_update",
            OutboundEvent::ClearChatHistory => "clear_chat_history",
            OutboundEvent::DbCollectionsList { .. } => "db_collections_list",
            OutboundEvent::DbCollectionData { .. } => "db_collection_data",
            OutboundEvent::TraceLogResponse { .. } => "trace_log_response",
            OutboundEvent::HavenTraceLogResponse { .. } => "haven_trace_log_response",
        }
    }

    fn payload(&self) -> Value {
        match self {
            OutboundEvent::LogMessage { kind, data } => json!({"type": kind, "data": data}),
            OutboundEvent::ToolLog { data } => json!({"data": data}),
            OutboundEvent::DisplayUserPrompt { prompt } => json!({"prompt": prompt}),
            OutboundEvent::RequestUserConfirmation { prompt } => json!({"prompt": prompt}),
            OutboundEvent::SessionListUpdate { status, content } => {
                json!({"status": status, "content": content})
            }
            OutboundEvent::SessionNameUpdate { name } => json!({"name": name}),
            OutboundEvent::SessionConfigUpdate { max_buffer_size } => {
                json!({"max_buffer_size": max_buffer_size})
            }
            OutboundEvent::ClearChatHistory => json!({}),
            OutboundEvent::DbCollectionsList { collections } => {
                json!({"collections": collections})
            }
            OutboundEvent::DbCollectionData {
                collection,
                records,
            } => json!({"collection": collection, "records": records}),
            OutboundEvent::TraceLogResponse { trace } => json!({"trace": trace}),
            OutboundEvent::HavenTraceLogResponse { trace } => json!({"trace": trace}),
        }
    }

    /// Serialize into the `{event, payload}` wire form.
    pub fn to_message(&self) -> String {
        json!({"event": self.name(), "payload": self.payload()}).to_string()
    }

    pub fn info(data: impl Into<String>) -> Self {
        OutboundEvent::LogMessage {
            kind: LogKind::Info,
            data: data.into(),
        }
    }

    pub fn final_answer(data: impl Into<String>) -> Self {
        OutboundEvent::LogMessage {
            kind: LogKind::FinalAnswer,
            data: data.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_task() {
        let event =
            parse_inbound(r#"{"event": "start_task", "payload": {"prompt": "hello"}}"#).unwrap();
        assert_eq!(
            event,
            InboundEvent::StartTask {
                prompt: "hello".into()
            }
        );
    }

    #[test]
    fn test_parse_event_without_payload() {
        let event = parse_inbound(r#"{"event": "request_session_list"}"#).unwrap();
        assert_eq!(event, InboundEvent::RequestSessionList);
    }

    #[test]
    fn test_parse_user_confirmation() {
        let event =
            parse_inbound(r#"{"event": "user_confirmation", "payload": {"response": "yes"}}"#)
                .unwrap();
        assert_eq!(
            event,
            InboundEvent::UserConfirmation {
                response: "yes".into()
            }
        );
    }

    #[test]
    fn test_parse_audit_event_partial_fields() {
        let event = parse_inbound(
            r#"{"event": "log_audit_event", "payload": {"event": "click", "source": "ui"}}"#,
        )
        .unwrap();
        match event {
            InboundEvent::LogAuditEvent(audit) => {
                assert_eq!(audit.event, "click");
                assert_eq!(audit.source.as_deref(), Some("ui"));
                assert!(audit.details.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_rejected() {
        let err = parse_inbound(r#"{"event": "reboot_server"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown event"));
    }

    #[test]
    fn test_missing_field_rejected() {
        let err = parse_inbound(r#"{"event": "start_task", "payload": {}}"#).unwrap_err();
        assert!(err.to_string().contains("prompt"));
    }

    #[test]
    fn test_outbound_wire_shape() {
        let message = OutboundEvent::LogMessage {
            kind: LogKind::FinalAnswer,
            data: "Hi.".into(),
        }
        .to_message();
        let value: Value = serde_json::from_str(&message).unwrap();
        assert_eq!(value["event"], "log_message");
        assert_eq!(value["payload"]["type"], "final_answer");
        assert_eq!(value["payload"]["data"], "Hi.");
    }

    #[test]
    fn test_outbound_clear_chat_history() {
        let value: Value =
            serde_json::from_str(&OutboundEvent::ClearChatHistory.to_message()).unwrap();
        assert_eq!(value["event"], "clear_chat_history");
    }

    #[test]
    fn test_log_kinds_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&LogKind::SystemConfirmReplayed).unwrap(),
            "\"system_confirm_replayed\""
        );
    }
}
