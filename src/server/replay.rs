//! History replay: re-emit the rendering events a client would have seen
//! for a stored sequence of turns, without re-executing anything.

use tracing::debug;

use super::events::{LogKind, OutboundEvent};
use super::session::EventEmitter;
use crate::models::{MemoryRecord, Role, ToolResult};
use crate::parser::{is_prose_effectively_empty, parse_agent_response};

const OBSERVATION_PREFIXES: &[&str] = &["Tool Result:", "TOOL_RESULT:", "OBSERVATION:"];

/// Try to decode a stored turn as a serialized tool result.
fn decode_tool_result(content: &str) -> Option<ToolResult> {
    let body = OBSERVATION_PREFIXES
        .iter()
        .find_map(|prefix| content.strip_prefix(prefix))
        .unwrap_or(content);
    let start = body.find('{')?;
    serde_json::from_str(&body[start..]).ok()
}

fn replay_user_turn(emitter: &EventEmitter, content: &str) {
    if content.starts_with("USER_CONFIRMATION:") {
        return;
    }
    if OBSERVATION_PREFIXES.iter().any(|p| content.starts_with(p)) {
        match decode_tool_result(content) {
            Some(result) => {
                emitter.emit(OutboundEvent::ToolLog {
                    data: format!("[{}]", result.message),
                });
            }
            None => {
                emitter.emit(OutboundEvent::ToolLog {
                    data: format!("[{}]", content),
                });
            }
        }
        return;
    }
    // A bare serialized result can appear without a prefix.
    if let Some(result) = decode_tool_result(content) {
        emitter.emit(OutboundEvent::ToolLog {
            data: format!("[{}]", result.message),
        });
        return;
    }
    emitter.emit(OutboundEvent::LogMessage {
        kind: LogKind::User,
        data: content.to_string(),
    });
}

fn replay_model_turn(emitter: &EventEmitter, content: &str) {
    let parsed = parse_agent_response(content);

    let mut final_message = String::new();
    let mut confirmation_prompt = None;
    if let Some(command) = &parsed.command {
        match command.action.as_str() {
            "task_complete" => {
                let answer = command.get_str("answer").unwrap_or_default();
                final_message = if answer.len() > parsed.prose.len() {
                    answer.to_string()
                } else {
                    parsed.prose.clone()
                };
            }
            "request_confirmation" => {
                confirmation_prompt = Some(
                    command
                        .get_str("prompt")
                        .unwrap_or("Are you sure?")
                        .to_string(),
                );
            }
            _ => {}
        }
    }

    if !is_prose_effectively_empty(&final_message) {
        emitter.emit(OutboundEvent::final_answer(final_message));
    } else if !parsed.is_prose_empty() {
        emitter.emit(OutboundEvent::info(parsed.prose.clone()));
    }
    if let Some(prompt) = confirmation_prompt {
        emitter.emit(OutboundEvent::LogMessage {
            kind: LogKind::SystemConfirmReplayed,
            data: prompt,
        });
    }
}

/// Walk records in timestamp order and rebuild the client's chat view.
pub fn replay_history(emitter: &EventEmitter, records: &[MemoryRecord]) {
    emitter.emit(OutboundEvent::ClearChatHistory);
    for record in records {
        if record.content.trim().is_empty() {
            continue;
        }
        match record.role {
            Role::User => replay_user_turn(emitter, &record.content),
            Role::ToolObservation => {
                if let Some(result) = decode_tool_result(&record.content) {
                    emitter.emit(OutboundEvent::ToolLog {
                        data: format!("[{}]", result.message),
                    });
                } else {
                    emitter.emit(OutboundEvent::ToolLog {
                        data: format!("[{}]", record.content),
                    });
                }
            }
            Role::Model => replay_model_turn(emitter, &record.content),
        }
    }
    debug!("Replayed {} records", records.len());
}
