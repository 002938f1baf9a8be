//! Core data shapes shared by the parser, memory, tools, and the loop.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::error::AgentError;

/// Who produced a conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
    ToolObservation,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
            Role::ToolObservation => "tool_observation",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "model" => Some(Role::Model),
            "tool_observation" => Some(Role::ToolObservation),
            _ => None,
        }
    }
}

/// Metadata key carrying the full RAG-augmented prompt on user turns.
pub const META_AUGMENTED_PROMPT: &str = "augmented_prompt";
/// Metadata key naming the tool that produced an observation turn.
pub const META_TOOL_NAME: &str = "tool_name";
/// Metadata key flagging summary records.
pub const META_IS_SUMMARY: &str = "is_summary";

/// One immutable record in a memory collection.
///
/// Records within a collection are totally ordered by `timestamp`; the
/// memory manager guarantees strict per-session monotonicity so the order
/// is well defined even for turns landing in the same clock tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl MemoryRecord {
    pub fn new(role: Role, content: impl Into<String>, timestamp: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// The wire shape of a model-issued command: an action name plus an
/// untyped parameter object. Validation into [`ToolCommand`] happens
/// before any handler runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCommand {
    pub action: String,
    #[serde(default)]
    pub parameters: Value,
}

impl RawCommand {
    pub fn new(action: &str, parameters: Value) -> Self {
        Self {
            action: action.to_string(),
            parameters,
        }
    }

    fn params_object(&self) -> Map<String, Value> {
        match &self.parameters {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => Map::new(),
        }
    }

    /// Mutable access to a named string parameter, used by the parser's
    /// payload rehydration pass.
    pub fn set_parameter(&mut self, key: &str, value: String) {
        if !self.parameters.is_object() {
            self.parameters = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.parameters {
            map.insert(key.to_string(), Value::String(value));
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

/// Tagged sum of every registered action, with typed parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCommand {
    CreateFile { filename: String, content: String },
    ReadFile { filename: String },
    ReadProjectFile { filename: String },
    ListAllowedProjectFiles,
    ListDirectory { path: Option<String> },
    DeleteFile { filename: String },
    ExecutePythonScript { script: String },
    ApplyPatch { diff_content: String },
    ListSessions,
    LoadSession { session_name: String },
    SaveSession { session_name: String },
    DeleteSession { session_name: String },
    RequestConfirmation { prompt: String },
    TaskComplete { answer: String },
}

fn require_str(params: &Map<String, Value>, action: &str, key: &str) -> Result<String, AgentError> {
    match params.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(AgentError::InvalidArgument(format!(
            "parameter '{}' of '{}' must be a string, got {}",
            key, action, other
        ))),
        None => Err(AgentError::InvalidArgument(format!(
            "missing required parameter '{}' for '{}'",
            key, action
        ))),
    }
}

fn optional_str(params: &Map<String, Value>, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

impl ToolCommand {
    /// Validate a raw `{action, parameters}` pair into a typed command.
    /// Unknown actions and malformed parameters are errors, never no-ops.
    pub fn from_raw(raw: &RawCommand) -> Result<ToolCommand, AgentError> {
        let params = raw.params_object();
        let action = raw.action.as_str();
        let command = match action {
            "create_file" => ToolCommand::CreateFile {
                filename: require_str(&params, action, "filename")?,
                content: require_str(&params, action, "content")?,
            },
            "read_file" => ToolCommand::ReadFile {
                filename: require_str(&params, action, "filename")?,
            },
            "read_project_file" => ToolCommand::ReadProjectFile {
                filename: require_str(&params, action, "filename")?,
            },
            "list_allowed_project_files" => ToolCommand::ListAllowedProjectFiles,
            "list_directory" => ToolCommand::ListDirectory {
                path: optional_str(&params, "path"),
            },
            "delete_file" => ToolCommand::DeleteFile {
                filename: require_str(&params, action, "filename")?,
            },
            "execute_python_script" => ToolCommand::ExecutePythonScript {
                script: require_str(&params, action, "script")?,
            },
            "apply_patch" => ToolCommand::ApplyPatch {
                diff_content: require_str(&params, action, "diff_content")?,
            },
            "list_sessions" => ToolCommand::ListSessions,
            "load_session" => ToolCommand::LoadSession {
                session_name: require_str(&params, action, "session_name")?,
            },
            "save_session" => ToolCommand::SaveSession {
                session_name: require_str(&params, action, "session_name")?,
            },
            "delete_session" => ToolCommand::DeleteSession {
                session_name: require_str(&params, action, "session_name")?,
            },
            "request_confirmation" => ToolCommand::RequestConfirmation {
                prompt: optional_str(&params, "prompt")
                    .unwrap_or_else(|| "Are you sure?".to_string()),
            },
            "task_complete" => ToolCommand::TaskComplete {
                answer: optional_str(&params, "answer").unwrap_or_default(),
            },
            other => {
                return Err(AgentError::InvalidArgument(format!(
                    "unknown action: {}",
                    other
                )))
            }
        };
        Ok(command)
    }

    pub fn action_name(&self) -> &'static str {
        match self {
            ToolCommand::CreateFile { .. } => "create_file",
            ToolCommand::ReadFile { .. } => "read_file",
            ToolCommand::ReadProjectFile { .. } => "read_project_file",
            ToolCommand::ListAllowedProjectFiles => "list_allowed_project_files",
            ToolCommand::ListDirectory { .. } => "list_directory",
            ToolCommand::DeleteFile { .. } => "delete_file",
            ToolCommand::ExecutePythonScript { .. } => "execute_python_script",
            ToolCommand::ApplyPatch { .. } => "apply_patch",
            ToolCommand::ListSessions => "list_sessions",
            ToolCommand::LoadSession { .. } => "load_session",
            ToolCommand::SaveSession { .. } => "save_session",
            ToolCommand::DeleteSession { .. } => "delete_session",
            ToolCommand::RequestConfirmation { .. } => "request_confirmation",
            ToolCommand::TaskComplete { .. } => "task_complete",
        }
    }

    /// Render back to the `{action, parameters}` wire shape.
    /// `ToolCommand::from_raw(&c.render())` reproduces `c`.
    pub fn render(&self) -> RawCommand {
        let (action, parameters) = match self {
            ToolCommand::CreateFile { filename, content } => (
                "create_file",
                json!({"filename": filename, "content": content}),
            ),
            ToolCommand::ReadFile { filename } => ("read_file", json!({"filename": filename})),
            ToolCommand::ReadProjectFile { filename } => {
                ("read_project_file", json!({"filename": filename}))
            }
            ToolCommand::ListAllowedProjectFiles => ("list_allowed_project_files", json!({})),
            ToolCommand::ListDirectory { path } => match path {
                Some(p) => ("list_directory", json!({"path": p})),
                None => ("list_directory", json!({})),
            },
            ToolCommand::DeleteFile { filename } => ("delete_file", json!({"filename": filename})),
            ToolCommand::ExecutePythonScript { script } => {
                ("execute_python_script", json!({"script": script}))
            }
            ToolCommand::ApplyPatch { diff_content } => {
                ("apply_patch", json!({"diff_content": diff_content}))
            }
            ToolCommand::ListSessions => ("list_sessions", json!({})),
            ToolCommand::LoadSession { session_name } => {
                ("load_session", json!({"session_name": session_name}))
            }
            ToolCommand::SaveSession { session_name } => {
                ("save_session", json!({"session_name": session_name}))
            }
            ToolCommand::DeleteSession { session_name } => {
                ("delete_session", json!({"session_name": session_name}))
            }
            ToolCommand::RequestConfirmation { prompt } => {
                ("request_confirmation", json!({"prompt": prompt}))
            }
            ToolCommand::TaskComplete { answer } => ("task_complete", json!({"answer": answer})),
        };
        RawCommand::new(action, parameters)
    }

    /// Every registered action name, in dispatch order.
    pub fn known_actions() -> &'static [&'static str] {
        &[
            "create_file",
            "read_file",
            "read_project_file",
            "list_allowed_project_files",
            "list_directory",
            "delete_file",
            "execute_python_script",
            "apply_patch",
            "list_sessions",
            "load_session",
            "save_session",
            "delete_session",
            "request_confirmation",
            "task_complete",
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
}

/// Standardized result of a tool execution. Handlers always return one of
/// these; internal errors never escape to the reasoning loop raw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

impl ToolResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Success,
            message: message.into(),
            content: None,
        }
    }

    pub fn success_with(message: impl Into<String>, content: Value) -> Self {
        Self {
            status: ToolStatus::Success,
            message: message.into(),
            content: Some(content),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            message: message.into(),
            content: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    /// Serialize into the observation string fed back to the model.
    pub fn to_observation(&self) -> String {
        format!(
            "Tool Result: {}",
            serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
        )
    }
}

/// Output of the response parser: prose, and the command if one was found.
/// Both empty is an error the loop surfaces to the model as an observation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedAgentResponse {
    pub prose: String,
    pub command: Option<RawCommand>,
}

impl ParsedAgentResponse {
    pub fn is_prose_empty(&self) -> bool {
        self.prose.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [Role::User, Role::Model, Role::ToolObservation] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("assistant"), None);
    }

    #[test]
    fn test_from_raw_typed_parameters() {
        let raw = RawCommand::new(
            "create_file",
            json!({"filename": "notes.txt", "content": "hello"}),
        );
        let cmd = ToolCommand::from_raw(&raw).unwrap();
        assert_eq!(
            cmd,
            ToolCommand::CreateFile {
                filename: "notes.txt".into(),
                content: "hello".into()
            }
        );
    }

    #[test]
    fn test_from_raw_unknown_action() {
        let raw = RawCommand::new("rm_rf", json!({}));
        let err = ToolCommand::from_raw(&raw).unwrap_err();
        assert!(err.to_string().contains("unknown action: rm_rf"));
    }

    #[test]
    fn test_from_raw_missing_parameter() {
        let raw = RawCommand::new("read_file", json!({}));
        let err = ToolCommand::from_raw(&raw).unwrap_err();
        assert!(err.to_string().contains("filename"));
    }

    #[test]
    fn test_from_raw_wrong_parameter_type() {
        let raw = RawCommand::new("read_file", json!({"filename": 42}));
        assert!(ToolCommand::from_raw(&raw).is_err());
    }

    #[test]
    fn test_from_raw_absent_parameters_object() {
        let raw = RawCommand::new("list_sessions", Value::Null);
        assert_eq!(ToolCommand::from_raw(&raw).unwrap(), ToolCommand::ListSessions);
    }

    #[test]
    fn test_render_round_trip_all_actions() {
        let commands = vec![
            ToolCommand::CreateFile {
                filename: "a.txt".into(),
                content: "body {}".into(),
            },
            ToolCommand::ReadFile {
                filename: "a.txt".into(),
            },
            ToolCommand::ReadProjectFile {
                filename: "Cargo.toml".into(),
            },
            ToolCommand::ListAllowedProjectFiles,
            ToolCommand::ListDirectory { path: None },
            ToolCommand::ListDirectory {
                path: Some("docs".into()),
            },
            ToolCommand::DeleteFile {
                filename: "old.txt".into(),
            },
            ToolCommand::ExecutePythonScript {
                script: "print(1)".into(),
            },
            ToolCommand::ApplyPatch {
                diff_content: "--- a/x\n+++ b/x\n".into(),
            },
            ToolCommand::ListSessions,
            ToolCommand::LoadSession {
                session_name: "demo".into(),
            },
            ToolCommand::SaveSession {
                session_name: "demo".into(),
            },
            ToolCommand::DeleteSession {
                session_name: "demo".into(),
            },
            ToolCommand::RequestConfirmation {
                prompt: "Delete it?".into(),
            },
            ToolCommand::TaskComplete {
                answer: "Done.".into(),
            },
        ];
        for cmd in commands {
            let round = ToolCommand::from_raw(&cmd.render()).unwrap();
            assert_eq!(round, cmd);
        }
    }

    #[test]
    fn test_tool_result_observation_shape() {
        let result = ToolResult::success_with("Listed files.", json!(["a.txt"]));
        let obs = result.to_observation();
        assert!(obs.starts_with("Tool Result: {"));
        assert!(obs.contains("\"status\":\"success\""));
        assert!(obs.contains("a.txt"));
    }

    #[test]
    fn test_tool_result_error_omits_content() {
        let serialized = serde_json::to_string(&ToolResult::error("boom")).unwrap();
        assert!(!serialized.contains("content"));
    }

    #[test]
    fn test_memory_record_metadata_builder() {
        let rec = MemoryRecord::new(Role::User, "hi", 1.0)
            .with_metadata(META_AUGMENTED_PROMPT, "context + hi");
        assert_eq!(
            rec.metadata.get(META_AUGMENTED_PROMPT).map(String::as_str),
            Some("context + hi")
        );
    }
}
