use thiserror::Error;

/// Error kinds surfaced by the agent core.
///
/// Tool handlers never let these escape to the reasoning loop; every
/// failure is translated into an error `ToolResult` so the model can
/// attempt recovery. The two model-host variants are the exception the
/// loop inspects directly: a timeout becomes an observation, an
/// unavailable host terminates the loop.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("path escapes the sandbox: {0}")]
    PathEscape(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("patch not applicable: {0}")]
    PatchNotApplicable(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("model host unavailable: {0}")]
    ModelHostUnavailable(String),

    #[error("model call timed out after {0}s")]
    ModelHostTimeout(u64),

    #[error("store error: {0}")]
    StoreError(String),

    #[error("session conflict: {0}")]
    SessionConflict(String),

    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl AgentError {
    /// Stable label for logging and trace events.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::InvalidArgument(_) => "InvalidArgument",
            AgentError::PathEscape(_) => "PathEscape",
            AgentError::NotFound(_) => "NotFound",
            AgentError::PatchNotApplicable(_) => "PatchNotApplicable",
            AgentError::ParseError(_) => "ParseError",
            AgentError::ModelHostUnavailable(_) => "ModelHostUnavailable",
            AgentError::ModelHostTimeout(_) => "ModelHostTimeout",
            AgentError::StoreError(_) => "StoreError",
            AgentError::SessionConflict(_) => "SessionConflict",
            AgentError::Unknown(_) => "Unknown",
        }
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::StoreError(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::ParseError(e.to_string())
    }
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels_are_stable() {
        assert_eq!(AgentError::InvalidArgument("x".into()).kind(), "InvalidArgument");
        assert_eq!(AgentError::PathEscape("x".into()).kind(), "PathEscape");
        assert_eq!(AgentError::ModelHostTimeout(120).kind(), "ModelHostTimeout");
    }

    #[test]
    fn test_display_includes_detail() {
        let err = AgentError::PatchNotApplicable("hunk 2 pre-image mismatch".into());
        assert!(err.to_string().contains("hunk 2"));
    }
}
