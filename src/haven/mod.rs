//! Client for the Haven model host, the out-of-process holder of model
//! credentials and per-session chat histories.
//!
//! Only the wire contract lives here. The host is reached over HTTP with a
//! shared-secret header; every call carries a timeout so a wedged host
//! degrades into an observation the reasoning loop can act on, never a
//! stalled reactor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error};

use crate::config::HavenConfig;
use crate::error::AgentError;

/// One prior turn shipped to the host when (re)seeding a session history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub text: String,
}

#[async_trait]
pub trait ModelHost: Send + Sync {
    /// Ensure a named session exists host-side, seeding it with `history`
    /// when it is first created.
    async fn get_or_create_session(
        &self,
        name: &str,
        history: &[HistoryTurn],
    ) -> Result<bool, AgentError>;

    /// Send a prompt to a session. Stateful: the host appends both the
    /// prompt and its reply to its own history.
    async fn send_message(&self, name: &str, prompt: &str) -> Result<String, AgentError>;

    async fn list_sessions(&self) -> Result<Vec<String>, AgentError>;

    async fn delete_session(&self, name: &str) -> Result<(), AgentError>;

    async fn has_session(&self, name: &str) -> Result<bool, AgentError>;

    async fn get_trace_log(&self) -> Result<Vec<Value>, AgentError>;
}

/// HTTP implementation of [`ModelHost`].
pub struct HavenClient {
    http: reqwest::Client,
    base_url: String,
    auth_key: String,
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct HavenReply {
    status: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl HavenClient {
    pub fn new(config: &HavenConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("http://{}", config.address),
            auth_key: config.auth_key.clone(),
            timeout_secs: config.request_timeout_secs,
        }
    }

    fn classify(&self, err: reqwest::Error) -> AgentError {
        if err.is_timeout() {
            AgentError::ModelHostTimeout(self.timeout_secs)
        } else {
            AgentError::ModelHostUnavailable(err.to_string())
        }
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value, AgentError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .header("x-haven-key", &self.auth_key)
            .timeout(Duration::from_secs(self.timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        let response = response
            .error_for_status()
            .map_err(|e| AgentError::ModelHostUnavailable(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| AgentError::ModelHostUnavailable(e.to_string()))
    }

    async fn get_json(&self, path: &str) -> Result<Value, AgentError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .header("x-haven-key", &self.auth_key)
            .timeout(Duration::from_secs(self.timeout_secs))
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        let response = response
            .error_for_status()
            .map_err(|e| AgentError::ModelHostUnavailable(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| AgentError::ModelHostUnavailable(e.to_string()))
    }
}

#[async_trait]
impl ModelHost for HavenClient {
    async fn get_or_create_session(
        &self,
        name: &str,
        history: &[HistoryTurn],
    ) -> Result<bool, AgentError> {
        let body = json!({"name": name, "history": history});
        let reply = self.post_json("/sessions", body).await?;
        debug!("Haven session '{}' ready", name);
        Ok(reply
            .get("status")
            .and_then(Value::as_str)
            .map(|s| s == "success")
            .unwrap_or(true))
    }

    async fn send_message(&self, name: &str, prompt: &str) -> Result<String, AgentError> {
        let path = format!("/sessions/{}/messages", name);
        let value = self.post_json(&path, json!({"prompt": prompt})).await?;
        let reply: HavenReply = serde_json::from_value(value)
            .map_err(|e| AgentError::ModelHostUnavailable(format!("malformed reply: {}", e)))?;
        if reply.status == "success" {
            Ok(reply.text.unwrap_or_default())
        } else {
            let message = reply
                .message
                .unwrap_or_else(|| "unknown error in Haven".to_string());
            error!(
                "Haven send_message failed for session '{}': {}",
                name, message
            );
            Err(AgentError::ModelHostUnavailable(message))
        }
    }

    async fn list_sessions(&self) -> Result<Vec<String>, AgentError> {
        let value = self.get_json("/sessions").await?;
        let names = value
            .get("sessions")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    async fn delete_session(&self, name: &str) -> Result<(), AgentError> {
        let url = format!("{}/sessions/{}", self.base_url, name);
        self.http
            .delete(&url)
            .header("x-haven-key", &self.auth_key)
            .timeout(Duration::from_secs(self.timeout_secs))
            .send()
            .await
            .map_err(|e| self.classify(e))?
            .error_for_status()
            .map_err(|e| AgentError::ModelHostUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn has_session(&self, name: &str) -> Result<bool, AgentError> {
        let sessions = self.list_sessions().await?;
        Ok(sessions.iter().any(|s| s == name))
    }

    async fn get_trace_log(&self) -> Result<Vec<Value>, AgentError> {
        let value = self.get_json("/trace").await?;
        Ok(value
            .get("trace")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}
