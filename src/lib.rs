//! Local AI agent server.
//!
//! A browser client connects over a WebSocket event channel; the server
//! drives a bounded reasoning loop in which the model emits structured
//! tool commands that are validated, optionally confirmed with the user,
//! executed against a sandboxed filesystem, and fed back as observations
//! until the model delivers a final answer. Model credentials and chat
//! histories live in a separate process (the Haven) reached over HTTP.

pub mod agent;
pub mod config;
pub mod error;
pub mod haven;
pub mod memory;
pub mod models;
pub mod parser;
pub mod sandbox;
pub mod server;
pub mod store;
pub mod tools;
pub mod trace;

pub use config::Config;
pub use error::AgentError;
pub use models::{MemoryRecord, ParsedAgentResponse, RawCommand, Role, ToolCommand, ToolResult};
pub use sandbox::PathGuard;
pub use server::Server;
