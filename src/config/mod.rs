use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Application configuration.
///
/// Loaded from `config.toml` in the working directory when present (every
/// field has a serde default), then overridden by environment variables for
/// deployment-level settings (`SERVER_PORT`, `HAVEN_ADDRESS`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_project_id")]
    pub project_id: String,

    #[serde(default = "default_location")]
    pub location: String,

    #[serde(default)]
    pub debug_mode: bool,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub haven: HavenConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HavenConfig {
    /// host:port of the Haven model-host process.
    #[serde(default = "default_haven_address")]
    pub address: String,

    /// Shared secret sent as the `x-haven-key` header on every call.
    #[serde(default)]
    pub auth_key: String,

    /// Per-call timeout in seconds. Expiry is reported to the reasoning
    /// loop as an observation, not a crash.
    #[serde(default = "default_haven_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard cap on reasoning-loop iterations.
    #[serde(default = "default_absolute_max_iterations")]
    pub absolute_max_iterations: usize,

    /// Soft cap: past this, each prompt carries a finalize reminder.
    #[serde(default = "default_nominal_max_iterations")]
    pub nominal_max_iterations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Directory holding the persistent vector collections.
    #[serde(default = "default_store_dir")]
    pub store_dir: String,

    /// Size of the short-term conversational buffer.
    #[serde(default = "default_segment_threshold")]
    pub segment_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Directory name (relative to the working directory) confining all
    /// user-visible tool I/O.
    #[serde(default = "default_sandbox_dir")]
    pub dir: String,

    /// Server-owned files readable through `read_project_file`.
    #[serde(default = "default_allowed_project_files")]
    pub allowed_project_files: Vec<String>,
}

fn default_project_id() -> String {
    "local-agent".to_string()
}

fn default_location() -> String {
    "us-east1".to_string()
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5001
}

fn default_haven_address() -> String {
    "127.0.0.1:50000".to_string()
}

fn default_haven_timeout() -> u64 {
    120
}

fn default_absolute_max_iterations() -> usize {
    10
}

fn default_nominal_max_iterations() -> usize {
    3
}

fn default_store_dir() -> String {
    "chroma_db".to_string()
}

fn default_segment_threshold() -> usize {
    20
}

fn default_sandbox_dir() -> String {
    "sandbox".to_string()
}

fn default_allowed_project_files() -> Vec<String> {
    [
        "README.md",
        "Cargo.toml",
        "config.toml",
        "src/main.rs",
        "src/agent/mod.rs",
        "src/tools/mod.rs",
        "src/memory/mod.rs",
        "src/parser/mod.rs",
        "src/sandbox/mod.rs",
        "src/sandbox/patch.rs",
        "src/server/mod.rs",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_id: default_project_id(),
            location: default_location(),
            debug_mode: false,
            server: ServerConfig::default(),
            haven: HavenConfig::default(),
            agent: AgentConfig::default(),
            memory: MemoryConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for HavenConfig {
    fn default() -> Self {
        Self {
            address: default_haven_address(),
            auth_key: String::new(),
            request_timeout_secs: default_haven_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            absolute_max_iterations: default_absolute_max_iterations(),
            nominal_max_iterations: default_nominal_max_iterations(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            segment_threshold: default_segment_threshold(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            dir: default_sandbox_dir(),
            allowed_project_files: default_allowed_project_files(),
        }
    }
}

impl Config {
    /// Load configuration: `config.toml` if present, then env overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)?;
            let parsed: Config = toml::from_str(&raw)?;
            info!("Loaded configuration from {}", path.display());
            parsed
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PROJECT_ID") {
            self.project_id = v;
        }
        if let Ok(v) = std::env::var("LOCATION") {
            self.location = v;
        }
        if let Ok(v) = std::env::var("SERVER_PORT") {
            match v.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!("Ignoring non-numeric SERVER_PORT: {}", v),
            }
        }
        if let Ok(v) = std::env::var("HAVEN_ADDRESS") {
            self.haven.address = v;
        }
        if let Ok(v) = std::env::var("HAVEN_AUTH_KEY") {
            self.haven.auth_key = v;
        }
        if let Ok(v) = std::env::var("ABSOLUTE_MAX_ITERATIONS_REASONING_LOOP") {
            match v.parse() {
                Ok(n) => self.agent.absolute_max_iterations = n,
                Err(_) => warn!(
                    "Ignoring non-numeric ABSOLUTE_MAX_ITERATIONS_REASONING_LOOP: {}",
                    v
                ),
            }
        }
        if let Ok(v) = std::env::var("NOMINAL_MAX_ITERATIONS_REASONING_LOOP") {
            match v.parse() {
                Ok(n) => self.agent.nominal_max_iterations = n,
                Err(_) => warn!(
                    "Ignoring non-numeric NOMINAL_MAX_ITERATIONS_REASONING_LOOP: {}",
                    v
                ),
            }
        }
        if let Ok(v) = std::env::var("SEGMENT_THRESHOLD") {
            match v.parse() {
                Ok(n) => self.memory.segment_threshold = n,
                Err(_) => warn!("Ignoring non-numeric SEGMENT_THRESHOLD: {}", v),
            }
        }
        if let Ok(v) = std::env::var("DEBUG_MODE") {
            self.debug_mode = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    /// Path of the sandbox root, resolved against the working dir at use.
    pub fn sandbox_path(&self) -> PathBuf {
        PathBuf::from(&self.sandbox.dir)
    }

    /// Path of the vector store directory.
    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(&self.memory.store_dir)
    }
}
