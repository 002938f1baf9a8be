//! Secure action execution layer: the only path through which the agent
//! touches the local system.
//!
//! Dispatch is declarative: the loop hands over a validated command, each
//! action maps to one handler, and every handler returns a standardized
//! `ToolResult`. Internal errors never escape raw; whatever goes wrong
//! becomes an error result the model can read and react to. All filesystem
//! paths route through the sandbox guard, and blocking work runs on the
//! worker pool so the event reactor never stalls.

use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::AgentError;
use crate::haven::{HistoryTurn, ModelHost};
use crate::memory::{MemoryManager, CODE_PREFIX, TURNS_PREFIX};
use crate::models::{MemoryRecord, RawCommand, Role, ToolCommand, ToolResult};
use crate::sandbox::{patch, PathGuard};
use crate::server::events::OutboundEvent;
use crate::server::session::{ActiveSession, SessionRegistry};
use crate::store::VectorStore;
use crate::trace::TraceLog;

/// Directories skipped by `list_directory`, alongside anything hidden.
const SKIP_DIRS: &[&str] = &["chroma_db", "sessions", "target", "node_modules", "__pycache__"];

/// Stateful collaborators handed to tool handlers. Only the fields a
/// handler actually needs are marshalled; sessions themselves stay owned
/// by the registry and are looked up by id.
#[derive(Clone)]
pub struct ToolContext {
    pub guard: PathGuard,
    pub store: VectorStore,
    pub host: Arc<dyn ModelHost>,
    pub registry: SessionRegistry,
    pub session_id: String,
    pub config: Arc<Config>,
    pub trace: TraceLog,
}

impl ToolContext {
    fn session(&self) -> Option<Arc<ActiveSession>> {
        self.registry.get(&self.session_id)
    }

    fn emit(&self, event: OutboundEvent) {
        if let Some(session) = self.session() {
            session.emitter.emit(event);
        }
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, AgentError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AgentError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AgentError::Unknown(anyhow::anyhow!("worker task failed: {}", e)))?
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

/// Validate and execute a raw command. The single entry point for all tool
/// executions; unknown actions and bad parameters come back as error
/// results, never panics or raw errors.
pub async fn dispatch(raw: &RawCommand, ctx: &ToolContext) -> ToolResult {
    let command = match ToolCommand::from_raw(raw) {
        Ok(command) => command,
        Err(e) => {
            warn!("Rejected command '{}': {}", raw.action, e);
            return ToolResult::error(e.to_string());
        }
    };
    execute(command, ctx).await
}

pub async fn execute(command: ToolCommand, ctx: &ToolContext) -> ToolResult {
    ctx.trace
        .record("tool_dispatch", json!({"action": command.action_name()}));
    match command {
        ToolCommand::CreateFile { filename, content } => {
            handle_create_file(ctx, filename, content).await
        }
        ToolCommand::ReadFile { filename } => handle_read_file(ctx, filename).await,
        ToolCommand::ReadProjectFile { filename } => handle_read_project_file(ctx, filename).await,
        ToolCommand::ListAllowedProjectFiles => handle_list_allowed_project_files(ctx),
        ToolCommand::ListDirectory { path } => handle_list_directory(ctx, path).await,
        ToolCommand::DeleteFile { filename } => handle_delete_file(ctx, filename).await,
        ToolCommand::ExecutePythonScript { script } => handle_execute_script(ctx, script).await,
        ToolCommand::ApplyPatch { diff_content } => handle_apply_patch(ctx, diff_content).await,
        ToolCommand::ListSessions => handle_list_sessions(ctx).await,
        ToolCommand::LoadSession { session_name } => handle_load_session(ctx, session_name).await,
        ToolCommand::SaveSession { session_name } => handle_save_session(ctx, session_name).await,
        ToolCommand::DeleteSession { session_name } => {
            handle_delete_session(ctx, session_name).await
        }
        ToolCommand::RequestConfirmation { .. } | ToolCommand::TaskComplete { .. } => {
            ToolResult::error("This action is handled by the reasoning loop, not the tool layer.")
        }
    }
}

/// Translate a guard failure into a result, reporting escape attempts to
/// the user as well as the model.
fn path_failure(ctx: &ToolContext, err: AgentError, raw_path: &str) -> ToolResult {
    if matches!(err, AgentError::PathEscape(_)) {
        ctx.emit(OutboundEvent::info(format!(
            "Blocked an attempt to access a path outside the sandbox: '{}'",
            raw_path
        )));
    }
    ToolResult::error(err.to_string())
}

async fn handle_create_file(ctx: &ToolContext, filename: String, content: String) -> ToolResult {
    let path = match ctx.guard.safe_path(&filename) {
        Ok(p) => p,
        Err(e) => return path_failure(ctx, e, &filename),
    };
    let write = run_blocking(move || {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| AgentError::StoreError(format!("cannot create directories: {}", e)))?;
        }
        fs::write(&path, &content)
            .map_err(|e| AgentError::StoreError(format!("cannot write file: {}", e)))
    })
    .await;
    match write {
        Ok(()) => ToolResult::success(format!(
            "File '{}' written successfully.",
            basename(&filename)
        )),
        Err(e) => ToolResult::error(e.to_string()),
    }
}

async fn handle_read_file(ctx: &ToolContext, filename: String) -> ToolResult {
    let path = match ctx.guard.safe_existing_path(&filename) {
        Ok(p) => p,
        Err(e) => return path_failure(ctx, e, &filename),
    };
    let read = run_blocking(move || {
        fs::read_to_string(&path)
            .map_err(|e| AgentError::StoreError(format!("cannot read file: {}", e)))
    })
    .await;
    match read {
        Ok(content) => ToolResult::success_with(
            format!("Read content from '{}'.", basename(&filename)),
            json!(content),
        ),
        Err(e) => ToolResult::error(e.to_string()),
    }
}

async fn handle_read_project_file(ctx: &ToolContext, filename: String) -> ToolResult {
    if !ctx
        .config
        .sandbox
        .allowed_project_files
        .iter()
        .any(|allowed| allowed == &filename)
    {
        return ToolResult::error(format!(
            "Access denied. Reading the project file '{}' is not permitted.",
            filename
        ));
    }
    let read = run_blocking(move || {
        fs::read_to_string(&filename)
            .map_err(|e| AgentError::NotFound(format!("cannot read project file: {}", e)))
    })
    .await;
    match read {
        Ok(content) => ToolResult::success_with("Read project file.", json!(content)),
        Err(e) => ToolResult::error(e.to_string()),
    }
}

fn handle_list_allowed_project_files(ctx: &ToolContext) -> ToolResult {
    ToolResult::success_with(
        "Listed allowed project files.",
        json!(ctx.config.sandbox.allowed_project_files),
    )
}

fn walk_directory(root: &Path, base: &Path, out: &mut Vec<String>) {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || SKIP_DIRS.contains(&name.as_str()) {
            continue;
        }
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        // Symlinks are skipped: following them could walk out of the
        // sandbox or cycle.
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            walk_directory(&path, base, out);
        } else if let Ok(relative) = path.strip_prefix(base) {
            out.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
}

async fn handle_list_directory(ctx: &ToolContext, path: Option<String>) -> ToolResult {
    let root = match path {
        Some(ref p) => match ctx.guard.safe_existing_path(p) {
            Ok(resolved) => resolved,
            Err(e) => return path_failure(ctx, e, p),
        },
        None => ctx.guard.root().to_path_buf(),
    };
    let listing = run_blocking(move || {
        let mut files = Vec::new();
        walk_directory(&root, &root, &mut files);
        files.sort();
        Ok(files)
    })
    .await;
    match listing {
        Ok(files) => ToolResult::success_with("Listed files in directory.", json!(files)),
        Err(e) => ToolResult::error(e.to_string()),
    }
}

async fn handle_delete_file(ctx: &ToolContext, filename: String) -> ToolResult {
    let path = match ctx.guard.safe_existing_path(&filename) {
        Ok(p) => p,
        Err(e) => return path_failure(ctx, e, &filename),
    };
    let removal = run_blocking(move || {
        fs::remove_file(&path)
            .map_err(|e| AgentError::StoreError(format!("cannot delete file: {}", e)))
    })
    .await;
    match removal {
        Ok(()) => ToolResult::success(format!("File '{}' deleted.", basename(&filename))),
        Err(e) => ToolResult::error(e.to_string()),
    }
}

/// Run a script in an isolated Python interpreter with captured output.
/// `-I` strips the environment and user site-packages; the reasoning loop,
/// not this handler, bounds the runtime.
async fn handle_execute_script(ctx: &ToolContext, script: String) -> ToolResult {
    debug!("Executing python script ({} bytes)", script.len());
    ctx.trace
        .record("script_execution", json!({"bytes": script.len()}));
    let output = tokio::process::Command::new("python3")
        .arg("-I")
        .arg("-c")
        .arg(&script)
        .current_dir(ctx.guard.root())
        .output()
        .await;
    match output {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            if output.status.success() {
                ToolResult::success_with("Script executed.", json!(stdout))
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                ToolResult::error(format!(
                    "Script failed with exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ))
            }
        }
        Err(e) => ToolResult::error(format!("Could not start interpreter: {}", e)),
    }
}

async fn handle_apply_patch(ctx: &ToolContext, diff_content: String) -> ToolResult {
    let guard = ctx.guard.clone();
    let outcome = run_blocking(move || patch::apply_patch(&guard, &diff_content)).await;
    match outcome {
        Ok(outcome) => ToolResult::success(format!(
            "Patch applied successfully. File saved to '{}'.",
            outcome.target_display
        )),
        Err(e) => {
            if matches!(e, AgentError::PathEscape(_)) {
                ctx.emit(OutboundEvent::info(
                    "Blocked a patch touching paths outside the sandbox.".to_string(),
                ));
            }
            ToolResult::error(e.to_string())
        }
    }
}

/// Union of saved collections and live Haven sessions, labeled by where
/// each one exists.
async fn handle_list_sessions(ctx: &ToolContext) -> ToolResult {
    let store = ctx.store.clone();
    let collections = match run_blocking(move || store.list_collections()).await {
        Ok(names) => names,
        Err(e) => return ToolResult::error(format!("Failed to list sessions: {}", e)),
    };

    let mut statuses: BTreeMap<String, &'static str> = collections
        .iter()
        .filter_map(|name| name.strip_prefix(TURNS_PREFIX))
        .map(|name| (name.to_string(), "Saved"))
        .collect();

    match ctx.host.list_sessions().await {
        Ok(live) => {
            for name in live {
                let entry = statuses.entry(name).or_insert("Live");
                if *entry == "Saved" {
                    *entry = "Live & Saved";
                }
            }
        }
        Err(e) => return ToolResult::error(format!("Failed to list sessions: {}", e)),
    }

    let content: Vec<_> = statuses
        .into_iter()
        .map(|(name, status)| json!({"name": name, "summary": status}))
        .collect();
    ToolResult::success_with("Retrieved all sessions.", json!(content))
}

fn history_for_host(records: &[MemoryRecord]) -> Vec<HistoryTurn> {
    records
        .iter()
        .map(|r| HistoryTurn {
            role: match r.role {
                Role::Model => "model".to_string(),
                // Tool observations were prompts from the host's view.
                Role::User | Role::ToolObservation => "user".to_string(),
            },
            text: r.content.clone(),
        })
        .collect()
}

async fn handle_load_session(ctx: &ToolContext, session_name: String) -> ToolResult {
    let session = match ctx.session() {
        Some(s) => s,
        None => return ToolResult::error("Active session not found."),
    };

    let store = ctx.store.clone();
    let label = format!("{}{}", TURNS_PREFIX, session_name);
    let exists = match run_blocking({
        let store = store.clone();
        let label = label.clone();
        move || store.collection_exists(&label)
    })
    .await
    {
        Ok(exists) => exists,
        Err(e) => return ToolResult::error(format!("Could not load session: {}", e)),
    };
    if !exists {
        return ToolResult::error(format!("Session '{}' not found.", session_name));
    }

    let records = match run_blocking({
        let store = store.clone();
        move || store.collection(&label)?.get_all_records()
    })
    .await
    {
        Ok(records) => records,
        Err(e) => return ToolResult::error(format!("Could not load session: {}", e)),
    };

    let limit = ctx.config.memory.segment_threshold;
    let tail_start = records.len().saturating_sub(limit);
    let tail = &records[tail_start..];

    // Persisted records win: reseed the host history from the store.
    let history = history_for_host(tail);
    if let Err(e) = ctx.host.delete_session(&session_name).await {
        debug!("Haven delete before reload failed (continuing): {}", e);
    }
    if let Err(e) = ctx.host.get_or_create_session(&session_name, &history).await {
        return ToolResult::error(format!("Could not load session: {}", e));
    }

    let memory = match run_blocking({
        let store = store.clone();
        let session_name = session_name.clone();
        move || MemoryManager::new(&store, &session_name, limit)
    })
    .await
    {
        Ok(memory) => memory,
        Err(e) => return ToolResult::error(format!("Could not load session: {}", e)),
    };

    session.replace_memory(memory);
    session.set_name(&session_name);
    ctx.emit(OutboundEvent::SessionNameUpdate {
        name: session_name.clone(),
    });
    crate::server::replay::replay_history(&session.emitter, tail);
    ctx.trace
        .record("session_loaded", json!({"name": session_name}));
    ToolResult::success(format!("Session '{}' loaded.", session_name))
}

async fn handle_save_session(ctx: &ToolContext, session_name: String) -> ToolResult {
    let session = match ctx.session() {
        Some(s) => s,
        None => return ToolResult::error("Active session not found."),
    };
    let old_name = session.name();
    if old_name == session_name {
        return ToolResult::error("Session is already saved under that name.");
    }

    let store = ctx.store.clone();
    let records = match run_blocking({
        let store = store.clone();
        let old_name = old_name.clone();
        let new_name = session_name.clone();
        move || {
            let turns = store
                .collection(&format!("{}{}", TURNS_PREFIX, old_name))?
                .get_all_records()?;
            let target_turns = store.collection(&format!("{}{}", TURNS_PREFIX, new_name))?;
            for record in &turns {
                target_turns.add_record(record)?;
            }
            let code = store
                .collection(&format!("{}{}", CODE_PREFIX, old_name))?
                .get_all_records()?;
            let target_code = store.collection(&format!("{}{}", CODE_PREFIX, new_name))?;
            for record in &code {
                target_code.add_record(record)?;
            }
            Ok(turns)
        }
    })
    .await
    {
        Ok(records) => records,
        Err(e) => return ToolResult::error(format!("Failed to save session: {}", e)),
    };

    let history = history_for_host(&records);
    if let Err(e) = ctx.host.delete_session(&session_name).await {
        debug!("Haven delete before save failed (continuing): {}", e);
    }
    if let Err(e) = ctx.host.get_or_create_session(&session_name, &history).await {
        return ToolResult::error(format!("Failed to save session: {}", e));
    }

    let limit = ctx.config.memory.segment_threshold;
    let memory = match run_blocking({
        let store = store.clone();
        let session_name = session_name.clone();
        move || MemoryManager::new(&store, &session_name, limit)
    })
    .await
    {
        Ok(memory) => memory,
        Err(e) => return ToolResult::error(format!("Failed to save session: {}", e)),
    };

    session.replace_memory(memory);
    session.set_name(&session_name);
    ctx.emit(OutboundEvent::SessionNameUpdate {
        name: session_name.clone(),
    });
    ctx.trace
        .record("session_saved", json!({"name": session_name}));
    ToolResult::success(format!("Session saved as '{}'.", session_name))
}

async fn handle_delete_session(ctx: &ToolContext, session_name: String) -> ToolResult {
    let store = ctx.store.clone();
    let dropped = run_blocking({
        let session_name = session_name.clone();
        move || {
            store
                .collection(&format!("{}{}", TURNS_PREFIX, session_name))?
                .delete_collection()?;
            store
                .collection(&format!("{}{}", CODE_PREFIX, session_name))?
                .delete_collection()?;
            Ok(())
        }
    })
    .await;
    if let Err(e) = dropped {
        error!("Error deleting session '{}': {}", session_name, e);
        return ToolResult::error(format!("Could not delete session: {}", e));
    }
    if let Err(e) = ctx.host.delete_session(&session_name).await {
        return ToolResult::error(format!("Could not delete session: {}", e));
    }

    let refreshed = handle_list_sessions(ctx).await;
    ctx.emit(OutboundEvent::SessionListUpdate {
        status: if refreshed.is_success() {
            "success".to_string()
        } else {
            "error".to_string()
        },
        content: refreshed.content.clone().unwrap_or(json!([])),
    });
    ctx.trace
        .record("session_deleted", json!({"name": session_name}));
    ToolResult::success(format!(
        "Session '{}' deleted from both database and Haven.",
        session_name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::haven::testing::StubHost;
    use crate::server::session::EventEmitter;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        _tmp: TempDir,
        ctx: ToolContext,
        host: Arc<StubHost>,
        rx: UnboundedReceiver<OutboundEvent>,
    }

    fn harness() -> Harness {
        let tmp = TempDir::new().unwrap();
        let guard = PathGuard::new(&tmp.path().join("sandbox")).unwrap();
        let store = VectorStore::open_in_memory().unwrap();
        let host = Arc::new(StubHost::new());
        let registry = SessionRegistry::new();
        let config = Arc::new(Config::default());

        let memory = MemoryManager::new(&store, "New_Session_T", 20).unwrap();
        let (emitter, rx) = EventEmitter::new();
        let session = Arc::new(ActiveSession::new(
            "sid-1".to_string(),
            "New_Session_T".to_string(),
            memory,
            emitter,
        ));
        registry.insert(session);

        let ctx = ToolContext {
            guard,
            store,
            host: host.clone(),
            registry,
            session_id: "sid-1".to_string(),
            config,
            trace: TraceLog::default(),
        };
        Harness {
            _tmp: tmp,
            ctx,
            host,
            rx,
        }
    }

    fn raw(action: &str, params: serde_json::Value) -> RawCommand {
        RawCommand::new(action, params)
    }

    #[tokio::test]
    async fn test_create_then_read_file() {
        let h = harness();
        let created = dispatch(
            &raw("create_file", json!({"filename": "notes/a.txt", "content": "hello"})),
            &h.ctx,
        )
        .await;
        assert!(created.is_success(), "{:?}", created);

        let read = dispatch(&raw("read_file", json!({"filename": "notes/a.txt"})), &h.ctx).await;
        assert!(read.is_success());
        assert_eq!(read.content, Some(json!("hello")));
    }

    #[tokio::test]
    async fn test_read_missing_file_is_error_result() {
        let h = harness();
        let result = dispatch(&raw("read_file", json!({"filename": "ghost.txt"})), &h.ctx).await;
        assert!(!result.is_success());
        assert!(result.message.contains("not found") || result.message.contains("File not found"));
    }

    #[tokio::test]
    async fn test_path_escape_reported_to_user() {
        let mut h = harness();
        let result = dispatch(
            &raw("read_file", json!({"filename": "../../etc/passwd"})),
            &h.ctx,
        )
        .await;
        assert!(!result.is_success());
        let event = h.rx.try_recv().expect("escape should emit a user notice");
        match event {
            OutboundEvent::LogMessage { data, .. } => assert!(data.contains("outside the sandbox")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_file() {
        let h = harness();
        dispatch(
            &raw("create_file", json!({"filename": "old.txt", "content": "x"})),
            &h.ctx,
        )
        .await;
        let deleted = dispatch(&raw("delete_file", json!({"filename": "old.txt"})), &h.ctx).await;
        assert!(deleted.is_success());
        assert!(!h.ctx.guard.root().join("old.txt").exists());
    }

    #[tokio::test]
    async fn test_list_directory_skips_hidden_and_vendor() {
        let h = harness();
        let root = h.ctx.guard.root().to_path_buf();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join("target")).unwrap();
        fs::write(root.join("src/lib.rs"), "x").unwrap();
        fs::write(root.join("target/junk.o"), "x").unwrap();
        fs::write(root.join(".hidden"), "x").unwrap();
        fs::write(root.join("top.txt"), "x").unwrap();

        let result = dispatch(&raw("list_directory", json!({})), &h.ctx).await;
        let files: Vec<String> =
            serde_json::from_value(result.content.clone().unwrap()).unwrap();
        assert!(files.contains(&"src/lib.rs".to_string()));
        assert!(files.contains(&"top.txt".to_string()));
        assert!(!files.iter().any(|f| f.contains("target")));
        assert!(!files.iter().any(|f| f.contains(".hidden")));
    }

    #[tokio::test]
    async fn test_unknown_action_is_error() {
        let h = harness();
        let result = dispatch(&raw("summon_demon", json!({})), &h.ctx).await;
        assert!(!result.is_success());
        assert!(result.message.contains("unknown action: summon_demon"));
    }

    #[tokio::test]
    async fn test_read_project_file_allow_list() {
        let h = harness();
        let denied = dispatch(
            &raw("read_project_file", json!({"filename": "secrets.env"})),
            &h.ctx,
        )
        .await;
        assert!(!denied.is_success());
        assert!(denied.message.contains("not permitted"));

        let listed = dispatch(&raw("list_allowed_project_files", json!({})), &h.ctx).await;
        assert!(listed.is_success());
        let files: Vec<String> = serde_json::from_value(listed.content.unwrap()).unwrap();
        assert!(files.contains(&"Cargo.toml".to_string()));
    }

    #[tokio::test]
    async fn test_apply_patch_through_dispatch() {
        let h = harness();
        fs::write(h.ctx.guard.root().join("code.txt"), "one\ntwo\nthree\n").unwrap();
        let diff = "--- a/code.txt\n+++ b/code.txt\n@@ -2,1 +2,1 @@\n-two\n+TWO\n";
        let result = dispatch(&raw("apply_patch", json!({"diff_content": diff})), &h.ctx).await;
        assert!(result.is_success(), "{:?}", result);
        let patched = fs::read_to_string(h.ctx.guard.root().join("code.txt")).unwrap();
        assert_eq!(patched, "one\nTWO\nthree\n");
    }

    #[tokio::test]
    async fn test_list_sessions_union_of_saved_and_live() {
        let h = harness();
        // Saved collection only.
        h.ctx.store.collection("turns-archived").unwrap();
        // Live only.
        h.host.sessions.lock().unwrap().push("ephemeral".to_string());
        // Both.
        h.ctx.store.collection("turns-shared").unwrap();
        h.host.sessions.lock().unwrap().push("shared".to_string());

        let result = dispatch(&raw("list_sessions", json!({})), &h.ctx).await;
        assert!(result.is_success());
        let entries: Vec<serde_json::Value> =
            serde_json::from_value(result.content.unwrap()).unwrap();
        let find = |name: &str| {
            entries
                .iter()
                .find(|e| e["name"] == name)
                .map(|e| e["summary"].as_str().unwrap().to_string())
        };
        assert_eq!(find("archived").as_deref(), Some("Saved"));
        assert_eq!(find("ephemeral").as_deref(), Some("Live"));
        assert_eq!(find("shared").as_deref(), Some("Live & Saved"));
    }

    #[tokio::test]
    async fn test_save_load_round_trip_preserves_buffer() {
        let h = harness();
        let session = h.ctx.session().unwrap();
        session.with_memory(|m| {
            m.add_user_turn("what is rust", None).unwrap();
            m.add_turn(Role::Model, "a systems language", BTreeMap::new())
                .unwrap();
        });
        let original: Vec<(Role, String)> = session.with_memory(|m| {
            m.get_conversational_buffer()
                .iter()
                .map(|t| (t.role, t.content.clone()))
                .collect()
        });

        let saved = dispatch(
            &raw("save_session", json!({"session_name": "demo"})),
            &h.ctx,
        )
        .await;
        assert!(saved.is_success(), "{:?}", saved);
        assert_eq!(session.name(), "demo");

        let loaded = dispatch(
            &raw("load_session", json!({"session_name": "demo"})),
            &h.ctx,
        )
        .await;
        assert!(loaded.is_success(), "{:?}", loaded);

        let restored: Vec<(Role, String)> = session.with_memory(|m| {
            m.get_conversational_buffer()
                .iter()
                .map(|t| (t.role, t.content.clone()))
                .collect()
        });
        assert_eq!(restored, original);
        assert!(h.host.sessions.lock().unwrap().contains(&"demo".to_string()));
    }

    #[tokio::test]
    async fn test_load_missing_session_is_error() {
        let h = harness();
        let result = dispatch(
            &raw("load_session", json!({"session_name": "nope"})),
            &h.ctx,
        )
        .await;
        assert!(!result.is_success());
        assert!(result.message.contains("not found"));
    }

    #[tokio::test]
    async fn test_delete_session_drops_everywhere_and_emits_list() {
        let mut h = harness();
        dispatch(
            &raw("save_session", json!({"session_name": "doomed"})),
            &h.ctx,
        )
        .await;
        let result = dispatch(
            &raw("delete_session", json!({"session_name": "doomed"})),
            &h.ctx,
        )
        .await;
        assert!(result.is_success(), "{:?}", result);
        assert!(!h
            .ctx
            .store
            .list_collections()
            .unwrap()
            .contains(&"turns-doomed".to_string()));
        assert!(!h.host.sessions.lock().unwrap().contains(&"doomed".to_string()));

        let mut saw_list_update = false;
        while let Ok(event) = h.rx.try_recv() {
            if let OutboundEvent::SessionListUpdate { content, .. } = event {
                saw_list_update = true;
                assert!(!content.to_string().contains("doomed"));
            }
        }
        assert!(saw_list_update);
    }

    #[tokio::test]
    async fn test_loop_level_actions_rejected_at_dispatch() {
        let h = harness();
        let result = dispatch(
            &raw("request_confirmation", json!({"prompt": "sure?"})),
            &h.ctx,
        )
        .await;
        assert!(!result.is_success());
    }
}
