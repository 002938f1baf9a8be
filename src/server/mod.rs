//! The event bridge: the exclusive real-time channel between browser
//! clients and the agent core.
//!
//! One WebSocket connection maps to one [`ActiveSession`]. Outbound events
//! funnel through a single writer task per connection, so within a session
//! every emit arrives in program order. Inbound events are the only levers
//! a user can pull; each handler here delegates to the core and always
//! reports back, so the client never infers server state from silence.

pub mod events;
pub mod replay;
pub mod session;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::AgentError;
use crate::haven::ModelHost;
use crate::memory::MemoryManager;
use crate::models::ToolCommand;
use crate::sandbox::PathGuard;
use crate::store::VectorStore;
use crate::tools::{self, ToolContext};
use crate::trace::TraceLog;

use events::{AuditEvent, InboundEvent, OutboundEvent};
use session::{ActiveSession, Confirmation, EventEmitter, SessionRegistry};

/// All server-wide state, passed by reference into handlers. Session and
/// confirmation maps live here rather than in module globals.
pub struct Server {
    pub config: Arc<Config>,
    pub guard: PathGuard,
    pub store: VectorStore,
    pub host: Arc<dyn ModelHost>,
    pub registry: SessionRegistry,
    pub trace: TraceLog,
}

impl Server {
    pub fn new(config: Config, host: Arc<dyn ModelHost>) -> Result<Self, AgentError> {
        let guard = PathGuard::new(&config.sandbox_path())?;
        let store = VectorStore::open(&config.store_path())?;
        Ok(Self {
            config: Arc::new(config),
            guard,
            store,
            host,
            registry: SessionRegistry::new(),
            trace: TraceLog::default(),
        })
    }

    pub fn tool_context(&self, session_id: &str) -> ToolContext {
        ToolContext {
            guard: self.guard.clone(),
            store: self.store.clone(),
            host: self.host.clone(),
            registry: self.registry.clone(),
            session_id: session_id.to_string(),
            config: self.config.clone(),
            trace: self.trace.clone(),
        }
    }
}

pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/ws", get(ws_upgrade))
        .with_state(server)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(server: Arc<Server>) -> anyhow::Result<()> {
    let addr = format!(
        "{}:{}",
        server.config.server.bind, server.config.server.port
    );
    let app = router(server);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Agent server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_upgrade(State(server): State<Arc<Server>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(server, socket))
}

/// Uppercase wall-clock tag used in default session names,
/// e.g. `02AUG2025_014830PM`.
fn session_timestamp() -> String {
    chrono::Local::now()
        .format("%d%b%Y_%I%M%S%p")
        .to_string()
        .to_uppercase()
}

async fn handle_socket(server: Arc<Server>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (emitter, mut outbound_rx) = EventEmitter::new();

    // Single writer per connection: this task is the only place messages
    // hit the wire, which is what preserves per-session emit order.
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            if sink.send(Message::Text(event.to_message())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let session_id = Uuid::new_v4().to_string();
    let session_name = format!("New_Session_{}", session_timestamp());
    info!("Client connected: {} ({})", session_id, session_name);

    // A cold model host degrades the session rather than refusing it:
    // every later model call reports its own failure.
    if let Err(e) = server.host.get_or_create_session(&session_name, &[]).await {
        warn!("Haven not reachable while creating '{}': {}", session_name, e);
        emitter.emit(OutboundEvent::info(format!(
            "The model host is not reachable yet: {}",
            e
        )));
    }

    let memory = {
        let store = server.store.clone();
        let name = session_name.clone();
        let limit = server.config.memory.segment_threshold;
        tokio::task::spawn_blocking(move || MemoryManager::new(&store, &name, limit)).await
    };
    let memory = match memory {
        Ok(Ok(memory)) => memory,
        Ok(Err(e)) => {
            warn!("Could not initialize session memory: {}", e);
            emitter.emit(OutboundEvent::info("Failed to initialize the session."));
            writer.abort();
            return;
        }
        Err(e) => {
            warn!("Worker failure during session init: {}", e);
            emitter.emit(OutboundEvent::info("Failed to initialize the session."));
            writer.abort();
            return;
        }
    };

    let session = Arc::new(ActiveSession::new(
        session_id.clone(),
        session_name.clone(),
        memory,
        emitter.clone(),
    ));
    server.registry.insert(session.clone());

    emitter.emit(OutboundEvent::SessionNameUpdate {
        name: session_name.clone(),
    });
    emitter.emit(OutboundEvent::SessionConfigUpdate {
        max_buffer_size: server.config.memory.segment_threshold,
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match events::parse_inbound(&text) {
                Ok(event) => handle_event(&server, &session, event).await,
                Err(e) => {
                    emitter.emit(OutboundEvent::info(format!("Ignoring malformed event: {}", e)));
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }

    info!("Client disconnected: {}", session_id);
    // Removal resolves any outstanding confirmation `no`; a running loop
    // notices the missing session at its next suspension point.
    server.registry.remove(&session_id);
    writer.abort();
}

fn log_audit(session: &ActiveSession, audit: AuditEvent) {
    info!(
        target: "audit",
        event = %audit.event,
        session = %session.name(),
        source = audit.source.as_deref().unwrap_or("-"),
        destination = audit.destination.as_deref().unwrap_or("-"),
        details = audit.details.as_deref().unwrap_or("-"),
        control_flow = audit.control_flow.as_deref().unwrap_or("-"),
        "client audit event"
    );
}

async fn handle_event(server: &Arc<Server>, session: &Arc<ActiveSession>, event: InboundEvent) {
    let emitter = session.emitter.clone();
    match event {
        InboundEvent::StartTask { prompt } => {
            if prompt.trim().is_empty() {
                emitter.emit(OutboundEvent::info(
                    "Invalid argument: a task prompt must not be empty.",
                ));
                return;
            }
            // One loop per session: a second start_task is rejected, never
            // queued behind the first.
            if !session.try_begin_task() {
                emitter.emit(OutboundEvent::info(
                    "A task is already running for this session; wait for it to finish.",
                ));
                return;
            }
            emitter.emit(OutboundEvent::DisplayUserPrompt {
                prompt: prompt.clone(),
            });
            let ctx = server.tool_context(&session.session_id);
            let session = session.clone();
            tokio::spawn(async move {
                let flag_holder = session.clone();
                crate::agent::execute_reasoning_loop(ctx, session, prompt).await;
                flag_holder.end_task();
            });
        }

        InboundEvent::UserConfirmation { response } => {
            session.resolve_confirmation(Confirmation::from_response(&response));
        }

        InboundEvent::RequestSessionList => {
            let ctx = server.tool_context(&session.session_id);
            let result = tools::execute(ToolCommand::ListSessions, &ctx).await;
            emitter.emit(OutboundEvent::SessionListUpdate {
                status: if result.is_success() {
                    "success".to_string()
                } else {
                    "error".to_string()
                },
                content: result.content.unwrap_or_else(|| json!([])),
            });
        }

        InboundEvent::RequestSessionName => {
            emitter.emit(OutboundEvent::SessionNameUpdate {
                name: session.name(),
            });
        }

        InboundEvent::LogAuditEvent(audit) => log_audit(session, audit),

        InboundEvent::RequestDbCollections => {
            let store = server.store.clone();
            let listing = tokio::task::spawn_blocking(move || store.list_collections()).await;
            match listing {
                Ok(Ok(names)) => {
                    emitter.emit(OutboundEvent::DbCollectionsList {
                        collections: json!(names),
                    });
                }
                Ok(Err(e)) => {
                    emitter.emit(OutboundEvent::info(format!("Could not list collections: {}", e)));
                }
                Err(e) => {
                    emitter.emit(OutboundEvent::info(format!("Could not list collections: {}", e)));
                }
            }
        }

        InboundEvent::RequestDbCollectionData { collection } => {
            let store = server.store.clone();
            let name = collection.clone();
            let records = tokio::task::spawn_blocking(move || {
                store.open_collection_unchecked(&name).get_all_records()
            })
            .await;
            match records {
                Ok(Ok(records)) => {
                    emitter.emit(OutboundEvent::DbCollectionData {
                        collection,
                        records: json!(records),
                    });
                }
                Ok(Err(e)) => {
                    emitter.emit(OutboundEvent::info(format!(
                        "Could not read collection '{}': {}",
                        collection, e
                    )));
                }
                Err(e) => {
                    emitter.emit(OutboundEvent::info(format!(
                        "Could not read collection '{}': {}",
                        collection, e
                    )));
                }
            }
        }

        InboundEvent::RequestTraceLog => {
            emitter.emit(OutboundEvent::TraceLogResponse {
                trace: json!(server.trace.snapshot()),
            });
        }

        InboundEvent::RequestHavenTraceLog => match server.host.get_trace_log().await {
            Ok(trace) => {
                emitter.emit(OutboundEvent::HavenTraceLogResponse {
                    trace: json!(trace),
                });
            }
            Err(e) => {
                emitter.emit(OutboundEvent::info(format!(
                    "Could not fetch the model host trace log: {}",
                    e
                )));
            }
        },
    }
}
