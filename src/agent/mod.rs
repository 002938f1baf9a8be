//! The reasoning loop: the cognitive engine driving one user task.
//!
//! Each task is a single cooperative task pumping a cycle of thought and
//! action: augment the prompt from memory, call the model host, parse the
//! reply, render it, then either finish, suspend for user confirmation, or
//! execute a tool and feed its result back as the next prompt. Iteration
//! is bounded: a soft cap nudges the model to finalize, a hard cap ends
//! the task with a diagnostic.
//!
//! The loop suspends only at typed rendezvous points: worker results, the
//! model-host call, and the single-shot confirmation slot. Disconnection
//! is observed at the next suspension: the session vanishes from the
//! registry (or the slot resolves `no`) and the loop exits without
//! emitting to the departed client.

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::AgentError;
use crate::memory::MemoryManager;
use crate::models::{Role, ToolCommand, ToolResult, META_TOOL_NAME};
use crate::parser::{is_prose_effectively_empty, parse_agent_response};
use crate::server::events::OutboundEvent;
use crate::server::session::{ActiveSession, Confirmation};
use crate::tools::{self, ToolContext};

const FINALIZE_NUDGE: &str = "WARNING: You have exceeded the nominal iteration limit. \
     You MUST finalize with the `task_complete` command in your next reply.";

const NO_COMMAND_OBSERVATION: &str = "Your reply did not include a command object. \
     Reply with a JSON command; use `task_complete` to deliver your final answer.";

/// Run memory work on the worker pool so the reactor keeps spinning.
async fn with_memory<R, F>(session: &Arc<ActiveSession>, f: F) -> Result<R, AgentError>
where
    R: Send + 'static,
    F: FnOnce(&mut MemoryManager) -> Result<R, AgentError> + Send + 'static,
{
    let session = session.clone();
    tokio::task::spawn_blocking(move || session.with_memory(f))
        .await
        .map_err(|e| AgentError::Unknown(anyhow::anyhow!("worker task failed: {}", e)))?
}

fn observation_of(result: &ToolResult, tool_name: Option<&str>) -> (String, BTreeMap<String, String>) {
    let observation = result.to_observation();
    let mut metadata = BTreeMap::new();
    if let Some(name) = tool_name {
        metadata.insert(META_TOOL_NAME.to_string(), name.to_string());
    }
    (observation, metadata)
}

/// Execute one user task to completion.
///
/// The caller has already claimed the session's busy flag and releases it
/// when this returns; concurrent `start_task` events are rejected at the
/// event bridge.
pub async fn execute_reasoning_loop(
    ctx: ToolContext,
    session: Arc<ActiveSession>,
    initial_prompt: String,
) {
    let absolute_max = ctx.config.agent.absolute_max_iterations;
    let nominal_max = ctx.config.agent.nominal_max_iterations;
    let emitter = session.emitter.clone();

    // Record the user turn and fold retrieved context into the first
    // prompt; later prompts are raw observations.
    let augmented = {
        let prompt = initial_prompt.clone();
        with_memory(&session, move |memory| {
            let augmented = memory.prepare_augmented_prompt(&prompt)?;
            memory.add_user_turn(&prompt, Some(&augmented))?;
            Ok(augmented)
        })
        .await
    };
    let mut current_prompt = match augmented {
        Ok(augmented) => augmented,
        Err(e) => {
            emitter.emit(OutboundEvent::info(format!(
                "Could not prepare the task: {}",
                e
            )));
            return;
        }
    };
    let mut destruction_confirmed = false;

    for iteration in 0..absolute_max {
        ctx.trace.record(
            "loop_iteration",
            json!({"iteration": iteration, "session": session.session_id}),
        );
        if !ctx.registry.contains(&session.session_id) {
            info!(
                "Session {} disappeared; ending reasoning loop",
                session.session_id
            );
            return;
        }

        let prompt_to_send = if iteration >= nominal_max {
            format!("{}\n\n{}", current_prompt, FINALIZE_NUDGE)
        } else {
            current_prompt.clone()
        };

        let response_text = match ctx.host.send_message(&session.name(), &prompt_to_send).await {
            Ok(text) => text,
            Err(AgentError::ModelHostTimeout(secs)) => {
                let result = ToolResult::error(format!("model call timed out after {}s", secs));
                emitter.emit(OutboundEvent::ToolLog {
                    data: format!("[{}]", result.message),
                });
                emitter.emit(OutboundEvent::info(result.message.clone()));
                let (observation, metadata) = observation_of(&result, None);
                let stored = observation.clone();
                let _ = with_memory(&session, move |memory| {
                    memory.add_turn(Role::ToolObservation, &stored, metadata)
                })
                .await;
                current_prompt = observation;
                continue;
            }
            Err(e) => {
                warn!("Model host failure ends the loop: {}", e);
                emitter.emit(OutboundEvent::info(format!(
                    "The model host is unavailable: {}. Ending the task.",
                    e
                )));
                return;
            }
        };

        {
            let stored = response_text.clone();
            let _ = with_memory(&session, move |memory| {
                memory.add_turn(Role::Model, &stored, BTreeMap::new())
            })
            .await;
        }

        let parsed = parse_agent_response(&response_text);

        let raw_command = match parsed.command.clone() {
            Some(raw) => raw,
            None => {
                if !parsed.is_prose_empty() {
                    emitter.emit(OutboundEvent::info(parsed.prose.clone()));
                }
                let result = ToolResult::error(NO_COMMAND_OBSERVATION);
                emitter.emit(OutboundEvent::ToolLog {
                    data: format!("[{}]", result.message),
                });
                let (observation, metadata) = observation_of(&result, None);
                let stored = observation.clone();
                let _ = with_memory(&session, move |memory| {
                    memory.add_turn(Role::ToolObservation, &stored, metadata)
                })
                .await;
                current_prompt = observation;
                continue;
            }
        };

        let command = match ToolCommand::from_raw(&raw_command) {
            Ok(command) => command,
            Err(e) => {
                if !parsed.is_prose_empty() {
                    emitter.emit(OutboundEvent::info(parsed.prose.clone()));
                }
                let result = ToolResult::error(e.to_string());
                emitter.emit(OutboundEvent::ToolLog {
                    data: format!("[{}]", result.message),
                });
                emitter.emit(OutboundEvent::info(result.message.clone()));
                let (observation, metadata) =
                    observation_of(&result, Some(&raw_command.action));
                let stored = observation.clone();
                let _ = with_memory(&session, move |memory| {
                    memory.add_turn(Role::ToolObservation, &stored, metadata)
                })
                .await;
                current_prompt = observation;
                continue;
            }
        };

        match command {
            ToolCommand::TaskComplete { answer } => {
                let final_message = if answer.len() > parsed.prose.len() {
                    answer
                } else {
                    parsed.prose.clone()
                };
                let final_message = if is_prose_effectively_empty(&final_message) {
                    "Task complete.".to_string()
                } else {
                    final_message
                };
                emitter.emit(OutboundEvent::final_answer(final_message));
                info!(
                    "Agent issued a final answer; ending loop for session {}",
                    session.session_id
                );
                return;
            }

            ToolCommand::RequestConfirmation { prompt } => {
                if !parsed.is_prose_empty() {
                    emitter.emit(OutboundEvent::info(parsed.prose.clone()));
                }
                let slot = session.install_confirmation();
                emitter.emit(OutboundEvent::RequestUserConfirmation {
                    prompt: prompt.clone(),
                });
                ctx.trace
                    .record("confirmation_wait", json!({"prompt": prompt}));

                let answer = match slot.await {
                    Ok(answer) => answer,
                    Err(_) => {
                        info!(
                            "Confirmation slot closed (disconnect); ending loop for session {}",
                            session.session_id
                        );
                        return;
                    }
                };
                destruction_confirmed = answer == Confirmation::Yes;
                let confirmation_text = format!("USER_CONFIRMATION: '{}'", answer.as_str());
                ctx.trace
                    .record("confirmation_answer", json!({"answer": answer.as_str()}));
                {
                    let stored = confirmation_text.clone();
                    let _ = with_memory(&session, move |memory| {
                        memory.add_turn(Role::User, &stored, BTreeMap::new())
                    })
                    .await;
                }
                current_prompt = confirmation_text;
                continue;
            }

            other => {
                if !parsed.is_prose_empty() {
                    emitter.emit(OutboundEvent::info(parsed.prose.clone()));
                }

                let action = other.action_name();
                let result = if matches!(
                    other,
                    ToolCommand::DeleteFile { .. } | ToolCommand::DeleteSession { .. }
                ) && !destruction_confirmed
                {
                    let message = format!(
                        "Action '{}' is destructive. Use 'request_confirmation' first.",
                        action
                    );
                    warn!("{}", message);
                    ToolResult::error(message)
                } else {
                    tools::execute(other, &ctx).await
                };
                destruction_confirmed = false;

                emitter.emit(OutboundEvent::ToolLog {
                    data: format!("[{}]", result.message),
                });
                emitter.emit(OutboundEvent::info(result.message.clone()));

                let (observation, metadata) = observation_of(&result, Some(action));
                let stored = observation.clone();
                let _ = with_memory(&session, move |memory| {
                    memory.add_turn(Role::ToolObservation, &stored, metadata)
                })
                .await;

                // A loaded session replaced this loop's memory and name;
                // its context is stale, so the loop ends here.
                if action == "load_session" && result.is_success() {
                    return;
                }
                current_prompt = observation;
            }
        }
    }

    emitter.emit(OutboundEvent::info(
        "The reasoning loop reached its iteration limit without a final answer.",
    ));
    info!(
        "Iteration cap reached for session {}; loop ended",
        session.session_id
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::haven::testing::StubHost;
    use crate::sandbox::PathGuard;
    use crate::server::events::LogKind;
    use crate::server::session::{EventEmitter, SessionRegistry};
    use crate::store::VectorStore;
    use crate::trace::TraceLog;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        _tmp: TempDir,
        ctx: ToolContext,
        session: Arc<ActiveSession>,
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

        let memory = MemoryManager::new(&store, "New_Session_L", 20).unwrap();
        let (emitter, rx) = EventEmitter::new();
        let session = Arc::new(ActiveSession::new(
            "loop-1".to_string(),
            "New_Session_L".to_string(),
            memory,
            emitter,
        ));
        registry.insert(session.clone());

        let ctx = ToolContext {
            guard,
            store,
            host: host.clone(),
            registry,
            session_id: "loop-1".to_string(),
            config,
            trace: TraceLog::default(),
        };
        Harness {
            _tmp: tmp,
            ctx,
            session,
            host,
            rx,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn task_complete(answer: &str) -> String {
        format!(
            "```json\n{{\"action\": \"task_complete\", \"parameters\": {{\"answer\": \"{}\"}}}}\n```",
            answer
        )
    }

    #[tokio::test]
    async fn test_simple_answer_single_iteration() {
        let mut h = harness();
        h.host.push_reply(&task_complete("Hi."));

        execute_reasoning_loop(h.ctx.clone(), h.session.clone(), "hello".to_string()).await;

        assert_eq!(h.host.call_count(), 1);
        let events = drain(&mut h.rx);
        let finals: Vec<_> = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    OutboundEvent::LogMessage {
                        kind: LogKind::FinalAnswer,
                        ..
                    }
                )
            })
            .collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0], &OutboundEvent::final_answer("Hi."));
    }

    #[tokio::test]
    async fn test_tool_then_answer() {
        let mut h = harness();
        std::fs::write(h.ctx.guard.root().join("a.txt"), "x").unwrap();
        h.host.push_reply(
            "Listing now.\n```json\n{\"action\": \"list_directory\", \"parameters\": {}}\n```",
        );
        h.host.push_reply(&task_complete("You have a.txt."));

        execute_reasoning_loop(h.ctx.clone(), h.session.clone(), "what files".to_string()).await;

        assert_eq!(h.host.call_count(), 2);
        // Second prompt carries the tool observation.
        let sent = h.host.sent.lock().unwrap();
        assert!(sent[1].1.starts_with("Tool Result: {"));
        assert!(sent[1].1.contains("a.txt"));
        drop(sent);

        let events = drain(&mut h.rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, OutboundEvent::ToolLog { .. })));
        assert!(events.contains(&OutboundEvent::final_answer("You have a.txt.")));
    }

    #[tokio::test]
    async fn test_no_command_feeds_error_observation() {
        let mut h = harness();
        h.host.push_reply("I am just musing with no command.");
        h.host.push_reply(&task_complete("Recovered."));

        execute_reasoning_loop(h.ctx.clone(), h.session.clone(), "go".to_string()).await;

        assert_eq!(h.host.call_count(), 2);
        let sent = h.host.sent.lock().unwrap();
        assert!(sent[1].1.contains("did not include a command"));
        drop(sent);
        let events = drain(&mut h.rx);
        assert!(events.contains(&OutboundEvent::info("I am just musing with no command.")));
    }

    #[tokio::test]
    async fn test_unknown_action_observation() {
        let h = harness();
        h.host
            .push_reply("{\"action\": \"summon\", \"parameters\": {}}");
        h.host.push_reply(&task_complete("ok"));

        execute_reasoning_loop(h.ctx.clone(), h.session.clone(), "go".to_string()).await;

        let sent = h.host.sent.lock().unwrap();
        assert!(sent[1].1.contains("unknown action: summon"));
    }

    #[tokio::test]
    async fn test_iteration_cap_single_terminal_info() {
        let mut h = harness();
        // Every reply asks for another listing; the loop must stop at the cap.
        for _ in 0..20 {
            h.host
                .push_reply("{\"action\": \"list_directory\", \"parameters\": {}}");
        }

        execute_reasoning_loop(h.ctx.clone(), h.session.clone(), "loop forever".to_string()).await;

        assert_eq!(
            h.host.call_count(),
            h.ctx.config.agent.absolute_max_iterations
        );
        let events = drain(&mut h.rx);
        let terminals: Vec<_> = events
            .iter()
            .filter(|e| match e {
                OutboundEvent::LogMessage {
                    kind: LogKind::Info,
                    data,
                } => data.contains("iteration limit"),
                _ => false,
            })
            .collect();
        assert_eq!(terminals.len(), 1);
    }

    #[tokio::test]
    async fn test_nominal_cap_nudges_model() {
        let h = harness();
        for _ in 0..20 {
            h.host
                .push_reply("{\"action\": \"list_directory\", \"parameters\": {}}");
        }
        execute_reasoning_loop(h.ctx.clone(), h.session.clone(), "busywork".to_string()).await;

        let sent = h.host.sent.lock().unwrap();
        let nominal = h.ctx.config.agent.nominal_max_iterations;
        assert!(!sent[nominal - 1].1.contains("nominal iteration limit"));
        assert!(sent[nominal].1.contains("nominal iteration limit"));
    }

    #[tokio::test]
    async fn test_confirmed_delete_flow() {
        let mut h = harness();
        std::fs::write(h.ctx.guard.root().join("old.txt"), "bye").unwrap();
        h.host.push_reply(
            "{\"action\": \"request_confirmation\", \"parameters\": {\"prompt\": \"Delete old.txt?\"}}",
        );
        h.host
            .push_reply("{\"action\": \"delete_file\", \"parameters\": {\"filename\": \"old.txt\"}}");
        h.host.push_reply(&task_complete("Deleted."));

        let ctx = h.ctx.clone();
        let session = h.session.clone();
        let task = tokio::spawn(async move {
            execute_reasoning_loop(ctx, session, "delete old.txt".to_string()).await;
        });

        // Wait for the confirmation request, then answer yes.
        let mut asked = false;
        for _ in 0..200 {
            if let Ok(event) = h.rx.try_recv() {
                if matches!(event, OutboundEvent::RequestUserConfirmation { .. }) {
                    asked = true;
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(asked, "loop never asked for confirmation");
        h.session.resolve_confirmation(Confirmation::Yes);
        task.await.unwrap();

        assert!(!h.ctx.guard.root().join("old.txt").exists());
        let sent = h.host.sent.lock().unwrap();
        assert!(sent[1].1.starts_with("USER_CONFIRMATION: 'yes'"));
    }

    #[tokio::test]
    async fn test_unconfirmed_destructive_action_blocked() {
        let h = harness();
        std::fs::write(h.ctx.guard.root().join("keep.txt"), "data").unwrap();
        h.host
            .push_reply("{\"action\": \"delete_file\", \"parameters\": {\"filename\": \"keep.txt\"}}");
        h.host.push_reply(&task_complete("ok"));

        execute_reasoning_loop(h.ctx.clone(), h.session.clone(), "delete keep.txt".to_string())
            .await;

        assert!(h.ctx.guard.root().join("keep.txt").exists());
        let sent = h.host.sent.lock().unwrap();
        assert!(sent[1].1.contains("destructive"));
    }

    #[tokio::test]
    async fn test_timeout_becomes_observation_and_loop_continues() {
        let mut h = harness();
        h.host.push_error(AgentError::ModelHostTimeout(120));
        h.host.push_reply(&task_complete("Back online."));

        execute_reasoning_loop(h.ctx.clone(), h.session.clone(), "hello".to_string()).await;

        assert_eq!(h.host.call_count(), 2);
        let sent = h.host.sent.lock().unwrap();
        assert!(sent[1].1.contains("timed out"));
        drop(sent);
        let events = drain(&mut h.rx);
        assert!(events.iter().any(|e| matches!(
            e,
            OutboundEvent::ToolLog { data } if data.contains("timed out")
        )));
        assert!(events.contains(&OutboundEvent::final_answer("Back online.")));
    }

    #[tokio::test]
    async fn test_unavailable_host_terminates_with_info() {
        let mut h = harness();
        h.host
            .push_error(AgentError::ModelHostUnavailable("connection refused".into()));

        execute_reasoning_loop(h.ctx.clone(), h.session.clone(), "hello".to_string()).await;

        assert_eq!(h.host.call_count(), 1);
        let events = drain(&mut h.rx);
        let infos: Vec<_> = events
            .iter()
            .filter(|e| {
                matches!(e, OutboundEvent::LogMessage { kind: LogKind::Info, data } if data.contains("unavailable"))
            })
            .collect();
        assert_eq!(infos.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_during_confirmation_ends_loop() {
        let mut h = harness();
        h.host.push_reply(
            "{\"action\": \"request_confirmation\", \"parameters\": {\"prompt\": \"Proceed?\"}}",
        );

        let ctx = h.ctx.clone();
        let session = h.session.clone();
        let task = tokio::spawn(async move {
            execute_reasoning_loop(ctx, session, "do something".to_string()).await;
        });

        for _ in 0..200 {
            if let Ok(event) = h.rx.try_recv() {
                if matches!(event, OutboundEvent::RequestUserConfirmation { .. }) {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        // Disconnect: registry removal resolves the slot as `no`; the loop
        // then observes the missing session and exits.
        h.ctx.registry.remove("loop-1");
        task.await.unwrap();
        assert_eq!(h.host.call_count(), 1);
    }

    #[tokio::test]
    async fn test_turns_recorded_for_save_load() {
        let h = harness();
        h.host.push_reply(&task_complete("Hi."));
        execute_reasoning_loop(h.ctx.clone(), h.session.clone(), "hello".to_string()).await;

        let records = h.session.with_memory(|m| m.get_all_turns()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].role, Role::User);
        assert_eq!(records[0].content, "hello");
        assert!(records[0]
            .metadata
            .contains_key(crate::models::META_AUGMENTED_PROMPT));
        assert_eq!(records[1].role, Role::Model);
    }
}
