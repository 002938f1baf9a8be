//! Per-connection session state and the registry that owns it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::events::OutboundEvent;
use crate::memory::MemoryManager;

/// User's answer to a confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Yes,
    No,
}

impl Confirmation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confirmation::Yes => "yes",
            Confirmation::No => "no",
        }
    }

    pub fn from_response(response: &str) -> Self {
        if response.trim().eq_ignore_ascii_case("yes") {
            Confirmation::Yes
        } else {
            Confirmation::No
        }
    }
}

/// Handle for pushing events to one client. All sends for a session go
/// through the same channel, drained by a single writer task, so emit
/// order is program order. A failed send means the client is gone.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl EventEmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false when the connection has gone away.
    pub fn emit(&self, event: OutboundEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Everything the server holds for one connected client.
pub struct ActiveSession {
    pub session_id: String,
    name: Mutex<String>,
    memory: Mutex<MemoryManager>,
    confirmation: Mutex<Option<oneshot::Sender<Confirmation>>>,
    busy: AtomicBool,
    pub emitter: EventEmitter,
}

impl ActiveSession {
    pub fn new(
        session_id: String,
        name: String,
        memory: MemoryManager,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            session_id,
            name: Mutex::new(name),
            memory: Mutex::new(memory),
            confirmation: Mutex::new(None),
            busy: AtomicBool::new(false),
            emitter,
        }
    }

    pub fn name(&self) -> String {
        self.name.lock().map(|n| n.clone()).unwrap_or_default()
    }

    pub fn set_name(&self, name: &str) {
        if let Ok(mut guard) = self.name.lock() {
            *guard = name.to_string();
        }
    }

    /// Run a closure against the session's memory manager. The lock is
    /// plain (not async): callers doing store I/O wrap the whole call in
    /// `spawn_blocking`.
    pub fn with_memory<R>(&self, f: impl FnOnce(&mut MemoryManager) -> R) -> R {
        let mut guard = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Swap in a fresh memory manager (session save/load rebinds).
    pub fn replace_memory(&self, memory: MemoryManager) {
        let mut guard = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        *guard = memory;
    }

    /// Install a fresh single-shot confirmation slot, returning the
    /// receiving end. At most one slot is outstanding: installing over an
    /// unconsumed slot drops it, which resolves the old waiter as `No`.
    pub fn install_confirmation(&self) -> oneshot::Receiver<Confirmation> {
        let (tx, rx) = oneshot::channel();
        let mut guard = self
            .confirmation
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if guard.replace(tx).is_some() {
            warn!(
                "Replacing an unconsumed confirmation slot for session {}",
                self.session_id
            );
        }
        rx
    }

    /// Deliver the user's answer to the waiting loop, if any.
    pub fn resolve_confirmation(&self, answer: Confirmation) -> bool {
        let sender = {
            let mut guard = self
                .confirmation
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        match sender {
            Some(tx) => tx.send(answer).is_ok(),
            None => {
                debug!(
                    "Confirmation received with no outstanding slot for session {}",
                    self.session_id
                );
                false
            }
        }
    }

    /// Try to claim the session for a reasoning loop. Fails when a loop
    /// is already running; a second task is rejected, never queued.
    pub fn try_begin_task(&self) -> bool {
        !self.busy.swap(true, Ordering::SeqCst)
    }

    pub fn end_task(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

/// Owner of all live sessions, keyed by connection id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Arc<ActiveSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<ActiveSession>) {
        if let Ok(mut map) = self.sessions.lock() {
            map.insert(session.session_id.clone(), session);
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<ActiveSession>> {
        self.sessions
            .lock()
            .ok()
            .and_then(|map| map.get(session_id).cloned())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .map(|map| map.contains_key(session_id))
            .unwrap_or(false)
    }

    /// Remove a session on disconnect; any outstanding confirmation wait
    /// resolves `No` so a suspended loop can exit cleanly.
    pub fn remove(&self, session_id: &str) -> Option<Arc<ActiveSession>> {
        let removed = self
            .sessions
            .lock()
            .ok()
            .and_then(|mut map| map.remove(session_id));
        if let Some(session) = &removed {
            session.resolve_confirmation(Confirmation::No);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VectorStore;

    fn session(id: &str) -> (Arc<ActiveSession>, mpsc::UnboundedReceiver<OutboundEvent>) {
        let store = VectorStore::open_in_memory().unwrap();
        let memory = MemoryManager::new(&store, &format!("Session_{}", id), 20).unwrap();
        let (emitter, rx) = EventEmitter::new();
        (
            Arc::new(ActiveSession::new(
                id.to_string(),
                format!("Session_{}", id),
                memory,
                emitter,
            )),
            rx,
        )
    }

    #[test]
    fn test_busy_flag_exclusive() {
        let (session, _rx) = session("s1");
        assert!(session.try_begin_task());
        assert!(!session.try_begin_task());
        session.end_task();
        assert!(session.try_begin_task());
    }

    #[tokio::test]
    async fn test_confirmation_slot_round_trip() {
        let (session, _rx) = session("s2");
        let rx = session.install_confirmation();
        assert!(session.resolve_confirmation(Confirmation::Yes));
        assert_eq!(rx.await.unwrap(), Confirmation::Yes);
    }

    #[test]
    fn test_confirmation_without_slot_is_noop() {
        let (session, _rx) = session("s3");
        assert!(!session.resolve_confirmation(Confirmation::Yes));
    }

    #[tokio::test]
    async fn test_registry_remove_resolves_slot_no() {
        let registry = SessionRegistry::new();
        let (session, _rx) = session("s4");
        registry.insert(session.clone());
        let slot = session.install_confirmation();
        registry.remove("s4");
        assert_eq!(slot.await.unwrap(), Confirmation::No);
        assert!(!registry.contains("s4"));
    }

    #[test]
    fn test_emitter_reports_closed_channel() {
        let (emitter, rx) = EventEmitter::new();
        assert!(emitter.emit(OutboundEvent::ClearChatHistory));
        drop(rx);
        assert!(!emitter.emit(OutboundEvent::ClearChatHistory));
    }

    #[test]
    fn test_confirmation_parsing() {
        assert_eq!(Confirmation::from_response("yes"), Confirmation::Yes);
        assert_eq!(Confirmation::from_response(" YES "), Confirmation::Yes);
        assert_eq!(Confirmation::from_response("no"), Confirmation::No);
        assert_eq!(Confirmation::from_response("maybe"), Confirmation::No);
    }
}
