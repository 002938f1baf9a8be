//! Tiered session memory.
//!
//! Tier 1 is a short conversational buffer held in memory, bounded to the
//! last `segment_threshold` turns and rebuilt from the store whenever a
//! session is (re)constructed. Tier 2 is the session's `turns` vector
//! collection, which also backs retrieval-augmented prompting. Code
//! artifacts live in a separate `code` collection so file bodies never
//! crowd out conversational recall.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::error::AgentError;
use crate::models::{MemoryRecord, Role, META_AUGMENTED_PROMPT};
use crate::store::{Collection, VectorStore};

/// Number of retrieved snippets folded into an augmented prompt.
const RETRIEVAL_K: usize = 5;

pub const TURNS_PREFIX: &str = "turns-";
pub const CODE_PREFIX: &str = "code-";

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedTurn {
    pub role: Role,
    pub content: String,
}

pub struct MemoryManager {
    session_name: String,
    buffer: Vec<BufferedTurn>,
    buffer_limit: usize,
    last_timestamp: f64,
    turns: Collection,
    code: Collection,
}

impl MemoryManager {
    /// Build the manager for `session_name`, repopulating the Tier-1
    /// buffer from whatever the `turns` collection already holds.
    pub fn new(
        store: &VectorStore,
        session_name: &str,
        buffer_limit: usize,
    ) -> Result<Self, AgentError> {
        let turns = store.collection(&format!("{}{}", TURNS_PREFIX, session_name))?;
        let code = store.collection(&format!("{}{}", CODE_PREFIX, session_name))?;

        let mut manager = Self {
            session_name: session_name.to_string(),
            buffer: Vec::new(),
            buffer_limit: buffer_limit.max(1),
            last_timestamp: 0.0,
            turns,
            code,
        };
        manager.repopulate_buffer()?;
        Ok(manager)
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn buffer_limit(&self) -> usize {
        self.buffer_limit
    }

    pub fn turns(&self) -> &Collection {
        &self.turns
    }

    fn repopulate_buffer(&mut self) -> Result<(), AgentError> {
        let all = self.turns.get_all_records()?;
        if let Some(last) = all.last() {
            self.last_timestamp = last.timestamp;
        }
        let tail_start = all.len().saturating_sub(self.buffer_limit);
        self.buffer = all[tail_start..]
            .iter()
            .map(|r| BufferedTurn {
                role: r.role,
                content: r.content.clone(),
            })
            .collect();
        if !self.buffer.is_empty() {
            info!(
                "Repopulated buffer with {} turns for session '{}'",
                self.buffer.len(),
                self.session_name
            );
        }
        Ok(())
    }

    /// Strictly increasing per-session timestamp, so same-tick turns keep
    /// their insertion order.
    fn next_timestamp(&mut self) -> f64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let ts = if now > self.last_timestamp {
            now
        } else {
            self.last_timestamp + 1e-6
        };
        self.last_timestamp = ts;
        ts
    }

    /// Append a turn to the buffer and persist it to the `turns`
    /// collection. Callers attach `augmented_prompt` metadata on user
    /// turns so save/load can reconstruct what the model actually saw.
    pub fn add_turn(
        &mut self,
        role: Role,
        content: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<String, AgentError> {
        self.buffer.push(BufferedTurn {
            role,
            content: content.to_string(),
        });
        if self.buffer.len() > self.buffer_limit {
            let excess = self.buffer.len() - self.buffer_limit;
            self.buffer.drain(..excess);
        }

        let timestamp = self.next_timestamp();
        let mut record = MemoryRecord::new(role, content, timestamp);
        record.metadata = metadata;
        self.turns.add_record(&record)?;
        debug!(
            "Added {} turn to memory for session '{}' with id {}",
            role.as_str(),
            self.session_name,
            record.id
        );
        Ok(record.id)
    }

    pub fn add_user_turn(
        &mut self,
        content: &str,
        augmented_prompt: Option<&str>,
    ) -> Result<String, AgentError> {
        let mut metadata = BTreeMap::new();
        if let Some(augmented) = augmented_prompt {
            metadata.insert(META_AUGMENTED_PROMPT.to_string(), augmented.to_string());
        }
        self.add_turn(Role::User, content, metadata)
    }

    /// Retrieval-augmented prompt assembly: similar prior turns are
    /// prepended as context. Exact matches of the prompt itself are
    /// filtered out, and an empty retrieval yields the raw prompt.
    pub fn prepare_augmented_prompt(&self, prompt: &str) -> Result<String, AgentError> {
        let mut retrieved = self.turns.query(prompt, RETRIEVAL_K)?;
        retrieved.retain(|r| r.content != prompt);
        if retrieved.is_empty() {
            return Ok(prompt.to_string());
        }
        retrieved.sort_by(|a, b| {
            a.timestamp
                .partial_cmp(&b.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let context: String = retrieved
            .iter()
            .map(|r| format!("- {}: {}", r.role.as_str(), r.content))
            .collect::<Vec<_>>()
            .join("\n");
        debug!(
            "Augmented prompt with {} retrieved documents for session '{}'",
            retrieved.len(),
            self.session_name
        );
        Ok(format!(
            "Relevant prior context (oldest first):\n{}\n\n--- Current task ---\n{}",
            context, prompt
        ))
    }

    /// Tier-1 buffer, oldest first.
    pub fn get_conversational_buffer(&self) -> &[BufferedTurn] {
        &self.buffer
    }

    pub fn get_all_turns(&self) -> Result<Vec<MemoryRecord>, AgentError> {
        self.turns.get_all_records()
    }

    /// Drop both collections and clear the buffer.
    pub fn delete_memory_collection(&mut self) -> Result<(), AgentError> {
        self.buffer.clear();
        self.turns.delete_collection()?;
        self.code.delete_collection()?;
        info!(
            "Deleted memory collections for session '{}'",
            self.session_name
        );
        Ok(())
    }

    /// Store a code artifact in the dedicated collection and return a
    /// pointer id that can stand in for the body in prose.
    pub fn add_code_artifact(
        &mut self,
        filename: &str,
        content: &str,
    ) -> Result<String, AgentError> {
        let timestamp = self.next_timestamp();
        let mut record = MemoryRecord::new(
            Role::ToolObservation,
            format!("Content of file: {}", filename),
            timestamp,
        );
        record
            .metadata
            .insert("filename".to_string(), filename.to_string());
        record
            .metadata
            .insert("raw_content".to_string(), content.to_string());
        let pointer = format!("[CODE-ARTIFACT-{}:{}]", record.id, filename);
        self.code.add_record(&record)?;
        info!("Saved code artifact with pointer: {}", pointer);
        Ok(pointer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(name: &str) -> (VectorStore, MemoryManager) {
        let store = VectorStore::open_in_memory().unwrap();
        let manager = MemoryManager::new(&store, name, 20).unwrap();
        (store, manager)
    }

    #[test]
    fn test_add_turn_updates_buffer_and_store() {
        let (_store, mut memory) = manager("demo");
        memory.add_user_turn("hello there", None).unwrap();
        memory
            .add_turn(Role::Model, "hi", BTreeMap::new())
            .unwrap();

        let buffer = memory.get_conversational_buffer();
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer[0].content, "hello there");
        assert_eq!(memory.get_all_turns().unwrap().len(), 2);
    }

    #[test]
    fn test_buffer_bounded_to_limit() {
        let store = VectorStore::open_in_memory().unwrap();
        let mut memory = MemoryManager::new(&store, "bounded", 3).unwrap();
        for i in 0..10 {
            memory
                .add_turn(Role::User, &format!("turn {}", i), BTreeMap::new())
                .unwrap();
        }
        let buffer = memory.get_conversational_buffer();
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer[0].content, "turn 7");
        assert_eq!(buffer[2].content, "turn 9");
        // Tier 2 keeps everything.
        assert_eq!(memory.get_all_turns().unwrap().len(), 10);
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let (_store, mut memory) = manager("mono");
        for _ in 0..5 {
            memory.add_turn(Role::User, "same tick", BTreeMap::new()).unwrap();
        }
        let records = memory.get_all_turns().unwrap();
        for pair in records.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
    }

    #[test]
    fn test_buffer_repopulated_on_reconstruction() {
        let store = VectorStore::open_in_memory().unwrap();
        {
            let mut memory = MemoryManager::new(&store, "persist", 20).unwrap();
            memory.add_user_turn("question one", None).unwrap();
            memory
                .add_turn(Role::Model, "answer one", BTreeMap::new())
                .unwrap();
        }
        let memory = MemoryManager::new(&store, "persist", 20).unwrap();
        let buffer = memory.get_conversational_buffer();
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer[0].content, "question one");
        assert_eq!(buffer[1].content, "answer one");
    }

    #[test]
    fn test_augmented_prompt_includes_relevant_context() {
        let (_store, mut memory) = manager("rag");
        memory
            .add_user_turn("my favorite color is teal", None)
            .unwrap();
        memory
            .add_turn(Role::Model, "Noted, teal it is.", BTreeMap::new())
            .unwrap();

        let augmented = memory
            .prepare_augmented_prompt("what is my favorite color?")
            .unwrap();
        assert!(augmented.contains("Relevant prior context"));
        assert!(augmented.contains("teal"));
        assert!(augmented.ends_with("what is my favorite color?"));
    }

    #[test]
    fn test_augmented_prompt_empty_store_passthrough() {
        let (_store, memory) = manager("empty");
        let augmented = memory.prepare_augmented_prompt("hello").unwrap();
        assert_eq!(augmented, "hello");
    }

    #[test]
    fn test_augmented_prompt_filters_exact_match() {
        let (_store, mut memory) = manager("exact");
        memory.add_user_turn("repeated prompt", None).unwrap();
        let augmented = memory.prepare_augmented_prompt("repeated prompt").unwrap();
        assert_eq!(augmented, "repeated prompt");
    }

    #[test]
    fn test_user_turn_records_augmented_prompt_metadata() {
        let (_store, mut memory) = manager("meta");
        memory
            .add_user_turn("raw prompt", Some("context + raw prompt"))
            .unwrap();
        let records = memory.get_all_turns().unwrap();
        assert_eq!(
            records[0].metadata.get(META_AUGMENTED_PROMPT).map(String::as_str),
            Some("context + raw prompt")
        );
    }

    #[test]
    fn test_delete_memory_collection_clears_everything() {
        let (store, mut memory) = manager("wipe");
        memory.add_user_turn("data", None).unwrap();
        memory.delete_memory_collection().unwrap();
        assert!(memory.get_conversational_buffer().is_empty());
        assert!(!store
            .list_collections()
            .unwrap()
            .iter()
            .any(|c| c.contains("wipe")));
    }

    #[test]
    fn test_code_artifact_pointer_shape() {
        let (_store, mut memory) = manager("code");
        let pointer = memory
            .add_code_artifact("main.py", "print('hi')")
            .unwrap();
        assert!(pointer.starts_with("[CODE-ARTIFACT-"));
        assert!(pointer.ends_with(":main.py]"));
    }
}
