//! Vector store adapter: named collections of memory records with
//! similarity search, persisted in sqlite under the store directory.
//!
//! Embeddings are computed at insert time and serialized into a TEXT
//! column; queries deserialize and rank by cosine similarity in process.
//! Rows that no longer validate into a `MemoryRecord` are dropped on read
//! with a logged count, so one corrupted row never poisons a session.

pub mod embeddings;

use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::models::{MemoryRecord, Role};
use embeddings::{
    cosine_similarity, default_embedding_function, deserialize_embedding, serialize_embedding,
    EmbeddingFunction,
};

#[derive(Clone)]
pub struct VectorStore {
    conn: Arc<Mutex<Connection>>,
    embedder: Arc<dyn EmbeddingFunction>,
}

impl VectorStore {
    /// Open (or create) the store under `dir`.
    pub fn open(dir: &Path) -> Result<Self, AgentError> {
        fs::create_dir_all(dir)
            .map_err(|e| AgentError::StoreError(format!("cannot create store dir: {}", e)))?;
        let db_path = dir.join("collections.sqlite");
        let conn = Connection::open(&db_path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                label TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp REAL NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                embedding TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (collection, id)
            );

            CREATE INDEX IF NOT EXISTS idx_records_collection_ts
                ON records(collection, timestamp);
            "#,
        )?;

        info!("Vector store opened at {}", db_path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            embedder: default_embedding_function(),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, AgentError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                label TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp REAL NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                embedding TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (collection, id)
            );
            CREATE INDEX IF NOT EXISTS idx_records_collection_ts
                ON records(collection, timestamp);
            "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            embedder: default_embedding_function(),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, AgentError> {
        self.conn
            .lock()
            .map_err(|e| AgentError::StoreError(format!("store lock poisoned: {}", e)))
    }

    /// Open a collection handle, registering the sanitized name.
    ///
    /// Two distinct labels that sanitize to the same name are rejected;
    /// silently merging sessions would be worse than refusing one.
    pub fn collection(&self, label: &str) -> Result<Collection, AgentError> {
        let name = sanitize_collection_name(label)?;
        {
            let conn = self.lock()?;
            let existing: Option<String> = conn
                .query_row(
                    "SELECT label FROM collections WHERE name = ?1",
                    params![&name],
                    |row| row.get(0),
                )
                .ok();
            match existing {
                Some(prior) if prior != label => {
                    return Err(AgentError::SessionConflict(format!(
                        "collection name '{}' already registered for '{}'",
                        name, prior
                    )));
                }
                Some(_) => {}
                None => {
                    conn.execute(
                        "INSERT INTO collections (name, label) VALUES (?1, ?2)",
                        params![&name, label],
                    )?;
                    debug!("Registered collection '{}' for label '{}'", name, label);
                }
            }
        }
        Ok(Collection {
            store: self.clone(),
            name,
        })
    }

    /// Sanitized names of every registered collection.
    pub fn list_collections(&self) -> Result<Vec<String>, AgentError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name FROM collections ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(names)
    }

    /// Read-only handle by sanitized name, for the inspection UI. Skips
    /// label registration so a display name never conflicts with the
    /// label that created the collection.
    pub fn open_collection_unchecked(&self, name: &str) -> Collection {
        Collection {
            store: self.clone(),
            name: name.to_string(),
        }
    }

    /// Whether a collection exists and holds at least one record.
    pub fn collection_exists(&self, label: &str) -> Result<bool, AgentError> {
        let name = sanitize_collection_name(label)?;
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM collections WHERE name = ?1",
            params![&name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

/// Keep alphanumerics, `_`, and `-`; everything else is dropped.
pub fn sanitize_collection_name(label: &str) -> Result<String, AgentError> {
    let sanitized: String = label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if sanitized.is_empty() {
        return Err(AgentError::InvalidArgument(format!(
            "collection label '{}' sanitizes to an empty name",
            label
        )));
    }
    Ok(sanitized.chars().take(63).collect())
}

/// Handle to one named collection.
#[derive(Clone)]
pub struct Collection {
    store: VectorStore,
    name: String,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection").field("name", &self.name).finish()
    }
}

struct RawRow {
    id: String,
    role: String,
    content: String,
    timestamp: f64,
    metadata: String,
    embedding: String,
}

fn validate_row(row: RawRow) -> Option<(MemoryRecord, Option<Vec<f32>>)> {
    let role = Role::parse(&row.role)?;
    let metadata: BTreeMap<String, String> = serde_json::from_str(&row.metadata).ok()?;
    let embedding = if row.embedding.is_empty() {
        None
    } else {
        deserialize_embedding(&row.embedding)
    };
    Some((
        MemoryRecord {
            id: row.id,
            role,
            content: row.content,
            timestamp: row.timestamp,
            metadata,
        },
        embedding,
    ))
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_record(&self, record: &MemoryRecord) -> Result<(), AgentError> {
        let embedding = serialize_embedding(&self.store.embedder.embed(&record.content));
        let metadata = serde_json::to_string(&record.metadata)?;
        let conn = self.store.lock()?;
        conn.execute(
            r#"INSERT OR REPLACE INTO records
               (collection, id, role, content, timestamp, metadata, embedding)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                &self.name,
                &record.id,
                record.role.as_str(),
                &record.content,
                record.timestamp,
                &metadata,
                &embedding
            ],
        )?;
        Ok(())
    }

    fn fetch_rows(&self) -> Result<Vec<RawRow>, AgentError> {
        let conn = self.store.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, role, content, timestamp, metadata, embedding
               FROM records WHERE collection = ?1
               ORDER BY timestamp ASC"#,
        )?;
        let rows = stmt
            .query_map(params![&self.name], |row| {
                Ok(RawRow {
                    id: row.get(0)?,
                    role: row.get(1)?,
                    content: row.get(2)?,
                    timestamp: row.get(3)?,
                    metadata: row.get(4)?,
                    embedding: row.get(5)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// All valid records, sorted by timestamp ascending.
    pub fn get_all_records(&self) -> Result<Vec<MemoryRecord>, AgentError> {
        let rows = self.fetch_rows()?;
        let total = rows.len();
        let records: Vec<MemoryRecord> = rows
            .into_iter()
            .filter_map(|row| validate_row(row).map(|(rec, _)| rec))
            .collect();
        let dropped = total - records.len();
        if dropped > 0 {
            warn!(
                "Dropped {} invalid record(s) reading collection '{}'",
                dropped, self.name
            );
        }
        Ok(records)
    }

    /// Nearest neighbors of `text`, at most `min(k, count)`, sorted by
    /// similarity descending with timestamp breaking ties.
    pub fn query(&self, text: &str, k: usize) -> Result<Vec<MemoryRecord>, AgentError> {
        let rows = self.fetch_rows()?;
        let total = rows.len();
        if total == 0 || k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self.store.embedder.embed(text);

        let mut scored: Vec<(f32, MemoryRecord)> = Vec::new();
        let mut dropped = 0usize;
        for row in rows {
            match validate_row(row) {
                Some((record, Some(embedding))) => {
                    scored.push((cosine_similarity(&query_vec, &embedding), record));
                }
                Some((record, None)) => {
                    // Legacy row without an embedding still participates,
                    // at zero similarity.
                    scored.push((0.0, record));
                }
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            warn!(
                "Dropped {} invalid record(s) querying collection '{}'",
                dropped, self.name
            );
        }

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    a.1.timestamp
                        .partial_cmp(&b.1.timestamp)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        Ok(scored
            .into_iter()
            .take(k.min(total))
            .map(|(_, rec)| rec)
            .collect())
    }

    pub fn update_records_metadata(
        &self,
        ids: &[String],
        metadatas: &[BTreeMap<String, String>],
    ) -> Result<(), AgentError> {
        if ids.len() != metadatas.len() {
            return Err(AgentError::InvalidArgument(
                "ids and metadatas must have equal length".to_string(),
            ));
        }
        let conn = self.store.lock()?;
        for (id, metadata) in ids.iter().zip(metadatas) {
            let serialized = serde_json::to_string(metadata)?;
            conn.execute(
                "UPDATE records SET metadata = ?1 WHERE collection = ?2 AND id = ?3",
                params![&serialized, &self.name, id],
            )?;
        }
        Ok(())
    }

    pub fn count(&self) -> Result<usize, AgentError> {
        let conn = self.store.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            params![&self.name],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Drop the collection and everything in it.
    pub fn delete_collection(&self) -> Result<(), AgentError> {
        let conn = self.store.lock()?;
        conn.execute(
            "DELETE FROM records WHERE collection = ?1",
            params![&self.name],
        )?;
        conn.execute(
            "DELETE FROM collections WHERE name = ?1",
            params![&self.name],
        )?;
        info!("Deleted collection '{}'", self.name);
        Ok(())
    }
}
