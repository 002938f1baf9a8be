//! Embedding seam for the vector store.
//!
//! The embedding-model runtime itself is an external collaborator; the
//! store only needs a function from text to a fixed-dimension vector. The
//! default implementation is a deterministic local feature-hashing embedder
//! over word tokens and character trigrams, shared process-wide and
//! initialized lazily on first use.

use std::sync::{Arc, OnceLock};

pub trait EmbeddingFunction: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
    fn dimensions(&self) -> usize;
}

/// Deterministic bag-of-features embedder: FNV-hashed word unigrams plus
/// character trigrams, accumulated into a fixed-width vector and
/// L2-normalized.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

impl EmbeddingFunction for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dims];
        let lowered = text.to_lowercase();

        for word in lowered.split(|c: char| !c.is_alphanumeric()) {
            if word.is_empty() {
                continue;
            }
            let h = fnv1a(word.as_bytes());
            vector[(h % self.dims as u64) as usize] += 1.0;

            let chars: Vec<char> = word.chars().collect();
            for window in chars.windows(3) {
                let tri: String = window.iter().collect();
                let h = fnv1a(tri.as_bytes());
                // Trigrams weigh less than whole words.
                vector[(h % self.dims as u64) as usize] += 0.5;
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        vector
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

const DEFAULT_DIMS: usize = 256;

/// Process-wide shared embedding function, read-only after init.
pub fn default_embedding_function() -> Arc<dyn EmbeddingFunction> {
    static SHARED: OnceLock<Arc<HashEmbedder>> = OnceLock::new();
    let shared = SHARED
        .get_or_init(|| Arc::new(HashEmbedder::new(DEFAULT_DIMS)))
        .clone();
    shared
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

pub fn serialize_embedding(embedding: &[f32]) -> String {
    serde_json::to_string(embedding).unwrap_or_else(|_| "[]".to_string())
}

pub fn deserialize_embedding(raw: &str) -> Option<Vec<f32>> {
    serde_json::from_str(raw).ok()
}
