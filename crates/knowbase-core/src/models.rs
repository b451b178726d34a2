//! Core data models shared by the store, search, and ingestion layers.

use serde::Serialize;

/// Normalized document as persisted by a [`Store`](crate::store::Store).
///
/// Documents are unique on `(source, source_id)`. Timestamps are Unix
/// seconds.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub source: String,
    pub source_id: String,
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub content_type: String,
    pub body: String,
    pub metadata_json: String,
    pub dedup_hash: String,
}

/// A chunk of a document's body text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// SHA-256 of `text`, used to detect stale embeddings.
    pub hash: String,
}

/// A retrieved chunk with its full text, used as answer context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextPassage {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub title: Option<String>,
    pub source: String,
    pub source_id: String,
    pub source_url: Option<String>,
    pub score: f64,
    pub text: String,
}

impl ContextPassage {
    /// Human-readable label: the title if present, else the source id.
    pub fn label(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.source_id)
    }
}
