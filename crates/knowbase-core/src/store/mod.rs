//! Storage abstraction for knowbase.
//!
//! The [`Store`] trait covers everything the ingestion, search, and query
//! pipelines need from a backend. The application ships a SQLite
//! implementation; [`memory::InMemoryStore`] backs unit tests.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{Chunk, Document};

/// A candidate chunk returned from keyword or vector search.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub document_id: String,
    /// Raw backend score (negated BM25 rank or cosine similarity). Higher is better.
    pub raw_score: f64,
    pub snippet: String,
}

/// Full document response including metadata, body, and chunks.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentResponse {
    pub id: String,
    pub source: String,
    pub source_id: String,
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub content_type: String,
    pub body: String,
    pub metadata: serde_json::Value,
    pub chunks: Vec<ChunkResponse>,
}

/// A single chunk within a [`DocumentResponse`].
#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub index: i64,
    pub text: String,
}

/// Lightweight document metadata for result enrichment.
#[derive(Debug, Clone)]
pub struct DocumentMetadata {
    pub id: String,
    pub title: Option<String>,
    pub source: String,
    pub source_id: String,
    pub source_url: Option<String>,
    pub updated_at: i64,
}

/// Identity and content hash of an already-indexed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedDocument {
    pub id: String,
    pub source_id: String,
    pub dedup_hash: String,
}

/// A stored chunk with its full text.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
}

/// Restricts candidate retrieval to a source and/or a minimum update time.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandidateFilter<'a> {
    /// Exact source name (`filesystem:notes`) or connector type prefix (`filesystem`).
    pub source: Option<&'a str>,
    /// Only documents with `updated_at >= since` (Unix seconds).
    pub since: Option<i64>,
}

impl CandidateFilter<'_> {
    pub fn matches(&self, source: &str, updated_at: i64) -> bool {
        self.source.map_or(true, |f| source_matches(f, source))
            && self.since.map_or(true, |ts| updated_at >= ts)
    }
}

/// `filter` matches a source either exactly or as its `<type>:` prefix.
pub fn source_matches(filter: &str, source: &str) -> bool {
    source == filter
        || source
            .strip_prefix(filter)
            .is_some_and(|rest| rest.starts_with(':'))
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_document`](Store::upsert_document) | Insert or update a document |
/// | [`indexed_documents`](Store::indexed_documents) | List documents of one source |
/// | [`delete_document`](Store::delete_document) | Remove a document with its chunks and vectors |
/// | [`replace_chunks`](Store::replace_chunks) | Replace all chunks for a document |
/// | [`index_document`](Store::index_document) | Upsert a document and replace its chunks atomically |
/// | [`upsert_embedding`](Store::upsert_embedding) | Store a vector for a chunk |
/// | [`get_document`](Store::get_document) | Full document with chunks |
/// | [`get_document_metadata`](Store::get_document_metadata) | Lightweight metadata |
/// | [`get_chunk`](Store::get_chunk) | A single chunk's text |
/// | [`keyword_search`](Store::keyword_search) | Full-text candidates |
/// | [`vector_search`](Store::vector_search) | Cosine similarity candidates |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or update a document keyed on `(source, source_id)`. Returns its id.
    async fn upsert_document(&self, doc: &Document) -> Result<String>;

    /// All documents currently indexed for `source`.
    async fn indexed_documents(&self, source: &str) -> Result<Vec<IndexedDocument>>;

    async fn delete_document(&self, id: &str) -> Result<()>;

    /// Replace all chunks (and drop stale vectors) for a document.
    async fn replace_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Upsert `doc` and replace its chunks in one unit of work.
    ///
    /// Either both the new row (with its `dedup_hash`) and the new chunks
    /// are visible afterwards, or neither is. `chunks` must be built for
    /// `doc.id`. Returns the stored document id.
    async fn index_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<String>;

    async fn upsert_embedding(
        &self,
        chunk_id: &str,
        doc_id: &str,
        vector: &[f32],
        model: &str,
        content_hash: &str,
    ) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<DocumentResponse>>;

    async fn get_document_metadata(&self, id: &str) -> Result<Option<DocumentMetadata>>;

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<StoredChunk>>;

    async fn keyword_search(
        &self,
        query: &str,
        limit: i64,
        filter: CandidateFilter<'_>,
    ) -> Result<Vec<ChunkCandidate>>;

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: i64,
        filter: CandidateFilter<'_>,
    ) -> Result<Vec<ChunkCandidate>>;
}

/// Format a Unix timestamp as ISO 8601 (UTC).
pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
