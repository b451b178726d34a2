//! In-memory [`Store`] implementation.
//!
//! Keeps documents, chunks, and vectors in maps behind `std::sync::RwLock`.
//! Keyword search is a term-frequency count over lowercase chunk text;
//! vector search is brute-force cosine similarity. Used by unit tests and
//! by callers that want a throwaway index.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{Chunk, Document};

use super::{
    format_ts_iso, CandidateFilter, ChunkCandidate, ChunkResponse, DocumentMetadata,
    DocumentResponse, IndexedDocument, Store, StoredChunk,
};

const SNIPPET_CHARS: usize = 240;

#[derive(Default)]
struct Inner {
    docs: HashMap<String, Document>,
    chunks: HashMap<String, Chunk>,
    vectors: HashMap<String, Vec<f32>>,
}

impl Inner {
    fn upsert(&mut self, doc: &Document) -> String {
        let existing = self
            .docs
            .values()
            .find(|d| d.source == doc.source && d.source_id == doc.source_id)
            .map(|d| d.id.clone());
        let id = existing.unwrap_or_else(|| doc.id.clone());
        let mut stored = doc.clone();
        stored.id = id.clone();
        self.docs.insert(id.clone(), stored);
        id
    }

    fn replace(&mut self, doc_id: &str, chunks: &[Chunk]) {
        let stale: Vec<String> = self
            .chunks
            .values()
            .filter(|c| c.document_id == doc_id)
            .map(|c| c.id.clone())
            .collect();
        for cid in stale {
            self.chunks.remove(&cid);
            self.vectors.remove(&cid);
        }
        for c in chunks {
            self.chunks.insert(c.id.clone(), c.clone());
        }
    }

    fn doc_passes(&self, doc_id: &str, filter: CandidateFilter<'_>) -> bool {
        self.docs
            .get(doc_id)
            .is_some_and(|d| filter.matches(&d.source, d.updated_at))
    }
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

fn snippet(text: &str) -> String {
    text.chars().take(SNIPPET_CHARS).collect()
}

fn sort_and_truncate(candidates: &mut Vec<ChunkCandidate>, limit: i64) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    candidates.truncate(limit.max(0) as usize);
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_document(&self, doc: &Document) -> Result<String> {
        Ok(self.write()?.upsert(doc))
    }

    async fn indexed_documents(&self, source: &str) -> Result<Vec<IndexedDocument>> {
        let inner = self.read()?;
        let mut out: Vec<IndexedDocument> = inner
            .docs
            .values()
            .filter(|d| d.source == source)
            .map(|d| IndexedDocument {
                id: d.id.clone(),
                source_id: d.source_id.clone(),
                dedup_hash: d.dedup_hash.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(out)
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        let mut inner = self.write()?;
        inner.docs.remove(id);
        let chunk_ids: Vec<String> = inner
            .chunks
            .values()
            .filter(|c| c.document_id == id)
            .map(|c| c.id.clone())
            .collect();
        for cid in chunk_ids {
            inner.chunks.remove(&cid);
            inner.vectors.remove(&cid);
        }
        Ok(())
    }

    async fn replace_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> Result<()> {
        self.write()?.replace(doc_id, chunks);
        Ok(())
    }

    async fn index_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<String> {
        let mut inner = self.write()?;
        let id = inner.upsert(doc);
        inner.replace(&id, chunks);
        Ok(id)
    }

    async fn upsert_embedding(
        &self,
        chunk_id: &str,
        _doc_id: &str,
        vector: &[f32],
        _model: &str,
        _content_hash: &str,
    ) -> Result<()> {
        self.write()?
            .vectors
            .insert(chunk_id.to_string(), vector.to_vec());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<DocumentResponse>> {
        let inner = self.read()?;
        let Some(doc) = inner.docs.get(id) else {
            return Ok(None);
        };
        let mut chunks: Vec<ChunkResponse> = inner
            .chunks
            .values()
            .filter(|c| c.document_id == id)
            .map(|c| ChunkResponse {
                index: c.chunk_index,
                text: c.text.clone(),
            })
            .collect();
        chunks.sort_by_key(|c| c.index);

        Ok(Some(DocumentResponse {
            id: doc.id.clone(),
            source: doc.source.clone(),
            source_id: doc.source_id.clone(),
            source_url: doc.source_url.clone(),
            title: doc.title.clone(),
            author: doc.author.clone(),
            created_at: format_ts_iso(doc.created_at),
            updated_at: format_ts_iso(doc.updated_at),
            content_type: doc.content_type.clone(),
            body: doc.body.clone(),
            metadata: serde_json::from_str(&doc.metadata_json)
                .unwrap_or_else(|_| serde_json::json!({})),
            chunks,
        }))
    }

    async fn get_document_metadata(&self, id: &str) -> Result<Option<DocumentMetadata>> {
        Ok(self.read()?.docs.get(id).map(|d| DocumentMetadata {
            id: d.id.clone(),
            title: d.title.clone(),
            source: d.source.clone(),
            source_id: d.source_id.clone(),
            source_url: d.source_url.clone(),
            updated_at: d.updated_at,
        }))
    }

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<StoredChunk>> {
        Ok(self.read()?.chunks.get(chunk_id).map(|c| StoredChunk {
            id: c.id.clone(),
            document_id: c.document_id.clone(),
            chunk_index: c.chunk_index,
            text: c.text.clone(),
        }))
    }

    async fn keyword_search(
        &self,
        query: &str,
        limit: i64,
        filter: CandidateFilter<'_>,
    ) -> Result<Vec<ChunkCandidate>> {
        let terms: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let inner = self.read()?;
        let mut candidates: Vec<ChunkCandidate> = inner
            .chunks
            .values()
            .filter(|c| inner.doc_passes(&c.document_id, filter))
            .filter_map(|c| {
                let lower = c.text.to_lowercase();
                let hits: usize = terms.iter().map(|t| lower.matches(t.as_str()).count()).sum();
                (hits > 0).then(|| ChunkCandidate {
                    chunk_id: c.id.clone(),
                    document_id: c.document_id.clone(),
                    raw_score: hits as f64,
                    snippet: snippet(&c.text),
                })
            })
            .collect();
        sort_and_truncate(&mut candidates, limit);
        Ok(candidates)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: i64,
        filter: CandidateFilter<'_>,
    ) -> Result<Vec<ChunkCandidate>> {
        let inner = self.read()?;
        let mut candidates: Vec<ChunkCandidate> = inner
            .vectors
            .iter()
            .filter_map(|(chunk_id, vector)| {
                let chunk = inner.chunks.get(chunk_id)?;
                if !inner.doc_passes(&chunk.document_id, filter) {
                    return None;
                }
                Some(ChunkCandidate {
                    chunk_id: chunk_id.clone(),
                    document_id: chunk.document_id.clone(),
                    raw_score: cosine_similarity(query_vec, vector) as f64,
                    snippet: snippet(&chunk.text),
                })
            })
            .collect();
        sort_and_truncate(&mut candidates, limit);
        Ok(candidates)
    }
}
