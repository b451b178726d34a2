//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] operation onto the schema created by
//! [`migrate`](crate::migrate): documents, chunks, chunks_fts,
//! embeddings, and chunk_vectors.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashSet;

use knowbase_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use knowbase_core::models::{Chunk, Document};
use knowbase_core::store::{
    format_ts_iso, CandidateFilter, ChunkCandidate, ChunkResponse, DocumentMetadata,
    DocumentResponse, IndexedDocument, Store, StoredChunk,
};

/// Source and since restriction shared by both candidate queries.
/// Binds: source, source, source, source, since, since.
const FILTER_SQL: &str = "(? IS NULL OR d.source = ? OR substr(d.source, 1, length(?) + 1) = ? || ':') \
     AND (? IS NULL OR d.updated_at >= ?)";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Turn free text into an FTS5 query.
///
/// Questions such as `how do I burp a baby?` contain characters FTS5 treats
/// as syntax, so the text is reduced to its alphanumeric terms, each quoted,
/// joined with `OR`. Single-character terms are dropped unless nothing else
/// remains. Returns `None` when the text has no terms at all.
pub fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    if terms.is_empty() {
        return None;
    }

    let long: Vec<&str> = terms
        .iter()
        .copied()
        .filter(|t| t.chars().count() > 1)
        .collect();
    let chosen = if long.is_empty() { terms } else { long };

    let mut seen = HashSet::new();
    let quoted: Vec<String> = chosen
        .into_iter()
        .map(str::to_lowercase)
        .filter(|t| seen.insert(t.clone()))
        .map(|t| format!("\"{}\"", t))
        .collect();
    Some(quoted.join(" OR "))
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_document(&self, doc: &Document) -> Result<String> {
        let mut conn = self.pool.acquire().await?;
        upsert_document_in(&mut *conn, doc).await
    }

    async fn indexed_documents(&self, source: &str) -> Result<Vec<IndexedDocument>> {
        let rows = sqlx::query(
            "SELECT id, source_id, dedup_hash FROM documents WHERE source = ? ORDER BY source_id",
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| IndexedDocument {
                id: row.get("id"),
                source_id: row.get("source_id"),
                dedup_hash: row.get("dedup_hash"),
            })
            .collect())
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn replace_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        replace_chunks_in(&mut *tx, doc_id, chunks).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn index_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<String> {
        let mut tx = self.pool.begin().await?;
        let id = upsert_document_in(&mut *tx, doc).await?;
        if id != doc.id {
            bail!(
                "document {} is stored as {}; chunks were built for the wrong id",
                doc.source_id,
                id
            );
        }
        replace_chunks_in(&mut *tx, &id, chunks).await?;
        // An early return drops `tx` and rolls back the row with the chunks.
        tx.commit().await?;
        Ok(id)
    }

    async fn upsert_embedding(
        &self,
        chunk_id: &str,
        doc_id: &str,
        vector: &[f32],
        model: &str,
        content_hash: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let blob = vec_to_blob(vector);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO embeddings (chunk_id, model, dims, created_at, hash)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                model = excluded.model,
                dims = excluded.dims,
                created_at = excluded.created_at,
                hash = excluded.hash
            "#,
        )
        .bind(chunk_id)
        .bind(model)
        .bind(vector.len() as i64)
        .bind(now)
        .bind(content_hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, document_id, embedding)
            VALUES (?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                document_id = excluded.document_id,
                embedding = excluded.embedding
            "#,
        )
        .bind(chunk_id)
        .bind(doc_id)
        .bind(&blob)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<DocumentResponse>> {
        let Some(doc_row) = sqlx::query(
            "SELECT id, source, source_id, source_url, title, author, created_at, updated_at, content_type, body, metadata_json FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let created_at: i64 = doc_row.get("created_at");
        let updated_at: i64 = doc_row.get("updated_at");
        let metadata_json: String = doc_row.get("metadata_json");
        let metadata: serde_json::Value =
            serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({}));

        let chunk_rows = sqlx::query(
            "SELECT chunk_index, text FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let chunks = chunk_rows
            .iter()
            .map(|row| ChunkResponse {
                index: row.get("chunk_index"),
                text: row.get("text"),
            })
            .collect();

        Ok(Some(DocumentResponse {
            id: doc_row.get("id"),
            source: doc_row.get("source"),
            source_id: doc_row.get("source_id"),
            source_url: doc_row.get("source_url"),
            title: doc_row.get("title"),
            author: doc_row.get("author"),
            created_at: format_ts_iso(created_at),
            updated_at: format_ts_iso(updated_at),
            content_type: doc_row.get("content_type"),
            body: doc_row.get("body"),
            metadata,
            chunks,
        }))
    }

    async fn get_document_metadata(&self, id: &str) -> Result<Option<DocumentMetadata>> {
        let row = sqlx::query(
            "SELECT id, title, source, source_id, updated_at, source_url FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| DocumentMetadata {
            id: r.get("id"),
            title: r.get("title"),
            source: r.get("source"),
            source_id: r.get("source_id"),
            source_url: r.get("source_url"),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<StoredChunk>> {
        let row = sqlx::query("SELECT id, document_id, chunk_index, text FROM chunks WHERE id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| StoredChunk {
            id: r.get("id"),
            document_id: r.get("document_id"),
            chunk_index: r.get("chunk_index"),
            text: r.get("text"),
        }))
    }

    async fn keyword_search(
        &self,
        query: &str,
        limit: i64,
        filter: CandidateFilter<'_>,
    ) -> Result<Vec<ChunkCandidate>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let sql = format!(
            r#"
            SELECT chunks_fts.chunk_id AS chunk_id,
                   chunks_fts.document_id AS document_id,
                   chunks_fts.rank AS rank,
                   snippet(chunks_fts, 2, '>>>', '<<<', '...', 48) AS snippet
            FROM chunks_fts
            JOIN documents d ON d.id = chunks_fts.document_id
            WHERE chunks_fts MATCH ? AND {}
            ORDER BY chunks_fts.rank
            LIMIT ?
            "#,
            FILTER_SQL
        );

        let rows = sqlx::query(&sql)
            .bind(&fts)
            .bind(filter.source)
            .bind(filter.source)
            .bind(filter.source)
            .bind(filter.source)
            .bind(filter.since)
            .bind(filter.since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                ChunkCandidate {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    raw_score: -rank,
                    snippet: row.get("snippet"),
                }
            })
            .collect())
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: i64,
        filter: CandidateFilter<'_>,
    ) -> Result<Vec<ChunkCandidate>> {
        let sql = format!(
            r#"
            SELECT cv.chunk_id, cv.document_id, cv.embedding,
                   COALESCE(substr(c.text, 1, 240), '') AS snippet
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            JOIN documents d ON d.id = cv.document_id
            WHERE {}
            "#,
            FILTER_SQL
        );

        let rows = sqlx::query(&sql)
            .bind(filter.source)
            .bind(filter.source)
            .bind(filter.source)
            .bind(filter.source)
            .bind(filter.since)
            .bind(filter.since)
            .fetch_all(&self.pool)
            .await?;

        let mut candidates: Vec<ChunkCandidate> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = blob_to_vec(&blob);
                ChunkCandidate {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    raw_score: cosine_similarity(query_vec, &vec) as f64,
                    snippet: row.get("snippet"),
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        candidates.truncate(limit.max(0) as usize);

        Ok(candidates)
    }
}

async fn upsert_document_in(conn: &mut SqliteConnection, doc: &Document) -> Result<String> {
    let id: String = sqlx::query_scalar(
        r#"
        INSERT INTO documents (id, source, source_id, source_url, title, author,
                               created_at, updated_at, content_type, body,
                               metadata_json, dedup_hash)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source, source_id) DO UPDATE SET
            source_url = excluded.source_url,
            title = excluded.title,
            author = excluded.author,
            updated_at = excluded.updated_at,
            content_type = excluded.content_type,
            body = excluded.body,
            metadata_json = excluded.metadata_json,
            dedup_hash = excluded.dedup_hash
        RETURNING id
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.source)
    .bind(&doc.source_id)
    .bind(&doc.source_url)
    .bind(&doc.title)
    .bind(&doc.author)
    .bind(doc.created_at)
    .bind(doc.updated_at)
    .bind(&doc.content_type)
    .bind(&doc.body)
    .bind(&doc.metadata_json)
    .bind(&doc.dedup_hash)
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}

async fn replace_chunks_in(
    conn: &mut SqliteConnection,
    doc_id: &str,
    chunks: &[Chunk],
) -> Result<()> {
    // Vectors survive only for chunks whose id and text are unchanged.
    let kept: HashSet<(&str, &str)> = chunks
        .iter()
        .map(|c| (c.id.as_str(), c.hash.as_str()))
        .collect();
    let existing = sqlx::query("SELECT id, hash FROM chunks WHERE document_id = ?")
        .bind(doc_id)
        .fetch_all(&mut *conn)
        .await?;
    for row in &existing {
        let id: String = row.get("id");
        let hash: String = row.get("hash");
        if kept.contains(&(id.as_str(), hash.as_str())) {
            continue;
        }
        sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
            .bind(&id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM embeddings WHERE chunk_id = ?")
            .bind(&id)
            .execute(&mut *conn)
            .await?;
    }

    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(doc_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(doc_id)
        .execute(&mut *conn)
        .await?;

    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(doc_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *conn)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(doc_id)
            .bind(&chunk.text)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}
