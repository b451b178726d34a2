//! `kb embed pending` and `kb embed rebuild`.
//!
//! A chunk is pending when it has no embedding for the configured model or
//! its stored hash no longer matches the chunk text. Index updates call
//! [`embed_pending`] after writing, so this command mostly catches up after
//! provider outages or a model change.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use knowbase_core::embedding::EmbeddingProvider;
use knowbase_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EmbedReport {
    pub pending: usize,
    pub embedded: u64,
    pub failed: u64,
}

struct PendingChunk {
    chunk_id: String,
    document_id: String,
    text: String,
    hash: String,
}

async fn find_pending_chunks(
    pool: &SqlitePool,
    model: &str,
    limit: Option<usize>,
) -> Result<Vec<PendingChunk>> {
    let limit_val = limit.map(|l| l as i64).unwrap_or(-1);

    let rows = sqlx::query(
        r#"
        SELECT c.id AS chunk_id, c.document_id, c.text, c.hash
        FROM chunks c
        LEFT JOIN embeddings e ON e.chunk_id = c.id AND e.model = ?
        WHERE e.chunk_id IS NULL OR e.hash != c.hash
        ORDER BY c.document_id, c.chunk_index
        LIMIT ?
        "#,
    )
    .bind(model)
    .bind(limit_val)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| PendingChunk {
            chunk_id: row.get("chunk_id"),
            document_id: row.get("document_id"),
            text: row.get("text"),
            hash: row.get("hash"),
        })
        .collect())
}

pub async fn count_pending(pool: &SqlitePool, model: &str) -> Result<usize> {
    Ok(find_pending_chunks(pool, model, None).await?.len())
}

/// Embed every pending chunk in batches. A failed batch is counted and
/// skipped; storage errors abort.
pub async fn embed_pending(
    store: &SqliteStore,
    provider: &dyn EmbeddingProvider,
    batch_size: usize,
    limit: Option<usize>,
) -> Result<EmbedReport> {
    let pending = find_pending_chunks(store.pool(), provider.model_name(), limit).await?;
    let mut report = EmbedReport {
        pending: pending.len(),
        ..Default::default()
    };

    for batch in pending.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();

        match provider.embed(&texts).await {
            Ok(vectors) => {
                for (item, vec) in batch.iter().zip(vectors.iter()) {
                    store
                        .upsert_embedding(
                            &item.chunk_id,
                            &item.document_id,
                            vec,
                            provider.model_name(),
                            &item.hash,
                        )
                        .await?;
                    report.embedded += 1;
                }
            }
            Err(e) => {
                tracing::warn!("embedding batch of {} failed: {}", batch.len(), e);
                report.failed += batch.len() as u64;
            }
        }
    }

    Ok(report)
}

fn require_enabled(config: &Config) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    Ok(())
}

pub async fn run_embed_pending(
    config: &Config,
    limit: Option<usize>,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    require_enabled(config)?;
    let provider = embedding::create_provider(&config.embedding)?;
    let pool = db::connect(config).await?;

    if dry_run {
        let pending = find_pending_chunks(&pool, provider.model_name(), limit).await?;
        println!("embed pending (dry-run)");
        println!("  chunks needing embeddings: {}", pending.len());
        pool.close().await;
        return Ok(());
    }

    let store = SqliteStore::new(pool);
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);
    let report = embed_pending(&store, provider.as_ref(), batch_size, limit).await?;

    println!("embed pending");
    if report.pending == 0 {
        println!("  all chunks up to date");
    } else {
        println!("  total pending: {}", report.pending);
        println!("  embedded: {}", report.embedded);
        println!("  failed: {}", report.failed);
    }

    store.pool().close().await;
    Ok(())
}

/// Drop every stored vector and embed all chunks again.
pub async fn run_embed_rebuild(config: &Config, batch_size_override: Option<usize>) -> Result<()> {
    require_enabled(config)?;
    let provider = embedding::create_provider(&config.embedding)?;
    let pool = db::connect(config).await?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chunk_vectors")
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM embeddings").execute(&mut *tx).await?;
    tx.commit().await?;
    tracing::info!("cleared existing embeddings");

    let store = SqliteStore::new(pool);
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);
    let report = embed_pending(&store, provider.as_ref(), batch_size, None).await?;

    println!("embed rebuild");
    println!("  total chunks: {}", report.pending);
    println!("  embedded: {}", report.embedded);
    println!("  failed: {}", report.failed);

    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sqlite_store::tests::{doc, memory_store};
    use async_trait::async_trait;
    use knowbase_core::chunk::chunk_text;
    use knowbase_core::store::CandidateFilter;

    /// Deterministic two-dimensional embedder: counts of "baby" and "sleep".
    pub(crate) struct WordCountEmbedder;

    #[async_trait]
    impl EmbeddingProvider for WordCountEmbedder {
        fn model_name(&self) -> &str {
            "word-count"
        }

        fn dims(&self) -> usize {
            2
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    vec![
                        t.matches("baby").count() as f32 + 0.01,
                        t.matches("sleep").count() as f32 + 0.01,
                    ]
                })
                .collect())
        }
    }

    struct Offline;

    #[async_trait]
    impl EmbeddingProvider for Offline {
        fn model_name(&self) -> &str {
            "offline"
        }

        fn dims(&self) -> usize {
            2
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            bail!("connection refused")
        }
    }

    async fn seeded() -> SqliteStore {
        let store = memory_store().await;
        for (sid, body) in [("a.md", "baby baby"), ("b.md", "sleep sleep")] {
            let d = doc("filesystem:notes", sid, body, 1);
            let id = store.upsert_document(&d).await.unwrap();
            store
                .replace_chunks(&id, &chunk_text(&id, body, 700, 0))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn pending_chunks_are_embedded_once() {
        let store = seeded().await;
        let first = embed_pending(&store, &WordCountEmbedder, 1, None)
            .await
            .unwrap();
        assert_eq!(first.pending, 2);
        assert_eq!(first.embedded, 2);

        let second = embed_pending(&store, &WordCountEmbedder, 1, None)
            .await
            .unwrap();
        assert_eq!(second.pending, 0);

        let hits = store
            .vector_search(&[0.0, 1.0], 1, CandidateFilter::default())
            .await
            .unwrap();
        assert!(hits[0].snippet.contains("sleep"));
    }

    #[tokio::test]
    async fn failed_batches_are_counted_not_fatal() {
        let store = seeded().await;
        let report = embed_pending(&store, &Offline, 10, None).await.unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.embedded, 0);
        assert_eq!(count_pending(store.pool(), "offline").await.unwrap(), 2);
    }
}
