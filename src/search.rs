//! Search entry points for `kb search` and `POST /search`.
//!
//! The scoring algorithm lives in `knowbase_core::search` and runs against
//! any [`Store`](knowbase_core::store::Store). This module maps config onto
//! [`SearchParams`], embeds the query when the mode needs it, and formats
//! CLI output.

use anyhow::{bail, Result};

pub use knowbase_core::search::{SearchMode, SearchParams, SearchRequest, SearchResultItem};
use knowbase_core::embedding::EmbeddingProvider;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub query: String,
    /// `None` picks [`default_mode`].
    pub mode: Option<SearchMode>,
    pub source: Option<String>,
    pub since: Option<String>,
    pub limit: Option<i64>,
    pub explain: bool,
}

/// Hybrid when an embedding provider is configured, keyword otherwise.
pub fn default_mode(config: &Config) -> SearchMode {
    if config.embedding.is_enabled() {
        SearchMode::Hybrid
    } else {
        SearchMode::Keyword
    }
}

pub fn search_params(config: &Config, final_limit: i64) -> SearchParams {
    SearchParams {
        hybrid_alpha: config.retrieval.hybrid_alpha,
        candidate_k_keyword: config.retrieval.candidate_k_keyword,
        candidate_k_vector: config.retrieval.candidate_k_vector,
        final_limit,
        max_chunks_per_doc: config.retrieval.max_chunks_per_doc,
    }
}

/// Reject modes that need vectors when embeddings are off.
pub fn check_mode(config: &Config, mode: SearchMode) -> Result<()> {
    if mode.needs_embedding() && !config.embedding.is_enabled() {
        bail!(
            "Mode '{}' requires embeddings. Set [embedding] provider in config.",
            mode
        );
    }
    Ok(())
}

/// Embed `query` if `mode` needs a vector.
pub async fn query_vector(
    mode: SearchMode,
    embedder: Option<&dyn EmbeddingProvider>,
    query: &str,
) -> Result<Option<Vec<f32>>> {
    if !mode.needs_embedding() {
        return Ok(None);
    }
    match embedder {
        Some(provider) => Ok(Some(provider.embed_query(query).await?)),
        None => bail!("Mode '{}' requires an embedding provider", mode),
    }
}

/// Shared by the CLI and the HTTP server.
pub async fn search_documents(
    config: &Config,
    store: &SqliteStore,
    embedder: Option<&dyn EmbeddingProvider>,
    opts: &SearchOptions,
) -> Result<Vec<SearchResultItem>> {
    if opts.query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mode = opts.mode.unwrap_or_else(|| default_mode(config));
    check_mode(config, mode)?;
    let query_vec = query_vector(mode, embedder, &opts.query).await?;

    let request = SearchRequest {
        query: &opts.query,
        query_vec: query_vec.as_deref(),
        mode,
        source_filter: opts.source.as_deref(),
        since: opts.since.as_deref(),
        params: search_params(config, opts.limit.unwrap_or(config.retrieval.final_limit)),
        explain: opts.explain,
    };

    knowbase_core::search::search(store, &request).await
}

/// `kb search`: run [`search_documents`] and print the hits.
pub async fn run_search(config: &Config, opts: SearchOptions) -> Result<()> {
    let mode = opts.mode.unwrap_or_else(|| default_mode(config));
    check_mode(config, mode)?;
    let embedder = if mode.needs_embedding() {
        Some(embedding::create_provider(&config.embedding)?)
    } else {
        None
    };

    let store = SqliteStore::new(db::connect(config).await?);
    let results = search_documents(config, &store, embedder.as_deref(), &opts).await?;
    store.pool().close().await;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    if let Some(ex) = results.first().and_then(|r| r.explain.as_ref()) {
        println!(
            "Search: mode={}, alpha={:.2}, candidates: {} keyword + {} vector",
            mode, ex.alpha, ex.keyword_candidates, ex.vector_candidates
        );
        println!();
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            result.score,
            result.source,
            result.title.as_deref().unwrap_or(&result.source_id)
        );
        if let Some(ex) = &result.explain {
            println!(
                "    scoring: keyword={:.3}  semantic={:.3}  → hybrid={:.3}",
                ex.keyword_score, ex.semantic_score, result.score
            );
        }
        println!("    path: {}", result.source_id);
        println!("    updated: {}", result.updated_at);
        println!(
            "    excerpt: \"{}\"",
            result.snippet.replace('\n', " ").trim()
        );
        println!("    id: {}", result.id);
        println!();
    }

    Ok(())
}
