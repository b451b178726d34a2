//! Keyword, semantic, and hybrid retrieval over a [`Store`].
//!
//! # Hybrid Scoring Algorithm
//!
//! 1. Fetch `candidate_k_keyword` keyword candidates (BM25 rank).
//! 2. Fetch `candidate_k_vector` vector candidates (cosine similarity).
//! 3. Normalize both sets to `[0, 1]` using min-max normalization.
//! 4. Merge per chunk: `score = (1 - α) × keyword + α × semantic`.
//!
//! [`search`] then groups chunks by document (MAX aggregation) and sorts by
//! score desc, updated_at desc, id asc. [`retrieve_passages`] keeps the
//! chunk granularity and returns full chunk text for answer generation.

use anyhow::{bail, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::models::ContextPassage;
use crate::store::{format_ts_iso, CandidateFilter, ChunkCandidate, DocumentMetadata, Store};

/// Which retrieval channels contribute to the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Keyword,
    Semantic,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Keyword => "keyword",
            SearchMode::Semantic => "semantic",
            SearchMode::Hybrid => "hybrid",
        }
    }

    /// Whether this mode needs a query embedding.
    pub fn needs_embedding(&self) -> bool {
        !matches!(self, SearchMode::Keyword)
    }

    fn uses_keyword(&self) -> bool {
        !matches!(self, SearchMode::Semantic)
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keyword" => Ok(SearchMode::Keyword),
            "semantic" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => bail!(
                "Unknown search mode: {}. Use keyword, semantic, or hybrid.",
                other
            ),
        }
    }
}

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Weight for semantic vs keyword: `hybrid = (1-α)*keyword + α*semantic`.
    pub hybrid_alpha: f64,
    pub candidate_k_keyword: i64,
    pub candidate_k_vector: i64,
    /// Maximum results (documents for [`search`], passages for [`retrieve_passages`]).
    pub final_limit: i64,
    /// Cap on passages drawn from one document by [`retrieve_passages`].
    pub max_chunks_per_doc: usize,
}

/// Bundles all inputs for a single retrieval.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    /// Pre-computed query embedding, required for semantic and hybrid modes.
    pub query_vec: Option<&'a [f32]>,
    pub mode: SearchMode,
    pub source_filter: Option<&'a str>,
    /// Only documents updated on or after this date (`YYYY-MM-DD`).
    pub since: Option<&'a str>,
    pub params: SearchParams,
    pub explain: bool,
}

/// A document-level search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub id: String,
    /// Relevance score in `[0.0, 1.0]`.
    pub score: f64,
    pub title: Option<String>,
    pub source: String,
    pub source_id: String,
    /// ISO 8601.
    pub updated_at: String,
    pub snippet: String,
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<ScoreExplanation>,
}

/// Scoring breakdown for a search result.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreExplanation {
    pub keyword_score: f64,
    pub semantic_score: f64,
    pub alpha: f64,
    pub keyword_candidates: usize,
    pub vector_candidates: usize,
}

#[derive(Debug, Clone)]
struct ScoredChunk {
    chunk_id: String,
    document_id: String,
    hybrid_score: f64,
    keyword_score: f64,
    semantic_score: f64,
    snippet: String,
}

struct ScoredSet {
    chunks: Vec<ScoredChunk>,
    alpha: f64,
    keyword_candidates: usize,
    vector_candidates: usize,
}

/// Parse a `YYYY-MM-DD` date into the Unix timestamp of its midnight (UTC).
pub fn parse_since(since: &str) -> Result<i64> {
    let date = NaiveDate::parse_from_str(since, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("invalid date '{}': {}", since, e))?;
    Ok(date
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default())
}

/// Fetch candidates from both channels and merge them into chunk scores,
/// sorted by hybrid score desc then chunk id asc.
async fn score_chunks<S: Store + ?Sized>(store: &S, req: &SearchRequest<'_>) -> Result<ScoredSet> {
    let filter = CandidateFilter {
        source: req.source_filter,
        since: req.since.map(parse_since).transpose()?,
    };

    let keyword_candidates = if req.mode.uses_keyword() {
        store
            .keyword_search(req.query, req.params.candidate_k_keyword, filter)
            .await?
    } else {
        Vec::new()
    };

    let vector_candidates = if req.mode.needs_embedding() {
        match req.query_vec {
            Some(qv) => {
                store
                    .vector_search(qv, req.params.candidate_k_vector, filter)
                    .await?
            }
            None => bail!("query_vec is required for semantic/hybrid mode"),
        }
    } else {
        Vec::new()
    };

    let alpha = match req.mode {
        SearchMode::Keyword => 0.0,
        SearchMode::Semantic => 1.0,
        SearchMode::Hybrid => req.params.hybrid_alpha,
    };

    let kw_map: HashMap<&str, f64> = normalize_scores(&keyword_candidates)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();
    let vec_map: HashMap<&str, f64> = normalize_scores(&vector_candidates)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();

    let mut unique: HashMap<&str, &ChunkCandidate> = HashMap::new();
    for c in keyword_candidates.iter().chain(vector_candidates.iter()) {
        unique.entry(c.chunk_id.as_str()).or_insert(c);
    }

    let mut chunks: Vec<ScoredChunk> = unique
        .into_iter()
        .map(|(chunk_id, cand)| {
            let k = kw_map.get(chunk_id).copied().unwrap_or(0.0);
            let v = vec_map.get(chunk_id).copied().unwrap_or(0.0);
            ScoredChunk {
                chunk_id: chunk_id.to_string(),
                document_id: cand.document_id.clone(),
                hybrid_score: (1.0 - alpha) * k + alpha * v,
                keyword_score: k,
                semantic_score: v,
                snippet: cand.snippet.clone(),
            }
        })
        .collect();

    chunks.sort_by(|a, b| {
        b.hybrid_score
            .partial_cmp(&a.hybrid_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });

    Ok(ScoredSet {
        chunks,
        alpha,
        keyword_candidates: keyword_candidates.len(),
        vector_candidates: vector_candidates.len(),
    })
}

/// Document-level search: the entry point for `kb search` and `POST /search`.
pub async fn search<S: Store + ?Sized>(
    store: &S,
    req: &SearchRequest<'_>,
) -> Result<Vec<SearchResultItem>> {
    if req.query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let scored = score_chunks(store, req).await?;
    let filter = CandidateFilter {
        source: req.source_filter,
        since: req.since.map(parse_since).transpose()?,
    };

    // Chunks arrive sorted, so the first chunk seen per document is its best.
    let mut best: Vec<&ScoredChunk> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for sc in &scored.chunks {
        if seen.insert(sc.document_id.as_str()) {
            best.push(sc);
        }
    }

    let mut results = Vec::with_capacity(best.len());
    for sc in best {
        let Some(meta) = store.get_document_metadata(&sc.document_id).await? else {
            continue;
        };
        if !filter.matches(&meta.source, meta.updated_at) {
            continue;
        }
        let explain = req.explain.then(|| ScoreExplanation {
            keyword_score: sc.keyword_score,
            semantic_score: sc.semantic_score,
            alpha: scored.alpha,
            keyword_candidates: scored.keyword_candidates,
            vector_candidates: scored.vector_candidates,
        });
        results.push((meta.updated_at, to_result(meta, sc, explain)));
    }

    results.sort_by(|(ta, a), (tb, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(tb.cmp(ta))
            .then(a.id.cmp(&b.id))
    });
    results.truncate(req.params.final_limit.max(0) as usize);

    Ok(results.into_iter().map(|(_, r)| r).collect())
}

fn to_result(
    meta: DocumentMetadata,
    sc: &ScoredChunk,
    explain: Option<ScoreExplanation>,
) -> SearchResultItem {
    SearchResultItem {
        id: meta.id,
        score: sc.hybrid_score,
        title: meta.title,
        source: meta.source,
        source_id: meta.source_id,
        updated_at: format_ts_iso(meta.updated_at),
        snippet: sc.snippet.clone(),
        source_url: meta.source_url,
        explain,
    }
}

/// Chunk-level retrieval for answer generation.
///
/// Returns up to `final_limit` passages with full chunk text, taking at most
/// `max_chunks_per_doc` from any single document.
pub async fn retrieve_passages<S: Store + ?Sized>(
    store: &S,
    req: &SearchRequest<'_>,
) -> Result<Vec<ContextPassage>> {
    if req.query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let scored = score_chunks(store, req).await?;
    let limit = req.params.final_limit.max(0) as usize;
    let per_doc_cap = req.params.max_chunks_per_doc.max(1);

    let mut meta_cache: HashMap<String, Option<DocumentMetadata>> = HashMap::new();
    let mut per_doc: HashMap<String, usize> = HashMap::new();
    let mut passages = Vec::new();

    for sc in &scored.chunks {
        if passages.len() >= limit {
            break;
        }
        let taken = per_doc.get(&sc.document_id).copied().unwrap_or(0);
        if taken >= per_doc_cap {
            continue;
        }
        if !meta_cache.contains_key(&sc.document_id) {
            let meta = store.get_document_metadata(&sc.document_id).await?;
            meta_cache.insert(sc.document_id.clone(), meta);
        }
        let Some(Some(meta)) = meta_cache.get(&sc.document_id) else {
            continue;
        };
        let Some(chunk) = store.get_chunk(&sc.chunk_id).await? else {
            continue;
        };

        per_doc.insert(sc.document_id.clone(), taken + 1);
        passages.push(ContextPassage {
            chunk_id: chunk.id,
            document_id: chunk.document_id,
            chunk_index: chunk.chunk_index,
            title: meta.title.clone(),
            source: meta.source.clone(),
            source_id: meta.source_id.clone(),
            source_url: meta.source_url.clone(),
            score: sc.hybrid_score,
            text: chunk.text,
        });
    }

    Ok(passages)
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<(&ChunkCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let (s_min, s_max) = candidates
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), c| {
            (lo.min(c.raw_score), hi.max(c.raw_score))
        });

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}
