//! `kb stats`: what is in the index.
//!
//! Totals for documents, chunks and embedded chunks, then one row per
//! source with its last update time.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::embed_cmd;

#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub source: String,
    pub documents: i64,
    pub chunks: i64,
    pub embedded: i64,
    pub last_update: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub documents: i64,
    pub chunks: i64,
    pub embedded: i64,
    /// Chunks without a vector for the configured model; `None` when
    /// embeddings are disabled.
    pub pending_embeddings: Option<usize>,
    pub sources: Vec<SourceStats>,
}

pub async fn collect_stats(pool: &SqlitePool, embedding_model: Option<&str>) -> Result<IndexStats> {
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;
    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;
    let embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
        .fetch_one(pool)
        .await?;

    let pending_embeddings = match embedding_model {
        Some(model) => Some(embed_cmd::count_pending(pool, model).await?),
        None => None,
    };

    let rows = sqlx::query(
        r#"
        SELECT
            d.source,
            COUNT(DISTINCT d.id) AS documents,
            COUNT(DISTINCT c.id) AS chunks,
            COUNT(DISTINCT cv.chunk_id) AS embedded,
            cp.updated_at AS last_update
        FROM documents d
        LEFT JOIN chunks c ON c.document_id = d.id
        LEFT JOIN chunk_vectors cv ON cv.chunk_id = c.id
        LEFT JOIN checkpoints cp ON cp.source = d.source
        GROUP BY d.source
        ORDER BY documents DESC, d.source
        "#,
    )
    .fetch_all(pool)
    .await?;

    let sources = rows
        .iter()
        .map(|row| SourceStats {
            source: row.get("source"),
            documents: row.get("documents"),
            chunks: row.get("chunks"),
            embedded: row.get("embedded"),
            last_update: row.get("last_update"),
        })
        .collect();

    Ok(IndexStats {
        documents,
        chunks,
        embedded,
        pending_embeddings,
        sources,
    })
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let model = config
        .embedding
        .is_enabled()
        .then(|| config.embedding.model.clone())
        .flatten();
    let stats = collect_stats(&pool, model.as_deref()).await;
    pool.close().await;
    let stats = stats?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("knowbase — Database Stats");
    println!("=========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  Chunks:      {}", stats.chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        stats.embedded,
        stats.chunks,
        percent(stats.embedded, stats.chunks)
    );
    if let Some(pending) = stats.pending_embeddings {
        println!("  Pending:     {} (run `kb embed pending`)", pending);
    }

    if !stats.sources.is_empty() {
        println!();
        println!("  By source:");
        println!(
            "  {:<24} {:>6} {:>8} {:>10}   {}",
            "SOURCE", "DOCS", "CHUNKS", "EMBEDDED", "LAST UPDATE"
        );
        println!("  {}", "-".repeat(76));
        let now = chrono::Utc::now().timestamp();
        for s in &stats.sources {
            println!(
                "  {:<24} {:>6} {:>8} {:>10}   {}",
                s.source,
                s.documents,
                s.chunks,
                s.embedded,
                s.last_update
                    .map(|ts| format_ts_relative(ts, now))
                    .unwrap_or_else(|| "never".to_string())
            );
        }
    }
    println!();

    Ok(())
}

fn percent(part: i64, whole: i64) -> i64 {
    if whole > 0 {
        part * 100 / whole
    } else {
        0
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{} B", bytes)
    } else if b < KB * KB {
        format!("{:.1} KB", b / KB)
    } else if b < KB * KB * KB {
        format!("{:.1} MB", b / (KB * KB))
    } else {
        format!("{:.2} GB", b / (KB * KB * KB))
    }
}

/// "3 hours ago" for recent times, a date otherwise.
fn format_ts_relative(ts: i64, now: i64) -> String {
    let delta = now - ts;
    let plural = |n: i64, unit: &str| format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" });
    match delta {
        d if d < 0 => format_date(ts),
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => plural(d / 60, "min"),
        d if d < 86400 => plural(d / 3600, "hour"),
        d if d < 86400 * 30 => plural(d / 86400, "day"),
        _ => format_date(ts),
    }
}

fn format_date(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
