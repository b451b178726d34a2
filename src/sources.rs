//! `kb sources` and `GET /sources`: configured directories and their state.
//!
//! A source is healthy when its root directory exists. Document counts and
//! the last update time come from the index, so a source that was removed
//! from the config but still has documents is listed too.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use knowbase_core::store::format_ts_iso;

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    /// `filesystem:<name>`
    pub name: String,
    pub root: Option<String>,
    /// Present in the current config.
    pub configured: bool,
    pub healthy: bool,
    pub documents: i64,
    /// ISO 8601 time of the last completed update.
    pub last_update: Option<String>,
    pub notes: Option<String>,
}

struct IndexedSource {
    documents: i64,
    last_update: Option<i64>,
}

async fn indexed_sources(pool: &SqlitePool) -> Result<BTreeMap<String, IndexedSource>> {
    let mut out: BTreeMap<String, IndexedSource> = BTreeMap::new();

    let rows = sqlx::query("SELECT source, COUNT(*) AS n FROM documents GROUP BY source")
        .fetch_all(pool)
        .await?;
    for row in &rows {
        out.insert(
            row.get("source"),
            IndexedSource {
                documents: row.get("n"),
                last_update: None,
            },
        );
    }

    let checkpoints = sqlx::query("SELECT source, updated_at FROM checkpoints")
        .fetch_all(pool)
        .await?;
    for row in &checkpoints {
        let entry = out
            .entry(row.get("source"))
            .or_insert(IndexedSource {
                documents: 0,
                last_update: None,
            });
        entry.last_update = Some(row.get("updated_at"));
    }

    Ok(out)
}

pub async fn get_sources(config: &Config, pool: &SqlitePool) -> Result<Vec<SourceStatus>> {
    let mut indexed = indexed_sources(pool).await?;
    let mut sources = Vec::new();

    for (name, fs_config) in &config.connectors.filesystem {
        let source = format!("filesystem:{}", name);
        let stats = indexed.remove(&source);
        let healthy = fs_config.root.is_dir();
        sources.push(SourceStatus {
            name: source,
            root: Some(fs_config.root.display().to_string()),
            configured: true,
            healthy,
            documents: stats.as_ref().map_or(0, |s| s.documents),
            last_update: stats.and_then(|s| s.last_update).map(format_ts_iso),
            notes: (!healthy).then(|| "root directory does not exist".to_string()),
        });
    }

    for (source, stats) in indexed {
        sources.push(SourceStatus {
            name: source,
            root: None,
            configured: false,
            healthy: false,
            documents: stats.documents,
            last_update: stats.last_update.map(format_ts_iso),
            notes: Some("no longer configured; run an update with --full after removing it".to_string()),
        });
    }

    Ok(sources)
}

pub async fn list_sources(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let sources = get_sources(config, &pool).await;
    pool.close().await;
    let sources = sources?;

    if sources.is_empty() {
        println!("No sources configured. Add [connectors.filesystem.<name>] or set KB_NOTES_DIRS.");
        return Ok(());
    }

    println!(
        "{:<24} {:<8} {:>6}  {:<20}  ROOT",
        "SOURCE", "HEALTHY", "DOCS", "LAST UPDATE"
    );
    for s in &sources {
        println!(
            "{:<24} {:<8} {:>6}  {:<20}  {}",
            s.name,
            if s.healthy { "yes" } else { "no" },
            s.documents,
            s.last_update.as_deref().unwrap_or("never"),
            s.root.as_deref().or(s.notes.as_deref()).unwrap_or("")
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilesystemConnectorConfig;
    use crate::sqlite_store::tests::{doc, memory_store};
    use knowbase_core::store::Store;

    #[tokio::test]
    async fn configured_and_orphaned_sources_are_listed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config: Config = toml::from_str("[db]\npath = \"x.sqlite\"").unwrap();
        config.connectors.filesystem.insert(
            "vault".to_string(),
            FilesystemConnectorConfig::with_root(tmp.path().to_path_buf()),
        );
        config.connectors.filesystem.insert(
            "gone".to_string(),
            FilesystemConnectorConfig::with_root(tmp.path().join("missing")),
        );

        let store = memory_store().await;
        store
            .upsert_document(&doc("filesystem:vault", "a.md", "a", 1))
            .await
            .unwrap();
        store
            .upsert_document(&doc("filesystem:old", "b.md", "b", 1))
            .await
            .unwrap();

        let sources = get_sources(&config, store.pool()).await.unwrap();
        let names: Vec<&str> = sources.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["filesystem:gone", "filesystem:vault", "filesystem:old"]);
        assert!(!sources[0].healthy);
        assert_eq!(sources[1].documents, 1);
        assert!(sources[1].healthy);
        assert!(!sources[2].configured);
    }
}
