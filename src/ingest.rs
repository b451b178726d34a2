//! Index update: connector → normalize → dedup → chunk → store → embed.
//!
//! For each selected connector the root is scanned in full, documents whose
//! files disappeared are pruned, and the remaining items are compared by
//! content hash. Unchanged documents are not re-chunked or re-embedded, so
//! running an update twice in a row writes nothing the second time.
//!
//! A checkpoint (newest file modification time seen) lets later runs skip
//! hashing files that have not been touched; files never indexed before are
//! always considered. Mtimes have one-second resolution, so files stamped
//! with the checkpoint second itself are hashed again. `--full` ignores the
//! checkpoint.
//!
//! Embedding happens once after all connectors are written and is never
//! fatal: chunks that fail stay pending for `kb embed pending`.

use anyhow::{bail, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use knowbase_core::chunk::chunk_text;
use knowbase_core::store::{IndexedDocument, Store};

use crate::config::Config;
use crate::connector_fs::{self, ScanOutcome};
use crate::db;
use crate::embed_cmd::{self, EmbedReport};
use crate::embedding;
use crate::migrate;
use crate::models::{Document, SourceItem};
use crate::progress::{ProgressEvent, ProgressMode, ProgressReporter};
use crate::sqlite_store::SqliteStore;

const PROGRESS_EVERY: u64 = 25;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Ignore checkpoints and hash every file.
    pub full: bool,
    /// Count what would change without writing.
    pub dry_run: bool,
    /// Process at most this many changed files per connector.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceReport {
    pub source: String,
    pub fetched: u64,
    pub upserted: u64,
    pub unchanged: u64,
    pub pruned: u64,
    pub chunks: u64,
    /// Files that matched but could not be read or extracted.
    pub skipped: Vec<String>,
    pub checkpoint: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub dry_run: bool,
    pub sources: Vec<SourceReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<EmbedReport>,
}

impl SyncReport {
    pub fn failed_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.error.is_some()).count()
    }
}

/// `kb update <connector>`: run the update and print a summary.
pub async fn run_sync(
    config: &Config,
    connector: &str,
    opts: SyncOptions,
    progress: ProgressMode,
) -> Result<()> {
    let pool = db::connect(config).await?;
    // An update on a fresh database creates the schema first.
    migrate::migrate_pool(&pool).await?;
    let store = SqliteStore::new(pool);
    let reporter = progress.reporter();

    let report = sync_all(config, &store, connector, opts, reporter.as_ref()).await?;
    print_report(config, &report);
    store.pool().close().await;

    let failed = report.failed_sources();
    if failed > 0 {
        bail!("{} connector(s) failed to update", failed);
    }
    Ok(())
}

fn print_report(config: &Config, report: &SyncReport) {
    for s in &report.sources {
        if report.dry_run {
            println!("update {} (dry-run)", s.source);
        } else {
            println!("update {}", s.source);
        }
        if let Some(err) = &s.error {
            println!("  error: {}", err);
            continue;
        }
        println!("  fetched: {} files", s.fetched);
        println!("  upserted documents: {}", s.upserted);
        println!("  unchanged: {}", s.unchanged);
        println!("  pruned: {}", s.pruned);
        println!("  chunks written: {}", s.chunks);
        println!("  skipped files: {}", s.skipped.len());
        for path in &s.skipped {
            println!("    {}", path);
        }
        if let Some(cp) = s.checkpoint {
            println!("  checkpoint: {}", cp);
        }
    }
    if let Some(e) = &report.embeddings {
        println!("embeddings");
        println!("  written: {}", e.embedded);
        println!("  pending: {}", e.failed);
    } else if config.embedding.is_enabled() && !report.dry_run {
        println!("embeddings");
        println!("  skipped: provider unavailable");
    }
    println!("ok");
}

/// Update every connector selected by `specifier`, then embed.
///
/// Connector failures are recorded in the report and do not stop the
/// remaining connectors. Storage errors abort.
pub async fn sync_all(
    config: &Config,
    store: &SqliteStore,
    specifier: &str,
    opts: SyncOptions,
    progress: &dyn ProgressReporter,
) -> Result<SyncReport> {
    let targets = connector_fs::resolve_connectors(config, specifier)?;
    let mut report = SyncReport {
        dry_run: opts.dry_run,
        ..Default::default()
    };

    for (source, fs_config) in targets {
        progress.report(ProgressEvent::Scanning {
            source: source.clone(),
        });

        let scan_source = source.clone();
        let scanned = tokio::task::spawn_blocking(move || {
            connector_fs::scan_filesystem(&scan_source, &fs_config)
        })
        .await?;

        let source_report = match scanned {
            Ok(outcome) => sync_source(config, store, &source, outcome, opts, progress).await?,
            Err(e) => {
                tracing::error!("update {} failed: {:#}", source, e);
                SourceReport {
                    source,
                    error: Some(format!("{:#}", e)),
                    ..Default::default()
                }
            }
        };
        report.sources.push(source_report);
    }

    if !opts.dry_run && config.embedding.is_enabled() {
        report.embeddings = embed_after_sync(config, store, progress).await?;
    }

    Ok(report)
}

async fn embed_after_sync(
    config: &Config,
    store: &SqliteStore,
    progress: &dyn ProgressReporter,
) -> Result<Option<EmbedReport>> {
    let provider = match embedding::create_provider(&config.embedding) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("could not create embedding provider: {:#}", e);
            return Ok(None);
        }
    };
    let pending = embed_cmd::count_pending(store.pool(), provider.model_name()).await?;
    if pending > 0 {
        progress.report(ProgressEvent::Embedding {
            pending: pending as u64,
        });
    }
    let report =
        embed_cmd::embed_pending(store, provider.as_ref(), config.embedding.batch_size, None)
            .await?;
    Ok(Some(report))
}

async fn sync_source(
    config: &Config,
    store: &SqliteStore,
    source: &str,
    outcome: ScanOutcome,
    opts: SyncOptions,
    progress: &dyn ProgressReporter,
) -> Result<SourceReport> {
    let ScanOutcome { items, skipped } = outcome;
    let mut report = SourceReport {
        source: source.to_string(),
        fetched: items.len() as u64,
        skipped: skipped.iter().map(|s| s.path.clone()).collect(),
        ..Default::default()
    };

    let indexed: HashMap<String, IndexedDocument> = store
        .indexed_documents(source)
        .await?
        .into_iter()
        .map(|d| (d.source_id.clone(), d))
        .collect();

    // Prune documents whose files are gone. A file that still exists but
    // failed extraction keeps its previous version, as does everything under
    // a directory that could not be listed.
    let present: HashSet<&str> = items.iter().map(|i| i.source_id.as_str()).collect();
    for doc in indexed.values() {
        let unseen = skipped.iter().any(|s| s.covers(&doc.source_id));
        if !present.contains(doc.source_id.as_str()) && !unseen {
            if !opts.dry_run {
                store.delete_document(&doc.id).await?;
            }
            tracing::debug!("pruned {} {}", source, doc.source_id);
            report.pruned += 1;
        }
    }

    let checkpoint = if opts.full {
        None
    } else {
        get_checkpoint(store.pool(), source).await?
    };

    let mut candidates: Vec<&SourceItem> = items
        .iter()
        .filter(|item| {
            !indexed.contains_key(&item.source_id)
                || checkpoint.map_or(true, |cp| item.updated_at.timestamp() >= cp)
        })
        .collect();

    let truncated = opts.limit.is_some_and(|lim| candidates.len() > lim);
    if let Some(lim) = opts.limit {
        candidates.truncate(lim);
    }

    let total = candidates.len() as u64;
    for (n, item) in candidates.iter().enumerate() {
        let hash = dedup_hash(item);
        let existing = indexed.get(&item.source_id);
        if existing.is_some_and(|d| d.dedup_hash == hash) {
            report.unchanged += 1;
        } else if opts.dry_run {
            report.upserted += 1;
            report.chunks += chunk_text(
                "dry-run",
                &item.body,
                config.chunking.max_tokens,
                config.chunking.overlap_tokens,
            )
            .len() as u64;
        } else {
            let id = existing
                .map(|d| d.id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let doc = to_document(item, id, hash);
            let chunks = chunk_text(
                &doc.id,
                &doc.body,
                config.chunking.max_tokens,
                config.chunking.overlap_tokens,
            );
            store.index_document(&doc, &chunks).await?;
            report.upserted += 1;
            report.chunks += chunks.len() as u64;
        }

        let done = n as u64 + 1;
        if done % PROGRESS_EVERY == 0 || done == total {
            progress.report(ProgressEvent::Indexing {
                source: source.to_string(),
                n: done,
                total,
            });
        }
    }
    report.unchanged += report.fetched - total;

    // A truncated run has not looked at every changed file yet.
    if !opts.dry_run && !truncated {
        let newest = items
            .iter()
            .map(|i| i.updated_at.timestamp())
            .max()
            .unwrap_or(0)
            .max(checkpoint.unwrap_or(0));
        set_checkpoint(store.pool(), source, newest).await?;
        report.checkpoint = Some(newest);
    } else {
        report.checkpoint = checkpoint;
    }

    Ok(report)
}

/// SHA-256 over source, source id, and body. Touching a file without
/// changing it keeps the hash.
pub fn dedup_hash(item: &SourceItem) -> String {
    let mut hasher = Sha256::new();
    hasher.update(item.source.as_bytes());
    hasher.update([0]);
    hasher.update(item.source_id.as_bytes());
    hasher.update([0]);
    hasher.update(item.body.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn to_document(item: &SourceItem, id: String, dedup_hash: String) -> Document {
    Document {
        id,
        source: item.source.clone(),
        source_id: item.source_id.clone(),
        source_url: item.source_url.clone(),
        title: item.title.clone(),
        author: item.author.clone(),
        created_at: item.created_at.timestamp(),
        updated_at: item.updated_at.timestamp(),
        content_type: item.content_type.clone(),
        body: item.body.clone(),
        metadata_json: item.metadata_json.clone(),
        dedup_hash,
    }
}

pub async fn get_checkpoint(pool: &SqlitePool, source: &str) -> Result<Option<i64>> {
    let cursor: Option<String> =
        sqlx::query_scalar("SELECT cursor FROM checkpoints WHERE source = ?")
            .bind(source)
            .fetch_optional(pool)
            .await?;

    Ok(cursor.and_then(|s| s.parse::<i64>().ok()))
}

async fn set_checkpoint(pool: &SqlitePool, source: &str, cursor: i64) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO checkpoints (source, cursor, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(source) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
        "#,
    )
    .bind(source)
    .bind(cursor.to_string())
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilesystemConnectorConfig;
    use crate::progress::NoProgress;
    use crate::sqlite_store::tests::memory_store;
    use knowbase_core::store::CandidateFilter;
    use std::fs;
    use tempfile::TempDir;

    fn config_for(root: &std::path::Path) -> Config {
        let mut config: Config = toml::from_str("[db]\npath = \"unused.sqlite\"").unwrap();
        config.connectors.filesystem.insert(
            "vault".to_string(),
            FilesystemConnectorConfig::with_root(root.to_path_buf()),
        );
        config
    }

    async fn update(config: &Config, store: &SqliteStore, opts: SyncOptions) -> SourceReport {
        let report = sync_all(config, store, "all", opts, &NoProgress)
            .await
            .unwrap();
        report.sources.into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn second_update_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("burp.md"), "# Burping\n\nPat gently.").unwrap();
        fs::write(tmp.path().join("sleep.md"), "# Sleep\n\nDark room.").unwrap();
        let config = config_for(tmp.path());
        let store = memory_store().await;

        let first = update(&config, &store, SyncOptions::default()).await;
        assert_eq!(first.fetched, 2);
        assert_eq!(first.upserted, 2);
        assert!(first.checkpoint.is_some());

        let second = update(&config, &store, SyncOptions { full: true, ..Default::default() }).await;
        assert_eq!(second.upserted, 0);
        assert_eq!(second.unchanged, 2);
    }

    #[tokio::test]
    async fn deleted_files_are_pruned() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("keep.md"), "keep me").unwrap();
        fs::write(tmp.path().join("drop.md"), "ephemeral words").unwrap();
        let config = config_for(tmp.path());
        let store = memory_store().await;
        update(&config, &store, SyncOptions::default()).await;

        fs::remove_file(tmp.path().join("drop.md")).unwrap();
        let report = update(&config, &store, SyncOptions::default()).await;
        assert_eq!(report.pruned, 1);

        let hits = store
            .keyword_search("ephemeral", 5, CandidateFilter::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
        assert_eq!(store.indexed_documents("filesystem:vault").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn edited_file_is_reindexed_even_with_old_mtime() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("note.md");
        fs::write(&path, "original wording").unwrap();
        let config = config_for(tmp.path());
        let store = memory_store().await;
        update(&config, &store, SyncOptions::default()).await;

        fs::write(&path, "revised wording").unwrap();
        let report = update(&config, &store, SyncOptions { full: true, ..Default::default() }).await;
        assert_eq!(report.upserted, 1);
        let hits = store
            .keyword_search("revised", 5, CandidateFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn dry_run_and_limit_do_not_write() {
        let tmp = TempDir::new().unwrap();
        for i in 0..3 {
            fs::write(tmp.path().join(format!("n{}.md", i)), format!("note {}", i)).unwrap();
        }
        let config = config_for(tmp.path());
        let store = memory_store().await;

        let dry = update(&config, &store, SyncOptions { dry_run: true, ..Default::default() }).await;
        assert_eq!(dry.upserted, 3);
        assert!(store.indexed_documents("filesystem:vault").await.unwrap().is_empty());

        let limited = update(&config, &store, SyncOptions { limit: Some(2), ..Default::default() }).await;
        assert_eq!(limited.upserted, 2);
        assert!(limited.checkpoint.is_none());

        let rest = update(&config, &store, SyncOptions::default()).await;
        assert_eq!(rest.upserted, 1);
    }

    #[tokio::test]
    async fn missing_root_is_reported_per_source() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_for(tmp.path());
        config.connectors.filesystem.insert(
            "gone".to_string(),
            FilesystemConnectorConfig::with_root(tmp.path().join("missing")),
        );
        let store = memory_store().await;
        let report = sync_all(&config, &store, "all", SyncOptions::default(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(report.failed_sources(), 1);
        assert_eq!(report.sources.len(), 2);
    }

    #[test]
    fn dedup_hash_ignores_timestamps() {
        let now = chrono::Utc::now();
        let item = SourceItem {
            source: "filesystem:vault".into(),
            source_id: "a.md".into(),
            source_url: None,
            title: None,
            author: None,
            created_at: now,
            updated_at: now,
            content_type: "text/markdown".into(),
            body: "same".into(),
            metadata_json: "{}".into(),
        };
        let mut touched = item.clone();
        touched.updated_at = now + chrono::Duration::seconds(60);
        assert_eq!(dedup_hash(&item), dedup_hash(&touched));
    }

    #[tokio::test]
    async fn edit_in_checkpoint_second_is_picked_up() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("note.md");
        fs::write(&path, "original wording").unwrap();
        let mtime = fs::metadata(&path).unwrap().modified().unwrap();
        let config = config_for(tmp.path());
        let store = memory_store().await;
        update(&config, &store, SyncOptions::default()).await;

        fs::write(&path, "revised wording").unwrap();
        fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();

        let report = update(&config, &store, SyncOptions::default()).await;
        assert_eq!(report.upserted, 1);
        let hits = store
            .keyword_search("revised", 5, CandidateFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn failed_chunk_write_is_retried_by_next_update() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("note.md");
        fs::write(&path, "original wording").unwrap();
        let config = config_for(tmp.path());
        let store = memory_store().await;
        update(&config, &store, SyncOptions::default()).await;

        fs::write(&path, "revised wording").unwrap();
        sqlx::query(
            "CREATE TRIGGER fail_chunks BEFORE INSERT ON chunks BEGIN SELECT RAISE(FAIL, 'disk full'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();
        let full = SyncOptions {
            full: true,
            ..Default::default()
        };
        let err = sync_all(&config, &store, "all", full, &NoProgress)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("disk full"));

        sqlx::query("DROP TRIGGER fail_chunks")
            .execute(store.pool())
            .await
            .unwrap();
        let report = update(&config, &store, full).await;
        assert_eq!(report.upserted, 1);
        assert_eq!(report.unchanged, 0);

        let filter = CandidateFilter::default();
        let revised = store.keyword_search("revised", 5, filter).await.unwrap();
        let original = store.keyword_search("original", 5, filter).await.unwrap();
        assert_eq!(revised.len(), 1);
        assert!(original.is_empty());
    }

    #[tokio::test]
    async fn unlistable_directory_keeps_its_documents() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("Infant Care")).unwrap();
        fs::write(tmp.path().join("Infant Care/Burping.md"), "over the shoulder").unwrap();
        fs::write(tmp.path().join("Feeding.md"), "every three hours").unwrap();
        let config = config_for(tmp.path());
        let store = memory_store().await;
        update(&config, &store, SyncOptions::default()).await;

        // Scan result when "Infant Care" could not be read.
        let fs_config = &config.connectors.filesystem["vault"];
        let mut outcome = connector_fs::scan_filesystem("filesystem:vault", fs_config).unwrap();
        outcome.items.retain(|i| !i.source_id.starts_with("Infant Care/"));
        outcome.skipped.push(connector_fs::SkippedFile {
            path: "Infant Care".to_string(),
            reason: "Permission denied (os error 13)".to_string(),
            is_dir: true,
        });

        let report = sync_source(
            &config,
            &store,
            "filesystem:vault",
            outcome,
            SyncOptions::default(),
            &NoProgress,
        )
        .await
        .unwrap();
        assert_eq!(report.pruned, 0);
        assert_eq!(report.skipped, vec!["Infant Care".to_string()]);
        assert_eq!(store.indexed_documents("filesystem:vault").await.unwrap().len(), 2);
    }
}
