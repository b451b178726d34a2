//! Filesystem connector: walk notes directories and libraries.
//!
//! Each `[connectors.filesystem.<name>]` entry is scanned independently and
//! yields items with `source = "filesystem:<name>"`. Markdown and plain text
//! are read as UTF-8 (lossy); PDF and EPUB bytes go through
//! [`extract`](crate::extract). Files that are too large or fail extraction
//! are reported in [`ScanOutcome::skipped`] and never abort the scan.

use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::Path;
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::config::{Config, FilesystemConnectorConfig};
use crate::extract::{self, MIME_MARKDOWN, MIME_TEXT};
use crate::markdown;
use crate::models::SourceItem;

/// Always excluded, in addition to `exclude_globs`.
const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.git/**",
    "**/.obsidian/**",
    "**/.trash/**",
    "**/node_modules/**",
];

/// A file that matched the include globs but could not be indexed, or a
/// directory that could not be listed.
#[derive(Debug, Clone)]
pub struct SkippedFile {
    /// Relative to the connector root, `/`-separated. Empty for the root.
    pub path: String,
    pub reason: String,
    /// Nothing below this directory was seen during the scan.
    pub is_dir: bool,
}

impl SkippedFile {
    /// Whether the document at `source_id` may still exist on disk.
    pub fn covers(&self, source_id: &str) -> bool {
        if !self.is_dir {
            return source_id == self.path;
        }
        self.path.is_empty()
            || source_id
                .strip_prefix(self.path.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Items sorted by `source_id`.
    pub items: Vec<SourceItem>,
    pub skipped: Vec<SkippedFile>,
}

/// Resolve a connector specifier to `(source, config)` pairs.
///
/// Accepts `all`, `filesystem`, or `filesystem:<name>`.
pub fn resolve_connectors(
    config: &Config,
    specifier: &str,
) -> Result<Vec<(String, FilesystemConnectorConfig)>> {
    let all = || {
        config
            .connectors
            .filesystem
            .iter()
            .map(|(name, cfg)| (format!("filesystem:{}", name), cfg.clone()))
            .collect::<Vec<_>>()
    };

    let targets = match specifier.split_once(':') {
        None if specifier == "all" || specifier == "filesystem" => all(),
        Some(("filesystem", name)) => match config.connectors.filesystem.get(name) {
            Some(cfg) => vec![(specifier.to_string(), cfg.clone())],
            None => bail!(
                "Unknown connector: '{}'. Configured: {}",
                specifier,
                configured_names(config)
            ),
        },
        _ => bail!(
            "Unknown connector: '{}'. Use all, filesystem, or filesystem:<name>.",
            specifier
        ),
    };

    if targets.is_empty() {
        bail!("No filesystem connectors configured. Add [connectors.filesystem.<name>] or set KB_NOTES_DIRS.");
    }
    Ok(targets)
}

fn configured_names(config: &Config) -> String {
    let names: Vec<String> = config
        .connectors
        .filesystem
        .keys()
        .map(|n| format!("filesystem:{}", n))
        .collect();
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

pub fn scan_filesystem(source: &str, fs_config: &FilesystemConnectorConfig) -> Result<ScanOutcome> {
    let root = &fs_config.root;
    if !root.is_dir() {
        bail!(
            "Filesystem connector root does not exist: {}",
            root.display()
        );
    }

    let include_set = build_globset(&fs_config.include_globs)?;
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(fs_config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut outcome = ScanOutcome::default();

    for entry in WalkDir::new(root).follow_links(fs_config.follow_symlinks) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                // Without a path the whole root is treated as unseen.
                let (path, is_dir) = match e.path() {
                    Some(p) => (relative_id(root, p), p.is_dir()),
                    None => (String::new(), true),
                };
                tracing::warn!("cannot read {}: {}", path, e);
                outcome.skipped.push(SkippedFile {
                    path,
                    reason: e.to_string(),
                    is_dir,
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let rel_str = relative_id(root, path);

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        match file_to_source_item(source, path, &rel_str, fs_config.max_extract_bytes) {
            Ok(item) => outcome.items.push(item),
            Err(reason) => {
                tracing::warn!("skipping {}: {}", rel_str, reason);
                outcome.skipped.push(SkippedFile {
                    path: rel_str,
                    reason,
                    is_dir: false,
                });
            }
        }
    }

    outcome.items.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    Ok(outcome)
}

/// `path` relative to `root`, joined with `/` on every platform.
fn relative_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn to_utc(t: SystemTime) -> DateTime<Utc> {
    let secs = t
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// Build one item, or explain why the file is skipped.
fn file_to_source_item(
    source: &str,
    path: &Path,
    relative_path: &str,
    max_bytes: u64,
) -> std::result::Result<SourceItem, String> {
    let metadata = std::fs::metadata(path).map_err(|e| e.to_string())?;
    if metadata.len() > max_bytes {
        return Err(format!(
            "file is {} bytes, over the {} byte limit",
            metadata.len(),
            max_bytes
        ));
    }

    let modified = metadata.modified().map(to_utc).unwrap_or_default();
    let created = metadata.created().map(to_utc).unwrap_or(modified);
    let content_type = extract::content_type_for(path).unwrap_or(MIME_TEXT);
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;

    let stem = path
        .file_stem()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| relative_path.to_string());

    let (title, author, body, metadata_json) = if extract::is_binary(content_type) {
        let extracted = extract::extract_text(&bytes, content_type).map_err(|e| e.to_string())?;
        if extracted.text.trim().is_empty() {
            return Err("no extractable text".to_string());
        }
        (
            extracted.title.unwrap_or(stem),
            extracted.author,
            extracted.text,
            "{}".to_string(),
        )
    } else if content_type == MIME_MARKDOWN {
        let text = String::from_utf8_lossy(&bytes);
        let note = markdown::parse_note(&text);
        let json = note.meta.to_json();
        (
            note.meta.title.unwrap_or(stem),
            note.meta.author,
            note.body,
            json,
        )
    } else {
        (
            stem,
            None,
            String::from_utf8_lossy(&bytes).into_owned(),
            "{}".to_string(),
        )
    };

    let absolute = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

    Ok(SourceItem {
        source: source.to_string(),
        source_id: relative_path.to_string(),
        source_url: Some(format!("file://{}", absolute.display())),
        title: Some(title),
        author,
        created_at: created.min(modified),
        updated_at: modified,
        content_type: content_type.to_string(),
        body,
        metadata_json,
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::tests::build_epub;
    use std::fs;
    use tempfile::TempDir;

    fn fs_config(root: &Path) -> FilesystemConnectorConfig {
        FilesystemConnectorConfig::with_root(root.to_path_buf())
    }

    #[test]
    fn scans_notes_with_metadata_and_default_excludes() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("Infant Care")).unwrap();
        fs::create_dir_all(root.join(".obsidian")).unwrap();
        fs::write(
            root.join("Infant Care/Burping.md"),
            "---\ntags: [feeding]\n---\n# Burping Methods\n\nOver the shoulder. See [[Feeding]].",
        )
        .unwrap();
        fs::write(root.join("Infant Care/todo.txt"), "buy diapers").unwrap();
        fs::write(root.join(".obsidian/workspace.md"), "# internal").unwrap();
        fs::write(root.join("photo.png"), [0u8, 1, 2]).unwrap();

        let outcome = scan_filesystem("filesystem:vault", &fs_config(root)).unwrap();
        let ids: Vec<&str> = outcome.items.iter().map(|i| i.source_id.as_str()).collect();
        assert_eq!(ids, vec!["Infant Care/Burping.md", "Infant Care/todo.txt"]);

        let note = &outcome.items[0];
        assert_eq!(note.source, "filesystem:vault");
        assert_eq!(note.title.as_deref(), Some("Burping Methods"));
        assert_eq!(note.content_type, "text/markdown");
        assert!(note.body.starts_with("# Burping Methods"));
        assert!(note.metadata_json.contains("\"feeding\""));
        assert!(note.metadata_json.contains("\"Feeding\""));
        assert_eq!(outcome.items[1].title.as_deref(), Some("todo"));
        assert!(outcome.skipped.is_empty());
    }

    #[test]
    fn broken_and_oversized_files_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::write(root.join("broken.pdf"), b"%PDF-1.4 garbage").unwrap();
        fs::write(root.join("big.md"), "x".repeat(2048)).unwrap();
        fs::write(root.join("ok.md"), "fine").unwrap();

        let mut cfg = fs_config(root);
        cfg.max_extract_bytes = 1024;
        let outcome = scan_filesystem("filesystem:t", &cfg).unwrap();
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.skipped.len(), 2);
        let skipped: Vec<&str> = outcome.skipped.iter().map(|s| s.path.as_str()).collect();
        assert!(skipped.contains(&"broken.pdf"));
        assert!(skipped.contains(&"big.md"));
    }

    #[test]
    fn epub_title_and_author_come_from_package() {
        let tmp = TempDir::new().unwrap();
        let bytes = build_epub("Baby 411", "Denise Fields", &["<p>Fevers and colds.</p>"]);
        fs::write(tmp.path().join("baby-411.EPUB"), bytes).unwrap();

        let outcome = scan_filesystem("filesystem:books", &fs_config(tmp.path())).unwrap();
        let item = &outcome.items[0];
        assert_eq!(item.title.as_deref(), Some("Baby 411"));
        assert_eq!(item.author.as_deref(), Some("Denise Fields"));
        assert_eq!(item.content_type, "application/epub+zip");
        assert_eq!(item.body, "Fevers and colds.");
    }

    #[test]
    fn missing_root_is_an_error() {
        let cfg = FilesystemConnectorConfig::with_root("/definitely/not/here".into());
        assert!(scan_filesystem("filesystem:x", &cfg).is_err());
    }

    #[test]
    fn relative_ids_use_forward_slashes() {
        let root = Path::new("/home/me/vault");
        assert_eq!(
            relative_id(root, &root.join("Infant Care").join("Burping.md")),
            "Infant Care/Burping.md"
        );
        assert_eq!(relative_id(root, root), "");
    }

    #[test]
    fn skipped_directory_covers_everything_below_it() {
        let dir = SkippedFile {
            path: "Infant Care".to_string(),
            reason: "permission denied".to_string(),
            is_dir: true,
        };
        assert!(dir.covers("Infant Care/Burping.md"));
        assert!(dir.covers("Infant Care/Sleep/Naps.md"));
        assert!(!dir.covers("Infant Care Extra/a.md"));
        assert!(!dir.covers("Feeding.md"));

        let root = SkippedFile {
            path: String::new(),
            reason: "io error".to_string(),
            is_dir: true,
        };
        assert!(root.covers("anything.md"));

        let file = SkippedFile {
            path: "broken.pdf".to_string(),
            reason: "bad xref".to_string(),
            is_dir: false,
        };
        assert!(file.covers("broken.pdf"));
        assert!(!file.covers("broken.pdf.md"));
    }
}
