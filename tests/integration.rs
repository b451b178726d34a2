use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kb_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("kb");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let vault = root.join("vault");
    fs::create_dir_all(vault.join("Baby")).unwrap();
    fs::create_dir_all(vault.join(".obsidian")).unwrap();
    fs::write(
        vault.join("Baby/Burping.md"),
        "---\ntags: [baby, feeding]\n---\n# Burping Methods\n\nThree burping methods work well: over the shoulder, sitting on the lap, and face down across the knees.\n\nSee also [[Feeding Schedule]].",
    )
    .unwrap();
    fs::write(
        vault.join("Baby/Sleep.md"),
        "# Newborn Sleep\n\nNewborns sleep 14 to 17 hours a day in short stretches. #sleep",
    )
    .unwrap();
    fs::write(
        vault.join("Garden.md"),
        "# Garden\n\nTomatoes need six hours of sun and deep watering twice a week.",
    )
    .unwrap();
    fs::write(vault.join(".obsidian/workspace.json"), "{\"burping\": true}").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/kb.sqlite"

[chunking]
max_tokens = 700

[retrieval]
final_limit = 12

[llm]
provider = "extractive"

[connectors.filesystem.vault]
root = "{root}/vault"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("kb.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kb(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kb_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("KB_NOTES_DIRS")
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kb binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn vault(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("vault")
}

/// The `id:` line of the first search hit.
fn first_id(search_stdout: &str) -> String {
    search_stdout
        .lines()
        .find_map(|l| l.trim().strip_prefix("id: "))
        .expect("search output has an id line")
        .to_string()
}

fn build_epub(title: &str, author: &str, chapter: &str) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let opts = zip::write::SimpleFileOptions::default();
        zip.start_file("mimetype", opts).unwrap();
        zip.write_all(b"application/epub+zip").unwrap();
        zip.start_file("META-INF/container.xml", opts).unwrap();
        zip.write_all(
            br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#,
        )
        .unwrap();
        zip.start_file("content.opf", opts).unwrap();
        zip.write_all(
            format!(
                r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>{title}</dc:title>
    <dc:creator>{author}</dc:creator>
  </metadata>
  <manifest><item id="c1" href="ch1.xhtml" media-type="application/xhtml+xml"/></manifest>
  <spine><itemref idref="c1"/></spine>
</package>"#
            )
            .as_bytes(),
        )
        .unwrap();
        zip.start_file("ch1.xhtml", opts).unwrap();
        zip.write_all(
            format!(
                "<html xmlns=\"http://www.w3.org/1999/xhtml\"><body><p>{}</p></body></html>",
                chapter
            )
            .as_bytes(),
        )
        .unwrap();
        zip.finish().unwrap();
    }
    buf.into_inner()
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kb(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, again) = run_kb(&config_path, &["init"]);
    assert!(again, "second init failed (not idempotent)");
}

#[test]
fn test_update_indexes_vault() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kb(&config_path, &["update", "--progress", "off"]);
    assert!(success, "update failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("update filesystem:vault"));
    assert!(stdout.contains("upserted documents: 3"), "{}", stdout);
    assert!(stdout.contains("ok"));
}

#[test]
fn test_update_twice_writes_nothing() {
    let (_tmp, config_path) = setup_test_env();

    run_kb(&config_path, &["update", "--progress", "off"]);
    let (stdout, _, success) = run_kb(&config_path, &["update", "--progress", "off"]);
    assert!(success);
    assert!(stdout.contains("upserted documents: 0"), "{}", stdout);

    let (stdout, _, success) = run_kb(&config_path, &["update", "--full", "--progress", "off"]);
    assert!(success);
    assert!(stdout.contains("upserted documents: 0"), "{}", stdout);
    assert!(stdout.contains("unchanged: 3"), "{}", stdout);
}

#[test]
fn test_update_picks_up_edits_and_deletions() {
    let (_tmp, config_path) = setup_test_env();
    let vault = vault(&config_path);

    run_kb(&config_path, &["update", "--progress", "off"]);

    fs::remove_file(vault.join("Garden.md")).unwrap();
    fs::write(vault.join("Recipes.md"), "# Pancakes\n\nFlour, eggs, milk.").unwrap();

    let (stdout, _, success) = run_kb(&config_path, &["update", "--progress", "off"]);
    assert!(success);
    assert!(stdout.contains("pruned: 1"), "{}", stdout);
    assert!(stdout.contains("upserted documents: 1"), "{}", stdout);

    let (stdout, _, _) = run_kb(&config_path, &["search", "tomatoes"]);
    assert!(stdout.contains("No results."), "{}", stdout);
    let (stdout, _, _) = run_kb(&config_path, &["search", "pancakes"]);
    assert!(stdout.contains("Recipes.md"), "{}", stdout);
}

#[test]
fn test_update_dry_run_writes_nothing() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_kb(&config_path, &["update", "--dry-run", "--progress", "off"]);
    assert!(success);
    assert!(stdout.contains("(dry-run)"));

    let (stdout, _, _) = run_kb(&config_path, &["search", "burping"]);
    assert!(stdout.contains("No results."), "{}", stdout);
}

#[test]
fn test_update_unknown_connector_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_kb(&config_path, &["update", "filesystem:nope"]);
    assert!(!success);
    assert!(stderr.contains("nope"), "{}", stderr);
}

#[test]
fn test_sync_alias() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_kb(&config_path, &["sync", "filesystem", "--progress", "off"]);
    assert!(success);
    assert!(stdout.contains("upserted documents: 3"));
}

#[test]
fn test_search_natural_language_question() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["update", "--progress", "off"]);

    let (stdout, stderr, success) =
        run_kb(&config_path, &["search", "What are burping methods?"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.starts_with("1. "), "{}", stdout);
    assert!(stdout.contains("Burping Methods"));
    assert!(stdout.contains("path: Baby/Burping.md"));
}

#[test]
fn test_search_semantic_without_embeddings_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["update", "--progress", "off"]);

    let (_, stderr, success) = run_kb(&config_path, &["search", "burping", "--mode", "semantic"]);
    assert!(!success);
    assert!(stderr.contains("requires embeddings"), "{}", stderr);
}

#[test]
fn test_ask_answers_from_notes() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["update", "--progress", "off"]);

    let (stdout, stderr, success) =
        run_kb(&config_path, &["ask", "What are burping methods?"]);
    assert!(success, "ask failed: {}", stderr);
    assert!(stdout.contains("over the shoulder"), "{}", stdout);
    assert!(stdout.contains("Sources:"));
    assert!(stdout.contains("Baby/Burping.md"));
}

#[test]
fn test_ask_without_matches_says_so() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["update", "--progress", "off"]);

    let (stdout, _, success) = run_kb(&config_path, &["ask", "quantum chromodynamics", "--no-sources"]);
    assert!(success);
    assert!(!stdout.contains("Sources:"));
    assert!(!stdout.contains("over the shoulder"));
}

#[test]
fn test_ask_unknown_model_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["update", "--progress", "off"]);

    let (_, stderr, success) = run_kb(&config_path, &["ask", "burping", "--model", "gpt-9"]);
    assert!(!success);
    assert!(stderr.contains("unknown model"), "{}", stderr);
}

#[test]
fn test_get_document() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["update", "--progress", "off"]);

    let (search_out, _, _) = run_kb(&config_path, &["search", "burping"]);
    let id = first_id(&search_out);

    let (stdout, stderr, success) = run_kb(&config_path, &["get", &id]);
    assert!(success, "get failed: {}", stderr);
    assert!(stdout.contains("--- Document ---"));
    assert!(stdout.contains("title:        Burping Methods"));
    assert!(stdout.contains("tags:         baby, feeding"), "{}", stdout);
    assert!(stdout.contains("links:        Feeding Schedule"), "{}", stdout);
    assert!(stdout.contains("--- Chunks (1) ---"));
}

#[test]
fn test_get_missing_document_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);

    let (_, stderr, success) = run_kb(&config_path, &["get", "no-such-id"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_stats_and_sources() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["update", "--progress", "off"]);

    let (stdout, _, success) = run_kb(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Documents:   3"), "{}", stdout);
    assert!(stdout.contains("filesystem:vault"));

    let (stdout, _, success) = run_kb(&config_path, &["sources"]);
    assert!(success);
    assert!(stdout.contains("filesystem:vault"));
    assert!(stdout.contains("yes"));
}

#[test]
fn test_epub_is_indexed_with_metadata() {
    let (_tmp, config_path) = setup_test_env();
    let vault = vault(&config_path);
    fs::create_dir_all(vault.join("Books")).unwrap();
    fs::write(
        vault.join("Books/baby411.epub"),
        build_epub(
            "Baby 411",
            "Ari Brown",
            "Swaddling helps newborns settle by recreating the snug feel of the womb.",
        ),
    )
    .unwrap();

    let (stdout, stderr, success) = run_kb(&config_path, &["update", "--progress", "off"]);
    assert!(success, "update failed: {}", stderr);
    assert!(stdout.contains("upserted documents: 4"), "{}", stdout);

    let (stdout, _, _) = run_kb(&config_path, &["search", "swaddling"]);
    assert!(stdout.contains("Baby 411"), "{}", stdout);
    assert!(stdout.contains("Books/baby411.epub"));
}

#[test]
fn test_broken_pdf_is_skipped_not_fatal() {
    let (_tmp, config_path) = setup_test_env();
    let vault = vault(&config_path);
    fs::write(vault.join("broken.pdf"), b"this is not a pdf").unwrap();

    let (stdout, stderr, success) = run_kb(&config_path, &["update", "--progress", "off"]);
    assert!(success, "update failed: {}", stderr);
    assert!(stdout.contains("upserted documents: 3"));
    assert!(stdout.contains("skipped files: 1"), "{}", stdout);
    assert!(stdout.contains("broken.pdf"));
}

#[test]
fn test_embed_requires_provider() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);

    let (_, stderr, success) = run_kb(&config_path, &["embed", "pending"]);
    assert!(!success);
    assert!(stderr.contains("disabled"), "{}", stderr);
}

#[test]
fn test_completions_need_no_config() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("missing.toml");

    let (stdout, _, success) = run_kb(&missing, &["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("kb"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("missing.toml");

    let (_, stderr, success) = run_kb(&missing, &["stats"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
