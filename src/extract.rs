//! Text extraction for binary documents (PDF, EPUB).
//!
//! Connectors supply bytes and a content type; this module returns plain
//! UTF-8 text plus any title and author found in the file. Failures are
//! returned as [`ExtractError`] so the pipeline can skip the file and move
//! on.

use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_EPUB: &str = "application/epub+zip";

/// Decompression caps for EPUB archives (zip-bomb protection).
#[derive(Debug, Clone, Copy)]
pub struct EpubLimits {
    /// Maximum decompressed bytes read from a single entry.
    pub max_entry_bytes: u64,
    /// Maximum decompressed bytes read from one archive in total.
    pub max_total_bytes: u64,
    pub max_spine_items: usize,
}

impl Default for EpubLimits {
    fn default() -> Self {
        Self {
            max_entry_bytes: 50 * 1024 * 1024,
            max_total_bytes: 200 * 1024 * 1024,
            max_spine_items: 5_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("EPUB extraction failed: {0}")]
    Epub(String),
    #[error("EPUB entry {name} exceeds size limit ({limit} bytes)")]
    EntryTooLarge { name: String, limit: u64 },
}

impl From<zip::result::ZipError> for ExtractError {
    fn from(e: zip::result::ZipError) -> Self {
        ExtractError::Epub(e.to_string())
    }
}

impl From<quick_xml::Error> for ExtractError {
    fn from(e: quick_xml::Error) -> Self {
        ExtractError::Epub(e.to_string())
    }
}

/// Text and metadata pulled out of a binary document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub text: String,
    pub title: Option<String>,
    pub author: Option<String>,
}

/// Content type for a path, by extension. `None` for unsupported files.
pub fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "md" | "markdown" => Some(MIME_MARKDOWN),
        "txt" => Some(MIME_TEXT),
        "pdf" => Some(MIME_PDF),
        "epub" => Some(MIME_EPUB),
        _ => None,
    }
}

/// Whether the content type needs [`extract_text`] rather than a UTF-8 read.
pub fn is_binary(content_type: &str) -> bool {
    matches!(content_type, MIME_PDF | MIME_EPUB)
}

pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<Extracted, ExtractError> {
    match content_type {
        MIME_PDF => extract_pdf(bytes),
        MIME_EPUB => extract_epub_with_limits(bytes, &EpubLimits::default()),
        other => Err(ExtractError::UnsupportedContentType(other.to_string())),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    // pdf-extract panics on some malformed files.
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem(bytes)
    }));
    match result {
        Ok(Ok(text)) => Ok(Extracted {
            text,
            ..Default::default()
        }),
        Ok(Err(e)) => Err(ExtractError::Pdf(e.to_string())),
        Err(_) => Err(ExtractError::Pdf("parser panicked".to_string())),
    }
}

// ============ EPUB ============

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

struct Package {
    title: Option<String>,
    author: Option<String>,
    /// Spine hrefs, resolved against the archive root, in reading order.
    spine: Vec<String>,
}

/// Extract an EPUB, refusing archives that decompress past `limits`.
pub fn extract_epub_with_limits(
    bytes: &[u8],
    limits: &EpubLimits,
) -> Result<Extracted, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;
    let mut budget = limits.max_total_bytes;

    let container = read_entry(&mut archive, "META-INF/container.xml", limits, &mut budget)?;
    let opf_path = rootfile_path(&container)?;
    let opf = read_entry(&mut archive, &opf_path, limits, &mut budget)?;
    let package = parse_package(&opf, &opf_path)?;

    let mut chapters = Vec::new();
    for href in package.spine.iter().take(limits.max_spine_items) {
        let xhtml = match read_entry(&mut archive, href, limits, &mut budget) {
            Ok(x) => x,
            Err(e @ ExtractError::EntryTooLarge { .. }) => return Err(e),
            Err(e) => {
                tracing::debug!("skipping EPUB spine item {}: {}", href, e);
                continue;
            }
        };
        let text = xhtml_to_text(&xhtml);
        if !text.is_empty() {
            chapters.push(text);
        }
    }

    if chapters.is_empty() {
        return Err(ExtractError::Epub("no readable text in spine".to_string()));
    }

    Ok(Extracted {
        text: chapters.join("\n\n"),
        title: package.title,
        author: package.author,
    })
}

fn read_entry(
    archive: &mut Archive<'_>,
    name: &str,
    limits: &EpubLimits,
    budget: &mut u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Epub(format!("{}: {}", name, e)))?;
    let cap = limits.max_entry_bytes.min(*budget);
    let mut out = Vec::new();
    // One byte past the cap tells an entry of exactly `cap` bytes from a larger one.
    entry
        .take(cap.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Epub(format!("{}: {}", name, e)))?;
    if out.len() as u64 > cap {
        return Err(ExtractError::EntryTooLarge {
            name: name.to_string(),
            limit: cap,
        });
    }
    *budget -= out.len() as u64;
    Ok(out)
}

fn attr(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn rootfile_path(container: &[u8]) -> Result<String, ExtractError> {
    let mut reader = Reader::from_reader(container);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"rootfile" => {
                if let Some(path) = attr(&e, b"full-path") {
                    return Ok(path);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Err(ExtractError::Epub(
        "container.xml has no rootfile".to_string(),
    ))
}

fn parse_package(opf: &[u8], opf_path: &str) -> Result<Package, ExtractError> {
    let base = opf_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    let mut reader = Reader::from_reader(opf);
    let mut buf = Vec::new();

    let mut title: Option<String> = None;
    let mut creators: Vec<String> = Vec::new();
    let mut manifest: HashMap<String, (String, String)> = HashMap::new();
    let mut spine_ids: Vec<String> = Vec::new();
    let mut capture: Option<&'static str> = None;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"title" if title.is_none() => {
                    capture = Some("title");
                    text.clear();
                }
                b"creator" => {
                    capture = Some("creator");
                    text.clear();
                }
                _ => record_package_entry(&e, &mut manifest, &mut spine_ids),
            },
            Event::Empty(e) => record_package_entry(&e, &mut manifest, &mut spine_ids),
            Event::Text(t) if capture.is_some() => {
                text.push_str(&t.unescape().unwrap_or_default());
            }
            Event::End(e) => {
                let name = e.local_name();
                match (capture, name.as_ref()) {
                    (Some("title"), b"title") => {
                        title = Some(text.trim().to_string()).filter(|t| !t.is_empty());
                        capture = None;
                    }
                    (Some("creator"), b"creator") => {
                        let c = text.trim();
                        if !c.is_empty() {
                            creators.push(c.to_string());
                        }
                        capture = None;
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let spine = spine_ids
        .iter()
        .filter_map(|id| manifest.get(id))
        .filter(|(_, media)| media.is_empty() || media.contains("html"))
        .map(|(href, _)| resolve_href(base, href))
        .collect::<Vec<_>>();

    if spine.is_empty() {
        return Err(ExtractError::Epub("package has an empty spine".to_string()));
    }

    Ok(Package {
        title,
        author: (!creators.is_empty()).then(|| creators.join(", ")),
        spine,
    })
}

fn record_package_entry(
    e: &quick_xml::events::BytesStart<'_>,
    manifest: &mut HashMap<String, (String, String)>,
    spine_ids: &mut Vec<String>,
) {
    match e.local_name().as_ref() {
        b"item" => {
            if let (Some(id), Some(href)) = (attr(e, b"id"), attr(e, b"href")) {
                let media = attr(e, b"media-type").unwrap_or_default();
                manifest.insert(id, (href, media));
            }
        }
        b"itemref" => {
            if attr(e, b"linear").as_deref() != Some("no") {
                if let Some(idref) = attr(e, b"idref") {
                    spine_ids.push(idref);
                }
            }
        }
        _ => {}
    }
}

/// Resolve a manifest href against the OPF directory.
fn resolve_href(base: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or(href).replace("%20", " ");
    let mut parts: Vec<&str> = if base.is_empty() {
        Vec::new()
    } else {
        base.split('/').collect()
    };
    for seg in href.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

const BLOCK_TAGS: &[&[u8]] = &[
    b"p", b"div", b"br", b"li", b"tr", b"h1", b"h2", b"h3", b"h4", b"h5", b"h6", b"blockquote",
    b"section", b"article", b"pre", b"dd", b"dt", b"hr",
];

fn is_block(name: &[u8]) -> bool {
    BLOCK_TAGS.contains(&name)
}

/// Flatten XHTML into paragraphs separated by blank lines.
///
/// Malformed markup ends extraction early but keeps what was read.
fn xhtml_to_text(xhtml: &[u8]) -> String {
    let mut reader = Reader::from_reader(xhtml);
    reader.config_mut().check_end_names = false;
    let mut buf = Vec::new();

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut skip_depth = 0usize;
    let mut in_body = false;

    let flush = |current: &mut String, paragraphs: &mut Vec<String>| {
        let collapsed = current.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            paragraphs.push(collapsed);
        }
        current.clear();
    };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"body" => in_body = true,
                    b"script" | b"style" | b"head" => skip_depth += 1,
                    n if is_block(n) => flush(&mut current, &mut paragraphs),
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                if is_block(e.local_name().as_ref()) {
                    flush(&mut current, &mut paragraphs);
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"script" | b"style" | b"head" => skip_depth = skip_depth.saturating_sub(1),
                    n if is_block(n) => flush(&mut current, &mut paragraphs),
                    _ => {}
                }
            }
            Ok(Event::Text(t)) if skip_depth == 0 && in_body => {
                match t.unescape() {
                    Ok(s) => current.push_str(&s),
                    Err(_) => current.push_str(&String::from_utf8_lossy(&t)),
                }
                current.push(' ');
            }
            Ok(Event::CData(t)) if skip_depth == 0 && in_body => {
                current.push_str(&String::from_utf8_lossy(&t));
                current.push(' ');
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::debug!("stopping XHTML parse early: {}", e);
                break;
            }
            _ => {}
        }
        buf.clear();
    }
    flush(&mut current, &mut paragraphs);

    paragraphs.join("\n\n")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Build a minimal EPUB in memory with the given chapters.
    pub(crate) fn build_epub(title: &str, author: &str, chapters: &[&str]) -> Vec<u8> {
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
  <rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#,
            )
            .unwrap();

            let mut manifest = String::new();
            let mut spine = String::new();
            for (i, body) in chapters.iter().enumerate() {
                manifest.push_str(&format!(
                    r#"<item id="c{i}" href="text/ch{i}.xhtml" media-type="application/xhtml+xml"/>"#
                ));
                spine.push_str(&format!(r#"<itemref idref="c{i}"/>"#));
                zip.start_file(format!("OEBPS/text/ch{}.xhtml", i), opts).unwrap();
                zip.write_all(
                    format!(
                        "<html xmlns=\"http://www.w3.org/1999/xhtml\"><head><title>x</title><style>p {{}}</style></head><body>{}</body></html>",
                        body
                    )
                    .as_bytes(),
                )
                .unwrap();
            }
            zip.start_file("OEBPS/content.opf", opts).unwrap();
            zip.write_all(
                format!(
                    r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>{title}</dc:title>
    <dc:creator>{author}</dc:creator>
  </metadata>
  <manifest>{manifest}</manifest>
  <spine>{spine}</spine>
</package>"#
                )
                .as_bytes(),
            )
            .unwrap();
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn unsupported_content_type_returns_error() {
        let err = extract_text(b"foo", "application/octet-stream").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_text(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_epub_error() {
        let err = extract_text(b"not a zip", MIME_EPUB).unwrap_err();
        assert!(matches!(err, ExtractError::Epub(_)));
    }

    #[test]
    fn epub_text_follows_spine_order() {
        let bytes = build_epub(
            "The Happiest Baby",
            "Harvey Karp",
            &[
                "<h1>Chapter One</h1><p>Swaddling calms a fussy newborn.</p>",
                "<p>Shushing &amp; swinging help too.</p><script>var x = 1;</script>",
            ],
        );
        let out = extract_text(&bytes, MIME_EPUB).unwrap();
        assert_eq!(out.title.as_deref(), Some("The Happiest Baby"));
        assert_eq!(out.author.as_deref(), Some("Harvey Karp"));
        assert_eq!(
            out.text,
            "Chapter One\n\nSwaddling calms a fussy newborn.\n\nShushing & swinging help too."
        );
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for(Path::new("a/Note.MD")), Some(MIME_MARKDOWN));
        assert_eq!(content_type_for(Path::new("paper.pdf")), Some(MIME_PDF));
        assert_eq!(content_type_for(Path::new("book.epub")), Some(MIME_EPUB));
        assert_eq!(content_type_for(Path::new("image.png")), None);
        assert!(is_binary(MIME_EPUB));
        assert!(!is_binary(MIME_TEXT));
    }

    #[test]
    fn hrefs_resolve_against_opf_dir() {
        assert_eq!(resolve_href("OEBPS", "text/ch1.xhtml#s1"), "OEBPS/text/ch1.xhtml");
        assert_eq!(resolve_href("OEBPS/pkg", "../Text/A%20B.xhtml"), "OEBPS/Text/A B.xhtml");
        assert_eq!(resolve_href("", "ch.xhtml"), "ch.xhtml");
    }

    fn entry_len(bytes: &[u8], name: &str) -> u64 {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let size = archive.by_name(name).unwrap().size();
        size
    }

    #[test]
    fn oversized_spine_entry_is_rejected() {
        let long = format!("<p>{}</p>", "colic ".repeat(200));
        let bytes = build_epub("Colic", "Anon", &["<p>short</p>", &long]);
        let limits = EpubLimits {
            max_entry_bytes: 1024,
            ..Default::default()
        };
        let err = extract_epub_with_limits(&bytes, &limits).unwrap_err();
        match err {
            ExtractError::EntryTooLarge { name, limit } => {
                assert_eq!(name, "OEBPS/text/ch1.xhtml");
                assert_eq!(limit, 1024);
            }
            other => panic!("expected EntryTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn entry_of_exactly_the_limit_is_read() {
        let bytes = build_epub("Naps", "Anon", &["<p>Two naps a day.</p>"]);
        let largest = ["META-INF/container.xml", "OEBPS/content.opf", "OEBPS/text/ch0.xhtml"]
            .iter()
            .map(|n| entry_len(&bytes, n))
            .max()
            .unwrap();
        let limits = EpubLimits {
            max_entry_bytes: largest,
            ..Default::default()
        };
        let out = extract_epub_with_limits(&bytes, &limits).unwrap();
        assert_eq!(out.text, "Two naps a day.");
    }

    #[test]
    fn total_budget_applies_across_entries() {
        let bytes = build_epub("Naps", "Anon", &["<p>Two naps a day.</p>"]);
        let limits = EpubLimits {
            max_total_bytes: 64,
            ..Default::default()
        };
        let err = extract_epub_with_limits(&bytes, &limits).unwrap_err();
        assert!(matches!(err, ExtractError::EntryTooLarge { .. }));
    }
}
