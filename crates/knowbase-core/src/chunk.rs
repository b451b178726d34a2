//! Paragraph-boundary text chunker.
//!
//! Splits a document body into [`Chunk`]s that respect a configurable
//! `max_tokens` limit. Splitting happens on paragraph boundaries (`\n\n`)
//! so that a note's sections, a paper's paragraphs, or a book's chapters
//! stay coherent within each chunk.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` to `max_chars` using a 4 chars/token ratio.
//! 2. Split text on `\n\n` paragraph boundaries.
//! 3. Accumulate paragraphs until the next one would exceed `max_chars`,
//!    then flush the buffer as a chunk.
//! 4. Paragraphs longer than `max_chars` are hard-split at the nearest
//!    newline or space, always on a UTF-8 char boundary.
//! 5. When `overlap_tokens > 0`, every chunk after the first is prefixed
//!    with the word-aligned tail of its predecessor, so a chunk may exceed
//!    `max_chars` by at most the overlap.
//! 6. At least one chunk is returned, even for empty text.
//!
//! Chunk ids are UUID v5 values derived from the document id and index, so
//! re-chunking an unchanged document yields the same ids.
//!
//! ```rust
//! use knowbase_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("doc-123", "Hello world.\n\nSecond paragraph.", 700, 0);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].chunk_index, 0);
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Split text into chunks on paragraph boundaries, respecting `max_tokens`.
///
/// Returns chunks with contiguous indices starting at 0. Each chunk's
/// `hash` is the SHA-256 of its final text (overlap included).
pub fn chunk_text(
    document_id: &str,
    text: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Chunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let overlap_chars = (overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);

    let pieces = split_pieces(text, max_chars);
    if pieces.is_empty() {
        return vec![make_chunk(document_id, 0, text.trim())];
    }

    let mut chunks = Vec::with_capacity(pieces.len());
    for (i, piece) in pieces.iter().enumerate() {
        let body = if i > 0 && overlap_chars > 0 {
            let prefix = word_aligned_tail(&pieces[i - 1], overlap_chars);
            if prefix.is_empty() {
                piece.clone()
            } else {
                format!("{}\n\n{}", prefix, piece)
            }
        } else {
            piece.clone()
        };
        chunks.push(make_chunk(document_id, i as i64, &body));
    }
    chunks
}

/// Pack paragraphs into pieces of at most `max_chars` bytes.
fn split_pieces(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            hard_split(trimmed, max_chars, &mut pieces);
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }
    pieces
}

/// Split an oversized paragraph at newline/space boundaries.
fn hard_split(paragraph: &str, max_chars: usize, out: &mut Vec<String>) {
    let mut remaining = paragraph;
    while !remaining.is_empty() {
        let mut split_at = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
        if split_at == 0 {
            split_at = next_char_boundary(remaining);
        }
        if split_at < remaining.len() {
            if let Some(pos) = remaining[..split_at]
                .rfind('\n')
                .or_else(|| remaining[..split_at].rfind(' '))
            {
                if pos > 0 {
                    split_at = pos + 1;
                }
            }
        }
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
}

/// Last `max_bytes` of `text`, starting at a word boundary.
fn word_aligned_tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return "";
    }
    let start = snap_to_char_boundary(text, text.len() - max_bytes);
    let tail = &text[start..];
    match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim(),
        None => tail.trim(),
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_char_boundary(s: &str) -> usize {
    s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
}

/// SHA-256 hex digest of `text`.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(document_id: &str, index: i64, text: &str) -> Chunk {
    let name = format!("{}:{}", document_id, index);
    Chunk {
        id: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash: hash_text(text),
    }
}
