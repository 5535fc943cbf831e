//! Line-boundary text chunker with overlap.
//!
//! Splits document text into [`Chunk`]s that respect a configurable token
//! budget. Splitting only ever happens between lines; a single line longer
//! than the budget is emitted as its own chunk rather than broken mid-line.
//!
//! Chunking is deterministic: identical input text and configuration
//! produce byte-identical chunk boundaries, ids, and hashes on every call.
//! Chunk ids are derived from position and content
//! (`{source}:{path}:{ordinal}:{hash16}`), so re-indexing unchanged text
//! never rewrites unrelated chunks.
//!
//! Overlap is carried as duplicated leading text: a new chunk is seeded
//! with enough trailing lines of its predecessor to cover the overlap
//! budget, but its recorded `(start_line, end_line)` range covers only the
//! lines it exclusively owns, so every source line is attributed to exactly
//! one chunk.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::Chunk;

/// Approximate chars-per-token ratio used by the token estimator.
pub const CHARS_PER_TOKEN: usize = 4;

/// Split `content` into chunks for the given path and source tag.
///
/// Returns an empty list for empty or whitespace-only content.
pub fn chunk_text(content: &str, path: &str, source: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    let max_chars = config.target_tokens * CHARS_PER_TOKEN;
    let overlap_chars = config.overlap_tokens * CHARS_PER_TOKEN;
    let lines: Vec<&str> = content.split('\n').collect();

    let mut chunks = Vec::new();
    let mut ordinal = 0usize;
    // Buffered lines for the current chunk, each with its trailing newline.
    // May start with overlap lines carried from the previous chunk.
    let mut buf: Vec<String> = Vec::new();
    let mut buf_size = 0usize;
    // 0-based index of the first line the current chunk owns.
    let mut owned_start = 0usize;

    for (i, line) in lines.iter().enumerate() {
        let with_newline = format!("{line}\n");
        let line_size = with_newline.len();

        if buf_size + line_size > max_chars && !buf.is_empty() {
            chunks.push(make_chunk(&buf, path, source, owned_start, i - 1, ordinal));
            ordinal += 1;

            // Seed the next chunk with trailing lines up to the overlap budget.
            let mut overlap: Vec<String> = Vec::new();
            let mut overlap_size = 0usize;
            for prev in buf.iter().rev() {
                if overlap_size + prev.len() > overlap_chars {
                    break;
                }
                overlap.insert(0, prev.clone());
                overlap_size += prev.len();
            }
            buf = overlap;
            buf_size = overlap_size;
            owned_start = i;
        }

        buf.push(with_newline);
        buf_size += line_size;
    }

    if !buf.is_empty() {
        chunks.push(make_chunk(
            &buf,
            path,
            source,
            owned_start,
            lines.len() - 1,
            ordinal,
        ));
    }

    chunks
}

fn make_chunk(
    buf: &[String],
    path: &str,
    source: &str,
    owned_start: usize,
    owned_end: usize,
    ordinal: usize,
) -> Chunk {
    let text = buf.concat().trim_end_matches('\n').to_string();
    let hash = chunk_hash(&text);

    Chunk {
        id: format!("{}:{}:{}:{}", source, path, ordinal, hash),
        path: path.to_string(),
        source: source.to_string(),
        start_line: owned_start as i64 + 1,
        end_line: owned_end as i64 + 1,
        hash,
        text,
    }
}

/// First 16 hex chars of the SHA-256 of `text`. Used for chunk identity and
/// as the embedding-cache key.
pub fn chunk_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}
