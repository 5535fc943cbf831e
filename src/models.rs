//! Core data models used throughout mnemo.
//!
//! These types represent the files, chunks, and search results that flow
//! through the indexing and retrieval pipeline.

use serde::Serialize;

/// Source tag for daily short-term memory files (`memory/YYYY-MM-DD.md`).
pub const SOURCE_SHORT_TERM: &str = "short-term";

/// Source tag for the curated long-term memory file (`MEMORY.md`).
/// Chunks with this source receive a retrieval-priority boost.
pub const SOURCE_LONG_TERM: &str = "long-term";

/// Tracked file record. Chunks for a path are valid only while the stored
/// hash matches the file's current content hash.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: String,
    pub source: String,
    pub hash: String,
    pub mtime: i64,
    pub size: i64,
}

/// A chunk produced by the chunker, before embedding.
///
/// `start_line`/`end_line` are 1-indexed and attribute each source line to
/// exactly one chunk; overlap with the previous chunk is carried as
/// duplicated leading text only.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub path: String,
    pub source: String,
    pub start_line: i64,
    pub end_line: i64,
    pub hash: String,
    pub text: String,
}

/// Database record for a chunk, including its (optional) embedding vector.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub path: String,
    pub source: String,
    pub start_line: i64,
    pub end_line: i64,
    pub hash: String,
    pub model: String,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    pub updated_at: i64,
}

/// Which retrieval channel(s) produced a search result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Vector,
    Keyword,
    Both,
}

/// A ranked search result. Ephemeral, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub path: String,
    pub source: String,
    pub text: String,
    pub snippet: String,
    pub score: f64,
    pub start_line: i64,
    pub end_line: i64,
    pub matched_by: MatchKind,
}

/// Outcome of indexing a single file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexResult {
    pub path: String,
    pub chunks_added: usize,
    pub chunks_reused: usize,
    pub embeddings_computed: usize,
    pub embeddings_cached: usize,
}

/// Outcome of syncing the workspace's memory files into the index.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub files_synced: usize,
    pub files_removed: usize,
    pub chunks_indexed: usize,
    pub errors: Vec<String>,
}

/// Outcome of compacting short-term memory files.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompactResult {
    pub files_compacted: usize,
    pub files_archived: usize,
}

/// Index-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub total_files: i64,
    pub total_chunks: i64,
    pub total_vectors: i64,
    pub cache_entries: i64,
    pub db_size_bytes: u64,
}
