//! SQLite-backed storage: the single source of truth for files, chunks,
//! and the embedding cache.
//!
//! Owns the schema and all transactional writes. Two read paths serve
//! retrieval: cosine similarity over stored embedding blobs, and BM25
//! lexical relevance via the FTS5 index (kept in sync with chunk mutations
//! by triggers, transparently to callers).
//!
//! Write-ordering guarantee: [`Store::replace_file_chunks`] deletes old
//! chunks, inserts replacements, and updates the file record inside one
//! transaction, so a concurrent reader never observes a file whose hash
//! looks current while its chunks are stale or missing.

use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::Result;
use crate::migrate;
use crate::models::{ChunkRecord, FileRecord, MemoryStats};

/// A candidate chunk returned from one retrieval channel, before fusion.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: String,
    /// Raw channel score: cosine similarity for vectors, negated BM25 rank
    /// for lexical hits (higher = better in both cases).
    pub score: f64,
}

pub struct Store {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl Store {
    /// Open (and migrate) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            db_path: path.to_path_buf(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // === File operations ===

    /// Insert or update a file record. Returns whether the stored content
    /// hash changed (true for new files).
    pub async fn upsert_file(&self, file: &FileRecord) -> Result<bool> {
        let existing: Option<String> =
            sqlx::query_scalar("SELECT hash FROM files WHERE path = ?")
                .bind(&file.path)
                .fetch_optional(&self.pool)
                .await?;

        let changed = existing.as_deref() != Some(file.hash.as_str());

        sqlx::query(
            r#"
            INSERT INTO files (path, source, hash, mtime, size)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                source = excluded.source,
                hash = excluded.hash,
                mtime = excluded.mtime,
                size = excluded.size
            "#,
        )
        .bind(&file.path)
        .bind(&file.source)
        .bind(&file.hash)
        .bind(file.mtime)
        .bind(file.size)
        .execute(&self.pool)
        .await?;

        Ok(changed)
    }

    pub async fn get_file(&self, path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT path, source, hash, mtime, size FROM files WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| FileRecord {
            path: r.get("path"),
            source: r.get("source"),
            hash: r.get("hash"),
            mtime: r.get("mtime"),
            size: r.get("size"),
        }))
    }

    pub async fn list_files(&self, source: Option<&str>) -> Result<Vec<FileRecord>> {
        let rows = match source {
            Some(src) => {
                sqlx::query("SELECT path, source, hash, mtime, size FROM files WHERE source = ?")
                    .bind(src)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT path, source, hash, mtime, size FROM files")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows
            .iter()
            .map(|r| FileRecord {
                path: r.get("path"),
                source: r.get("source"),
                hash: r.get("hash"),
                mtime: r.get("mtime"),
                size: r.get("size"),
            })
            .collect())
    }

    /// Delete a file record and all its chunks in one transaction.
    /// No error if the path was never indexed.
    pub async fn delete_file(&self, path: &str, source: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE path = ? AND source = ?")
            .bind(path)
            .bind(source)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE path = ? AND source = ?")
            .bind(path)
            .bind(source)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // === Chunk operations ===

    /// Insert or replace a single chunk by id.
    pub async fn upsert_chunk(&self, chunk: &ChunkRecord) -> Result<()> {
        upsert_chunk_in(&self.pool, chunk).await
    }

    /// Atomically replace all chunks for a file and update its record.
    ///
    /// The file hash only becomes visible once the new chunks are fully
    /// persisted; readers see either the old or the new state.
    pub async fn replace_file_chunks(
        &self,
        file: &FileRecord,
        chunks: &[ChunkRecord],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE path = ? AND source = ?")
            .bind(&file.path)
            .bind(&file.source)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks
                    (id, path, source, start_line, end_line, hash, model, text, embedding, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    path = excluded.path,
                    source = excluded.source,
                    start_line = excluded.start_line,
                    end_line = excluded.end_line,
                    hash = excluded.hash,
                    model = excluded.model,
                    text = excluded.text,
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.path)
            .bind(&chunk.source)
            .bind(chunk.start_line)
            .bind(chunk.end_line)
            .bind(&chunk.hash)
            .bind(&chunk.model)
            .bind(&chunk.text)
            .bind(chunk.embedding.as_deref().map(vec_to_blob))
            .bind(chunk.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO files (path, source, hash, mtime, size)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                source = excluded.source,
                hash = excluded.hash,
                mtime = excluded.mtime,
                size = excluded.size
            "#,
        )
        .bind(&file.path)
        .bind(&file.source)
        .bind(&file.hash)
        .bind(file.mtime)
        .bind(file.size)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delete all chunks for a path. Returns the number deleted.
    pub async fn delete_chunks_for_file(&self, path: &str, source: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE path = ? AND source = ?")
            .bind(path)
            .bind(source)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_chunk(&self, id: &str) -> Result<Option<ChunkRecord>> {
        let row = sqlx::query(
            "SELECT id, path, source, start_line, end_line, hash, model, text, embedding, updated_at \
             FROM chunks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_chunk))
    }

    pub async fn get_chunks_for_file(&self, path: &str, source: &str) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query(
            "SELECT id, path, source, start_line, end_line, hash, model, text, embedding, updated_at \
             FROM chunks WHERE path = ? AND source = ? ORDER BY start_line",
        )
        .bind(path)
        .bind(source)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_chunk).collect())
    }

    pub async fn chunk_count(&self, source: Option<&str>) -> Result<i64> {
        let count: i64 = match source {
            Some(src) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE source = ?")
                    .bind(src)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    pub async fn chunk_count_for_path(&self, path: &str, source: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE path = ? AND source = ?")
                .bind(path)
                .bind(source)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // === Vector search ===

    /// Return the `limit` chunks most similar to `query` by cosine
    /// similarity, scores in [-1, 1]. Similarity is computed in Rust over
    /// the stored blobs.
    pub async fn search_vectors(
        &self,
        query: &[f32],
        limit: usize,
        source_filter: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let rows = match source_filter {
            Some(src) => {
                sqlx::query(
                    "SELECT id, embedding FROM chunks WHERE embedding IS NOT NULL AND source = ?",
                )
                .bind(src)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT id, embedding FROM chunks WHERE embedding IS NOT NULL")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut hits: Vec<SearchHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = blob_to_vec(&blob);
                SearchHit {
                    chunk_id: row.get("id"),
                    score: cosine_similarity(query, &vector) as f64,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(limit);

        Ok(hits)
    }

    // === Lexical search ===

    /// BM25-ranked full-text search. The raw score is the negated FTS5
    /// rank, so higher is better.
    pub async fn search_lexical(
        &self,
        query: &str,
        limit: usize,
        source_filter: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        let fts_query = match build_fts_query(query) {
            Some(q) => q,
            None => return Ok(Vec::new()),
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = match source_filter {
            Some(src) => {
                sqlx::query(
                    r#"
                    SELECT c.id AS chunk_id, chunks_fts.rank AS rank
                    FROM chunks_fts
                    JOIN chunks c ON c.rowid = chunks_fts.rowid
                    WHERE chunks_fts MATCH ? AND c.source = ?
                    ORDER BY rank
                    LIMIT ?
                    "#,
                )
                .bind(&fts_query)
                .bind(src)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT c.id AS chunk_id, chunks_fts.rank AS rank
                    FROM chunks_fts
                    JOIN chunks c ON c.rowid = chunks_fts.rowid
                    WHERE chunks_fts MATCH ?
                    ORDER BY rank
                    LIMIT ?
                    "#,
                )
                .bind(&fts_query)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                SearchHit {
                    chunk_id: row.get("chunk_id"),
                    score: -rank,
                }
            })
            .collect())
    }

    // === Embedding cache ===

    pub async fn cached_embedding(
        &self,
        provider: &str,
        model: &str,
        provider_key: &str,
        hash: &str,
    ) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT embedding FROM embedding_cache \
             WHERE provider = ? AND model = ? AND provider_key = ? AND hash = ?",
        )
        .bind(provider)
        .bind(model)
        .bind(provider_key)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(blob.map(|b| blob_to_vec(&b)))
    }

    pub async fn cache_embedding(
        &self,
        provider: &str,
        model: &str,
        provider_key: &str,
        hash: &str,
        vector: &[f32],
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO embedding_cache (provider, model, provider_key, hash, embedding, dims, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(provider, model, provider_key, hash) DO UPDATE SET
                embedding = excluded.embedding,
                dims = excluded.dims,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(provider)
        .bind(model)
        .bind(provider_key)
        .bind(hash)
        .bind(vec_to_blob(vector))
        .bind(vector.len() as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn cache_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Evict the oldest cache entries past `max_entries`. Returns the
    /// number removed. Pure cost optimization; never affects correctness.
    pub async fn prune_cache(&self, max_entries: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM embedding_cache
            WHERE rowid NOT IN (
                SELECT rowid FROM embedding_cache
                ORDER BY updated_at DESC
                LIMIT ?
            )
            "#,
        )
        .bind(max_entries)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // === Stats ===

    pub async fn stats(&self) -> Result<MemoryStats> {
        let total_files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let total_vectors: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        let cache_entries = self.cache_count().await?;

        Ok(MemoryStats {
            total_files,
            total_chunks,
            total_vectors,
            cache_entries,
            db_size_bytes: self.db_size(),
        })
    }

    pub fn db_size(&self) -> u64 {
        std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0)
    }
}

async fn upsert_chunk_in(pool: &SqlitePool, chunk: &ChunkRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chunks
            (id, path, source, start_line, end_line, hash, model, text, embedding, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            path = excluded.path,
            source = excluded.source,
            start_line = excluded.start_line,
            end_line = excluded.end_line,
            hash = excluded.hash,
            model = excluded.model,
            text = excluded.text,
            embedding = excluded.embedding,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.path)
    .bind(&chunk.source)
    .bind(chunk.start_line)
    .bind(chunk.end_line)
    .bind(&chunk.hash)
    .bind(&chunk.model)
    .bind(&chunk.text)
    .bind(chunk.embedding.as_deref().map(vec_to_blob))
    .bind(chunk.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

fn row_to_chunk(row: sqlx::sqlite::SqliteRow) -> ChunkRecord {
    let blob: Option<Vec<u8>> = row.get("embedding");
    ChunkRecord {
        id: row.get("id"),
        path: row.get("path"),
        source: row.get("source"),
        start_line: row.get("start_line"),
        end_line: row.get("end_line"),
        hash: row.get("hash"),
        model: row.get("model"),
        text: row.get("text"),
        embedding: blob.map(|b| blob_to_vec(&b)),
        updated_at: row.get("updated_at"),
    }
}

/// Build an FTS5 MATCH expression: an AND of quoted terms, so user queries
/// cannot inject FTS syntax. Returns `None` for queries with no terms.
fn build_fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" AND "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file(path: &str, source: &str, hash: &str) -> FileRecord {
        FileRecord {
            path: path.into(),
            source: source.into(),
            hash: hash.into(),
            mtime: 1_700_000_000,
            size: 42,
        }
    }

    fn chunk(id: &str, path: &str, text: &str, embedding: Option<Vec<f32>>) -> ChunkRecord {
        ChunkRecord {
            id: id.into(),
            path: path.into(),
            source: "docs".into(),
            start_line: 1,
            end_line: 1,
            hash: "abcd".into(),
            model: "test".into(),
            text: text.into(),
            embedding,
            updated_at: 1_700_000_000,
        }
    }

    async fn open_store() -> (Store, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("mem.db")).await.unwrap();
        (store, tmp)
    }

    #[tokio::test]
    async fn test_upsert_file_reports_changes() {
        let (store, _tmp) = open_store().await;

        assert!(store.upsert_file(&file("a.md", "docs", "h1")).await.unwrap());
        assert!(!store.upsert_file(&file("a.md", "docs", "h1")).await.unwrap());
        assert!(store.upsert_file(&file("a.md", "docs", "h2")).await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_chunks_and_lexical_search() {
        let (store, _tmp) = open_store().await;

        store
            .replace_file_chunks(
                &file("a.md", "docs", "h1"),
                &[
                    chunk("c1", "a.md", "the quick brown fox", None),
                    chunk("c2", "a.md", "jumps over the lazy dog", None),
                ],
            )
            .await
            .unwrap();

        let hits = store.search_lexical("fox", 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c1");

        // Replacing removes stale FTS entries too
        store
            .replace_file_chunks(
                &file("a.md", "docs", "h2"),
                &[chunk("c3", "a.md", "entirely new content", None)],
            )
            .await
            .unwrap();

        assert!(store.search_lexical("fox", 10, None).await.unwrap().is_empty());
        assert_eq!(store.search_lexical("content", 10, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_file_cascades_to_chunks() {
        let (store, _tmp) = open_store().await;

        store
            .replace_file_chunks(
                &file("a.md", "docs", "h1"),
                &[chunk("c1", "a.md", "cascade target", None)],
            )
            .await
            .unwrap();

        store.delete_file("a.md", "docs").await.unwrap();
        assert!(store.get_file("a.md").await.unwrap().is_none());
        assert_eq!(store.chunk_count(None).await.unwrap(), 0);
        assert!(store.search_lexical("cascade", 10, None).await.unwrap().is_empty());

        // Idempotent delete of a never-indexed path
        store.delete_file("ghost.md", "docs").await.unwrap();
    }

    #[tokio::test]
    async fn test_vector_search_orders_by_similarity() {
        let (store, _tmp) = open_store().await;

        store
            .replace_file_chunks(
                &file("a.md", "docs", "h1"),
                &[
                    chunk("close", "a.md", "x", Some(vec![1.0, 0.0, 0.0])),
                    chunk("far", "a.md", "y", Some(vec![0.0, 1.0, 0.0])),
                    chunk("mid", "a.md", "z", Some(vec![0.7, 0.7, 0.0])),
                    chunk("none", "a.md", "w", None),
                ],
            )
            .await
            .unwrap();

        let hits = store
            .search_vectors(&[1.0, 0.0, 0.0], 2, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "close");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert_eq!(hits[1].chunk_id, "mid");
    }

    #[tokio::test]
    async fn test_embedding_cache_roundtrip_and_prune() {
        let (store, _tmp) = open_store().await;

        store
            .cache_embedding("openai", "small", "openai:small", "hash1", &[0.1, 0.2])
            .await
            .unwrap();
        store
            .cache_embedding("openai", "small", "openai:small", "hash2", &[0.3, 0.4])
            .await
            .unwrap();

        let hit = store
            .cached_embedding("openai", "small", "openai:small", "hash1")
            .await
            .unwrap();
        assert_eq!(hit, Some(vec![0.1, 0.2]));

        let miss = store
            .cached_embedding("openai", "large", "openai:large", "hash1")
            .await
            .unwrap();
        assert!(miss.is_none());

        assert_eq!(store.cache_count().await.unwrap(), 2);
        let removed = store.prune_cache(1).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.cache_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lexical_search_source_filter_and_empty_query() {
        let (store, _tmp) = open_store().await;

        let mut long_term = chunk("lt", "MEMORY.md", "deployment checklist", None);
        long_term.source = "long-term".into();
        store
            .replace_file_chunks(
                &FileRecord {
                    path: "MEMORY.md".into(),
                    source: "long-term".into(),
                    hash: "h".into(),
                    mtime: 0,
                    size: 0,
                },
                &[long_term],
            )
            .await
            .unwrap();

        assert_eq!(
            store
                .search_lexical("deployment", 10, Some("long-term"))
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(store
            .search_lexical("deployment", 10, Some("docs"))
            .await
            .unwrap()
            .is_empty());
        assert!(store.search_lexical("   ", 10, None).await.unwrap().is_empty());
    }

    #[test]
    fn test_build_fts_query_quotes_terms() {
        assert_eq!(
            build_fts_query("hello world").as_deref(),
            Some("\"hello\" AND \"world\"")
        );
        assert_eq!(
            build_fts_query("say \"hi\"").as_deref(),
            Some("\"say\" AND \"\"\"hi\"\"\"")
        );
        assert!(build_fts_query("  ").is_none());
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let (store, _tmp) = open_store().await;

        store
            .replace_file_chunks(
                &file("a.md", "docs", "h1"),
                &[
                    chunk("c1", "a.md", "alpha", Some(vec![1.0, 0.0])),
                    chunk("c2", "a.md", "beta", None),
                ],
            )
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_files, 1);
        assert_eq!(stats.total_chunks, 2);
        assert_eq!(stats.total_vectors, 1);
        assert!(stats.db_size_bytes > 0);
    }
}
