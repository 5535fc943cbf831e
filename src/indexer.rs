//! Indexing pipeline for a single file.
//!
//! Turns a `(path, content, source)` triple into persisted chunks with
//! embeddings, minimizing redundant embedding calls: unchanged files are
//! skipped via the stored content hash, and chunk embeddings are looked up
//! in the content-addressed cache before the provider is asked.
//!
//! An embedding failure for any batch fails the whole call before anything
//! is persisted, so the index never holds a partially-updated file.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

use crate::chunk::chunk_text;
use crate::config::ChunkingConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::models::{Chunk, ChunkRecord, FileRecord, IndexResult};
use crate::store::Store;

pub struct Indexer {
    store: Arc<Store>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    chunking: ChunkingConfig,
    batch_size: usize,
}

impl Indexer {
    pub fn new(
        store: Arc<Store>,
        provider: Option<Arc<dyn EmbeddingProvider>>,
        chunking: ChunkingConfig,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            provider,
            chunking,
            batch_size: batch_size.max(1),
        }
    }

    /// Index one file's content under the given source tag.
    ///
    /// Idempotent for unchanged content: when the stored file hash matches
    /// and chunks already exist, returns a no-op result without touching
    /// the embedding provider.
    pub async fn index_file(&self, path: &str, content: &str, source: &str) -> Result<IndexResult> {
        let hash = content_hash(content);

        if let Some(existing) = self.store.get_file(path).await? {
            if existing.hash == hash {
                let existing_chunks = self.store.chunk_count_for_path(path, source).await?;
                if existing_chunks > 0 {
                    debug!(path, "content unchanged, skipping re-index");
                    return Ok(IndexResult {
                        path: path.to_string(),
                        chunks_added: 0,
                        chunks_reused: existing_chunks as usize,
                        embeddings_computed: 0,
                        embeddings_cached: 0,
                    });
                }
            }
        }

        let chunks = chunk_text(content, path, source, &self.chunking);
        let (embeddings, computed, cached) = self.embed_chunks(&chunks).await?;

        let model = self
            .provider
            .as_ref()
            .map(|p| p.model().to_string())
            .unwrap_or_else(|| "none".to_string());
        let now = chrono::Utc::now().timestamp();

        let records: Vec<ChunkRecord> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| ChunkRecord {
                id: chunk.id,
                path: chunk.path,
                source: chunk.source,
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                hash: chunk.hash,
                model: model.clone(),
                text: chunk.text,
                embedding,
                updated_at: now,
            })
            .collect();

        let file = FileRecord {
            path: path.to_string(),
            source: source.to_string(),
            hash,
            mtime: file_mtime(path).unwrap_or(now),
            size: content.len() as i64,
        };

        self.store.replace_file_chunks(&file, &records).await?;

        debug!(
            path,
            chunks = records.len(),
            embeddings_computed = computed,
            embeddings_cached = cached,
            "indexed file"
        );

        Ok(IndexResult {
            path: path.to_string(),
            chunks_added: records.len(),
            chunks_reused: 0,
            embeddings_computed: computed,
            embeddings_cached: cached,
        })
    }

    /// Remove a file and its chunks from the index. No error if the path
    /// was never indexed.
    pub async fn delete_index(&self, path: &str, source: &str) -> Result<()> {
        self.store.delete_file(path, source).await
    }

    /// Resolve an embedding per chunk, cache-first. Cache misses are
    /// batched through the provider; every new vector is stored back into
    /// the cache keyed by content hash, so identical text embeds once even
    /// across different files.
    async fn embed_chunks(
        &self,
        chunks: &[Chunk],
    ) -> Result<(Vec<Option<Vec<f32>>>, usize, usize)> {
        let provider = match &self.provider {
            Some(p) => p,
            None => return Ok((vec![None; chunks.len()], 0, 0)),
        };
        if chunks.is_empty() {
            return Ok((Vec::new(), 0, 0));
        }

        let provider_key = provider.provider_key();
        let mut embeddings: Vec<Option<Vec<f32>>> = vec![None; chunks.len()];
        let mut missing: Vec<usize> = Vec::new();
        let mut cached = 0usize;

        for (i, chunk) in chunks.iter().enumerate() {
            match self
                .store
                .cached_embedding(provider.id(), provider.model(), &provider_key, &chunk.hash)
                .await?
            {
                Some(vector) => {
                    embeddings[i] = Some(vector);
                    cached += 1;
                }
                None => missing.push(i),
            }
        }

        let mut computed = 0usize;
        for batch in missing.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|&i| chunks[i].text.clone()).collect();
            let vectors = provider.embed_batch(&texts).await?;

            for (&i, vector) in batch.iter().zip(vectors) {
                self.store
                    .cache_embedding(
                        provider.id(),
                        provider.model(),
                        &provider_key,
                        &chunks[i].hash,
                        &vector,
                    )
                    .await?;
                embeddings[i] = Some(vector);
                computed += 1;
            }
        }

        Ok((embeddings, computed, cached))
    }
}

/// Full SHA-256 hex digest of file content, used for change detection.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn file_mtime(path: &str) -> Option<i64> {
    let metadata = std::fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    Some(
        modified
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64,
    )
}
