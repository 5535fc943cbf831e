//! Memory manager: the external surface of the engine.
//!
//! Composes storage, indexing, search, and watching into dual-layer memory
//! semantics:
//! - **Short-term**: one append-only `memory/YYYY-MM-DD.md` file per day.
//! - **Long-term**: a single curated `MEMORY.md`, boosted at query time.
//!
//! The markdown files are the primary record; the database is a derived
//! index over them. Promotion from short-term to long-term copies content,
//! and compaction retires old daily files per the retention strategy.

use chrono::{Local, NaiveDate};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::Result;
use crate::indexer::Indexer;
use crate::models::{
    CompactResult, IndexResult, MemoryStats, SyncResult, SOURCE_LONG_TERM, SOURCE_SHORT_TERM,
};
use crate::search::{SearchOutcome, Searcher};
use crate::store::Store;
use crate::watcher::{ChangeCallback, FileWatcher};

pub struct MemoryManager {
    config: Config,
    workspace_dir: PathBuf,
    store: Arc<Store>,
    indexer: Arc<Indexer>,
    searcher: Arc<Searcher>,
    dirty: Arc<AtomicBool>,
    watcher: Option<FileWatcher>,
    reindex_task: Option<JoinHandle<()>>,
}

impl MemoryManager {
    /// Open the workspace, creating directories, default memory files, and
    /// the database as needed. The embedding provider is built from the
    /// configuration.
    pub async fn open(config: Config) -> Result<Self> {
        let provider = embedding::create_provider(&config.embedding)?;
        Self::with_provider(config, provider).await
    }

    /// Like [`MemoryManager::open`] with an explicit provider (or none).
    pub async fn with_provider(
        config: Config,
        provider: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self> {
        let configured_dir = config.workspace.resolved_dir();
        std::fs::create_dir_all(&configured_dir)?;
        // Canonicalize so watcher-reported paths and config-derived paths
        // agree as index keys
        let workspace_dir = std::fs::canonicalize(&configured_dir)?;
        std::fs::create_dir_all(workspace_dir.join("memory"))?;

        let db_path = match &config.workspace.db_path {
            Some(_) => config.db_path(),
            None => workspace_dir.join("memory.db"),
        };
        let store = Arc::new(Store::open(&db_path).await?);

        let indexer = Arc::new(Indexer::new(
            store.clone(),
            provider.clone(),
            config.chunking.clone(),
            config.embedding.batch_size,
        ));
        let searcher = Arc::new(Searcher::new(
            store.clone(),
            provider,
            config.search.clone(),
        ));

        let manager = Self {
            config,
            workspace_dir,
            store,
            indexer,
            searcher,
            dirty: Arc::new(AtomicBool::new(true)),
            watcher: None,
            reindex_task: None,
        };
        manager.ensure_memory_files()?;

        Ok(manager)
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    /// Path of the daily short-term file for `date`.
    pub fn short_term_path(&self, date: NaiveDate) -> PathBuf {
        self.workspace_dir
            .join("memory")
            .join(format!("{}.md", date.format("%Y-%m-%d")))
    }

    pub fn long_term_path(&self) -> PathBuf {
        self.workspace_dir.join("MEMORY.md")
    }

    fn memory_dir(&self) -> PathBuf {
        self.workspace_dir.join("memory")
    }

    fn ensure_memory_files(&self) -> Result<()> {
        let long_term = self.long_term_path();
        if !long_term.exists() {
            std::fs::write(
                &long_term,
                "# Long-term Memory\n\nCurated persistent knowledge. Entries below are \
                 promoted from daily logs or added directly.\n",
            )?;
        }

        let today = self.short_term_path(Local::now().date_naive());
        if !today.exists() {
            std::fs::write(&today, short_term_header(Local::now().date_naive()))?;
        }

        Ok(())
    }

    // === Dual-layer memory API ===

    /// Append an entry to the short-term memory file for `date` (today by
    /// default), creating the file with its header when missing.
    pub async fn append_to_short_term(
        &self,
        content: &str,
        date: Option<NaiveDate>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        let date = date.unwrap_or_else(|| Local::now().date_naive());
        let path = self.short_term_path(date);

        let mut body = if path.exists() {
            String::new()
        } else {
            short_term_header(date)
        };

        body.push_str(&format!(
            "\n### {}\n\n{}\n",
            Local::now().format("%H:%M:%S"),
            content.trim_end()
        ));
        if let Some(meta) = metadata {
            body.push_str(&format!("<!-- meta: {} -->\n", meta));
        }

        append_to_file(&path, &body)?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Copy content into long-term memory. The short-term record, if any,
    /// remains until compaction.
    pub async fn promote_to_long_term(&self, content: &str, summary: Option<&str>) -> Result<()> {
        let mut body = format!("\n## Entry: {}\n\n", Local::now().format("%Y-%m-%dT%H:%M:%S"));
        if let Some(summary) = summary {
            body.push_str(&format!("**Summary:** {}\n\n", summary));
        }
        body.push_str(&format!("{}\n", content.trim_end()));

        append_to_file(&self.long_term_path(), &body)?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Retire daily files `days_to_keep` or more days old, per the
    /// configured retention strategy. Retired files leave the searchable
    /// set either way; `archive` (and `summarize`) keep the text under
    /// `archive/`.
    pub async fn compact_short_term(&self, days_to_keep: Option<u32>) -> Result<CompactResult> {
        let days_to_keep = days_to_keep.unwrap_or(self.config.retention.days_to_keep) as i64;
        let strategy = self.config.retention.strategy.as_str();
        let today = Local::now().date_naive();

        let mut result = CompactResult::default();

        for entry in std::fs::read_dir(self.memory_dir())? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(file_date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") else {
                continue;
            };
            if (today - file_date).num_days() < days_to_keep {
                continue;
            }

            if strategy == "summarize" {
                let content = std::fs::read_to_string(&path)?;
                let summary: String = content.chars().take(500).collect::<String>().replace('\n', " ");
                self.promote_to_long_term(
                    &format!("Summary of {}:\n\n{}", file_date, summary.trim()),
                    Some(&format!("Daily summary for {}", file_date)),
                )
                .await?;
            }

            let path_key = path.to_string_lossy().to_string();
            if strategy == "delete" {
                std::fs::remove_file(&path)?;
            } else {
                let archive_dir = self.workspace_dir.join("archive");
                std::fs::create_dir_all(&archive_dir)?;
                std::fs::rename(&path, archive_dir.join(entry.file_name()))?;
                result.files_archived += 1;
            }

            self.indexer
                .delete_index(&path_key, SOURCE_SHORT_TERM)
                .await?;
            result.files_compacted += 1;
            info!(path = %path_key, strategy, "compacted short-term file");
        }

        Ok(result)
    }

    // === Index management ===

    /// Re-index `MEMORY.md` and every daily file, and drop index records
    /// for memory files deleted on disk. Per-file failures are collected
    /// without corrupting the index for other files.
    pub async fn sync(&self) -> Result<SyncResult> {
        let mut result = SyncResult::default();
        let mut on_disk: Vec<String> = Vec::new();

        let long_term = self.long_term_path();
        if long_term.exists() {
            self.sync_file(&long_term, SOURCE_LONG_TERM, &mut result, &mut on_disk)
                .await;
        }

        for entry in WalkDir::new(self.memory_dir()).into_iter().flatten() {
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if ext != "md" && ext != "markdown" {
                continue;
            }
            self.sync_file(path, SOURCE_SHORT_TERM, &mut result, &mut on_disk)
                .await;
        }

        for source in [SOURCE_SHORT_TERM, SOURCE_LONG_TERM] {
            for file in self.store.list_files(Some(source)).await? {
                if !on_disk.contains(&file.path) {
                    info!(path = %file.path, "removing deleted file from index");
                    self.store.delete_file(&file.path, source).await?;
                    result.files_removed += 1;
                }
            }
        }

        let pruned = self
            .store
            .prune_cache(self.config.embedding.cache_max_entries)
            .await?;
        if pruned > 0 {
            debug!(pruned, "evicted old embedding cache entries");
        }

        self.dirty.store(false, Ordering::SeqCst);
        debug!(
            synced = result.files_synced,
            removed = result.files_removed,
            chunks = result.chunks_indexed,
            "memory sync complete"
        );
        Ok(result)
    }

    async fn sync_file(
        &self,
        path: &Path,
        source: &str,
        result: &mut SyncResult,
        on_disk: &mut Vec<String>,
    ) {
        let path_key = path.to_string_lossy().to_string();
        on_disk.push(path_key.clone());

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                result.errors.push(format!("{}: {}", path_key, e));
                return;
            }
        };

        match self.indexer.index_file(&path_key, &content, source).await {
            Ok(index_result) => {
                result.files_synced += 1;
                result.chunks_indexed += index_result.chunks_added;
            }
            Err(e) => {
                warn!(path = %path_key, error = %e, "failed to index memory file");
                result.errors.push(format!("{}: {}", path_key, e));
            }
        }
    }

    /// Index arbitrary external content (e.g. docs or skills) under the
    /// given source tag.
    pub async fn index_file(&self, path: &str, content: &str, source: &str) -> Result<IndexResult> {
        self.indexer.index_file(path, content, source).await
    }

    /// Remove a path from the index. No error if it was never indexed.
    pub async fn delete_index(&self, path: &str, source: &str) -> Result<()> {
        self.indexer.delete_index(path, source).await
    }

    // === Search API ===

    /// Hybrid search over everything indexed. Syncs first when memory
    /// files changed since the last sync.
    pub async fn search(
        &self,
        query: &str,
        max_results: usize,
        min_score: Option<f64>,
    ) -> Result<SearchOutcome> {
        if self.dirty.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.sync().await {
                self.dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
        self.searcher.search(query, max_results, min_score, None).await
    }

    // === Stats ===

    pub async fn stats(&self) -> Result<MemoryStats> {
        self.store.stats().await
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // === File watching ===

    /// Watch the workspace for markdown changes and re-index them after
    /// the debounce window. The watcher only sees filesystem events; the
    /// indexer's hash check absorbs touches that don't change content.
    pub fn start_watching(&mut self) -> Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        let callback: ChangeCallback = Arc::new(move |path: &Path| {
            let _ = tx.send(path.to_path_buf());
        });

        let watcher = FileWatcher::start(
            &[self.workspace_dir.clone()],
            &self.config.watch,
            callback,
        )?;

        let indexer = self.indexer.clone();
        let memory_dir = self.memory_dir();
        let long_term = self.long_term_path();
        let archive_dir = self.workspace_dir.join("archive");

        let task = tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                let source = if path == long_term {
                    SOURCE_LONG_TERM
                } else if path.starts_with(&memory_dir) {
                    SOURCE_SHORT_TERM
                } else if path.starts_with(&archive_dir) {
                    continue;
                } else {
                    continue;
                };

                let path_key = path.to_string_lossy().to_string();
                let outcome = match std::fs::read_to_string(&path) {
                    Ok(content) => indexer.index_file(&path_key, &content, source).await.map(|_| ()),
                    // Gone between the event and now: drop its index
                    Err(_) => indexer.delete_index(&path_key, source).await,
                };
                if let Err(e) = outcome {
                    warn!(path = %path_key, error = %e, "watch-triggered reindex failed");
                }
            }
        });

        self.watcher = Some(watcher);
        self.reindex_task = Some(task);
        info!(dir = %self.workspace_dir.display(), "watching workspace for changes");
        Ok(())
    }

    /// Stop watching. No re-index callbacks run after this returns.
    pub async fn stop_watching(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }
        if let Some(task) = self.reindex_task.take() {
            let _ = task.await;
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// Release the watcher and database pool.
    pub async fn close(mut self) {
        self.stop_watching().await;
        self.store.close().await;
    }
}

fn short_term_header(date: NaiveDate) -> String {
    format!(
        "# Session {}\n\n## Metadata\n- Created: {}\n- Source: auto-generated\n\n## Content\n",
        date.format("%Y-%m-%d"),
        Local::now().format("%Y-%m-%dT%H:%M:%S"),
    )
}

fn append_to_file(path: &Path, body: &str) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(body.as_bytes())?;
    Ok(())
}
