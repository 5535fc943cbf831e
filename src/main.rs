//! # mnemo CLI
//!
//! The `mnemo` binary manages a local memory workspace: daily short-term
//! logs, a curated long-term file, and the hybrid search index over both.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mnemo init` | Create the workspace, memory files, and database |
//! | `mnemo sync` | Re-index changed memory files |
//! | `mnemo search "<query>"` | Hybrid (vector + keyword) search |
//! | `mnemo remember "<note>"` | Append to today's short-term log |
//! | `mnemo promote "<note>"` | Add curated long-term memory |
//! | `mnemo compact` | Retire old daily files per retention policy |
//! | `mnemo index <file>` | Index an external text/markdown file |
//! | `mnemo forget <path>` | Remove a path from the index |
//! | `mnemo stats` | Show index statistics |
//! | `mnemo watch` | Watch the workspace and re-index on change |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use mnemo::config;
use mnemo::manager::MemoryManager;
use mnemo::stats;

/// mnemo — a local-first hybrid memory engine for AI tools.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file; without one, defaults are used (workspace at `~/.mnemo`,
/// embeddings disabled). See `config/mnemo.example.toml`.
#[derive(Parser)]
#[command(
    name = "mnemo",
    about = "mnemo — a local-first hybrid memory engine for AI tools",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mnemo.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the workspace directory, memory files, and database.
    ///
    /// Idempotent — running it multiple times is safe.
    Init,

    /// Re-index memory files that changed on disk.
    Sync,

    /// Search indexed memory with fused vector + keyword ranking.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Minimum combined score; defaults to the configured threshold.
        #[arg(long)]
        min_score: Option<f64>,
    },

    /// Append a note to today's short-term memory log.
    Remember {
        /// The note text.
        content: String,

        /// Target date (YYYY-MM-DD) instead of today.
        #[arg(long)]
        date: Option<String>,
    },

    /// Add a note to curated long-term memory.
    Promote {
        /// The note text.
        content: String,

        /// Optional one-line summary recorded with the entry.
        #[arg(long)]
        summary: Option<String>,
    },

    /// Retire daily files older than the retention window.
    Compact {
        /// Days of short-term memory to keep (defaults to config).
        #[arg(long)]
        days: Option<u32>,
    },

    /// Index an external text/markdown file.
    Index {
        /// Path of the file to index.
        path: PathBuf,

        /// Source tag recorded with the file's chunks.
        #[arg(long, default_value = "docs")]
        source: String,
    },

    /// Remove a path from the index. Succeeds even if never indexed.
    Forget {
        /// Indexed path to remove.
        path: String,

        /// Source tag the path was indexed under.
        #[arg(long, default_value = "docs")]
        source: String,
    },

    /// Show index statistics.
    Stats,

    /// Watch the workspace and re-index changed files until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let manager = MemoryManager::open(cfg).await?;
            let report = manager.sync().await?;
            println!("workspace: {}", manager.workspace_dir().display());
            println!("  files indexed: {}", report.files_synced);
            println!("initialized");
            manager.close().await;
        }
        Commands::Sync => {
            let manager = MemoryManager::open(cfg).await?;
            let report = manager.sync().await?;
            println!("sync");
            println!("  files synced: {}", report.files_synced);
            println!("  files removed: {}", report.files_removed);
            println!("  chunks indexed: {}", report.chunks_indexed);
            for error in &report.errors {
                eprintln!("  error: {}", error);
            }
            println!("ok");
            manager.close().await;
        }
        Commands::Search {
            query,
            limit,
            min_score,
        } => {
            let manager = MemoryManager::open(cfg).await?;
            let outcome = manager.search(&query, limit, min_score).await?;

            if outcome.degraded {
                eprintln!("note: keyword-only results (embeddings unavailable)");
            }
            if outcome.results.is_empty() {
                println!("No results.");
            } else {
                for (i, result) in outcome.results.iter().enumerate() {
                    println!(
                        "{}. [{:.2}] {} ({}:{}-{})",
                        i + 1,
                        result.score,
                        result.path,
                        result.source,
                        result.start_line,
                        result.end_line
                    );
                    println!("    \"{}\"", result.snippet);
                }
            }
            manager.close().await;
        }
        Commands::Remember { content, date } => {
            let date = date
                .map(|d| chrono::NaiveDate::parse_from_str(&d, "%Y-%m-%d"))
                .transpose()?;
            let manager = MemoryManager::open(cfg).await?;
            manager.append_to_short_term(&content, date, None).await?;
            println!("remembered");
            manager.close().await;
        }
        Commands::Promote { content, summary } => {
            let manager = MemoryManager::open(cfg).await?;
            manager
                .promote_to_long_term(&content, summary.as_deref())
                .await?;
            println!("promoted to long-term memory");
            manager.close().await;
        }
        Commands::Compact { days } => {
            let manager = MemoryManager::open(cfg).await?;
            let result = manager.compact_short_term(days).await?;
            println!("compact");
            println!("  files compacted: {}", result.files_compacted);
            println!("  files archived: {}", result.files_archived);
            println!("ok");
            manager.close().await;
        }
        Commands::Index { path, source } => {
            let content = std::fs::read_to_string(&path)?;
            let manager = MemoryManager::open(cfg).await?;
            let result = manager
                .index_file(&path.to_string_lossy(), &content, &source)
                .await?;
            println!("indexed {}", result.path);
            println!("  chunks added: {}", result.chunks_added);
            println!("  chunks reused: {}", result.chunks_reused);
            println!("  embeddings computed: {}", result.embeddings_computed);
            println!("  embeddings cached: {}", result.embeddings_cached);
            manager.close().await;
        }
        Commands::Forget { path, source } => {
            let manager = MemoryManager::open(cfg).await?;
            manager.delete_index(&path, &source).await?;
            println!("forgot {}", path);
            manager.close().await;
        }
        Commands::Stats => {
            let manager = MemoryManager::open(cfg).await?;
            stats::run_stats(manager.store()).await?;
            manager.close().await;
        }
        Commands::Watch => {
            let mut manager = MemoryManager::open(cfg).await?;
            manager.sync().await?;
            manager.start_watching()?;
            println!(
                "watching {} (ctrl-c to stop)",
                manager.workspace_dir().display()
            );
            tokio::signal::ctrl_c().await?;
            manager.stop_watching().await;
            manager.close().await;
            println!("stopped");
        }
    }

    Ok(())
}
