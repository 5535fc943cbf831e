//! Error taxonomy for the memory engine.
//!
//! Storage and I/O failures are fatal to the operation that hit them;
//! embedding failures are recoverable (retry, batch-split, or fail the
//! enclosing call). Deleting a path that was never indexed is not an error,
//! and searching one returns an empty result set.

use thiserror::Error;

/// All errors surfaced by the mnemo library.
#[derive(Debug, Error)]
pub enum Error {
    /// Database failure (I/O, corruption, constraint violation). Fatal:
    /// the current ingest or search operation must abort.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Filesystem failure while reading or writing memory files.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Embedding provider failure (network, rate limit, bad response).
    /// Recoverable: callers may retry or fail the enclosing call.
    #[error("embedding provider error: {0}")]
    Embedding(String),

    /// Chunker contract violation. Should not occur for valid UTF-8 input.
    #[error("chunking error: {0}")]
    Chunking(String),

    /// File watcher failure (OS watch limit, backend initialization).
    #[error("watch error: {0}")]
    Watch(String),

    /// Invalid configuration detected at load time.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether the caller may reasonably retry the operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Embedding(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
