use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Top-level configuration. Every section is optional in the TOML file;
/// defaults reproduce a working local setup with embeddings disabled.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Root directory holding `MEMORY.md`, `memory/`, `archive/`, and the
    /// database file.
    #[serde(default = "default_workspace_dir")]
    pub dir: PathBuf,
    /// Database path override. Defaults to `<dir>/memory.db`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            dir: default_workspace_dir(),
            db_path: None,
        }
    }
}

impl WorkspaceConfig {
    /// Workspace directory with a leading `~` expanded.
    pub fn resolved_dir(&self) -> PathBuf {
        expand_tilde(&self.dir)
    }
}

fn default_workspace_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".mnemo"))
        .unwrap_or_else(|| PathBuf::from(".mnemo"))
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(dirs) = directories::BaseDirs::new() {
            return dirs.home_dir().join(stripped);
        }
    }
    path.to_path_buf()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            overlap_tokens: default_overlap_tokens(),
        }
    }
}

fn default_target_tokens() -> usize {
    400
}
fn default_overlap_tokens() -> usize {
    80
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Weight of the normalized vector-similarity signal.
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    /// Weight of the normalized lexical (BM25) signal.
    #[serde(default = "default_text_weight")]
    pub text_weight: f64,
    /// Over-fetch factor: each channel is asked for
    /// `max_results * candidate_multiplier` candidates before fusion.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    /// Default minimum combined score; results below it are dropped.
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    /// Bonus applied to chunks from long-term memory before the final sort.
    #[serde(default = "default_long_term_boost")]
    pub long_term_boost: f64,
    /// `"additive"` or `"multiplicative"`.
    #[serde(default = "default_boost_mode")]
    pub long_term_boost_mode: String,
    /// Allow search to degrade to lexical-only when query embedding fails
    /// or no provider is configured. Degradation is always flagged.
    #[serde(default)]
    pub lexical_fallback: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            text_weight: default_text_weight(),
            candidate_multiplier: default_candidate_multiplier(),
            min_score: default_min_score(),
            long_term_boost: default_long_term_boost(),
            long_term_boost_mode: default_boost_mode(),
            lexical_fallback: false,
        }
    }
}

fn default_vector_weight() -> f64 {
    0.7
}
fn default_text_weight() -> f64 {
    0.3
}
fn default_candidate_multiplier() -> usize {
    3
}
fn default_min_score() -> f64 {
    0.25
}
fn default_long_term_boost() -> f64 {
    0.1
}
fn default_boost_mode() -> String {
    "additive".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `openai`, or `ollama`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible endpoint or Ollama host).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Cap on embedding-cache rows; oldest entries are pruned past it.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: i64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_cache_max_entries() -> i64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Quiet window after the last raw event before a change fires.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Scan interval for the polling fallback.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Skip the OS-notification backend and poll unconditionally.
    #[serde(default)]
    pub force_polling: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce_ms(),
            poll_interval_secs: default_poll_interval_secs(),
            force_polling: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_debounce_ms() -> u64 {
    1000
}
fn default_poll_interval_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    /// Daily files younger than this many days survive compaction.
    #[serde(default = "default_days_to_keep")]
    pub days_to_keep: u32,
    /// `archive`, `delete`, or `summarize`.
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days_to_keep: default_days_to_keep(),
            strategy: default_strategy(),
        }
    }
}

fn default_days_to_keep() -> u32 {
    7
}
fn default_strategy() -> String {
    "archive".to_string()
}

impl Config {
    /// Resolved database path.
    pub fn db_path(&self) -> PathBuf {
        self.workspace
            .db_path
            .clone()
            .map(|p| expand_tilde(&p))
            .unwrap_or_else(|| self.workspace.resolved_dir().join("memory.db"))
    }

    /// Validate cross-field constraints. Called by [`load_config`]; callers
    /// constructing a `Config` by hand should call it too.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.target_tokens == 0 {
            return Err(Error::Config("chunking.target_tokens must be > 0".into()));
        }
        if self.chunking.overlap_tokens >= self.chunking.target_tokens {
            return Err(Error::Config(
                "chunking.overlap_tokens must be smaller than target_tokens".into(),
            ));
        }
        for (name, w) in [
            ("search.vector_weight", self.search.vector_weight),
            ("search.text_weight", self.search.text_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(Error::Config(format!("{} must be in [0.0, 1.0]", name)));
            }
        }
        if self.search.vector_weight + self.search.text_weight <= 0.0 {
            return Err(Error::Config(
                "search weights must not both be zero".into(),
            ));
        }
        if self.search.candidate_multiplier == 0 {
            return Err(Error::Config(
                "search.candidate_multiplier must be >= 1".into(),
            ));
        }
        match self.search.long_term_boost_mode.as_str() {
            "additive" | "multiplicative" => {}
            other => {
                return Err(Error::Config(format!(
                    "unknown long_term_boost_mode: '{}'. Use additive or multiplicative.",
                    other
                )))
            }
        }
        match self.embedding.provider.as_str() {
            "disabled" => {}
            "openai" | "ollama" => {
                if self.embedding.model.is_none() {
                    return Err(Error::Config(format!(
                        "embedding.model must be set when provider is '{}'",
                        self.embedding.provider
                    )));
                }
                if self.embedding.dims.unwrap_or(0) == 0 {
                    return Err(Error::Config(format!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        self.embedding.provider
                    )));
                }
            }
            other => {
                return Err(Error::Config(format!(
                    "unknown embedding provider: '{}'. Use disabled, openai, or ollama.",
                    other
                )))
            }
        }
        match self.retention.strategy.as_str() {
            "archive" | "delete" | "summarize" => {}
            other => {
                return Err(Error::Config(format!(
                    "unknown retention strategy: '{}'. Use archive, delete, or summarize.",
                    other
                )))
            }
        }
        Ok(())
    }
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    let config: Config =
        toml::from_str(&content).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from `path` if it exists, otherwise fall back to
/// defaults. Used by the CLI so `mnemo` works out of the box.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }
}
