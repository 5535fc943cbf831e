//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and two concrete backends:
//! - **[`OpenAiProvider`]** — any OpenAI-compatible `/embeddings` endpoint,
//!   with batching, retry, and exponential backoff.
//! - **[`OllamaProvider`]** — a local Ollama instance's `/api/embed` endpoint.
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] — encode a `Vec<f32>` as little-endian bytes for SQLite
//! - [`blob_to_vec`] — decode a SQLite BLOB back into a `Vec<f32>`
//!
//! # Retry Strategy
//!
//! HTTP 429 and 5xx responses and network errors are retried with
//! exponential backoff (1s, 2s, 4s, ... capped at 32s); other 4xx responses
//! fail immediately. The request timeout (`timeout_secs`) is the deadline:
//! a timed-out call fails cleanly with a recoverable [`Error::Embedding`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// The embedding capability consumed by the indexer and searcher.
///
/// Concrete providers are interchangeable trait objects selected at
/// construction time; vectors share a fixed dimensionality per
/// `(provider, model)`.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider identifier (e.g. `"openai"`).
    fn id(&self) -> &str;
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model(&self) -> &str;
    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a single query text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("empty embedding response".into()))
    }

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Cache key component: `"{id}:{model}"`.
    fn provider_key(&self) -> String {
        format!("{}:{}", self.id(), self.model())
    }
}

/// Create the configured provider, or `None` when embeddings are disabled.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAiProvider::new(config)?))),
        "ollama" => Ok(Some(Arc::new(OllamaProvider::new(config)?))),
        other => Err(Error::Config(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ OpenAI-compatible provider ============

/// Embedding provider for OpenAI-compatible HTTP APIs.
///
/// Posts to `{base_url}/embeddings` with the configured model. The base URL
/// defaults to the OpenAI API and can point at any compatible server.
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiProvider {
    model: String,
    dims: usize,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    max_retries: u32,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Config("embedding.model required for openai provider".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| Error::Config("embedding.dims required for openai provider".into()))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Config("OPENAI_API_KEY environment variable not set".into()))?;
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Embedding(e.to_string()))?;

        Ok(Self {
            model,
            dims,
            base_url,
            api_key,
            client,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn id(&self) -> &str {
        "openai"
    }
    fn model(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let json = request_with_retry(
            &self.client,
            &url,
            Some(self.api_key.as_str()),
            &body,
            self.max_retries,
        )
        .await?;

        let data = json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| Error::Embedding("invalid response: missing data array".into()))?;

        let mut embeddings = Vec::with_capacity(data.len());
        for item in data {
            let values = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| Error::Embedding("invalid response: missing embedding".into()))?;
            embeddings.push(
                values
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect(),
            );
        }

        Ok(embeddings)
    }
}

// ============ Ollama provider ============

/// Embedding provider backed by a local Ollama instance.
///
/// Posts to `{url}/api/embed` (default `http://localhost:11434`). Requires
/// an embedding model to be pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
    max_retries: u32,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Config("embedding.model required for ollama provider".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| Error::Config("embedding.dims required for ollama provider".into()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Embedding(e.to_string()))?;

        Ok(Self {
            model,
            dims,
            url,
            client,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn id(&self) -> &str {
        "ollama"
    }
    fn model(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let json = request_with_retry(&self.client, &url, None, &body, self.max_retries).await?;

        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::Embedding("invalid response: missing embeddings array".into()))?;

        let mut result = Vec::with_capacity(embeddings.len());
        for embedding in embeddings {
            let values = embedding
                .as_array()
                .ok_or_else(|| Error::Embedding("invalid response: embedding is not an array".into()))?;
            result.push(
                values
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect(),
            );
        }

        Ok(result)
    }
}

/// POST `body` to `url`, retrying 429/5xx/network errors with exponential
/// backoff. Non-429 client errors fail immediately.
async fn request_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(key) = bearer {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response
                        .json()
                        .await
                        .map_err(|e| Error::Embedding(format!("invalid response body: {}", e)));
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(Error::Embedding(format!(
                        "{} returned {}: {}",
                        url, status, body_text
                    )));
                    continue;
                }

                return Err(Error::Embedding(format!(
                    "{} returned {}: {}",
                    url, status, body_text
                )));
            }
            Err(e) => {
                last_err = Some(Error::Embedding(format!("request to {} failed: {}", url, e)));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::Embedding("embedding failed after retries".into())))
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes, producing a BLOB of `vec.len() × 4`
/// bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector. Reverses [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors or vectors of
/// different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
