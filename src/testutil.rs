//! Shared test helpers.

use async_trait::async_trait;
use std::sync::atomic::AtomicUsize;

use crate::embedding::EmbeddingProvider;
use crate::error::Result;

pub(crate) const KEYWORDS: [&str; 8] = [
    "rust", "python", "database", "memory", "search", "network", "cooking", "music",
];

/// Deterministic bag-of-keywords embedder: each dimension is 1.0 when the
/// text contains that keyword. Lets vector search distinguish topics in
/// tests, and counts provider traffic for cache assertions.
pub(crate) struct MockEmbedder {
    pub calls: AtomicUsize,
    pub texts_embedded: AtomicUsize,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            texts_embedded: AtomicUsize::new(0),
        }
    }

    pub fn keyword_embedding(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        KEYWORDS
            .iter()
            .map(|kw| if lower.contains(kw) { 1.0 } else { 0.0 })
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    fn id(&self) -> &str {
        "mock"
    }
    fn model(&self) -> &str {
        "mock-model"
    }
    fn dims(&self) -> usize {
        KEYWORDS.len()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        use std::sync::atomic::Ordering;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::keyword_embedding(t)).collect())
    }
}
