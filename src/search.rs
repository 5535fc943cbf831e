//! Hybrid search: vector similarity fused with BM25 lexical relevance.
//!
//! Each channel is over-fetched, its scores are min-max normalized into
//! [0, 1] independently, and the two signals are combined per chunk as
//! `vector_weight * v + text_weight * k` (a missing signal contributes 0).
//! Long-term memory chunks receive a configured priority bonus before the
//! final sort. Ties break by `updated_at` (newest first), then chunk id
//! ascending, so repeated searches are byte-stable.
//!
//! A query-embedding failure fails the call unless `lexical_fallback` is
//! configured, in which case the search degrades to lexical-only and the
//! outcome is flagged as degraded — never silently.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::config::SearchConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::models::{MatchKind, SearchResult, SOURCE_LONG_TERM};
use crate::store::{SearchHit, Store};

/// Search results plus a flag marking lexical-only degradation.
#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    pub degraded: bool,
}

pub struct Searcher {
    store: Arc<Store>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    config: SearchConfig,
}

impl Searcher {
    pub fn new(
        store: Arc<Store>,
        provider: Option<Arc<dyn EmbeddingProvider>>,
        config: SearchConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Run a hybrid search. `min_score` defaults to the configured
    /// threshold; results below it are dropped. An empty result list is
    /// not an error.
    pub async fn search(
        &self,
        query: &str,
        max_results: usize,
        min_score: Option<f64>,
        source_filter: Option<&str>,
    ) -> Result<SearchOutcome> {
        if query.trim().is_empty() || max_results == 0 {
            return Ok(SearchOutcome::default());
        }

        let min_score = min_score.unwrap_or(self.config.min_score);
        let candidates = max_results * self.config.candidate_multiplier;

        let (query_vec, degraded) = self.embed_query(query).await?;

        let (vector_hits, lexical_hits) = tokio::join!(
            async {
                match &query_vec {
                    Some(qv) => self.store.search_vectors(qv, candidates, source_filter).await,
                    None => Ok(Vec::new()),
                }
            },
            self.store.search_lexical(query, candidates, source_filter),
        );
        let vector_hits = vector_hits?;
        let lexical_hits = lexical_hits?;

        let vector_norm = normalize_scores(&vector_hits);
        let lexical_norm = normalize_scores(&lexical_hits);

        // Lexical-only degradation ranks purely by the lexical signal
        // instead of scaling it by text_weight.
        let (vector_weight, text_weight) = if query_vec.is_none() {
            (0.0, 1.0)
        } else {
            (self.config.vector_weight, self.config.text_weight)
        };

        // Merge both channels by chunk id
        let mut merged: HashMap<&str, (f64, f64)> = HashMap::new();
        for (id, score) in &vector_norm {
            merged.entry(id).or_insert((0.0, 0.0)).0 = *score;
        }
        for (id, score) in &lexical_norm {
            merged.entry(id).or_insert((0.0, 0.0)).1 = *score;
        }

        let mut results = Vec::with_capacity(merged.len());
        for (chunk_id, (v, k)) in &merged {
            let chunk = match self.store.get_chunk(chunk_id).await? {
                Some(chunk) => chunk,
                // Deleted between candidate fetch and enrichment
                None => continue,
            };

            let mut score = vector_weight * v + text_weight * k;
            if chunk.source == SOURCE_LONG_TERM {
                score = self.apply_boost(score);
            }
            if score < min_score {
                continue;
            }

            let matched_by = match (*v > 0.0, *k > 0.0) {
                (true, true) => MatchKind::Both,
                (false, true) => MatchKind::Keyword,
                _ => MatchKind::Vector,
            };

            results.push((chunk.updated_at, SearchResult {
                chunk_id: chunk.id.clone(),
                path: chunk.path,
                source: chunk.source,
                snippet: make_snippet(&chunk.text),
                text: chunk.text,
                score,
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                matched_by,
            }));
        }

        // Deterministic order: score desc, recency desc, chunk id asc
        results.sort_by(|(a_updated, a), (b_updated, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b_updated.cmp(a_updated))
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        results.truncate(max_results);

        Ok(SearchOutcome {
            results: results.into_iter().map(|(_, r)| r).collect(),
            degraded,
        })
    }

    /// Embed the query, or decide on lexical-only degradation.
    async fn embed_query(&self, query: &str) -> Result<(Option<Vec<f32>>, bool)> {
        match &self.provider {
            Some(provider) => match provider.embed(query).await {
                Ok(vector) => Ok((Some(vector), false)),
                Err(e) if self.config.lexical_fallback => {
                    warn!(error = %e, "query embedding failed, degrading to lexical-only search");
                    Ok((None, true))
                }
                Err(e) => Err(e),
            },
            None if self.config.lexical_fallback => Ok((None, true)),
            None => Err(Error::Embedding(
                "no embedding provider configured and lexical_fallback is disabled".into(),
            )),
        }
    }

    fn apply_boost(&self, score: f64) -> f64 {
        match self.config.long_term_boost_mode.as_str() {
            "multiplicative" => score * (1.0 + self.config.long_term_boost),
            _ => score + self.config.long_term_boost,
        }
    }
}

/// Min-max normalize raw channel scores into [0, 1]. A set of identical
/// scores normalizes to 1.0 (every hit is equally the best the channel
/// found).
fn normalize_scores(hits: &[SearchHit]) -> Vec<(String, f64)> {
    if hits.is_empty() {
        return Vec::new();
    }

    let min = hits.iter().map(|h| h.score).fold(f64::INFINITY, f64::min);
    let max = hits
        .iter()
        .map(|h| h.score)
        .fold(f64::NEG_INFINITY, f64::max);

    hits.iter()
        .map(|h| {
            let norm = if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (h.score - min) / (max - min)
            };
            (h.chunk_id.clone(), norm)
        })
        .collect()
}

/// Single-line excerpt of at most 200 characters.
fn make_snippet(text: &str) -> String {
    let mut snippet: String = text.chars().take(200).collect();
    snippet = snippet.replace('\n', " ").trim().to_string();
    if text.chars().count() > 200 {
        snippet.push_str("...");
    }
    snippet
}
