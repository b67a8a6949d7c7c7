use super::mmr::mmr_select;
use crate::config::RetrievalConfig;
use crate::embedding::{EmbeddingClient, EmbeddingClientError, RetryPolicy, embed_with_retry};
use crate::extraction::ChunkMetadata;
use crate::index::{IndexEntry, ScoredPosition, VectorIndex, cosine_similarity};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Candidate breadth for the diversity pass of a hybrid search.
const HYBRID_FETCH_K: usize = 20;
/// Upper bound on the merged pool of the broadening pass.
const BROADENED_POOL_LIMIT: usize = 15;
/// Characters of chunk text hashed into a content fingerprint.
const FINGERPRINT_PREFIX_CHARS: usize = 100;
/// Query words at or below this length are not searched on their own.
const MIN_KEYWORD_CHARS: usize = 3;

const STOP_WORDS: &[&str] = &[
    "about", "above", "after", "again", "also", "been", "before", "being", "below", "between",
    "both", "could", "does", "doing", "down", "during", "each", "from", "further", "give",
    "have", "having", "here", "into", "just", "more", "most", "much", "only", "other", "over",
    "please", "same", "should", "show", "some", "such", "tell", "than", "that", "their",
    "theirs", "them", "then", "there", "these", "they", "this", "those", "through", "under",
    "until", "very", "were", "what", "when", "where", "which", "while", "whom", "will", "with",
    "would", "your", "yours",
];

/// Errors emitted while answering a query.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Query text was blank.
    #[error("query must not be empty")]
    EmptyQuery,
    /// Embedding provider failed to return vectors for the query text.
    #[error("failed to embed query: {0}")]
    Embedding(#[from] EmbeddingClientError),
}

/// How candidates are ranked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Similarity candidates re-ranked for diversity.
    #[default]
    Mmr,
    /// Plain cosine similarity.
    Similarity,
    /// Union of a similarity pass and a diversity pass.
    Hybrid,
}

/// Per-request search settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchOptions {
    /// Results wanted; the configured default applies when absent.
    #[serde(default)]
    pub k: Option<usize>,
    /// Ranking mode.
    #[serde(default)]
    pub mode: SearchMode,
    /// Drop results scoring below this cosine similarity.
    #[serde(default)]
    pub min_score: Option<f32>,
}

/// One retrieved chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    /// Chunk identifier.
    pub chunk_id: String,
    /// Chunk text.
    pub text: String,
    /// Chunk metadata.
    pub metadata: ChunkMetadata,
    /// Cosine similarity to the query.
    pub score: f32,
    /// 1-based selection order of the diversity pass, when one ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Hit {
    position: usize,
    score: f32,
    rank: Option<usize>,
}

/// Similarity and diversity search over one session's index.
pub struct RetrievalEngine {
    client: Arc<dyn EmbeddingClient>,
    retry: RetryPolicy,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    /// Build an engine embedding queries with `client`.
    pub fn new(client: Arc<dyn EmbeddingClient>, retry: RetryPolicy, config: RetrievalConfig) -> Self {
        Self {
            client,
            retry,
            config,
        }
    }

    /// Effective `k` for a request: the default when absent, clamped into `[1, max_k]`.
    pub fn effective_k(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.config.default_k)
            .clamp(1, self.config.max_k.max(1))
    }

    /// Search `index` for `query`. Results are unique by chunk id and sorted by score.
    pub async fn search(
        &self,
        index: &VectorIndex,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }
        if index.is_empty() {
            return Ok(Vec::new());
        }

        let k = self.effective_k(options.k);
        let query_vector = self.embed(&[query.to_string()], index.dimension()).await?;
        let Some(query_vector) = query_vector.into_iter().next() else {
            return Ok(Vec::new());
        };

        let hits: Vec<Hit> = match options.mode {
            SearchMode::Similarity => index
                .similarity_search(&query_vector, k)
                .into_iter()
                .map(|scored| Hit {
                    position: scored.position,
                    score: scored.score,
                    rank: None,
                })
                .collect(),
            SearchMode::Mmr => {
                let fetch_k = k.saturating_mul(self.config.fetch_multiplier);
                let primary = self.mmr(index, &query_vector, k, fetch_k);
                let primary = filter_min_score(primary, options.min_score);
                if primary.len() < self.config.min_useful_results && index.len() > primary.len() {
                    self.broaden(index, query, &query_vector, primary, k).await?
                } else {
                    primary
                }
            }
            SearchMode::Hybrid => {
                let similar = index
                    .similarity_search(&query_vector, k)
                    .into_iter()
                    .map(|scored| Hit {
                        position: scored.position,
                        score: scored.score,
                        rank: None,
                    });
                let diverse = self.mmr(index, &query_vector, k.div_ceil(2), HYBRID_FETCH_K);
                let mut merged = dedupe(index, similar.chain(diverse));
                merged.truncate(k);
                merged
            }
        };

        let mut hits = filter_min_score(hits, options.min_score);
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.position.cmp(&b.position))
        });
        hits.truncate(k);

        tracing::debug!(
            mode = ?options.mode,
            k,
            returned = hits.len(),
            "Search completed"
        );

        Ok(hits
            .into_iter()
            .map(|hit| to_result(&index.entries()[hit.position], hit))
            .collect())
    }

    async fn embed(
        &self,
        texts: &[String],
        dimension: Option<usize>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        embed_with_retry(self.client.as_ref(), texts, dimension, &self.retry).await
    }

    fn mmr(&self, index: &VectorIndex, query: &[f32], k: usize, fetch_k: usize) -> Vec<Hit> {
        let candidates = index.similarity_search(query, fetch_k.max(k));
        mmr_select(index, &candidates, k, self.config.diversity)
            .into_iter()
            .enumerate()
            .map(|(order, scored)| Hit {
                position: scored.position,
                score: scored.score,
                rank: Some(order + 1),
            })
            .collect()
    }

    /// Search again per significant query word, merge, dedupe, and re-rank the pool against
    /// the full query.
    async fn broaden(
        &self,
        index: &VectorIndex,
        query: &str,
        query_vector: &[f32],
        primary: Vec<Hit>,
        k: usize,
    ) -> Result<Vec<Hit>, RetrievalError> {
        let keywords = significant_keywords(query);
        if keywords.is_empty() {
            return Ok(primary);
        }
        tracing::debug!(keywords = ?keywords, primary = primary.len(), "Broadening search");

        let keyword_vectors = self.embed(&keywords, index.dimension()).await?;
        let fetch_k = k.saturating_mul(self.config.fetch_multiplier);
        let mut pool: Vec<Hit> = primary;
        for vector in &keyword_vectors {
            pool.extend(self.mmr(index, vector, k, fetch_k));
        }

        let mut pool = dedupe(index, pool);
        pool.truncate(BROADENED_POOL_LIMIT);

        let mut rescored: Vec<ScoredPosition> = pool
            .iter()
            .map(|hit| ScoredPosition {
                position: hit.position,
                score: cosine_similarity(query_vector, &index.entries()[hit.position].embedding),
            })
            .collect();
        rescored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

        Ok(mmr_select(index, &rescored, k, self.config.diversity)
            .into_iter()
            .enumerate()
            .map(|(order, scored)| Hit {
                position: scored.position,
                score: scored.score,
                rank: Some(order + 1),
            })
            .collect())
    }
}

fn filter_min_score(hits: Vec<Hit>, min_score: Option<f32>) -> Vec<Hit> {
    match min_score {
        Some(threshold) => hits.into_iter().filter(|hit| hit.score >= threshold).collect(),
        None => hits,
    }
}

/// Keep the first hit per chunk id and per content fingerprint.
fn dedupe(index: &VectorIndex, hits: impl IntoIterator<Item = Hit>) -> Vec<Hit> {
    let mut seen_ids = HashSet::new();
    let mut seen_fingerprints = HashSet::new();
    hits.into_iter()
        .filter(|hit| {
            let entry = &index.entries()[hit.position];
            seen_ids.insert(entry.chunk_id.clone()) && seen_fingerprints.insert(fingerprint(entry))
        })
        .collect()
}

/// Source, page, and a digest of the opening text.
fn fingerprint(entry: &IndexEntry) -> String {
    let prefix: String = entry.text.chars().take(FINGERPRINT_PREFIX_CHARS).collect();
    let digest = hex::encode(Sha256::digest(prefix.as_bytes()));
    format!(
        "{}/{}/{}",
        entry.metadata.source,
        entry
            .metadata
            .page
            .map(|page| page.to_string())
            .unwrap_or_default(),
        digest
    )
}

fn significant_keywords(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .split_whitespace()
        .map(|word| {
            word.trim_matches(|ch: char| !ch.is_alphanumeric() && ch != '$' && ch != '%')
                .to_string()
        })
        .filter(|word| word.chars().count() > MIN_KEYWORD_CHARS)
        .filter(|word| !STOP_WORDS.contains(&word.to_lowercase().as_str()))
        .filter(|word| seen.insert(word.to_lowercase()))
        .collect()
}

fn to_result(entry: &IndexEntry, hit: Hit) -> RetrievalResult {
    RetrievalResult {
        chunk_id: entry.chunk_id.clone(),
        text: entry.text.clone(),
        metadata: entry.metadata.clone(),
        score: hit.score,
        rank: hit.rank,
    }
}
