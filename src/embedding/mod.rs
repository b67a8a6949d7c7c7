//! Embedding client abstraction, provider adapters, and the retrying call wrapper used by
//! both ingestion and retrieval.

mod http;
mod retry;

pub use http::{OllamaEmbeddingClient, OpenAiEmbeddingClient};
pub use retry::{RetryPolicy, embed_with_retry};

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingClientError {
    /// Provider was unable to produce embeddings for the supplied input.
    #[error("Failed to generate embeddings: {0}")]
    GenerationFailed(String),
    /// Provider throttled the request.
    #[error("Embedding provider rate limited the request: {0}")]
    RateLimited(String),
    /// Provider could not be reached.
    #[error("Embedding provider unavailable: {0}")]
    Unavailable(String),
    /// Provider answered with a payload that does not match the request.
    #[error("Malformed embedding response: {0}")]
    InvalidResponse(String),
    /// Provider call exceeded the configured timeout.
    #[error("Embedding request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Produce an embedding vector for each supplied chunk of text, in input order.
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError>;
}

/// Deterministic embedding client that hashes word tokens into a fixed-width vector.
///
/// Used for local development and tests; texts sharing vocabulary land close together.
pub struct LocalHashClient {
    dimension: usize,
}

impl LocalHashClient {
    /// Construct a hashing client producing vectors of `dimension` slots.
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn encode(text: &str, dimension: usize) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; dimension];

        if text.is_empty() {
            return embedding;
        }

        let mut tokens = 0usize;
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
        {
            let hash = fnv1a(token.to_lowercase().as_bytes());
            let position = (hash % dimension as u64) as usize;
            let sign = if (hash >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            embedding[position] += sign;
            tokens += 1;
        }

        if tokens == 0 {
            for (idx, byte) in text.bytes().enumerate() {
                let position = idx % dimension;
                embedding[position] += f32::from(byte) / 255.0;
            }
        }

        let norm = embedding
            .iter()
            .map(|value| value * value)
            .sum::<f32>()
            .sqrt();

        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingClient for LocalHashClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if self.dimension == 0 {
            return Err(EmbeddingClientError::GenerationFailed(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }

        if texts.is_empty() {
            return Err(EmbeddingClientError::GenerationFailed(
                "no texts provided".to_string(),
            ));
        }

        Ok(texts
            .iter()
            .map(|text| Self::encode(text, self.dimension))
            .collect())
    }
}

/// Build an embedding client suitable for the supplied configuration.
pub fn get_embedding_client(config: &EmbeddingConfig) -> Arc<dyn EmbeddingClient> {
    tracing::debug!(
        provider = ?config.provider,
        model = %config.model,
        dimension = config.dimension,
        "Building embedding client"
    );
    match config.provider {
        EmbeddingProvider::Local => Arc::new(LocalHashClient::new(config.dimension)),
        EmbeddingProvider::OpenAI => Arc::new(OpenAiEmbeddingClient::new(
            config.base_url.clone(),
            config.api_key.clone().unwrap_or_default(),
            config.model.clone(),
            config.dimension,
        )),
        EmbeddingProvider::Ollama => Arc::new(OllamaEmbeddingClient::new(
            config.base_url.clone(),
            config.model.clone(),
        )),
    }
}
