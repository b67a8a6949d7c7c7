//! Timeout and bounded exponential backoff around a single provider call.

use super::{EmbeddingClient, EmbeddingClientError};
use crate::config::EmbeddingConfig;
use std::time::Duration;
use tokio_retry::{
    Retry,
    strategy::{ExponentialBackoff, jitter},
};

const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Retry settings shared by ingestion and query embedding.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub max_retries: usize,
    /// Delay before the first retry; doubles on each subsequent attempt.
    pub base_delay: Duration,
    /// Upper bound for one provider call.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Derive the policy from embedding settings.
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            timeout: config.request_timeout,
        }
    }

    /// A policy that never sleeps between attempts.
    pub const fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            timeout: Duration::from_secs(30),
        }
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> + use<> {
        let factor = (self.base_delay.as_millis() as u64) / 2;
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(MAX_BACKOFF)
            .map(jitter)
            .take(self.max_retries)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EmbeddingConfig::default())
    }
}

/// Call `client` for `texts`, retrying transient failures and rejecting malformed output.
///
/// A response counts as a failure when the vector count differs from the input count, when a
/// vector is empty or carries non-finite values, or when its width differs from
/// `expected_dimension` (or from the first vector when no dimension is known yet).
pub async fn embed_with_retry(
    client: &dyn EmbeddingClient,
    texts: &[String],
    expected_dimension: Option<usize>,
    policy: &RetryPolicy,
) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let mut attempt = 0usize;
    Retry::spawn(policy.backoff(), || {
        attempt += 1;
        let current = attempt;
        let batch = texts.to_vec();
        async move {
            let result = match tokio::time::timeout(policy.timeout, client.generate_embeddings(batch))
                .await
            {
                Ok(Ok(vectors)) => validate(vectors, texts.len(), expected_dimension),
                Ok(Err(error)) => Err(error),
                Err(_) => Err(EmbeddingClientError::Timeout(policy.timeout)),
            };
            if let Err(error) = &result {
                tracing::warn!(
                    attempt = current,
                    batch_size = texts.len(),
                    error = %error,
                    "Embedding attempt failed"
                );
            }
            result
        }
    })
    .await
}

fn validate(
    vectors: Vec<Vec<f32>>,
    expected_count: usize,
    expected_dimension: Option<usize>,
) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
    if vectors.len() != expected_count {
        return Err(EmbeddingClientError::InvalidResponse(format!(
            "expected {expected_count} vectors, received {}",
            vectors.len()
        )));
    }

    let width = expected_dimension.or_else(|| vectors.first().map(Vec::len));
    for (position, vector) in vectors.iter().enumerate() {
        if vector.is_empty() {
            return Err(EmbeddingClientError::InvalidResponse(format!(
                "vector {position} is empty"
            )));
        }
        if Some(vector.len()) != width {
            return Err(EmbeddingClientError::InvalidResponse(format!(
                "vector {position} has dimension {}, expected {}",
                vector.len(),
                width.unwrap_or_default()
            )));
        }
        if vector.iter().any(|value| !value.is_finite()) {
            return Err(EmbeddingClientError::InvalidResponse(format!(
                "vector {position} contains non-finite values"
            )));
        }
    }

    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyClient {
        failures_before_success: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingClient for FlakyClient {
        async fn generate_embeddings(
            &self,
            texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return Err(EmbeddingClientError::Unavailable("warming up".into()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        }
    }

    struct WrongWidthClient;

    #[async_trait]
    impl EmbeddingClient for WrongWidthClient {
        async fn generate_embeddings(
            &self,
            texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            Ok(texts.iter().map(|_| vec![0.5; 4]).collect())
        }
    }

    struct SlowClient;

    #[async_trait]
    impl EmbeddingClient for SlowClient {
        async fn generate_embeddings(
            &self,
            _texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    fn texts(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("chunk {i}")).collect()
    }

    #[tokio::test]
    async fn retries_until_provider_recovers() {
        let client = FlakyClient {
            failures_before_success: 2,
            calls: AtomicUsize::new(0),
        };
        let vectors = embed_with_retry(&client, &texts(2), Some(3), &RetryPolicy::immediate(3))
            .await
            .expect("eventually succeeds");
        assert_eq!(vectors.len(), 2);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let client = FlakyClient {
            failures_before_success: usize::MAX,
            calls: AtomicUsize::new(0),
        };
        let error = embed_with_retry(&client, &texts(1), None, &RetryPolicy::immediate(2))
            .await
            .expect_err("never succeeds");
        assert!(matches!(error, EmbeddingClientError::Unavailable(_)));
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejects_dimension_mismatch() {
        let error = embed_with_retry(&WrongWidthClient, &texts(1), Some(3), &RetryPolicy::immediate(0))
            .await
            .expect_err("wrong width");
        assert!(matches!(error, EmbeddingClientError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn times_out_slow_providers() {
        let policy = RetryPolicy {
            max_retries: 0,
            base_delay: Duration::ZERO,
            timeout: Duration::from_millis(20),
        };
        let error = embed_with_retry(&SlowClient, &texts(1), None, &policy)
            .await
            .expect_err("timed out");
        assert!(matches!(error, EmbeddingClientError::Timeout(_)));
    }

    #[test]
    fn validate_rejects_non_finite_values() {
        let error = validate(vec![vec![f32::NAN, 1.0]], 1, None).expect_err("nan");
        assert!(matches!(error, EmbeddingClientError::InvalidResponse(_)));
    }
}
