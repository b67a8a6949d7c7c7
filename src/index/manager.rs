use super::IndexError;
use super::persist;
use super::store::{IndexEntry, IndexHandle, VectorIndex};
use crate::config::EmbeddingConfig;
use crate::embedding::{EmbeddingClient, RetryPolicy, embed_with_retry};
use crate::extraction::Chunk;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Result of an embed-and-store run.
#[derive(Debug, Clone)]
pub struct EmbedOutcome {
    /// Index after the run; equal to the last checkpoint written.
    pub handle: IndexHandle,
    /// Chunks embedded and appended.
    pub embedded: usize,
    /// Chunks dropped because their embedding failed even on its own.
    pub failed: usize,
    /// Chunks already present in the index (or repeated in the input) and not re-embedded.
    pub skipped_duplicates: usize,
    /// Batches sent to the provider.
    pub batches: usize,
}

/// Embeds chunks in bounded batches and checkpoints the session index after each batch.
pub struct IndexManager {
    client: Arc<dyn EmbeddingClient>,
    batch_size: usize,
    retry: RetryPolicy,
}

impl IndexManager {
    /// Build a manager from embedding settings.
    pub fn new(client: Arc<dyn EmbeddingClient>, config: &EmbeddingConfig) -> Self {
        Self::with_policy(client, config.batch_size, RetryPolicy::from_config(config))
    }

    /// Build a manager with an explicit batch size and retry policy.
    pub fn with_policy(
        client: Arc<dyn EmbeddingClient>,
        batch_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            batch_size: batch_size.max(1),
            retry,
        }
    }

    /// Load the persisted index from `storage`, if one exists.
    pub async fn load(&self, storage: &Path) -> Result<Option<IndexHandle>, IndexError> {
        Ok(persist::load(storage)
            .await?
            .map(|(index, manifest)| {
                tracing::debug!(
                    storage = %storage.display(),
                    chunk_count = manifest.chunk_count,
                    "Loaded index snapshot"
                );
                Arc::new(index)
            }))
    }

    /// Embed `chunks` and append them to the index in `storage`.
    ///
    /// `current` is the in-memory handle when the caller already holds one; otherwise the
    /// persisted snapshot (if any) is loaded and extended.
    pub async fn embed_and_store(
        &self,
        storage: &Path,
        current: Option<IndexHandle>,
        chunks: Vec<Chunk>,
    ) -> Result<EmbedOutcome, IndexError> {
        let base = match current {
            Some(handle) => handle,
            None => self
                .load(storage)
                .await?
                .unwrap_or_else(|| Arc::new(VectorIndex::new())),
        };
        let working = VectorIndex::clone(&base);
        self.embed_into(storage, working, chunks, false).await
    }

    /// Replace the index in `storage` with one built from `chunks` alone.
    pub async fn rebuild(
        &self,
        storage: &Path,
        chunks: Vec<Chunk>,
    ) -> Result<EmbedOutcome, IndexError> {
        tracing::info!(storage = %storage.display(), chunks = chunks.len(), "Rebuilding index");
        self.embed_into(storage, VectorIndex::new(), chunks, true)
            .await
    }

    async fn embed_into(
        &self,
        storage: &Path,
        mut working: VectorIndex,
        chunks: Vec<Chunk>,
        always_checkpoint: bool,
    ) -> Result<EmbedOutcome, IndexError> {
        let (pending, skipped_duplicates) = dedupe_against(&working, chunks);
        let mut embedded = 0usize;
        let mut failed = 0usize;
        let mut batches = 0usize;
        let mut checkpointed = false;

        for batch in pending.chunks(self.batch_size) {
            batches += 1;
            let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
            let added = match embed_with_retry(
                self.client.as_ref(),
                &texts,
                working.dimension(),
                &self.retry,
            )
            .await
            {
                Ok(vectors) => {
                    let mut added = 0usize;
                    for (chunk, vector) in batch.iter().zip(vectors) {
                        working.push(IndexEntry::from_chunk(chunk.clone(), vector))?;
                        added += 1;
                    }
                    added
                }
                Err(error) => {
                    tracing::warn!(
                        batch = batches,
                        batch_size = batch.len(),
                        error = %error,
                        "Batch embedding failed; retrying chunks individually"
                    );
                    let (added, dropped) = self.embed_individually(&mut working, batch).await?;
                    failed += dropped;
                    added
                }
            };

            if added > 0 {
                persist::save(storage, &working).await?;
                checkpointed = true;
                embedded += added;
            }
        }

        if always_checkpoint && !checkpointed {
            persist::save(storage, &working).await?;
        }

        tracing::info!(
            storage = %storage.display(),
            embedded,
            failed,
            skipped_duplicates,
            batches,
            total = working.len(),
            "Embedded chunks into index"
        );

        Ok(EmbedOutcome {
            handle: Arc::new(working),
            embedded,
            failed,
            skipped_duplicates,
            batches,
        })
    }

    async fn embed_individually(
        &self,
        working: &mut VectorIndex,
        batch: &[Chunk],
    ) -> Result<(usize, usize), IndexError> {
        let mut added = 0usize;
        let mut dropped = 0usize;
        for chunk in batch {
            match embed_with_retry(
                self.client.as_ref(),
                std::slice::from_ref(&chunk.text),
                working.dimension(),
                &self.retry,
            )
            .await
            {
                Ok(mut vectors) => match vectors.pop() {
                    Some(vector) => {
                        working.push(IndexEntry::from_chunk(chunk.clone(), vector))?;
                        added += 1;
                    }
                    None => dropped += 1,
                },
                Err(error) => {
                    tracing::warn!(
                        chunk_id = %chunk.id,
                        source = %chunk.metadata.source,
                        error = %error,
                        "Dropping chunk after embedding failure"
                    );
                    dropped += 1;
                }
            }
        }
        Ok((added, dropped))
    }
}

/// Drop chunks already indexed or repeated within the input, keeping the first occurrence.
fn dedupe_against(index: &VectorIndex, chunks: Vec<Chunk>) -> (Vec<Chunk>, usize) {
    let mut seen = HashSet::new();
    let mut pending = Vec::with_capacity(chunks.len());
    let mut skipped = 0usize;

    for chunk in chunks {
        if index.contains(&chunk.id) || !seen.insert(chunk.id.clone()) {
            skipped += 1;
        } else {
            pending.push(chunk);
        }
    }

    (pending, skipped)
}
