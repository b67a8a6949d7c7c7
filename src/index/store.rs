//! In-memory vector index with exact cosine search.

use super::IndexError;
use crate::extraction::{Chunk, ChunkMetadata};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

/// Shared, immutable view of a session's index.
pub type IndexHandle = Arc<VectorIndex>;

/// One embedded chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Chunk identifier.
    pub chunk_id: String,
    /// Embedding vector.
    pub embedding: Vec<f32>,
    /// Chunk text.
    pub text: String,
    /// Chunk metadata.
    pub metadata: ChunkMetadata,
}

impl IndexEntry {
    /// Pair a chunk with its embedding.
    pub fn from_chunk(chunk: Chunk, embedding: Vec<f32>) -> Self {
        Self {
            chunk_id: chunk.id,
            embedding,
            text: chunk.text,
            metadata: chunk.metadata,
        }
    }
}

/// Position and cosine score of a search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredPosition {
    /// Offset into [`VectorIndex::entries`].
    pub position: usize,
    /// Cosine similarity to the query.
    pub score: f32,
}

/// Ordered entries sharing one embedding dimension.
#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    dimension: Option<usize>,
    entries: Vec<IndexEntry>,
    ids: HashSet<String>,
}

impl VectorIndex {
    /// Empty index; the dimension is fixed by the first insert.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an index from persisted entries, validating their shape.
    pub fn from_entries(entries: Vec<IndexEntry>) -> Result<Self, IndexError> {
        let mut index = Self::new();
        for entry in entries {
            index.push(entry)?;
        }
        Ok(index)
    }

    /// Embedding width shared by every entry, once known.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Whether a chunk id is already indexed.
    pub fn contains(&self, chunk_id: &str) -> bool {
        self.ids.contains(chunk_id)
    }

    /// Append an entry. Duplicate ids and mismatched dimensions are rejected.
    pub fn push(&mut self, entry: IndexEntry) -> Result<(), IndexError> {
        if entry.embedding.is_empty() {
            return Err(IndexError::Corrupt(format!(
                "entry {} has an empty embedding",
                entry.chunk_id
            )));
        }
        match self.dimension {
            Some(expected) if expected != entry.embedding.len() => {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: entry.embedding.len(),
                });
            }
            Some(_) => {}
            None => self.dimension = Some(entry.embedding.len()),
        }
        if !self.ids.insert(entry.chunk_id.clone()) {
            return Err(IndexError::DuplicateEntry(entry.chunk_id));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Exact top-`limit` cosine search, highest score first.
    pub fn similarity_search(&self, query: &[f32], limit: usize) -> Vec<ScoredPosition> {
        if limit == 0 || self.entries.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<ScoredPosition> = self
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| ScoredPosition {
                position,
                score: cosine_similarity(query, &entry.embedding),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.position.cmp(&b.position))
        });
        scored.truncate(limit);
        scored
    }
}

/// Cosine similarity; zero when either vector has no magnitude or widths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
