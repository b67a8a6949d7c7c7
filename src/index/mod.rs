//! Per-session vector index: in-memory store, on-disk checkpoints, and the batching manager
//! that embeds chunks into it.

mod manager;
pub mod persist;
mod store;

pub use manager::{EmbedOutcome, IndexManager};
pub use persist::Manifest;
pub use store::{IndexEntry, IndexHandle, ScoredPosition, VectorIndex, cosine_similarity};

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building, persisting, or loading an index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Reading or writing the session directory failed.
    #[error("index persistence failed at {path}: {source}")]
    Persistence {
        /// File being read or written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Snapshot or manifest could not be encoded or decoded.
    #[error("index serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// An entry's embedding width differs from the index's.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Width of existing entries.
        expected: usize,
        /// Width of the rejected entry.
        actual: usize,
    },
    /// Chunk id already present in the index.
    #[error("chunk {0} is already indexed")]
    DuplicateEntry(String),
    /// Persisted data is structurally invalid.
    #[error("index data is corrupt: {0}")]
    Corrupt(String),
}
