//! Extraction and chunking pipeline: raw document bytes to ordered, metadata-tagged chunks.

pub mod chunking;
mod loader;
mod metadata;
mod normalize;
mod pipeline;
mod summary;
pub mod types;

pub use chunking::{TextSplitter, TextWindow};
pub use loader::{DocumentFormat, PAGE_STRATEGIES, PageStrategy};
pub use pipeline::{
    DocumentProcessor, FALLBACK_MAX_CHARS, MIN_FALLBACK_CHARS, MIN_NORMALIZED_CHARS,
    MIN_PAGE_CHARS, compute_chunk_id,
};
pub use types::{
    Chunk, ChunkKind, ChunkMetadata, ChunkingError, DocumentInput, DocumentReport,
    DocumentStatus, ExtractionError, ProcessedBatch, Section,
};
