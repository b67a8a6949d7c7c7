//! Query-time search over a session index: cosine candidates, MMR re-ranking, keyword
//! broadening when results are sparse, and content-fingerprint deduplication.

mod engine;
mod mmr;

pub use engine::{RetrievalEngine, RetrievalError, RetrievalResult, SearchMode, SearchOptions};
