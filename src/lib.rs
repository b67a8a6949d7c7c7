#![deny(missing_docs)]

//! Core library for docvault: session-scoped document ingestion, embedding, and retrieval.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Document extraction and chunking.
pub mod extraction;
/// Per-session vector index storage.
pub mod index;
/// Structured logging and tracing setup.
pub mod logging;
/// Service counters.
pub mod metrics;
/// Scheduled inactivity sweeps.
pub mod reaper;
/// Similarity search with diversity re-ranking.
pub mod retrieval;
/// Session facade shared by the HTTP surface and embedders.
pub mod service;
/// Session registry and clocks.
pub mod session;
