use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing ingestion, embedding, and session activity.
#[derive(Default)]
pub struct ServiceMetrics {
    documents_processed: AtomicU64,
    documents_failed: AtomicU64,
    chunks_indexed: AtomicU64,
    embedding_failures: AtomicU64,
    sessions_created: AtomicU64,
    sessions_reaped: AtomicU64,
}

impl ServiceMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one ingestion call: documents seen, documents that yielded nothing, and the
    /// number of chunks that reached the index.
    pub fn record_ingest(&self, documents: u64, failed_documents: u64, chunks_indexed: u64) {
        self.documents_processed
            .fetch_add(documents, Ordering::Relaxed);
        self.documents_failed
            .fetch_add(failed_documents, Ordering::Relaxed);
        self.chunks_indexed
            .fetch_add(chunks_indexed, Ordering::Relaxed);
    }

    /// Record chunks dropped because the provider could not embed them.
    pub fn record_embedding_failures(&self, count: u64) {
        self.embedding_failures.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a newly created session.
    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record sessions removed by an inactivity sweep.
    pub fn record_sessions_reaped(&self, count: u64) {
        self.sessions_reaped.fetch_add(count, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_processed: self.documents_processed.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            chunks_indexed: self.chunks_indexed.load(Ordering::Relaxed),
            embedding_failures: self.embedding_failures.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_reaped: self.sessions_reaped.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of service counters used for reporting.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Documents submitted for ingestion since startup.
    pub documents_processed: u64,
    /// Documents that contributed zero chunks.
    pub documents_failed: u64,
    /// Chunks embedded and stored across all sessions.
    pub chunks_indexed: u64,
    /// Chunks dropped after per-item embedding retries failed.
    pub embedding_failures: u64,
    /// Sessions created since startup.
    pub sessions_created: u64,
    /// Sessions deleted by the inactivity sweep.
    pub sessions_reaped: u64,
}
