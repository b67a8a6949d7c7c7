//! Session-facing facade coordinating extraction, embedding, indexing, and retrieval.

use crate::{
    config::{Config, ReaperConfig},
    embedding::{EmbeddingClient, RetryPolicy, get_embedding_client},
    extraction::{
        ChunkingError, DocumentInput, DocumentProcessor, DocumentReport, DocumentStatus,
        ExtractionError,
    },
    index::{IndexError, IndexManager},
    logging,
    metrics::{MetricsSnapshot, ServiceMetrics},
    reaper::Reaper,
    retrieval::{RetrievalEngine, RetrievalError, RetrievalResult, SearchOptions},
    session::{Clock, SessionError, SessionInfo, SessionRegistry, SystemClock},
};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

/// Errors surfaced by [`SessionApi`] operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The session does not exist, or was deleted while the operation waited for it.
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    /// The request was rejected before any work started.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Session storage could not be created or removed.
    #[error("session storage failure: {0}")]
    Storage(SessionError),
    /// The text splitter could not be built.
    #[error("chunking setup failed: {0}")]
    Chunking(#[from] ChunkingError),
    /// The extraction worker failed.
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    /// Index embedding or persistence failed.
    #[error("index operation failed: {0}")]
    Index(#[from] IndexError),
    /// Query embedding or search failed.
    #[error("search failed: {0}")]
    Retrieval(RetrievalError),
}

impl From<SessionError> for ServiceError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::NotFound(id) => Self::SessionNotFound(id),
            other => Self::Storage(other),
        }
    }
}

impl From<RetrievalError> for ServiceError {
    fn from(error: RetrievalError) -> Self {
        match error {
            RetrievalError::EmptyQuery => Self::InvalidInput("query must not be empty".into()),
            other => Self::Retrieval(other),
        }
    }
}

/// Outcome of one ingestion call.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    /// Chunks produced by extraction for this call.
    pub chunk_count: usize,
    /// Chunks embedded and stored.
    pub embedded: usize,
    /// Chunks dropped because the provider could not embed them.
    pub failed: usize,
    /// Chunks already present in the session index.
    pub skipped_duplicates: usize,
    /// Entries in the session index after this call.
    pub total_chunks: usize,
    /// Per-document status, in input order.
    pub documents: Vec<DocumentReport>,
}

/// Operations exposed to consumers of the session store (HTTP handlers, embedders).
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Allocate a new empty session.
    async fn create_session(&self) -> Result<Uuid, ServiceError>;

    /// Extract, chunk, embed, and store `documents` in a session's index.
    async fn ingest(
        &self,
        session_id: Uuid,
        documents: Vec<DocumentInput>,
    ) -> Result<IngestReport, ServiceError>;

    /// Query a session's index. A session without an index yields no results.
    async fn search(
        &self,
        session_id: Uuid,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<RetrievalResult>, ServiceError>;

    /// Delete a session and its storage. Returns `false` if it did not exist.
    async fn delete_session(&self, session_id: Uuid) -> Result<bool, ServiceError>;

    /// Snapshot of a session, or `None` when it does not exist.
    async fn session_info(&self, session_id: Uuid) -> Option<SessionInfo>;

    /// Run one inactivity sweep now and return the number of sessions deleted.
    async fn sweep_inactive(&self, threshold: Option<Duration>) -> usize;

    /// Current service counters.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

/// Default [`SessionApi`] implementation backed by on-disk session indexes.
///
/// Construct it once at start-up and share it through an `Arc`; the registry inside is
/// also handed to the [`Reaper`] so scheduled and on-demand sweeps see the same sessions.
pub struct RagService {
    registry: Arc<SessionRegistry>,
    processor: Arc<DocumentProcessor>,
    index_manager: IndexManager,
    engine: RetrievalEngine,
    metrics: Arc<ServiceMetrics>,
    reaper_config: ReaperConfig,
}

impl RagService {
    /// Build a service using the configured embedding provider and the system clock.
    pub async fn new(config: &Config) -> Result<Self, ServiceError> {
        tracing::info!(provider = ?config.embedding.provider, "Initializing embedding client");
        let client = get_embedding_client(&config.embedding);
        Self::with_components(config, client, Arc::new(SystemClock)).await
    }

    /// Build a service around an explicit embedding client and clock.
    pub async fn with_components(
        config: &Config,
        client: Arc<dyn EmbeddingClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ServiceError> {
        let registry = SessionRegistry::open(&config.storage_dir, clock).await?;
        let processor = DocumentProcessor::new(&config.chunking)?;
        let index_manager = IndexManager::new(Arc::clone(&client), &config.embedding);
        let engine = RetrievalEngine::new(
            client,
            RetryPolicy::from_config(&config.embedding),
            config.retrieval.clone(),
        );

        Ok(Self {
            registry: Arc::new(registry),
            processor: Arc::new(processor),
            index_manager,
            engine,
            metrics: Arc::new(ServiceMetrics::new()),
            reaper_config: config.reaper,
        })
    }

    /// Shared session registry.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// A reaper sharing this service's registry and metrics.
    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            Arc::clone(&self.registry),
            self.reaper_config,
            Arc::clone(&self.metrics),
        )
    }

    /// Runs a whole ingestion under the session guard.
    ///
    /// The guard is taken before extraction so a delete or reaper sweep waits for the
    /// upload to finish and then sees the refreshed access time.
    async fn ingest_locked(
        &self,
        session_id: Uuid,
        documents: Vec<DocumentInput>,
    ) -> Result<IngestReport, ServiceError> {
        let mut guard = self.registry.lock(session_id).await?;

        let document_count = documents.len();
        let batch = self.processor.process_blocking(documents).await?;
        let chunk_count = batch.chunks.len();
        let failed_documents = batch
            .reports
            .iter()
            .filter(|report| report.status == DocumentStatus::Failed)
            .count();

        let storage = guard.storage_dir().to_path_buf();
        let outcome = match self
            .index_manager
            .embed_and_store(&storage, guard.index(), batch.chunks)
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                if matches!(error, IndexError::Persistence { .. }) {
                    match self.index_manager.load(&storage).await {
                        Ok(Some(handle)) => guard.attach_index(handle),
                        Ok(None) => {}
                        Err(reload) => {
                            tracing::warn!(error = %reload, "Failed to reload index checkpoint")
                        }
                    }
                }
                tracing::error!(error = %error, "Ingestion failed");
                return Err(error.into());
            }
        };

        if !outcome.handle.is_empty() {
            guard.attach_index(Arc::clone(&outcome.handle));
        }
        self.registry.touch(session_id).await?;
        drop(guard);

        self.metrics.record_ingest(
            document_count as u64,
            failed_documents as u64,
            outcome.embedded as u64,
        );
        if outcome.failed > 0 {
            self.metrics.record_embedding_failures(outcome.failed as u64);
        }
        tracing::info!(
            documents = document_count,
            chunks = chunk_count,
            embedded = outcome.embedded,
            failed = outcome.failed,
            skipped_duplicates = outcome.skipped_duplicates,
            total = outcome.handle.len(),
            "Ingestion completed"
        );

        Ok(IngestReport {
            chunk_count,
            embedded: outcome.embedded,
            failed: outcome.failed,
            skipped_duplicates: outcome.skipped_duplicates,
            total_chunks: outcome.handle.len(),
            documents: batch.reports,
        })
    }

    async fn search_locked(
        &self,
        session_id: Uuid,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<RetrievalResult>, ServiceError> {
        let guard = self.registry.lock(session_id).await?;
        let results = match guard.index() {
            Some(index) => self.engine.search(&index, query, &options).await?,
            None => Vec::new(),
        };
        self.registry.touch(session_id).await?;
        drop(guard);

        tracing::debug!(mode = ?options.mode, results = results.len(), "Search completed");
        Ok(results)
    }
}

#[async_trait]
impl SessionApi for RagService {
    async fn create_session(&self) -> Result<Uuid, ServiceError> {
        let id = self.registry.create().await?;
        self.metrics.record_session_created();
        Ok(id)
    }

    async fn ingest(
        &self,
        session_id: Uuid,
        documents: Vec<DocumentInput>,
    ) -> Result<IngestReport, ServiceError> {
        if documents.is_empty() {
            return Err(ServiceError::InvalidInput("no documents supplied".into()));
        }
        self.ingest_locked(session_id, documents)
            .instrument(logging::session_span("ingest", session_id))
            .await
    }

    async fn search(
        &self,
        session_id: Uuid,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<RetrievalResult>, ServiceError> {
        if query.trim().is_empty() {
            return Err(RetrievalError::EmptyQuery.into());
        }
        self.search_locked(session_id, query, options)
            .instrument(logging::session_span("search", session_id))
            .await
    }

    async fn delete_session(&self, session_id: Uuid) -> Result<bool, ServiceError> {
        Ok(self.registry.delete(session_id).await?)
    }

    async fn session_info(&self, session_id: Uuid) -> Option<SessionInfo> {
        self.registry.info(session_id).await
    }

    async fn sweep_inactive(&self, threshold: Option<Duration>) -> usize {
        let threshold = threshold.unwrap_or(self.reaper_config.inactivity_threshold);
        let removed = self.reaper().sweep_now(threshold).await;
        tracing::info!(removed, threshold_secs = threshold.as_secs(), "On-demand sweep finished");
        removed
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
