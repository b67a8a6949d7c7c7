//! Core data types and error definitions for the extraction pipeline.

use anyhow::Error as TokenizerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors produced while turning raw text into chunks.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Splitting was configured with an impossible length budget.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    /// Tokenizer resources were unavailable for the configured encoding.
    #[error("failed to initialize tokenizer '{model}': {source}")]
    Tokenizer {
        /// Encoding or model name we attempted to load.
        model: String,
        /// Underlying error raised by the tokenizer library.
        #[source]
        source: TokenizerError,
    },
}

/// Errors raised while reading text out of a document.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Document bytes could not be parsed in their detected format.
    #[error("document could not be parsed: {0}")]
    Corrupted(String),
    /// A strategy ran but produced no usable text.
    #[error("no extractable text")]
    Empty,
    /// Requested page does not exist.
    #[error("page {0} is out of range")]
    PageOutOfRange(usize),
    /// Background worker panicked or was cancelled.
    #[error("extraction worker failed: {0}")]
    Worker(String),
}

/// What a chunk represents inside its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// Window over a single page's normalized text.
    Page,
    /// Synthesized digest of a document's high-signal tokens.
    DocumentSummary,
    /// Raw whole-document text used when page extraction failed.
    FallbackExtraction,
}

impl ChunkKind {
    /// Stable lowercase label used in hashes and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::DocumentSummary => "document_summary",
            Self::FallbackExtraction => "fallback_extraction",
        }
    }
}

/// Coarse financial-statement classification of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    /// Income or profit-and-loss statement.
    IncomeStatement,
    /// Balance sheet or statement of financial position.
    BalanceSheet,
    /// Statement of cash flows.
    CashFlow,
    /// Executive summary or highlights.
    ExecutiveSummary,
}

/// Metadata carried by every chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Owning document name.
    pub source: String,
    /// 1-based page number; absent for summary and fallback chunks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    /// Page count of the owning document.
    pub total_pages: usize,
    /// 0-based position of the chunk within its page.
    pub chunk_index: usize,
    /// Number of chunks produced for the page.
    pub total_chunks: usize,
    /// Byte offset where the chunk starts in the normalized page text.
    pub start_index: usize,
    /// Byte offset where the chunk ends in the normalized page text.
    pub end_index: usize,
    /// What the chunk represents.
    pub kind: ChunkKind,
    /// Statement classification of the page, when recognized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<Section>,
    /// Currency amounts found on the page.
    #[serde(default)]
    pub financial_values: Vec<String>,
    /// Percentages found on the page.
    #[serde(default)]
    pub percentages: Vec<String>,
    /// Distinct year or quarter tokens found on the page.
    #[serde(default)]
    pub time_periods: Vec<String>,
    /// Currency amounts inside this chunk.
    #[serde(default)]
    pub chunk_financial_values: Vec<String>,
    /// Percentages inside this chunk.
    #[serde(default)]
    pub chunk_percentages: Vec<String>,
    /// Year or quarter tokens inside this chunk.
    #[serde(default)]
    pub chunk_dates: Vec<String>,
    /// `Label: value` pairs found on the page.
    #[serde(default)]
    pub key_values: BTreeMap<String, String>,
    /// Whether a tabular rendering was appended to the page text.
    #[serde(default)]
    pub has_table: bool,
    /// Failure marker recorded on fallback chunks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChunkMetadata {
    /// Metadata skeleton for a chunk of `source` with no extracted values yet.
    pub fn new(source: impl Into<String>, kind: ChunkKind, total_pages: usize) -> Self {
        Self {
            source: source.into(),
            page: None,
            total_pages,
            chunk_index: 0,
            total_chunks: 1,
            start_index: 0,
            end_index: 0,
            kind,
            section: None,
            financial_values: Vec::new(),
            percentages: Vec::new(),
            time_periods: Vec::new(),
            chunk_financial_values: Vec::new(),
            chunk_percentages: Vec::new(),
            chunk_dates: Vec::new(),
            key_values: BTreeMap::new(),
            has_table: false,
            error: None,
        }
    }
}

/// Retrievable unit of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Content-derived identifier, stable for identical input.
    pub id: String,
    /// Chunk body.
    pub text: String,
    /// Position and extracted values.
    pub metadata: ChunkMetadata,
}

/// Raw document submitted for processing.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    /// Display name, usually the uploaded file name.
    pub name: String,
    /// Raw bytes.
    pub bytes: Vec<u8>,
}

impl DocumentInput {
    /// Pair a name with its bytes.
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// Per-document processing outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Page extraction succeeded for at least one page.
    Processed,
    /// Only the whole-document fallback produced text.
    Fallback,
    /// The document contributed nothing.
    Failed,
}

/// Summary of how one document fared in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentReport {
    /// Document name.
    pub name: String,
    /// Outcome classification.
    pub status: DocumentStatus,
    /// Pages discovered in the document.
    pub pages_total: usize,
    /// Pages that produced chunks.
    pub pages_used: usize,
    /// Pages skipped as empty or too short.
    pub pages_skipped: usize,
    /// Chunks produced, including summary and fallback chunks.
    pub chunk_count: usize,
    /// Failure description when extraction fell back or failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Output of a processing run over several documents.
#[derive(Debug, Clone, Default)]
pub struct ProcessedBatch {
    /// Chunks in document order, then page order, then position.
    pub chunks: Vec<Chunk>,
    /// One report per input document, in input order.
    pub reports: Vec<DocumentReport>,
}
