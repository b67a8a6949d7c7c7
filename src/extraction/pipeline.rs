//! Document-to-chunk orchestration: page extraction, normalization, splitting, metadata, and
//! per-document fallback.

use super::chunking::TextSplitter;
use super::loader::{
    LoadedDocument, PAGE_STRATEGIES, detect_tables, extract_whole_document, render_tables,
};
use super::metadata::{chunk_signals, page_signals};
use super::normalize::normalize_page_text;
use super::summary::build_summary;
use super::types::{
    Chunk, ChunkKind, ChunkMetadata, ChunkingError, DocumentInput, DocumentReport,
    DocumentStatus, ExtractionError, ProcessedBatch,
};
use crate::config::ChunkingConfig;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Pages whose best extraction trims to fewer characters are treated as empty.
pub const MIN_PAGE_CHARS: usize = 10;
/// Pages whose normalized text is shorter than this are skipped.
pub const MIN_NORMALIZED_CHARS: usize = 50;
/// Fallback text must exceed this many characters to be kept.
pub const MIN_FALLBACK_CHARS: usize = 100;
/// Fallback chunks are truncated to this many characters.
pub const FALLBACK_MAX_CHARS: usize = 5_000;

const CHUNK_ID_HEX_LEN: usize = 32;

/// Turns raw documents into ordered, metadata-tagged chunks.
#[derive(Debug, Clone)]
pub struct DocumentProcessor {
    splitter: TextSplitter,
}

impl DocumentProcessor {
    /// Build a processor for the given splitting settings.
    pub fn new(config: &ChunkingConfig) -> Result<Self, ChunkingError> {
        Ok(Self {
            splitter: TextSplitter::new(config)?,
        })
    }

    /// Process every document; a failing document is reported, never propagated.
    pub fn process(&self, documents: &[DocumentInput]) -> ProcessedBatch {
        let mut batch = ProcessedBatch::default();
        for document in documents {
            let (chunks, report) = self.process_document(document);
            tracing::info!(
                document = %report.name,
                status = ?report.status,
                pages_total = report.pages_total,
                pages_used = report.pages_used,
                chunks = report.chunk_count,
                "Processed document"
            );
            batch.chunks.extend(chunks);
            batch.reports.push(report);
        }
        batch
    }

    /// Run [`Self::process`] on the blocking pool.
    pub async fn process_blocking(
        self: &Arc<Self>,
        documents: Vec<DocumentInput>,
    ) -> Result<ProcessedBatch, ExtractionError> {
        let processor = Arc::clone(self);
        tokio::task::spawn_blocking(move || processor.process(&documents))
            .await
            .map_err(|error| ExtractionError::Worker(error.to_string()))
    }

    fn process_document(&self, document: &DocumentInput) -> (Vec<Chunk>, DocumentReport) {
        let mut report = DocumentReport {
            name: document.name.clone(),
            status: DocumentStatus::Failed,
            pages_total: 0,
            pages_used: 0,
            pages_skipped: 0,
            chunk_count: 0,
            error: None,
        };

        let loaded = match LoadedDocument::load(&document.bytes) {
            Ok(loaded) => loaded,
            Err(error) => {
                tracing::warn!(document = %document.name, error = %error, "Document unreadable; trying fallback");
                let chunks = fallback_chunks(document, 0, &error, &mut report);
                return (chunks, report);
            }
        };

        let total_pages = loaded.page_count();
        report.pages_total = total_pages;
        let mut chunks = Vec::new();
        let mut full_text = String::new();

        for page in 1..=total_pages {
            let Some(raw) = best_page_text(&loaded, page, &document.name) else {
                tracing::debug!(document = %document.name, page, "Skipping page without meaningful text");
                report.pages_skipped += 1;
                continue;
            };

            let tables = detect_tables(&raw);
            let mut normalized = normalize_page_text(&raw);
            if !tables.is_empty() {
                normalized.push_str("\n\n");
                normalized.push_str(&render_tables(&tables));
            }

            if normalized.trim().chars().count() < MIN_NORMALIZED_CHARS {
                tracing::debug!(document = %document.name, page, "Skipping page; normalized text too short");
                report.pages_skipped += 1;
                continue;
            }

            full_text.push_str(&raw);
            full_text.push('\n');

            let signals = page_signals(&normalized);
            let windows = self.splitter.split(&normalized);
            let total_chunks = windows.len();
            for (chunk_index, window) in windows.into_iter().enumerate() {
                let local = chunk_signals(&window.text);
                let mut metadata = ChunkMetadata::new(&document.name, ChunkKind::Page, total_pages);
                metadata.page = Some(page);
                metadata.chunk_index = chunk_index;
                metadata.total_chunks = total_chunks;
                metadata.start_index = window.start;
                metadata.end_index = window.end;
                metadata.section = signals.section;
                metadata.financial_values = signals.financial_values.clone();
                metadata.percentages = signals.percentages.clone();
                metadata.time_periods = signals.time_periods.clone();
                metadata.key_values = signals.key_values.clone();
                metadata.has_table = !tables.is_empty();
                metadata.chunk_financial_values = local.financial_values;
                metadata.chunk_percentages = local.percentages;
                metadata.chunk_dates = local.dates;
                chunks.push(make_chunk(window.text, metadata));
            }
            report.pages_used += 1;
        }

        if report.pages_used == 0 {
            let error = ExtractionError::Empty;
            tracing::warn!(document = %document.name, "No page produced text; trying fallback");
            let chunks = fallback_chunks(document, total_pages, &error, &mut report);
            return (chunks, report);
        }

        // The summary is capped at the first splitter window so it obeys the chunk budget.
        let summary = build_summary(&document.name, &full_text)
            .and_then(|summary| self.splitter.split(&summary).into_iter().next());
        if let Some(window) = summary {
            let mut metadata =
                ChunkMetadata::new(&document.name, ChunkKind::DocumentSummary, total_pages);
            metadata.start_index = window.start;
            metadata.end_index = window.end;
            chunks.push(make_chunk(window.text, metadata));
        }

        report.status = DocumentStatus::Processed;
        report.chunk_count = chunks.len();
        (chunks, report)
    }
}

/// First strategy output with enough text, if any.
fn best_page_text(loaded: &LoadedDocument, page: usize, name: &str) -> Option<String> {
    for strategy in PAGE_STRATEGIES {
        match loaded.extract_page(page, strategy) {
            Ok(text) if text.trim().chars().count() >= MIN_PAGE_CHARS => return Some(text),
            Ok(_) => {
                tracing::debug!(document = name, page, ?strategy, "Strategy yielded too little text");
            }
            Err(error) => {
                tracing::debug!(document = name, page, ?strategy, error = %error, "Strategy failed");
            }
        }
    }
    None
}

fn fallback_chunks(
    document: &DocumentInput,
    total_pages: usize,
    cause: &ExtractionError,
    report: &mut DocumentReport,
) -> Vec<Chunk> {
    report.error = Some(cause.to_string());

    let text = match extract_whole_document(&document.bytes) {
        Ok(text) => text,
        Err(error) => {
            tracing::error!(document = %document.name, error = %error, "Fallback extraction failed");
            report.error = Some(format!("{cause}; fallback: {error}"));
            return Vec::new();
        }
    };

    if text.chars().count() <= MIN_FALLBACK_CHARS {
        tracing::warn!(document = %document.name, "Fallback text too short to keep");
        return Vec::new();
    }

    let truncated: String = text.chars().take(FALLBACK_MAX_CHARS).collect();
    let mut metadata =
        ChunkMetadata::new(&document.name, ChunkKind::FallbackExtraction, total_pages);
    metadata.end_index = truncated.len();
    metadata.error = Some(cause.to_string());

    tracing::info!(document = %document.name, "Used fallback extraction");
    report.status = DocumentStatus::Fallback;
    report.chunk_count = 1;
    vec![make_chunk(truncated, metadata)]
}

fn make_chunk(text: String, metadata: ChunkMetadata) -> Chunk {
    Chunk {
        id: compute_chunk_id(&metadata, &text),
        text,
        metadata,
    }
}

/// Content-derived chunk identifier (first 32 hex characters of SHA-256).
pub fn compute_chunk_id(metadata: &ChunkMetadata, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(metadata.source.as_bytes());
    hasher.update([0u8]);
    hasher.update(metadata.page.unwrap_or_default().to_le_bytes());
    hasher.update(metadata.chunk_index.to_le_bytes());
    hasher.update(metadata.kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(CHUNK_ID_HEX_LEN);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn processor(size: usize, overlap: usize) -> DocumentProcessor {
        DocumentProcessor::new(&ChunkingConfig {
            chunk_size: size,
            chunk_overlap: overlap,
            ..ChunkingConfig::default()
        })
        .expect("processor")
    }

    fn report_page(number: usize) -> String {
        format!(
            "Page {number} of the annual report.\n\nIncome Statement for FY 2023 shows revenue \
             of $1.5 billion, up 12% year over year.\nOperating costs fell to $400 million.\n\n\
             Management expects Q2 2024 margins near 18%. The board approved a dividend."
        )
    }

    #[test]
    fn three_page_document_yields_ordered_page_chunks() {
        let pages: Vec<String> = (1..=3).map(report_page).collect();
        let bytes = pages.join("\x0C");
        let batch = processor(120, 40).process(&[DocumentInput::new("annual.txt", bytes)]);

        let report = &batch.reports[0];
        assert_eq!(report.status, DocumentStatus::Processed);
        assert_eq!(report.pages_total, 3);
        assert_eq!(report.pages_used, 3);
        assert_eq!(report.chunk_count, batch.chunks.len());

        let page_chunks: Vec<&Chunk> = batch
            .chunks
            .iter()
            .filter(|chunk| chunk.metadata.kind == ChunkKind::Page)
            .collect();
        assert!(page_chunks.len() >= 3);
        for page in 1..=3 {
            let indices: Vec<usize> = page_chunks
                .iter()
                .filter(|chunk| chunk.metadata.page == Some(page))
                .map(|chunk| chunk.metadata.chunk_index)
                .collect();
            assert!(!indices.is_empty());
            assert_eq!(indices, (0..indices.len()).collect::<Vec<_>>());
            for chunk in page_chunks
                .iter()
                .filter(|chunk| chunk.metadata.page == Some(page))
            {
                assert_eq!(chunk.metadata.total_chunks, indices.len());
                assert!(chunk.text.chars().count() <= 120);
            }
        }

        let ids: HashSet<&str> = batch.chunks.iter().map(|chunk| chunk.id.as_str()).collect();
        assert_eq!(ids.len(), batch.chunks.len());
    }

    #[test]
    fn page_metadata_is_inherited_by_chunks() {
        let batch = processor(1600, 800).process(&[DocumentInput::new("q.txt", report_page(1))]);
        let first = &batch.chunks[0];
        assert_eq!(first.metadata.section, Some(crate::extraction::Section::IncomeStatement));
        assert!(first.metadata.financial_values.contains(&"$1.5 billion".to_string()));
        assert!(first.metadata.chunk_percentages.contains(&"12%".to_string()));
        assert!(first.metadata.time_periods.contains(&"FY 2023".to_string()));
        assert_eq!(first.metadata.total_pages, 1);
    }

    #[test]
    fn summary_chunk_closes_the_document() {
        let pages: Vec<String> = (1..=2).map(report_page).collect();
        let batch = processor(1600, 800).process(&[DocumentInput::new("r.txt", pages.join("\x0C"))]);
        let last = batch.chunks.last().expect("chunks");
        assert_eq!(last.metadata.kind, ChunkKind::DocumentSummary);
        assert!(last.text.contains("Key Financial Figures"));
        assert_eq!(last.metadata.page, None);
    }

    #[test]
    fn summary_chunk_respects_chunk_size() {
        let pages: Vec<String> = (1..=4).map(report_page).collect();
        let full = processor(1600, 800).process(&[DocumentInput::new("r.txt", pages.join("\x0C"))]);
        let unbounded = full.chunks.last().expect("chunks");
        assert!(unbounded.text.chars().count() > 60);

        let batch = processor(60, 20).process(&[DocumentInput::new("r.txt", pages.join("\x0C"))]);
        let summaries: Vec<&Chunk> = batch
            .chunks
            .iter()
            .filter(|chunk| chunk.metadata.kind == ChunkKind::DocumentSummary)
            .collect();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].text.starts_with("DOCUMENT SUMMARY: r.txt"));
        assert!(batch.chunks.iter().all(|chunk| chunk.text.chars().count() <= 60));
    }

    #[test]
    fn processing_is_deterministic() {
        let doc = DocumentInput::new("same.txt", report_page(7));
        let first = processor(90, 30).process(std::slice::from_ref(&doc));
        let second = processor(90, 30).process(std::slice::from_ref(&doc));
        assert_eq!(first.chunks, second.chunks);
    }

    #[test]
    fn short_pages_are_skipped() {
        let bytes = format!("tiny\x0C{}", report_page(2));
        let batch = processor(1600, 800).process(&[DocumentInput::new("mixed.txt", bytes)]);
        let report = &batch.reports[0];
        assert_eq!(report.pages_skipped, 1);
        assert_eq!(report.pages_used, 1);
        assert!(batch
            .chunks
            .iter()
            .all(|chunk| chunk.metadata.page != Some(1)));
    }

    #[test]
    fn unreadable_document_uses_truncated_fallback() {
        let mut bytes = vec![0xFF, 0xFE];
        bytes.extend(std::iter::repeat_n(b'a', 6_000));
        let batch = processor(1600, 800).process(&[DocumentInput::new("broken.bin", bytes)]);

        let report = &batch.reports[0];
        assert_eq!(report.status, DocumentStatus::Fallback);
        assert!(report.error.is_some());
        assert_eq!(batch.chunks.len(), 1);
        let chunk = &batch.chunks[0];
        assert_eq!(chunk.metadata.kind, ChunkKind::FallbackExtraction);
        assert_eq!(chunk.text.chars().count(), FALLBACK_MAX_CHARS);
        assert!(chunk.metadata.error.is_some());
    }

    #[test]
    fn failed_document_does_not_abort_the_batch() {
        let batch = processor(1600, 800).process(&[
            DocumentInput::new("empty.txt", Vec::<u8>::new()),
            DocumentInput::new("bad.pdf", b"%PDF-1.4 garbage".to_vec()),
            DocumentInput::new("good.txt", report_page(1)),
        ]);
        assert_eq!(batch.reports.len(), 3);
        assert_eq!(batch.reports[0].status, DocumentStatus::Failed);
        assert_eq!(batch.reports[0].chunk_count, 0);
        assert_eq!(batch.reports[1].status, DocumentStatus::Failed);
        assert_eq!(batch.reports[2].status, DocumentStatus::Processed);
        assert!(batch.chunks.iter().all(|chunk| chunk.metadata.source == "good.txt"));
    }

    #[test]
    fn tables_are_appended_after_prose() {
        let text = "Segment results for the year were mixed across regions.\n\
                    Region\t2023\t2022\nNorth\t$120\t$110\nSouth\t$95\t$99\n";
        let batch = processor(1600, 800).process(&[DocumentInput::new("t.txt", text)]);
        let chunk = &batch.chunks[0];
        assert!(chunk.metadata.has_table);
        assert!(chunk.text.contains("[TABLE DATA]:\nRegion | 2023 | 2022"));
    }

    #[test]
    fn chunk_ids_change_with_content() {
        let base = ChunkMetadata::new("a.txt", ChunkKind::Page, 1);
        assert_ne!(compute_chunk_id(&base, "one"), compute_chunk_id(&base, "two"));
        assert_eq!(compute_chunk_id(&base, "one").len(), 32);
    }

    #[tokio::test]
    async fn blocking_processing_matches_inline() {
        let processor = Arc::new(processor(200, 50));
        let docs = vec![DocumentInput::new("p.txt", report_page(3))];
        let inline = processor.process(&docs);
        let offloaded = processor.process_blocking(docs).await.expect("worker");
        assert_eq!(inline.chunks, offloaded.chunks);
    }
}
