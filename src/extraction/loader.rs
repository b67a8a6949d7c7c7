//! Format detection and page-level text extraction.
//!
//! PDFs are parsed with `lopdf`; each page is read with an ordered list of strategies (the
//! library's layout text, then raw text-showing operators grouped into blocks). Plain text
//! documents use form feeds as page breaks. When a document cannot be parsed at all,
//! [`extract_whole_document`] provides the raw fallback text (`pdf-extract` for PDFs, lossy
//! UTF-8 for anything else).

use super::types::ExtractionError;
use lopdf::{Document, Object, content::Content};
use regex::Regex;
use std::sync::LazyLock;

const PDF_MAGIC: &[u8] = b"%PDF-";
const PAGE_BREAK: char = '\x0C';
/// Kerning offset (thousandths of an em) wide enough to read as a word gap.
const TJ_SPACE_THRESHOLD: f32 = -200.0;

static COLUMN_GAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\t+| {2,}").expect("valid column regex"));

/// Detected document encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    /// Portable Document Format.
    Pdf,
    /// UTF-8 text with optional form-feed page breaks.
    PlainText,
}

impl DocumentFormat {
    /// Sniff the format from the leading bytes.
    pub fn detect(bytes: &[u8]) -> Self {
        let start = bytes
            .iter()
            .position(|byte| !byte.is_ascii_whitespace())
            .unwrap_or(bytes.len());
        if bytes[start..].starts_with(PDF_MAGIC) {
            Self::Pdf
        } else {
            Self::PlainText
        }
    }
}

/// Ways of reading one page, tried in order until one yields enough text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStrategy {
    /// Reading-order text as laid out by the parser.
    Layout,
    /// Text grouped by content blocks.
    Blocks,
}

/// Strategies applied to each page, primary first.
pub const PAGE_STRATEGIES: [PageStrategy; 2] = [PageStrategy::Layout, PageStrategy::Blocks];

/// Parsed document ready for page extraction.
pub(crate) enum LoadedDocument {
    Pdf {
        document: Box<Document>,
        page_numbers: Vec<u32>,
    },
    Text {
        pages: Vec<String>,
    },
}

impl LoadedDocument {
    /// Parse `bytes` according to their detected format.
    pub(crate) fn load(bytes: &[u8]) -> Result<Self, ExtractionError> {
        match DocumentFormat::detect(bytes) {
            DocumentFormat::Pdf => {
                let document = guard_panics("PDF parser", || Document::load_mem(bytes))?
                    .map_err(|error| {
                        ExtractionError::Corrupted(format!("failed to parse PDF: {error}"))
                    })?;
                if document.is_encrypted() {
                    return Err(ExtractionError::Corrupted("PDF is encrypted".into()));
                }
                let mut page_numbers: Vec<u32> = document.get_pages().keys().copied().collect();
                page_numbers.sort_unstable();
                Ok(Self::Pdf {
                    document: Box::new(document),
                    page_numbers,
                })
            }
            DocumentFormat::PlainText => {
                let text = std::str::from_utf8(bytes).map_err(|error| {
                    ExtractionError::Corrupted(format!("text is not valid UTF-8: {error}"))
                })?;
                if text.contains('\0') {
                    return Err(ExtractionError::Corrupted(
                        "text contains NUL bytes".into(),
                    ));
                }
                Ok(Self::Text {
                    pages: text.split(PAGE_BREAK).map(str::to_string).collect(),
                })
            }
        }
    }

    pub(crate) fn page_count(&self) -> usize {
        match self {
            Self::Pdf { page_numbers, .. } => page_numbers.len(),
            Self::Text { pages } => pages.len(),
        }
    }

    /// Extract the 1-based `page` with `strategy`.
    pub(crate) fn extract_page(
        &self,
        page: usize,
        strategy: PageStrategy,
    ) -> Result<String, ExtractionError> {
        let index = page
            .checked_sub(1)
            .filter(|index| *index < self.page_count())
            .ok_or(ExtractionError::PageOutOfRange(page))?;

        let text = match self {
            Self::Pdf {
                document,
                page_numbers,
            } => {
                let number = page_numbers[index];
                match strategy {
                    PageStrategy::Layout => {
                        guard_panics("PDF text layer", || document.extract_text(&[number]))?
                            .map_err(|error| {
                                ExtractionError::Corrupted(format!("page {page}: {error}"))
                            })?
                    }
                    PageStrategy::Blocks => guard_panics("PDF content stream", || {
                        pdf_page_blocks(document, number)
                    })??,
                }
            }
            Self::Text { pages } => match strategy {
                PageStrategy::Layout => pages[index].clone(),
                PageStrategy::Blocks => text_blocks(&pages[index]),
            },
        };

        if text.trim().is_empty() {
            return Err(ExtractionError::Empty);
        }
        Ok(text)
    }
}

fn pdf_page_blocks(document: &Document, page_number: u32) -> Result<String, ExtractionError> {
    let page_id = document
        .get_pages()
        .get(&page_number)
        .copied()
        .ok_or(ExtractionError::PageOutOfRange(page_number as usize))?;
    let raw = document
        .get_page_content(page_id)
        .map_err(|error| ExtractionError::Corrupted(format!("page content: {error}")))?;
    let content = Content::decode(&raw)
        .map_err(|error| ExtractionError::Corrupted(format!("content stream: {error}")))?;

    let mut blocks: Vec<String> = Vec::new();
    let mut current = String::new();

    for operation in &content.operations {
        match operation.operator.as_str() {
            "BT" => current.clear(),
            "ET" => {
                let block = current.trim();
                if !block.is_empty() {
                    blocks.push(block.to_string());
                }
                current.clear();
            }
            "Tj" => push_strings(&mut current, &operation.operands),
            "'" | "\"" => {
                push_line_break(&mut current);
                push_strings(&mut current, &operation.operands);
            }
            "TJ" => {
                for operand in &operation.operands {
                    if let Object::Array(items) = operand {
                        for item in items {
                            match item {
                                Object::String(bytes, _) => current.push_str(&decode_pdf_string(bytes)),
                                Object::Integer(offset) if (*offset as f32) < TJ_SPACE_THRESHOLD => {
                                    current.push(' ')
                                }
                                Object::Real(offset) if (*offset as f32) < TJ_SPACE_THRESHOLD => {
                                    current.push(' ')
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
            "Td" | "TD" | "T*" | "Tm" => push_line_break(&mut current),
            _ => {}
        }
    }

    let trailing = current.trim();
    if !trailing.is_empty() {
        blocks.push(trailing.to_string());
    }

    Ok(blocks.join("\n\n"))
}

fn push_strings(buffer: &mut String, operands: &[Object]) {
    for operand in operands {
        if let Object::String(bytes, _) = operand {
            buffer.push_str(&decode_pdf_string(bytes));
        }
    }
}

fn push_line_break(buffer: &mut String) {
    if !buffer.is_empty() && !buffer.ends_with('\n') {
        buffer.push('\n');
    }
}

/// Decode a PDF string: UTF-16BE when it carries a byte-order mark, Latin-1 otherwise.
fn decode_pdf_string(bytes: &[u8]) -> String {
    if let Some(body) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units = body
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
        return char::decode_utf16(units)
            .map(|unit| unit.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
    }
    bytes.iter().map(|byte| char::from(*byte)).collect()
}

fn text_blocks(page: &str) -> String {
    page.split("\n\n")
        .map(|block| {
            block
                .lines()
                .map(str::trim)
                .filter(|line| line.chars().any(char::is_alphanumeric))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|block| !block.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Run a third-party parser call, turning a panic into a per-document failure.
///
/// lopdf and pdf-extract both index into untrusted structures and can panic on malformed
/// files; a panic here must fail one document, not the extraction batch.
fn guard_panics<T>(stage: &str, parse: impl FnOnce() -> T) -> Result<T, ExtractionError> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(parse)).map_err(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|message| (*message).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        ExtractionError::Corrupted(format!("{stage} aborted: {reason}"))
    })
}

/// Raw whole-document text used when page extraction fails.
pub(crate) fn extract_whole_document(bytes: &[u8]) -> Result<String, ExtractionError> {
    let text = match DocumentFormat::detect(bytes) {
        DocumentFormat::Pdf => {
            guard_panics("PDF text layer", || pdf_extract::extract_text_from_mem(bytes))?
                .map_err(|error| {
                    ExtractionError::Corrupted(format!("failed to extract PDF text: {error}"))
                })?
        }
        DocumentFormat::PlainText => String::from_utf8_lossy(bytes).into_owned(),
    };

    let cleaned: String = text
        .chars()
        .filter(|ch| {
            *ch != char::REPLACEMENT_CHARACTER && (!ch.is_control() || ch.is_whitespace())
        })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Err(ExtractionError::Empty);
    }
    Ok(cleaned.to_string())
}

/// Rows of cells found in column-aligned runs of lines.
pub(crate) fn detect_tables(text: &str) -> Vec<Vec<Vec<String>>> {
    let mut tables = Vec::new();
    let mut current: Vec<Vec<String>> = Vec::new();

    for line in text.lines() {
        match table_row(line) {
            Some(cells) => current.push(cells),
            None => {
                if current.len() >= 2 {
                    tables.push(std::mem::take(&mut current));
                } else {
                    current.clear();
                }
            }
        }
    }
    if current.len() >= 2 {
        tables.push(current);
    }

    tables
}

fn table_row(line: &str) -> Option<Vec<String>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let cells: Vec<String> = if trimmed.contains('|') {
        trimmed
            .split('|')
            .map(|cell| cell.trim().to_string())
            .filter(|cell| !cell.is_empty())
            .collect()
    } else {
        COLUMN_GAP
            .split(trimmed)
            .map(|cell| cell.trim().to_string())
            .filter(|cell| !cell.is_empty())
            .collect()
    };

    let numeric = cells
        .iter()
        .any(|cell| cell.chars().any(|ch| ch.is_ascii_digit()));
    (cells.len() >= 2 && numeric).then_some(cells)
}

/// Render tables as a row-delimited block appended after page prose.
pub(crate) fn render_tables(tables: &[Vec<Vec<String>>]) -> String {
    let body = tables
        .iter()
        .map(|rows| {
            rows.iter()
                .map(|cells| cells.join(" | "))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("[TABLE DATA]:\n{body}")
}
