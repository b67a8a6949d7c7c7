//! Recursive boundary-aware text splitting with overlapping windows.
//!
//! The splitter walks a descending list of boundaries (section break, paragraph, line,
//! sentence, clause, phrase, word, character). A span longer than the budget is cut at the
//! coarsest boundary it contains, and pieces still too long are cut again at the next boundary.
//! The resulting atomic pieces are contiguous byte ranges, so merged windows always map back
//! to exact offsets in the source text.
//!
//! - Windows are filled greedily up to `chunk_size`.
//! - Each following window starts by backing up over at most `chunk_overlap` worth of trailing
//!   pieces, so text around a boundary appears in both windows and nothing falls between them.
//! - Length is measured in characters by default, or in tokens with a `tiktoken` encoding.

use crate::config::{ChunkingConfig, LengthUnit};
use anyhow::Error as TokenizerError;
use std::ops::Range;
use std::sync::Arc;
use tiktoken_rs::{
    CoreBPE, cl100k_base, get_bpe_from_model, o200k_base, p50k_base, p50k_edit, r50k_base,
};

use super::types::ChunkingError;

pub(crate) type LengthCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Boundaries tried in order; the empty string means "between any two characters".
pub(crate) const SEPARATORS: [&str; 8] = ["\n\n\n", "\n\n", "\n", ". ", "; ", ", ", " ", ""];

/// One window produced by the splitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextWindow {
    /// Window text with surrounding whitespace trimmed.
    pub text: String,
    /// Byte offset of `text` in the source.
    pub start: usize,
    /// Byte offset one past the end of `text` in the source.
    pub end: usize,
}

/// Splits text into bounded, overlapping windows.
#[derive(Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    counter: LengthCounter,
}

impl std::fmt::Debug for TextSplitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextSplitter")
            .field("chunk_size", &self.chunk_size)
            .field("chunk_overlap", &self.chunk_overlap)
            .finish_non_exhaustive()
    }
}

impl TextSplitter {
    /// Build a splitter from configuration, loading a tokenizer when lengths are in tokens.
    pub fn new(config: &ChunkingConfig) -> Result<Self, ChunkingError> {
        let counter = match config.length_unit {
            LengthUnit::Characters => character_counter(),
            LengthUnit::Tokens => build_tiktoken_counter(&config.tokenizer)?,
        };
        Self::with_counter(config.chunk_size, config.chunk_overlap, counter)
    }

    /// Build a splitter with an explicit length function.
    pub(crate) fn with_counter(
        chunk_size: usize,
        chunk_overlap: usize,
        counter: LengthCounter,
    ) -> Result<Self, ChunkingError> {
        if chunk_size == 0 {
            return Err(ChunkingError::InvalidChunkSize);
        }
        Ok(Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
            counter,
        })
    }

    /// Configured upper bound per window.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split `text` into windows. Returns an empty vector for blank input.
    pub fn split(&self, text: &str) -> Vec<TextWindow> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut pieces = Vec::new();
        self.collect_pieces(text, 0..text.len(), &SEPARATORS, &mut pieces);
        let lengths: Vec<usize> = pieces
            .iter()
            .map(|range| self.measure(&text[range.clone()]))
            .collect();

        self.merge(text, &pieces, &lengths)
    }

    fn measure(&self, segment: &str) -> usize {
        self.counter.as_ref()(segment)
    }

    /// Cut `range` into contiguous pieces that each fit the budget where possible.
    fn collect_pieces(
        &self,
        text: &str,
        range: Range<usize>,
        separators: &[&str],
        pieces: &mut Vec<Range<usize>>,
    ) {
        let span = &text[range.clone()];
        if self.measure(span) <= self.chunk_size {
            pieces.push(range);
            return;
        }

        let Some(position) = separators
            .iter()
            .position(|separator| separator.is_empty() || span.contains(separator))
        else {
            pieces.push(range);
            return;
        };
        let separator = separators[position];
        let finer = &separators[position + 1..];

        for piece in split_keeping_separator(span, separator) {
            let absolute = range.start + piece.start..range.start + piece.end;
            if separator.is_empty() {
                pieces.push(absolute);
            } else {
                self.collect_pieces(text, absolute, finer, pieces);
            }
        }
    }

    fn merge(&self, text: &str, pieces: &[Range<usize>], lengths: &[usize]) -> Vec<TextWindow> {
        let count = pieces.len();
        let mut windows = Vec::new();
        let mut start = 0usize;

        while start < count {
            let mut end = start;
            let mut total = lengths[start];
            while end + 1 < count && total + lengths[end + 1] <= self.chunk_size {
                end += 1;
                total += lengths[end];
            }

            if let Some(window) = trimmed_window(text, pieces[start].start..pieces[end].end) {
                windows.push(window);
            }

            if end + 1 >= count {
                break;
            }

            let following = lengths[end + 1];
            let mut next = end + 1;
            let mut carried = 0usize;
            while next > start + 1 {
                let candidate = lengths[next - 1];
                if carried + candidate > self.chunk_overlap
                    || carried + candidate + following > self.chunk_size
                {
                    break;
                }
                carried += candidate;
                next -= 1;
            }
            start = next;
        }

        windows
    }
}

/// Split `span` after every occurrence of `separator`, keeping the separator on the left piece.
fn split_keeping_separator(span: &str, separator: &str) -> Vec<Range<usize>> {
    if separator.is_empty() {
        return span
            .char_indices()
            .map(|(offset, ch)| offset..offset + ch.len_utf8())
            .collect();
    }

    let mut ranges = Vec::new();
    let mut cursor = 0usize;
    for (offset, matched) in span.match_indices(separator) {
        let end = offset + matched.len();
        if end > cursor {
            ranges.push(cursor..end);
        }
        cursor = end;
    }
    if cursor < span.len() {
        ranges.push(cursor..span.len());
    }
    ranges
}

fn trimmed_window(text: &str, range: Range<usize>) -> Option<TextWindow> {
    let raw = &text[range.clone()];
    let leading = raw.len() - raw.trim_start().len();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let start = range.start + leading;
    Some(TextWindow {
        text: trimmed.to_string(),
        start,
        end: start + trimmed.len(),
    })
}

fn character_counter() -> LengthCounter {
    Arc::new(|segment: &str| segment.chars().count())
}

fn build_tiktoken_counter(name: &str) -> Result<LengthCounter, ChunkingError> {
    let normalized = name.trim();
    let target = if normalized.is_empty() {
        "cl100k_base"
    } else {
        normalized
    };
    let encoding = resolve_encoding(target).map_err(|source| ChunkingError::Tokenizer {
        model: target.to_string(),
        source,
    })?;
    let encoding = Arc::new(encoding);

    Ok(Arc::new(move |segment: &str| {
        encoding.encode_ordinary(segment).len()
    }))
}

fn resolve_encoding(name: &str) -> Result<CoreBPE, TokenizerError> {
    if let Some(candidate) = encoding_from_name(name) {
        return candidate;
    }
    match get_bpe_from_model(name) {
        Ok(encoding) => Ok(encoding),
        Err(error) => {
            tracing::warn!(
                tokenizer = name,
                error = %error,
                "Unknown tokenizer; counting with 'cl100k_base'"
            );
            cl100k_base()
        }
    }
}

fn encoding_from_name(name: &str) -> Option<Result<CoreBPE, TokenizerError>> {
    match name {
        "cl100k_base" => Some(cl100k_base()),
        "o200k_base" => Some(o200k_base()),
        "p50k_base" => Some(p50k_base()),
        "p50k_edit" => Some(p50k_edit()),
        "r50k_base" | "gpt2" => Some(r50k_base()),
        _ => None,
    }
}
