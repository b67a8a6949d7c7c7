//! Whitespace normalization, extraction-artifact repair, and section markers.
//!
//! Extracted page text arrives with hard line wraps, ragged spacing, and numbers split by the
//! layout engine (`$ 1, 250`). Normalization collapses wraps inside a paragraph, keeps blank-line
//! paragraph breaks (`\n\n`) and wider section breaks (`\n\n\n`), glues split figures back
//! together, and puts a section break in front of recognized financial-statement headings so
//! the splitter prefers to cut there.

use regex::Regex;
use std::sync::LazyLock;

pub(crate) const SECTION_BREAK: &str = "\n\n\n";
const PARAGRAPH_BREAK: &str = "\n\n";

static SPLIT_CURRENCY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\s+(\d)").expect("valid currency regex"));
static SPLIT_THOUSANDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d),\s+(\d{3})\b").expect("valid thousands regex"));
static SPLIT_DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d)\s+\.(\d)").expect("valid decimal regex"));
static SPLIT_PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d)\s+%").expect("valid percent regex"));
static SECTION_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\s*\b(Table of Contents|Executive Summary|Financial Highlights|Management Discussion|Risk Factors|Notes to Financial Statements|Financial Statements|Income Statement|Balance Sheet|Cash Flow)\b",
    )
    .expect("valid heading regex")
});
static EXCESS_BREAKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{4,}").expect("valid break regex"));

/// Normalize one page of extracted text.
pub(crate) fn normalize_page_text(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace(['\r', '\x0C'], "\n");

    let mut output = String::with_capacity(unified.len());
    let mut blank_run = 0usize;
    let mut paragraph = String::new();

    for line in unified.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            blank_run += 1;
            continue;
        }

        if blank_run > 0 && !paragraph.is_empty() {
            flush_paragraph(&mut output, &mut paragraph);
            output.push_str(if blank_run >= 2 {
                SECTION_BREAK
            } else {
                PARAGRAPH_BREAK
            });
        }
        blank_run = 0;

        if !paragraph.is_empty() {
            paragraph.push(' ');
        }
        for (idx, word) in trimmed.split_whitespace().enumerate() {
            if idx > 0 {
                paragraph.push(' ');
            }
            paragraph.push_str(word);
        }
    }
    flush_paragraph(&mut output, &mut paragraph);

    let repaired = repair_split_figures(&output);
    let marked = SECTION_HEADING.replace_all(&repaired, "\n\n\n$1");
    let collapsed = EXCESS_BREAKS.replace_all(&marked, SECTION_BREAK);
    collapsed.trim().to_string()
}

fn flush_paragraph(output: &mut String, paragraph: &mut String) {
    output.push_str(paragraph);
    paragraph.clear();
}

/// Rejoin currency signs, thousands groups, decimals, and percent signs split by whitespace.
pub(crate) fn repair_split_figures(text: &str) -> String {
    let text = SPLIT_CURRENCY.replace_all(text, "$$$1");
    let text = SPLIT_THOUSANDS.replace_all(&text, "$1,$2");
    let text = SPLIT_DECIMAL.replace_all(&text, "$1.$2");
    SPLIT_PERCENT.replace_all(&text, "$1%").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_wrapped_lines_and_keeps_paragraphs() {
        let raw = "Revenue grew\nstrongly   this year.\n\nMargins held\nsteady.";
        assert_eq!(
            normalize_page_text(raw),
            "Revenue grew strongly this year.\n\nMargins held steady."
        );
    }

    #[test]
    fn wide_gaps_become_section_breaks() {
        let raw = "Part one.\n\n\n\n\nPart two.";
        assert_eq!(normalize_page_text(raw), "Part one.\n\n\nPart two.");
    }

    #[test]
    fn repairs_split_numbers() {
        assert_eq!(
            repair_split_figures("Sales of $ 1, 250 rose 12 % to 3 .5 points"),
            "Sales of $1,250 rose 12% to 3.5 points"
        );
    }

    #[test]
    fn leaves_separate_figures_apart() {
        assert_eq!(repair_split_figures("in 2023 and 2024"), "in 2023 and 2024");
    }

    #[test]
    fn injects_section_break_before_headings() {
        let normalized =
            normalize_page_text("Results were solid. Balance Sheet total assets rose.");
        assert_eq!(
            normalized,
            "Results were solid.\n\n\nBalance Sheet total assets rose."
        );
    }

    #[test]
    fn heading_at_start_does_not_leave_leading_breaks() {
        let normalized = normalize_page_text("Executive Summary\nThe year was good.");
        assert!(normalized.starts_with("Executive Summary"));
    }

    #[test]
    fn never_emits_more_than_three_newlines() {
        let normalized = normalize_page_text("Intro.\n\n\nCash Flow\n\n\n\nDetails follow here.");
        assert!(!normalized.contains("\n\n\n\n"));
    }
}
