//! Best-effort extraction of financial signals from page and chunk text.

use super::types::Section;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

const PAGE_VALUE_LIMIT: usize = 5;
const PAGE_PERIOD_LIMIT: usize = 3;
const KEY_VALUE_LIMIT: usize = 10;
const SECTION_WINDOW_CHARS: usize = 500;

pub(crate) static CURRENCY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\$[\d,]+(?:\.\d{1,2})?(?:\s*(?:million|billion|M|B)\b)?")
        .expect("valid currency regex")
});
pub(crate) static PERCENTAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?%").expect("valid percentage regex"));
pub(crate) static PERIOD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:Q[1-4]\s*)?(?:FY\s*)?20\d{2}\b").expect("valid period regex")
});
static KEY_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b([A-Z][A-Za-z&/\- ]{2,40}?)\s*:\s*(\(?-?\$?[\d,]+(?:\.\d+)?\)?%?(?:\s*(?:million|billion))?)",
    )
    .expect("valid key-value regex")
});

/// Signals gathered from a whole page and copied onto each of its chunks.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PageSignals {
    pub(crate) financial_values: Vec<String>,
    pub(crate) percentages: Vec<String>,
    pub(crate) time_periods: Vec<String>,
    pub(crate) section: Option<Section>,
    pub(crate) key_values: BTreeMap<String, String>,
}

/// Signals local to one chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ChunkSignals {
    pub(crate) financial_values: Vec<String>,
    pub(crate) percentages: Vec<String>,
    pub(crate) dates: Vec<String>,
}

pub(crate) fn page_signals(text: &str) -> PageSignals {
    PageSignals {
        financial_values: distinct_matches(&CURRENCY, text, PAGE_VALUE_LIMIT),
        percentages: distinct_matches(&PERCENTAGE, text, PAGE_VALUE_LIMIT),
        time_periods: distinct_matches(&PERIOD, text, PAGE_PERIOD_LIMIT),
        section: classify_section(text),
        key_values: key_values(text),
    }
}

pub(crate) fn chunk_signals(text: &str) -> ChunkSignals {
    ChunkSignals {
        financial_values: distinct_matches(&CURRENCY, text, usize::MAX),
        percentages: distinct_matches(&PERCENTAGE, text, usize::MAX),
        dates: distinct_matches(&PERIOD, text, usize::MAX),
    }
}

/// Distinct matches of `pattern` in first-seen order, at most `limit` of them.
pub(crate) fn distinct_matches(pattern: &Regex, text: &str, limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    pattern
        .find_iter(text)
        .map(|found| found.as_str().trim().to_string())
        .filter(|value| seen.insert(value.clone()))
        .take(limit)
        .collect()
}

/// Classify a page from its opening text.
pub(crate) fn classify_section(text: &str) -> Option<Section> {
    let head: String = text
        .chars()
        .take(SECTION_WINDOW_CHARS)
        .collect::<String>()
        .to_lowercase();

    if head.contains("income statement") || (head.contains("profit") && head.contains("loss")) {
        Some(Section::IncomeStatement)
    } else if head.contains("balance sheet")
        || (head.contains("assets") && head.contains("liabilities"))
    {
        Some(Section::BalanceSheet)
    } else if head.contains("cash flow") {
        Some(Section::CashFlow)
    } else if head.contains("executive summary") || head.contains("overview") {
        Some(Section::ExecutiveSummary)
    } else {
        None
    }
}

fn key_values(text: &str) -> BTreeMap<String, String> {
    let mut pairs = BTreeMap::new();
    for captures in KEY_VALUE.captures_iter(text) {
        if pairs.len() >= KEY_VALUE_LIMIT {
            break;
        }
        let (Some(label), Some(value)) = (captures.get(1), captures.get(2)) else {
            continue;
        };
        let label = label.as_str().trim();
        if label.is_empty() {
            continue;
        }
        pairs
            .entry(label.to_string())
            .or_insert_with(|| value.as_str().trim().to_string());
    }
    pairs
}
