//! Document-level digest built from the highest-signal tokens across all pages.

use super::metadata::{CURRENCY, PERCENTAGE, PERIOD, distinct_matches};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

const MIN_DOCUMENT_CHARS: usize = 100;
const FIGURE_LIMIT: usize = 5;
const PERIOD_LIMIT: usize = 5;
const PERCENT_LIMIT: usize = 10;
const ENTITY_CANDIDATES: usize = 5;
const ENTITY_MIN_COUNT: usize = 5;
const ENTITY_MIN_LEN: usize = 3;

static CAPITALIZED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][a-z]+\b").expect("valid entity regex"));

/// Build the summary body for `name`, or `None` when the text is too short or carries no signal.
pub(crate) fn build_summary(name: &str, full_text: &str) -> Option<String> {
    if full_text.trim().chars().count() <= MIN_DOCUMENT_CHARS {
        return None;
    }

    let mut parts = vec![format!("DOCUMENT SUMMARY: {name}")];

    let figures: Vec<String> = distinct_matches(&CURRENCY, full_text, usize::MAX)
        .into_iter()
        .filter(|value| {
            let lower = value.to_lowercase();
            lower.contains("million") || lower.contains("billion")
        })
        .take(FIGURE_LIMIT)
        .collect();
    if !figures.is_empty() {
        parts.push(format!("Key Financial Figures: {}", figures.join(", ")));
    }

    let periods = distinct_matches(&PERIOD, full_text, PERIOD_LIMIT);
    if !periods.is_empty() {
        parts.push(format!("Time Periods Covered: {}", periods.join(", ")));
    }

    let percentages = distinct_matches(&PERCENTAGE, full_text, PERCENT_LIMIT);
    if !percentages.is_empty() {
        parts.push(format!("Key Percentages: {}", percentages.join(", ")));
    }

    let entities = frequent_entities(full_text);
    if !entities.is_empty() {
        parts.push(format!("Key Entities: {}", entities.join(", ")));
    }

    (parts.len() > 1).then(|| parts.join("\n"))
}

/// Most frequent capitalized words, keeping those seen more than five times and longer than
/// three characters.
fn frequent_entities(text: &str) -> Vec<String> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (order, word) in CAPITALIZED.find_iter(text).enumerate() {
        counts
            .entry(word.as_str())
            .and_modify(|(count, _)| *count += 1)
            .or_insert((1, order));
    }

    let mut ranked: Vec<(&str, usize, usize)> = counts
        .into_iter()
        .map(|(word, (count, first_seen))| (word, count, first_seen))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

    ranked
        .into_iter()
        .take(ENTITY_CANDIDATES)
        .filter(|(word, count, _)| *count > ENTITY_MIN_COUNT && word.chars().count() > ENTITY_MIN_LEN)
        .map(|(word, _, _)| word.to_string())
        .collect()
}
