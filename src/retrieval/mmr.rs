//! Maximal marginal relevance re-ranking.

use crate::index::{ScoredPosition, VectorIndex, cosine_similarity};

/// Select up to `k` candidates balancing query relevance against redundancy.
///
/// Each step picks the candidate maximizing
/// `lambda * relevance - (1 - lambda) * max_similarity_to_selected`. The returned order is the
/// selection order; ties keep the candidate that ranked higher by relevance.
pub(crate) fn mmr_select(
    index: &VectorIndex,
    candidates: &[ScoredPosition],
    k: usize,
    lambda: f32,
) -> Vec<ScoredPosition> {
    let entries = index.entries();
    let mut remaining: Vec<ScoredPosition> = candidates.to_vec();
    let mut selected: Vec<ScoredPosition> = Vec::with_capacity(k.min(candidates.len()));

    while selected.len() < k && !remaining.is_empty() {
        let mut best_slot = 0usize;
        let mut best_value = f32::NEG_INFINITY;

        for (slot, candidate) in remaining.iter().enumerate() {
            let embedding = &entries[candidate.position].embedding;
            let redundancy = selected
                .iter()
                .map(|chosen| cosine_similarity(embedding, &entries[chosen.position].embedding))
                .fold(0.0_f32, f32::max);
            let value = lambda * candidate.score - (1.0 - lambda) * redundancy;
            if value > best_value {
                best_value = value;
                best_slot = slot;
            }
        }

        selected.push(remaining.remove(best_slot));
    }

    selected
}
