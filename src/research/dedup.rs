//! Source deduplication: exact identity first, then fuzzy embedding
//! clustering.
//!
//! Kept-set invariant: no two surviving SourceRefs share a normalized
//! stable identifier or title hash, and under the fuzzy strategy no two
//! have embedding cosine similarity at or above the threshold.

use chrono::Datelike;
use std::collections::HashSet;

use crate::model::{SourceRef, cosine_similarity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupStrategy {
    /// Group by normalized stable identifier / title hash only.
    Exact,
    /// Exact pass, then cosine clustering of the remainder.
    Fuzzy,
}

fn normalized_id(source: &SourceRef) -> String {
    source.stable_id.trim().to_lowercase()
}

/// Deduplicate, keeping the best-scored member of every identity group
/// and (in fuzzy mode) of every similarity cluster. Output order is the
/// canonical ranking: combined score descending, stable id ascending.
pub fn deduplicate(
    sources: Vec<SourceRef>,
    strategy: DedupStrategy,
    fuzzy_threshold: f64,
) -> Vec<SourceRef> {
    let current_year = chrono::Utc::now().year();

    // Rank best-first so each group's winner is seen before its
    // duplicates.
    let mut ranked = sources;
    ranked.sort_by(|a, b| {
        b.combined_score(current_year)
            .partial_cmp(&a.combined_score(current_year))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.stable_id.cmp(&b.stable_id))
    });

    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut seen_titles: HashSet<String> = HashSet::new();
    let mut kept: Vec<SourceRef> = Vec::new();

    for source in ranked {
        let id = normalized_id(&source);
        let title_hash = source.normalized_title_hash();
        if seen_ids.contains(&id) || seen_titles.contains(&title_hash) {
            continue;
        }
        if strategy == DedupStrategy::Fuzzy
            && let Some(embedding) = &source.embedding
        {
            let near_duplicate = kept.iter().any(|canonical| {
                canonical
                    .embedding
                    .as_ref()
                    .is_some_and(|e| cosine_similarity(e, embedding) >= fuzzy_threshold)
            });
            if near_duplicate {
                continue;
            }
        }
        seen_ids.insert(id);
        seen_titles.insert(title_hash);
        kept.push(source);
    }
    kept
}
