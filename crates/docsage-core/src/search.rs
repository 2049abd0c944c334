//! Ranking helpers shared by every [`Store`](crate::store::Store) backend.
//!
//! # Ordering
//!
//! Results are sorted by score (desc), then `indexed_seq` (desc, the most
//! recently indexed record wins a tie), then chunk id (asc). The ordering is
//! total, so identical index state always produces identical rankings.
//!
//! # Hybrid fusion
//!
//! [`reciprocal_rank_fusion`] merges several ranked lists by summing
//! `1 / (k + rank)` for every list a chunk appears in. Raw scores from
//! different backends are never compared directly.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::ScoredChunk;

/// Conventional RRF smoothing constant.
pub const RRF_K: f64 = 60.0;

/// Total order used for every ranked result list.
pub fn compare_scored(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.indexed_seq.cmp(&a.indexed_seq))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Sort candidates with [`compare_scored`] and keep the best `k`.
pub fn rank_candidates(mut candidates: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    candidates.sort_by(compare_scored);
    candidates.truncate(k);
    candidates
}

/// Fuse ranked lists with reciprocal rank fusion.
///
/// Each chunk scores `Σ 1 / (k_const + rank)` over the lists containing it,
/// with `rank` starting at 1. The fused list is ordered with
/// [`compare_scored`] and truncated to `limit`.
pub fn reciprocal_rank_fusion(
    lists: &[Vec<ScoredChunk>],
    k_const: f64,
    limit: usize,
) -> Vec<ScoredChunk> {
    let mut fused: HashMap<String, ScoredChunk> = HashMap::new();

    for list in lists {
        for (rank, chunk) in list.iter().enumerate() {
            let contribution = 1.0 / (k_const + rank as f64 + 1.0);
            fused
                .entry(chunk.chunk_id.clone())
                .and_modify(|c| c.score += contribution)
                .or_insert_with(|| ScoredChunk {
                    score: contribution,
                    ..chunk.clone()
                });
        }
    }

    rank_candidates(fused.into_values().collect(), limit)
}

/// Lowercased alphanumeric terms of a query, deduplicated in order.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// Term-frequency score of `text` for `terms`; zero when nothing matches.
pub fn term_match_score(text: &str, terms: &[String]) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<String, usize> = HashMap::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        *counts.entry(word.to_lowercase()).or_default() += 1;
    }

    let mut matched = 0usize;
    let mut frequency = 0usize;
    for term in terms {
        if let Some(&n) = counts.get(term) {
            matched += 1;
            frequency += n;
        }
    }
    if matched == 0 {
        return 0.0;
    }
    // Coverage of distinct terms dominates raw frequency.
    matched as f64 + (frequency as f64).ln_1p() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(id: &str, score: f64, seq: i64) -> ScoredChunk {
        ScoredChunk {
            chunk_id: id.to_string(),
            document_id: "doc".to_string(),
            path: "doc.md".to_string(),
            chunk_index: 0,
            text: String::new(),
            score,
            indexed_seq: seq,
        }
    }

    fn ids(list: &[ScoredChunk]) -> Vec<&str> {
        list.iter().map(|c| c.chunk_id.as_str()).collect()
    }

    #[test]
    fn ranks_by_score_then_recency_then_id() {
        let ranked = rank_candidates(
            vec![
                scored("b", 0.5, 1),
                scored("a", 0.5, 1),
                scored("c", 0.9, 1),
                scored("d", 0.5, 7),
            ],
            10,
        );
        assert_eq!(ids(&ranked), vec!["c", "d", "a", "b"]);
    }

    #[test]
    fn rank_truncates() {
        let ranked = rank_candidates(vec![scored("a", 0.1, 1), scored("b", 0.2, 1)], 1);
        assert_eq!(ids(&ranked), vec!["b"]);
    }

    #[test]
    fn ranking_is_order_independent() {
        let items = vec![
            scored("x", 0.3, 2),
            scored("y", 0.3, 2),
            scored("z", 0.7, 1),
        ];
        let mut reversed = items.clone();
        reversed.reverse();
        assert_eq!(rank_candidates(items, 3), rank_candidates(reversed, 3));
    }

    #[test]
    fn rrf_rewards_agreement() {
        let semantic = vec![scored("a", 0.9, 1), scored("b", 0.8, 1), scored("c", 0.7, 1)];
        let keyword = vec![scored("b", 3.0, 1), scored("d", 2.0, 1)];
        let fused = reciprocal_rank_fusion(&[semantic, keyword], RRF_K, 3);
        assert_eq!(fused[0].chunk_id, "b");
        assert!((fused[0].score - (1.0 / 62.0 + 1.0 / 61.0)).abs() < 1e-12);
        assert_eq!(fused.len(), 3);
    }

    #[test]
    fn query_terms_dedup_and_lowercase() {
        assert_eq!(
            query_terms("Retention policy? retention, POLICY!"),
            vec!["retention", "policy"]
        );
        assert!(query_terms("  ?! ").is_empty());
    }

    #[test]
    fn term_match_prefers_coverage() {
        let terms = query_terms("quarterly retention");
        let both = term_match_score("Quarterly retention review", &terms);
        let one = term_match_score("retention retention retention", &terms);
        assert!(both > one);
        assert_eq!(term_match_score("unrelated text", &terms), 0.0);
    }
}
