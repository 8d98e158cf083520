//! Score-curve heuristics for semantic results.

use crate::config::RankingConfig;

/// Number of leading results that count as "most relevant".
///
/// Finds the steepest drop between adjacent scores within the first
/// `elbow_window` pairs. A drop smaller than both `elbow_min_drop` and
/// `elbow_relative_drop * top` is noise; then `default_split` is used.
/// `scores` must be sorted descending. Returns 0 only for an empty slice.
pub fn relevance_split(scores: &[f32], config: &RankingConfig) -> usize {
    let n = scores.len();
    if n == 0 {
        return 0;
    }

    let fallback = config.default_split.clamp(1, n);
    let last = (n - 1).min(config.elbow_window);

    let mut best_drop = 0.0f32;
    let mut best_split = fallback;
    for i in 1..=last {
        let drop = scores[i - 1] - scores[i];
        if drop > best_drop {
            best_drop = drop;
            best_split = i;
        }
    }

    let required = config
        .elbow_min_drop
        .max(scores[0] * config.elbow_relative_drop);
    if best_drop < required {
        best_split = fallback;
    }
    best_split.max(1)
}

/// Lowest similarity a semantic hit may have and still be returned.
///
/// Sits `keep_margin` below the elbow score but never under a floor, and
/// never above the elbow score itself. Weak top scores lower the floor;
/// short queries with a weak top score lower it further.
pub fn keep_threshold(cutoff: f32, top: f32, token_count: usize, config: &RankingConfig) -> f32 {
    let floor = if token_count <= 2 && top < config.short_query_top_score {
        config.keep_floor_short
    } else if top < config.weak_top_score {
        config.keep_floor_weak
    } else {
        config.keep_floor
    };
    (cutoff - config.keep_margin).max(floor).min(cutoff)
}

/// How many of the first page's hits to emphasize.
pub fn highlight_count(eligible: &[(i64, f32)], cutoff: f32, page_len: usize, config: &RankingConfig) -> usize {
    let above = eligible
        .iter()
        .take(config.highlight_window)
        .filter(|(_, score)| *score >= cutoff)
        .count();
    above
        .clamp(config.highlight_min, config.highlight_max.max(config.highlight_min))
        .min(page_len)
}
