//! Path-token fallback matching.

use anyhow::Result;
use std::collections::HashSet;

use crate::config::RankingConfig;
use crate::db::{Database, PhotoFilters};

/// Lowercased ASCII alphanumeric runs of at least two characters, in query
/// order, at most `max_tokens` of them.
pub fn query_tokens(query: &str, max_tokens: usize) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit()))
        .filter(|token| token.len() >= 2)
        .take(max_tokens)
        .map(str::to_string)
        .collect()
}

/// Photos whose path mentions any query token, minus `exclude`.
pub fn lexical_fallback(
    db: &Database,
    tokens: &[String],
    filters: &PhotoFilters,
    exclude: &HashSet<i64>,
    config: &RankingConfig,
) -> Result<Vec<i64>> {
    if tokens.is_empty() {
        return Ok(Vec::new());
    }
    db.lexical_match_ids(tokens, filters, exclude, config.lexical_limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_tokens() {
        assert_eq!(
            query_tokens("Holiday 2019/Beach-Trip", 8),
            vec!["holiday", "2019", "beach", "trip"]
        );
    }

    #[test]
    fn test_query_tokens_drops_short_runs() {
        assert_eq!(query_tokens("a b cd e", 8), vec!["cd"]);
        assert!(query_tokens("  ", 8).is_empty());
    }

    #[test]
    fn test_query_tokens_non_ascii_splits() {
        assert_eq!(query_tokens("café_noir", 8), vec!["caf", "noir"]);
    }

    #[test]
    fn test_query_tokens_bounded() {
        let query = "aa bb cc dd ee ff gg hh ii jj";
        let tokens = query_tokens(query, 8);
        assert_eq!(tokens.len(), 8);
        assert_eq!(tokens.last().map(String::as_str), Some("hh"));
    }
}
