//! Hybrid photo search.
//!
//! A non-empty query is embedded and matched against the vector index; the
//! breadth of that ANN search grows until the similarity tail falls below a
//! keep threshold derived from the score curve. Photos whose path mentions a
//! query token are appended after every semantic hit. An empty query pages
//! through a shuffle that is stable for one calendar day.

pub mod lexical;
pub mod relevance;

pub use lexical::query_tokens;
pub use relevance::{keep_threshold, relevance_split};

use anyhow::Result;
use chrono::{Datelike, Local, NaiveDate};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use crate::config::RankingConfig;
use crate::db::{Database, Photo, PhotoFilters};
use crate::embed::{EmbedError, Embedder};
use crate::vector::{IndexError, VectorIndex};

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub filters: PhotoFilters,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub photo: Photo,
    /// Cosine similarity; `None` for lexical and shuffle results.
    pub score: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub offset: usize,
    pub limit: usize,
    pub total: usize,
    /// Leading hits to emphasize. Only set on the first page of a semantic search.
    pub most_relevant_count: Option<usize>,
    pub relevance_cutoff: Option<f32>,
    pub keep_threshold: Option<f32>,
    pub has_more: bool,
    pub next_offset: usize,
}

/// Outcome of the widening loop.
#[derive(Debug, Default)]
struct SemanticHits {
    eligible: Vec<(i64, f32)>,
    relevance_cutoff: Option<f32>,
    keep_threshold: Option<f32>,
    attempts: usize,
    k: usize,
}

pub struct Searcher {
    embedder: Option<Arc<dyn Embedder>>,
    index: Option<Arc<VectorIndex>>,
    config: RankingConfig,
}

impl Searcher {
    pub fn new(
        embedder: Option<Arc<dyn Embedder>>,
        index: Option<Arc<VectorIndex>>,
        config: RankingConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            config,
        }
    }

    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    pub fn search(&self, db: &Database, request: &SearchRequest) -> Result<SearchPage> {
        self.search_on(db, request, Local::now().date_naive())
    }

    /// Like [`Searcher::search`], with the shuffle keyed by `today`.
    pub fn search_on(&self, db: &Database, request: &SearchRequest, today: NaiveDate) -> Result<SearchPage> {
        let offset = request.offset;
        let limit = request.limit.clamp(1, self.config.max_page.max(1));
        let query = request.query.trim();

        if query.is_empty() {
            return self.browse(db, &request.filters, offset, limit, today);
        }

        let started = Instant::now();
        let tokens = query_tokens(query, self.config.max_query_tokens);

        let semantic = match self.embed_query(query)? {
            Some((vector, index)) => self.semantic_hits(db, index, &vector, &request.filters, offset, limit, tokens.len())?,
            None => SemanticHits::default(),
        };
        let semantic_elapsed = started.elapsed();

        let semantic_ids: Vec<i64> = semantic.eligible.iter().map(|(id, _)| *id).collect();
        let scores: HashMap<i64, f32> = semantic.eligible.iter().copied().collect();
        let exclude: HashSet<i64> = semantic_ids.iter().copied().collect();
        let lexical_ids = lexical::lexical_fallback(db, &tokens, &request.filters, &exclude, &self.config)?;

        let semantic_total = semantic_ids.len();
        let lexical_total = lexical_ids.len();
        let mut combined = semantic_ids;
        combined.extend(lexical_ids);
        let total = combined.len();

        let page_ids: Vec<i64> = combined.into_iter().skip(offset).take(limit).collect();
        let hits: Vec<SearchHit> = db
            .photos_by_ids(&page_ids)?
            .into_iter()
            .map(|photo| SearchHit {
                score: scores.get(&photo.id).copied(),
                photo,
            })
            .collect();

        let most_relevant_count = match semantic.relevance_cutoff {
            Some(cutoff) if offset == 0 && !semantic.eligible.is_empty() => Some(relevance::highlight_count(
                &semantic.eligible,
                cutoff,
                hits.len(),
                &self.config,
            )),
            _ => None,
        };

        tracing::info!(
            query = %query,
            offset,
            limit,
            rows = hits.len(),
            total,
            semantic = semantic_total,
            lexical = lexical_total,
            attempts = semantic.attempts,
            k = semantic.k,
            keep = semantic.keep_threshold.unwrap_or(0.0),
            relevant = semantic.relevance_cutoff.unwrap_or(0.0),
            semantic_ms = semantic_elapsed.as_millis() as u64,
            total_ms = started.elapsed().as_millis() as u64,
            "Search"
        );

        Ok(page(hits, offset, limit, total, most_relevant_count, &semantic))
    }

    /// Empty query: the filtered catalog in a day-keyed shuffle.
    fn browse(
        &self,
        db: &Database,
        filters: &PhotoFilters,
        offset: usize,
        limit: usize,
        today: NaiveDate,
    ) -> Result<SearchPage> {
        let total = db.count_photos(filters)?;
        let ids = db.shuffled_photo_ids(filters, daily_seed(today), offset, limit)?;
        let hits = db
            .photos_by_ids(&ids)?
            .into_iter()
            .map(|photo| SearchHit { photo, score: None })
            .collect();
        Ok(page(hits, offset, limit, total, None, &SemanticHits::default()))
    }

    /// Encode the query, or `None` when the semantic side is unavailable.
    fn embed_query(&self, query: &str) -> Result<Option<(Vec<f32>, &VectorIndex)>> {
        let (Some(embedder), Some(index)) = (&self.embedder, &self.index) else {
            tracing::warn!("Semantic search unavailable, using path matches only");
            return Ok(None);
        };
        match embedder.embed_text(query) {
            Ok(vector) => Ok(Some((vector, index.as_ref()))),
            Err(EmbedError::Unavailable(reason)) => {
                tracing::warn!(reason = %reason, "Embedder unavailable, using path matches only");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Widen the ANN breadth until the tail drops below the keep threshold,
    /// the page is covered, or the breadth cap is reached. Stale labels are
    /// pruned from the index along the way.
    #[allow(clippy::too_many_arguments)]
    fn semantic_hits(
        &self,
        db: &Database,
        index: &VectorIndex,
        vector: &[f32],
        filters: &PhotoFilters,
        offset: usize,
        limit: usize,
        token_count: usize,
    ) -> Result<SemanticHits> {
        let config = &self.config;
        let max_k = config.max_k.max(1);
        let wanted = offset.saturating_add(limit);
        let base_k = wanted
            .saturating_add(config.base_k_slack)
            .clamp(config.base_k_min, config.base_k_max.max(config.base_k_min))
            .min(max_k);

        let mut out = SemanticHits {
            k: base_k,
            ..SemanticHits::default()
        };
        let mut k = base_k;

        while out.attempts < config.max_attempts {
            out.attempts += 1;
            out.k = k;

            let mut hits = match index.search(vector, k) {
                Ok(hits) => hits,
                Err(IndexError::Unavailable(reason)) => {
                    tracing::warn!(reason = %reason, "Vector index unavailable, using path matches only");
                    return Ok(SemanticHits::default());
                }
                Err(e) => return Err(e.into()),
            };
            if hits.is_empty() {
                break;
            }
            hits.sort_by(|a, b| b.1.total_cmp(&a.1));
            let exhausted = hits.len() < k;

            let ids: Vec<i64> = hits.iter().map(|(id, _)| *id).collect();
            let existing = db.existing_photo_ids(&ids)?;
            let stale: Vec<i64> = ids.iter().copied().filter(|id| !existing.contains(id)).collect();
            if !stale.is_empty() {
                match index.delete_many(&stale) {
                    Ok(n) => tracing::debug!(pruned = n, "Pruned stale vector labels"),
                    Err(e) => tracing::warn!(error = %e, "Failed to prune stale vector labels"),
                }
            }

            let present: Vec<i64> = ids.iter().copied().filter(|id| existing.contains(id)).collect();
            let allowed = if filters.is_empty() {
                existing
            } else {
                db.filter_photo_ids(&present, filters)?
            };
            let filtered: Vec<(i64, f32)> = hits
                .into_iter()
                .filter(|(id, _)| allowed.contains(id))
                .collect();

            if filtered.is_empty() {
                if !stale.is_empty() {
                    continue;
                }
                if k >= max_k || exhausted {
                    break;
                }
                k = (k + base_k).min(max_k);
                continue;
            }

            let keep = match out.keep_threshold {
                Some(keep) => keep,
                None => {
                    let sample: Vec<f32> = filtered
                        .iter()
                        .take(config.elbow_sample.max(1))
                        .map(|(_, score)| *score)
                        .collect();
                    let split = relevance_split(&sample, config).clamp(1, sample.len());
                    let cutoff = sample[split - 1];
                    let keep = keep_threshold(cutoff, sample[0], token_count, config);
                    out.relevance_cutoff = Some(cutoff);
                    out.keep_threshold = Some(keep);
                    keep
                }
            };

            let last_score = filtered.last().map(|(_, score)| *score).unwrap_or(f32::MIN);
            out.eligible = filtered.into_iter().filter(|(_, score)| *score >= keep).collect();

            let complete = k >= max_k || exhausted || last_score < keep;
            if complete || out.eligible.len() >= wanted {
                break;
            }
            if !stale.is_empty() {
                continue;
            }
            k = (k + base_k).min(max_k);
        }

        Ok(out)
    }
}

fn page(
    hits: Vec<SearchHit>,
    offset: usize,
    limit: usize,
    total: usize,
    most_relevant_count: Option<usize>,
    semantic: &SemanticHits,
) -> SearchPage {
    let next_offset = offset.saturating_add(limit);
    SearchPage {
        has_more: hits.len() == limit && total > next_offset,
        hits,
        offset,
        limit,
        total,
        most_relevant_count,
        relevance_cutoff: semantic.relevance_cutoff,
        keep_threshold: semantic.keep_threshold,
        next_offset,
    }
}

/// `YYYYMMDD` as an integer.
fn daily_seed(day: NaiveDate) -> i64 {
    day.year() as i64 * 10_000 + day.month() as i64 * 100 + day.day() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VectorIndexConfig;
    use crate::db::{DateSource, PhotoUpsert};
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    const DIM: usize = 4;

    /// "beach" lands on the first axis, anything else on the last.
    struct AxisEmbedder;

    impl Embedder for AxisEmbedder {
        fn model_id(&self) -> &str {
            "axis"
        }

        fn dimension(&self) -> usize {
            DIM
        }

        fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            if text.contains("beach") {
                Ok(vec![1.0, 0.0, 0.0, 0.0])
            } else {
                Ok(vec![0.0, 0.0, 0.0, 1.0])
            }
        }

        fn embed_image(&self, _path: &Path) -> Result<Vec<f32>, EmbedError> {
            Err(EmbedError::Unavailable("text only".into()))
        }
    }

    struct Fixture {
        _dir: TempDir,
        db: Database,
        index: Arc<VectorIndex>,
        root_id: i64,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("catalog.db")).unwrap();
        db.initialize().unwrap();
        let root = db.add_root(Path::new("/photos")).unwrap();
        let config = VectorIndexConfig {
            path: dir.path().join("index"),
            default_capacity: 16,
            persist_interval_secs: 5,
        };
        let index = Arc::new(VectorIndex::new(&config, DIM, "axis"));
        Fixture {
            _dir: dir,
            db,
            index,
            root_id: root.id,
        }
    }

    fn insert(fx: &Fixture, rel: &str, date: &str) -> i64 {
        let path = format!("/photos/{}", rel);
        fx.db
            .upsert_photo(&PhotoUpsert {
                root_id: fx.root_id,
                path: &path,
                rel_path: rel,
                ext: "jpg",
                size_bytes: 1,
                mtime_ns: 1,
                date_taken: Some(date),
                date_source: DateSource::Exif,
            })
            .unwrap()
    }

    fn unit(x: f32) -> Vec<f32> {
        let y = (1.0 - x * x).max(0.0).sqrt();
        vec![x, y, 0.0, 0.0]
    }

    fn searcher(fx: &Fixture) -> Searcher {
        Searcher::new(
            Some(Arc::new(AxisEmbedder)),
            Some(Arc::clone(&fx.index)),
            RankingConfig::default(),
        )
    }

    fn request(query: &str, offset: usize, limit: usize) -> SearchRequest {
        SearchRequest {
            query: query.into(),
            filters: PhotoFilters::default(),
            offset,
            limit,
        }
    }

    #[test]
    fn test_semantic_hits_ordered_and_trimmed() {
        let fx = fixture();
        let strong = insert(&fx, "a.jpg", "2020-01-01 00:00:00");
        let good = insert(&fx, "b.jpg", "2020-01-02 00:00:00");
        let weak = insert(&fx, "c.jpg", "2020-01-03 00:00:00");
        fx.index.add_or_update(strong, &unit(0.95)).unwrap();
        fx.index.add_or_update(good, &unit(0.90)).unwrap();
        fx.index.add_or_update(weak, &unit(0.05)).unwrap();

        let page = searcher(&fx).search(&fx.db, &request("beach", 0, 10)).unwrap();
        let ids: Vec<i64> = page.hits.iter().map(|h| h.photo.id).collect();
        assert_eq!(ids, vec![strong, good]);
        assert_eq!(page.total, 2);
        assert!(page.hits[0].score.unwrap() > page.hits[1].score.unwrap());
        assert!(page.most_relevant_count.is_some());
        assert!(!page.has_more);
    }

    #[test]
    fn test_stale_labels_pruned() {
        let fx = fixture();
        let live = insert(&fx, "a.jpg", "2020-01-01 00:00:00");
        fx.index.add_or_update(live, &unit(0.9)).unwrap();
        fx.index.add_or_update(9_999, &unit(0.99)).unwrap();

        let page = searcher(&fx).search(&fx.db, &request("beach", 0, 10)).unwrap();
        assert_eq!(page.hits.len(), 1);
        assert_eq!(page.hits[0].photo.id, live);
        assert!(!fx.index.has_label(9_999).unwrap());
    }

    #[test]
    fn test_lexical_appended_after_semantic() {
        let fx = fixture();
        let semantic = insert(&fx, "misc/a.jpg", "2020-01-01 00:00:00");
        let older = insert(&fx, "beach/b.jpg", "2019-01-01 00:00:00");
        let newer = insert(&fx, "beach/c.jpg", "2021-01-01 00:00:00");
        fx.index.add_or_update(semantic, &unit(0.9)).unwrap();

        let page = searcher(&fx).search(&fx.db, &request("beach", 0, 10)).unwrap();
        let ids: Vec<i64> = page.hits.iter().map(|h| h.photo.id).collect();
        assert_eq!(ids, vec![semantic, newer, older]);
        assert!(page.hits[1].score.is_none());
    }

    #[test]
    fn test_lexical_only_without_embedder() {
        let fx = fixture();
        let id = insert(&fx, "beach/a.jpg", "2020-01-01 00:00:00");
        insert(&fx, "city/b.jpg", "2020-01-01 00:00:00");

        let searcher = Searcher::new(None, None, RankingConfig::default());
        let page = searcher.search(&fx.db, &request("Beach", 0, 10)).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.hits[0].photo.id, id);
        assert_eq!(page.most_relevant_count, None);
    }

    #[test]
    fn test_pagination_has_more() {
        let fx = fixture();
        for i in 0..5 {
            insert(&fx, &format!("beach/{}.jpg", i), "2020-01-01 00:00:00");
        }
        let searcher = Searcher::new(None, None, RankingConfig::default());

        let first = searcher.search(&fx.db, &request("beach", 0, 2)).unwrap();
        assert_eq!(first.hits.len(), 2);
        assert!(first.has_more);
        assert_eq!(first.next_offset, 2);

        let last = searcher.search(&fx.db, &request("beach", 4, 2)).unwrap();
        assert_eq!(last.hits.len(), 1);
        assert!(!last.has_more);
    }

    #[test]
    fn test_offset_past_the_end() {
        let fx = fixture();
        for i in 0..3 {
            insert(&fx, &format!("beach/{}.jpg", i), "2020-01-01 00:00:00");
        }
        let searcher = searcher(&fx);

        for query in ["beach", ""] {
            let page = searcher.search(&fx.db, &request(query, usize::MAX - 1, 10)).unwrap();
            assert!(page.hits.is_empty());
            assert_eq!(page.total, 3);
            assert!(!page.has_more);
            assert_eq!(page.next_offset, usize::MAX);
        }
    }

    #[test]
    fn test_browse_stable_within_day() {
        let fx = fixture();
        for i in 0..20 {
            insert(&fx, &format!("{}.jpg", i), "2020-01-01 00:00:00");
        }
        let searcher = searcher(&fx);
        let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let next_day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();

        let ids = |day: NaiveDate| -> Vec<i64> {
            searcher
                .search_on(&fx.db, &request("", 0, 20), day)
                .unwrap()
                .hits
                .iter()
                .map(|h| h.photo.id)
                .collect()
        };
        let a = ids(day);
        assert_eq!(a.len(), 20);
        assert_eq!(a, ids(day));
        assert_ne!(a, ids(next_day));

        let page = searcher.search_on(&fx.db, &request("", 0, 20), day).unwrap();
        assert_eq!(page.total, 20);
        assert!(!page.has_more);
    }

    #[test]
    fn test_daily_seed() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(daily_seed(day), 20240309);
    }
}
