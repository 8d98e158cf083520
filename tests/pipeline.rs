//! End-to-end runs of the scan → ingest → search pipeline, driven step by
//! step on the test thread instead of the worker threads.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use tempfile::{tempdir, TempDir};

use lighthouse::config::Config;
use lighthouse::db::{Database, PhotoFilters};
use lighthouse::embed::{normalize, EmbedError, Embedder};
use lighthouse::indexer::{IndexTask, Indexer, IngestOutcome};
use lighthouse::scanner::{ThumbnailManager, Thumbnailer};
use lighthouse::search::SearchRequest;
use lighthouse::Library;

const DIM: usize = 8;
const STEP: Duration = Duration::from_millis(20);

/// Images and queries mentioning "sunset" share the first axis. Every other
/// image gets its own axis, orthogonal to it.
struct FakeEmbedder {
    model_id: String,
}

impl FakeEmbedder {
    fn new(model_id: &str) -> Arc<dyn Embedder> {
        Arc::new(Self {
            model_id: model_id.to_string(),
        })
    }
}

fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[i] = 1.0;
    v
}

impl Embedder for FakeEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        DIM
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if text.to_lowercase().contains("sunset") {
            Ok(axis(0))
        } else {
            Ok(axis(DIM - 1))
        }
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbedError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.contains("sunset") {
            return Ok(axis(0));
        }
        let bucket = name.bytes().map(usize::from).sum::<usize>() % (DIM - 2);
        let mut v = axis(1 + bucket);
        normalize(&mut v);
        Ok(v)
    }
}

/// A model that never loads.
struct DeadEmbedder;

impl Embedder for DeadEmbedder {
    fn model_id(&self) -> &str {
        "dead"
    }

    fn dimension(&self) -> usize {
        DIM
    }

    fn embed_text(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
        Err(EmbedError::Unavailable("model missing".to_string()))
    }

    fn embed_image(&self, _path: &Path) -> Result<Vec<f32>, EmbedError> {
        Err(EmbedError::Unavailable("model missing".to_string()))
    }

    fn is_available(&self) -> bool {
        false
    }
}

struct Harness {
    dir: TempDir,
    config: Config,
    library: Library,
    db: Database,
}

impl Harness {
    fn new(embedder: Option<Arc<dyn Embedder>>) -> Self {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        Self::reopen(dir, config, embedder)
    }

    fn reopen(dir: TempDir, config: Config, embedder: Option<Arc<dyn Embedder>>) -> Self {
        let library = Library::open_with_embedder(config.clone(), embedder).unwrap();
        let db = Database::open(&config.db_path).unwrap();
        Self {
            dir,
            config,
            library,
            db,
        }
    }

    fn photos_dir(&self) -> PathBuf {
        let path = self.dir.path().join("photos");
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    fn indexer(&self) -> &Indexer {
        self.library.indexer()
    }

    /// Run queued scans and ingests until both queues are idle.
    fn drain(&self) {
        loop {
            let scanned = self.indexer().scan_next(&self.db, STEP);
            let mut ingested = false;
            while self.indexer().ingest_next(&self.db, STEP) {
                ingested = true;
            }
            if !scanned && !ingested {
                break;
            }
        }
    }

    fn photo_id(&self, path: &Path) -> i64 {
        self.db
            .photo_signature(&path.to_string_lossy())
            .unwrap()
            .unwrap()
            .id
    }
}

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.db_path = dir.join("catalog.db");
    config.thumbnails.path = dir.join("thumbs");
    config.index.path = dir.join("index");
    config.index.default_capacity = 16;
    config.embedding.enabled = false;
    config
}

fn write_png(path: &Path, width: u32, height: u32) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    image::RgbImage::from_pixel(width, height, image::Rgb([200, 120, 40]))
        .save(path)
        .unwrap();
}

fn request(query: &str) -> SearchRequest {
    SearchRequest {
        query: query.to_string(),
        filters: PhotoFilters::default(),
        offset: 0,
        limit: 50,
    }
}

#[test]
fn test_ingest_indexes_every_image() {
    let h = Harness::new(Some(FakeEmbedder::new("fake-v1")));
    let photos = h.photos_dir();
    write_png(&photos.join("sunset.png"), 16, 12);
    write_png(&photos.join("nested/dog.png"), 16, 12);
    write_png(&photos.join(".hidden/secret.png"), 16, 12);
    std::fs::write(photos.join("notes.txt"), "not a photo").unwrap();

    let root = h.library.track_root(&photos).unwrap();
    h.drain();

    let status = h.library.status().unwrap();
    assert_eq!(status.photos_total, 2);
    assert_eq!(status.roots[0].photo_count, 2);

    let sunset = photos.canonicalize().unwrap().join("sunset.png");
    let id = h.photo_id(&sunset);
    let photo = h.db.get_photo(id).unwrap().unwrap();
    assert_eq!(photo.root_id, root.id);
    assert_eq!(photo.rel_path, "sunset.png");
    assert_eq!((photo.width, photo.height), (Some(16), Some(12)));
    assert_eq!(photo.embedding_model.as_deref(), Some("fake-v1"));
    assert!(photo.date_taken.is_some());

    let thumbs = ThumbnailManager::new(&h.config.thumbnails);
    assert!(thumbs.has_thumbnail(id));
    assert!(h.indexer().vectors().unwrap().has_label(id).unwrap());

    let recent = h.library.recent_activity(10);
    assert_eq!(recent.len(), 2);
}

#[test]
fn test_rescan_is_idempotent() {
    let h = Harness::new(Some(FakeEmbedder::new("fake-v1")));
    let photos = h.photos_dir();
    write_png(&photos.join("a.png"), 16, 12);
    let root = h.library.track_root(&photos).unwrap();
    h.drain();

    let path = root.path.join("a.png");
    let task = IndexTask::new(path.clone(), root.id, root.path.clone());
    let outcome = h.indexer().process_task(&h.db, &task).unwrap();
    assert_eq!(outcome, IngestOutcome::Unchanged);

    // A full rescan leaves the catalog as it was.
    let before = h.db.get_photo(h.photo_id(&path)).unwrap().unwrap();
    h.library.rescan_all().unwrap();
    h.drain();
    let after = h.db.get_photo(h.photo_id(&path)).unwrap().unwrap();
    assert_eq!(before.id, after.id);
    assert_eq!(before.indexed_at, after.indexed_at);
    assert_eq!(h.library.status().unwrap().photos_total, 1);
}

#[test]
fn test_changed_file_is_reingested() {
    let h = Harness::new(Some(FakeEmbedder::new("fake-v1")));
    let photos = h.photos_dir();
    write_png(&photos.join("a.png"), 16, 12);
    let root = h.library.track_root(&photos).unwrap();
    h.drain();

    let path = root.path.join("a.png");
    let id = h.photo_id(&path);
    write_png(&path, 40, 30);

    let task = IndexTask::new(path.clone(), root.id, root.path.clone());
    match h.indexer().process_task(&h.db, &task).unwrap() {
        IngestOutcome::Updated {
            photo_id,
            metadata,
            thumbnail,
            embedding,
        } => {
            assert_eq!(photo_id, id);
            assert!(metadata && thumbnail && embedding);
        }
        other => panic!("expected an update, got {:?}", other),
    }
    let photo = h.db.get_photo(id).unwrap().unwrap();
    assert_eq!((photo.width, photo.height), (Some(40), Some(30)));
}

#[test]
fn test_scan_marks_root_finished() {
    let h = Harness::new(None);
    let photos = h.photos_dir();
    write_png(&photos.join("a.png"), 8, 8);
    write_png(&photos.join("b.png"), 8, 8);
    let root = h.library.track_root(&photos).unwrap();
    assert!(root.last_scan_finished_at.is_none());

    // Enumeration alone is not enough.
    assert!(h.indexer().scan_next(&h.db, STEP));
    let root = h.db.get_root(root.id).unwrap().unwrap();
    assert!(root.last_scan_enumerated_at.is_some());
    assert!(root.last_scan_finished_at.is_none());

    h.drain();
    let root = h.db.get_root(root.id).unwrap().unwrap();
    assert!(root.last_scan_finished_at.is_some());
    assert!(root.last_error.is_none());

    let stats = h.library.status().unwrap().indexer;
    let scan = stats.last_scan.unwrap();
    assert_eq!(scan.found, 2);
    assert_eq!(scan.enqueued, 2);
}

#[test]
fn test_watcher_event_does_not_finish_scan_early() {
    let h = Harness::new(None);
    let photos = h.photos_dir();
    write_png(&photos.join("a.png"), 8, 8);
    write_png(&photos.join("b.png"), 8, 8);
    let root = h.library.track_root(&photos).unwrap();

    // A change notification lands before the scan enumerates.
    assert!(h
        .indexer()
        .enqueue(IndexTask::new(root.path.join("a.png"), root.id, root.path.clone())));
    assert!(h.indexer().scan_next(&h.db, STEP));
    assert_eq!(h.indexer().stats().ingest_queue_len, 3);

    assert!(h.indexer().ingest_next(&h.db, STEP));
    assert!(h.indexer().ingest_next(&h.db, STEP));
    assert_eq!(h.indexer().stats().ingest_queue_len, 1);
    let pending = h.db.get_root(root.id).unwrap().unwrap();
    assert!(pending.last_scan_finished_at.is_none());

    assert!(h.indexer().ingest_next(&h.db, STEP));
    let done = h.db.get_root(root.id).unwrap().unwrap();
    assert!(done.last_scan_finished_at.is_some());
}

#[test]
fn test_unavailable_model_is_not_requeued() {
    let h = Harness::new(Some(Arc::new(DeadEmbedder)));
    let photos = h.photos_dir();
    write_png(&photos.join("a.png"), 8, 8);
    write_png(&photos.join("b.png"), 8, 8);
    let root = h.library.track_root(&photos).unwrap();
    h.drain();

    // Rows and thumbnails still land without a model.
    let status = h.library.status().unwrap();
    assert_eq!(status.photos_total, 2);
    assert_eq!(h.library.recent_activity(10).len(), 2);
    let photo = h.db.get_photo(h.photo_id(&root.path.join("a.png"))).unwrap().unwrap();
    assert_eq!((photo.width, photo.height), (Some(8), Some(8)));
    assert!(photo.embedding_model.is_none());

    for _ in 0..3 {
        lighthouse::tasks::catchup_step(h.indexer(), &h.db);
        assert_eq!(h.indexer().enqueue_missing_embeddings(&h.db).unwrap(), 0);
        assert_eq!(h.indexer().stats().ingest_queue_len, 0);
    }

    // A stray event for the photo writes nothing and is not reported.
    let task = IndexTask::new(root.path.join("a.png"), root.id, root.path.clone());
    assert_eq!(
        h.indexer().process_task(&h.db, &task).unwrap(),
        IngestOutcome::Unchanged
    );
    assert!(h.indexer().enqueue(task));
    h.drain();
    assert_eq!(h.library.recent_activity(10).len(), 2);
}

#[test]
fn test_concurrent_ingest_of_one_file_converges() {
    let h = Harness::new(Some(FakeEmbedder::new("fake-v1")));
    let photos = h.photos_dir();
    write_png(&photos.join("sunset.png"), 24, 18);
    let root = h.library.track_root(&photos).unwrap();
    let path = root.path.join("sunset.png");
    let task = IndexTask::new(path.clone(), root.id, root.path.clone());

    let barrier = Arc::new(Barrier::new(2));
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let indexer = Arc::clone(h.library.indexer());
            let barrier = Arc::clone(&barrier);
            let db_path = h.config.db_path.clone();
            let task = task.clone();
            thread::spawn(move || {
                let db = Database::open(&db_path).unwrap();
                barrier.wait();
                indexer.process_task(&db, &task).unwrap()
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let ids = h.db.photo_ids_for_root(root.id).unwrap();
    assert_eq!(ids.len(), 1);
    let photo = h.db.get_photo(ids[0]).unwrap().unwrap();
    assert_eq!(photo.path, path.to_string_lossy());
    assert_eq!((photo.width, photo.height), (Some(24), Some(18)));
    assert_eq!(photo.embedding_model.as_deref(), Some("fake-v1"));
    assert_eq!(photo.embedding_dim, Some(DIM as i64));
    assert!(h.indexer().vectors().unwrap().has_label(photo.id).unwrap());

    // Whatever either thread left behind, a further pass has nothing to do.
    assert_eq!(
        h.indexer().process_task(&h.db, &task).unwrap(),
        IngestOutcome::Unchanged
    );
}

#[test]
fn test_untrack_removes_derived_state() {
    let h = Harness::new(Some(FakeEmbedder::new("fake-v1")));
    let photos = h.photos_dir();
    write_png(&photos.join("sunset.png"), 16, 12);
    write_png(&photos.join("dog.png"), 16, 12);
    let root = h.library.track_root(&photos).unwrap();
    h.drain();

    let ids = h.db.photo_ids_for_root(root.id).unwrap();
    assert_eq!(ids.len(), 2);
    let thumbs = ThumbnailManager::new(&h.config.thumbnails);
    let vectors = h.indexer().vectors().unwrap();

    assert!(h.library.untrack_root(root.id).unwrap());
    assert!(h.db.get_root(root.id).unwrap().is_none());
    assert!(h.db.photo_ids_for_root(root.id).unwrap().is_empty());
    for id in ids {
        assert!(h.db.get_photo(id).unwrap().is_none());
        assert!(!thumbs.has_thumbnail(id));
        assert!(!vectors.has_label(id).unwrap());
    }
    assert!(h.library.search(&request("sunset")).unwrap().hits.is_empty());

    // The files themselves stay.
    assert!(photos.join("sunset.png").exists());
    assert!(!h.library.untrack_root(root.id).unwrap());
}

#[test]
fn test_missing_vector_label_self_heals() {
    let h = Harness::new(Some(FakeEmbedder::new("fake-v1")));
    let photos = h.photos_dir();
    write_png(&photos.join("sunset.png"), 16, 12);
    let root = h.library.track_root(&photos).unwrap();
    h.drain();

    let path = root.path.join("sunset.png");
    let id = h.photo_id(&path);
    let vectors = h.indexer().vectors().unwrap();
    assert!(vectors.delete(id).unwrap());

    let task = IndexTask::new(path, root.id, root.path.clone());
    let outcome = h.indexer().process_task(&h.db, &task).unwrap();
    assert_eq!(
        outcome,
        IngestOutcome::Updated {
            photo_id: id,
            metadata: false,
            thumbnail: false,
            embedding: true,
        }
    );
    assert!(vectors.has_label(id).unwrap());
}

#[test]
fn test_model_change_queues_reembedding() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let photos = dir.path().join("photos");
    write_png(&photos.join("a.png"), 8, 8);
    write_png(&photos.join("b.png"), 8, 8);

    let h = Harness::reopen(dir, config.clone(), Some(FakeEmbedder::new("fake-v1")));
    h.library.track_root(&photos).unwrap();
    h.drain();
    assert_eq!(h.indexer().enqueue_missing_embeddings(&h.db).unwrap(), 0);
    h.library.shutdown();
    let Harness { dir, library, .. } = h;
    drop(library);

    let h = Harness::reopen(dir, config, Some(FakeEmbedder::new("fake-v2")));
    assert_eq!(h.indexer().enqueue_missing_embeddings(&h.db).unwrap(), 2);
    h.drain();
    assert_eq!(h.indexer().enqueue_missing_embeddings(&h.db).unwrap(), 0);
}

#[test]
fn test_path_matches_follow_semantic_hits() {
    let h = Harness::new(Some(FakeEmbedder::new("fake-v1")));
    let photos = h.photos_dir();
    write_png(&photos.join("sunset.png"), 16, 12);
    write_png(&photos.join("beach/dog.png"), 16, 12);
    write_png(&photos.join("beach/cat.png"), 16, 12);
    write_png(&photos.join("city/tram.png"), 16, 12);
    h.library.track_root(&photos).unwrap();
    h.drain();

    let page = h.library.search(&request("sunset beach")).unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.hits[0].photo.rel_path, "sunset.png");
    assert!(page.hits[0].score.is_some());

    let mut rest: Vec<&str> = page.hits[1..].iter().map(|h| h.photo.rel_path.as_str()).collect();
    rest.sort();
    assert_eq!(rest, vec!["beach/cat.png", "beach/dog.png"]);
    assert!(page.hits[1..].iter().all(|h| h.score.is_none()));
    assert_eq!(page.most_relevant_count, Some(3));
    assert!(!page.has_more);
}

#[test]
fn test_search_without_embedder_uses_paths() {
    let h = Harness::new(None);
    let photos = h.photos_dir();
    write_png(&photos.join("beach/dog.png"), 8, 8);
    write_png(&photos.join("city/tram.png"), 8, 8);
    h.library.track_root(&photos).unwrap();
    h.drain();

    let page = h.library.search(&request("BEACH")).unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.hits[0].photo.rel_path, "beach/dog.png");
    assert!(page.most_relevant_count.is_none());
}

#[test]
fn test_browse_order_stable_for_a_day() {
    let h = Harness::new(None);
    let photos = h.photos_dir();
    for i in 0..12 {
        write_png(&photos.join(format!("p{:02}.png", i)), 4, 4);
    }
    h.library.track_root(&photos).unwrap();
    h.drain();

    let searcher = lighthouse::search::Searcher::new(None, None, h.config.ranking.clone());
    let day = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
    let ids = |offset: usize| -> Vec<i64> {
        let req = SearchRequest {
            query: String::new(),
            filters: PhotoFilters::default(),
            offset,
            limit: 5,
        };
        searcher
            .search_on(&h.db, &req, day)
            .unwrap()
            .hits
            .iter()
            .map(|hit| hit.photo.id)
            .collect()
    };

    let first = ids(0);
    assert_eq!(first, ids(0));

    let mut all: Vec<i64> = [ids(0), ids(5), ids(10)].concat();
    assert_eq!(all.len(), 12);
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 12);
}
