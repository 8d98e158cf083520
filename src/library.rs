//! The running photo library: catalog, pipeline, watcher and search behind
//! one handle. An outer layer (web UI, CLI) talks only to [`Library`].

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::db::{with_thread_db, Database, RootStatus, TrackedRoot};
use crate::embed::{ClipEmbedder, Embedder};
use crate::indexer::{IndexTask, Indexer, IndexerStats, IngestRecord};
use crate::scanner::{ThumbnailManager, Thumbnailer};
use crate::search::{SearchPage, SearchRequest, Searcher};
use crate::tasks;
use crate::vector::VectorIndex;
use crate::watcher::{RootWatcher, WatchService};

#[derive(Debug, Clone, Serialize)]
pub struct RootSummary {
    #[serde(flatten)]
    pub root: TrackedRoot,
    pub photo_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LibraryStatus {
    pub roots: Vec<RootSummary>,
    pub photos_total: usize,
    pub embeddings_enabled: bool,
    pub model_id: Option<String>,
    pub indexer: IndexerStats,
}

pub struct Library {
    config: Config,
    indexer: Arc<Indexer>,
    thumbnails: Arc<dyn Thumbnailer>,
    vectors: Option<Arc<VectorIndex>>,
    watcher: Option<Arc<dyn WatchService>>,
    searcher: Searcher,
}

impl Library {
    /// Open (and migrate) the catalog and wire up every component. Only a
    /// catalog that cannot be opened is an error; a missing model or
    /// watcher degrades the library instead.
    pub fn open(config: Config) -> Result<Self> {
        let embedder: Option<Arc<dyn Embedder>> = if config.embedding.enabled {
            Some(Arc::new(ClipEmbedder::new(&config.embedding)))
        } else {
            tracing::info!("Embeddings disabled, search will match paths only");
            None
        };
        Self::open_with_embedder(config, embedder)
    }

    /// Like [`Library::open`] with a caller-supplied embedder. `None`
    /// disables embeddings and semantic search.
    pub fn open_with_embedder(config: Config, embedder: Option<Arc<dyn Embedder>>) -> Result<Self> {
        let db = Database::open(&config.db_path)
            .with_context(|| format!("Failed to open catalog {}", config.db_path.display()))?;
        db.initialize().context("Failed to migrate catalog")?;
        drop(db);

        let thumbnails: Arc<dyn Thumbnailer> = Arc::new(ThumbnailManager::new(&config.thumbnails));

        let vectors = embedder.as_ref().map(|embedder| {
            Arc::new(VectorIndex::new(
                &config.index,
                embedder.dimension(),
                embedder.model_id(),
            ))
        });

        let indexer = Arc::new(Indexer::new(
            &config,
            Arc::clone(&thumbnails),
            embedder.clone(),
            vectors.clone(),
        ));

        let watcher = match Self::make_watcher(&indexer) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "Filesystem watcher unavailable, relying on scans");
                None
            }
        };

        let searcher = Searcher::new(embedder, vectors.clone(), config.ranking.clone());

        tracing::info!(db = %config.db_path.display(), "Library opened");
        Ok(Self {
            config,
            indexer,
            thumbnails,
            vectors,
            watcher,
            searcher,
        })
    }

    fn make_watcher(indexer: &Arc<Indexer>) -> Result<Arc<dyn WatchService>> {
        let indexer = Arc::clone(indexer);
        let watcher = RootWatcher::new(Arc::new(move |root_id: i64, root_path: &Path, path: PathBuf| {
            indexer.enqueue(IndexTask::new(path, root_id, root_path.to_path_buf()));
        }))?;
        Ok(Arc::new(watcher))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    /// Start the pipeline and maintenance threads, and rescan every root
    /// that was online when the library was last running.
    pub fn start(&self) -> Result<()> {
        self.indexer.start()?;
        tasks::spawn_monitor(
            &self.indexer,
            self.watcher.clone(),
            self.config.pipeline.monitor_interval(),
        )?;
        tasks::spawn_catchup(&self.indexer)?;

        let roots = self.with_db(|db| db.list_roots())?;
        for root in roots.iter().filter(|r| r.status == RootStatus::Online) {
            self.indexer.enqueue_scan_root(root.id, &root.path);
        }
        Ok(())
    }

    /// The tracked root at `path`, if any.
    pub fn find_root(&self, path: &Path) -> Result<Option<TrackedRoot>> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.with_db(|db| db.find_root_by_path(&path))
    }

    /// Track `path` (or return the existing root for it) and scan it.
    pub fn track_root(&self, path: &Path) -> Result<TrackedRoot> {
        let path = path
            .canonicalize()
            .with_context(|| format!("Cannot track {}", path.display()))?;
        if !path.is_dir() {
            anyhow::bail!("Not a directory: {}", path.display());
        }

        let root = self.with_db(|db| {
            let root = db.add_root(&path)?;
            db.set_root_online(root.id)?;
            Ok(root)
        })?;
        tracing::info!(root_id = root.id, path = %path.display(), "Tracking root");

        self.indexer.enqueue_scan_root(root.id, &root.path);
        if let Some(watcher) = &self.watcher {
            if let Err(e) = watcher.watch(root.id, &root.path) {
                tracing::warn!(root_id = root.id, error = %format!("{:#}", e), "Failed to watch root");
            }
        }

        self.with_db(|db| db.get_root(root.id))?
            .context("Root vanished right after tracking")
    }

    /// Stop tracking a root. Its photos, vector labels and thumbnails go
    /// with it; the files themselves are untouched. Returns false for an
    /// unknown root.
    pub fn untrack_root(&self, root_id: i64) -> Result<bool> {
        let Some(photo_ids) = self.with_db(|db| {
            if db.get_root(root_id)?.is_none() {
                return Ok(None);
            }
            let ids = db.photo_ids_for_root(root_id)?;
            db.remove_root(root_id)?;
            Ok(Some(ids))
        })?
        else {
            return Ok(false);
        };

        if let Some(watcher) = &self.watcher {
            watcher.unwatch(root_id);
        }
        self.indexer.forget_root(root_id);

        if let Some(vectors) = &self.vectors {
            if let Err(e) = vectors.delete_many(&photo_ids) {
                tracing::warn!(root_id, error = %e, "Failed to drop vector labels");
            }
        }
        for id in &photo_ids {
            if let Err(e) = self.thumbnails.remove(*id) {
                tracing::warn!(photo_id = *id, error = %format!("{:#}", e), "Failed to remove thumbnail");
            }
        }

        tracing::info!(root_id, photos = photo_ids.len(), "Root untracked");
        Ok(true)
    }

    /// Queue a scan of every root whose path is present. Returns how many
    /// were queued.
    pub fn rescan_all(&self) -> Result<usize> {
        let roots = self.with_db(|db| db.list_roots())?;
        let mut queued = 0;
        for root in roots.iter().filter(|r| r.path.exists()) {
            if self.indexer.enqueue_scan_root(root.id, &root.path) {
                queued += 1;
            }
        }
        Ok(queued)
    }

    pub fn status(&self) -> Result<LibraryStatus> {
        let roots = self.with_db(|db| {
            db.list_roots()?
                .into_iter()
                .map(|root| {
                    let photo_count = db.count_photos_in_root(root.id)?;
                    Ok(RootSummary { root, photo_count })
                })
                .collect::<Result<Vec<_>>>()
        })?;
        let photos_total = roots.iter().map(|r| r.photo_count).sum();

        Ok(LibraryStatus {
            roots,
            photos_total,
            embeddings_enabled: self.vectors.is_some(),
            model_id: self.vectors.as_ref().map(|v| v.model_id().to_string()),
            indexer: self.indexer.stats(),
        })
    }

    pub fn recent_activity(&self, limit: usize) -> Vec<IngestRecord> {
        self.indexer.recent_activity(limit)
    }

    pub fn search(&self, request: &SearchRequest) -> Result<SearchPage> {
        self.with_db(|db| self.searcher.search(db, request))
    }

    /// Stop every thread and flush the vector index.
    pub fn shutdown(&self) {
        tracing::info!("Library shutting down");
        self.indexer.stop();
    }

    fn with_db<R>(&self, f: impl FnOnce(&Database) -> Result<R>) -> Result<R> {
        with_thread_db(&self.config.db_path, f)
    }
}
