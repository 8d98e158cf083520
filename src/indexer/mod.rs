//! Scan and ingest pipeline.
//!
//! A scanner thread walks roots popped from the scan queue and feeds every
//! candidate image into the bounded ingest queue; an ingest thread drains it.
//! Each worker owns its own catalog connection. Producers block when the
//! ingest queue is full, which is the pipeline's only backpressure.

mod ingest;
pub mod progress;
pub mod queue;
mod scan;

pub use ingest::IngestOutcome;
pub use progress::{IndexerStats, IngestRecord, ProgressTracker, RootErrorLimiter};
pub use queue::WorkQueue;

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::db::Database;
use crate::embed::Embedder;
use crate::scanner::Thumbnailer;
use crate::vector::VectorIndex;

/// How long a worker waits on an empty queue before re-checking the stop flag.
const POP_TIMEOUT: Duration = Duration::from_millis(200);

/// Granularity of stop-aware sleeps.
const SLEEP_TICK: Duration = Duration::from_millis(100);

/// One candidate file, owned by a tracked root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTask {
    pub path: PathBuf,
    pub root_id: i64,
    pub root_path: PathBuf,
    /// Generation of the scan that queued this file. `None` for watcher
    /// events and embedding catch-up.
    pub scan: Option<u64>,
}

impl IndexTask {
    /// A task raised outside any scan.
    pub fn new(path: PathBuf, root_id: i64, root_path: PathBuf) -> Self {
        Self {
            path,
            root_id,
            root_path,
            scan: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTask {
    pub root_id: i64,
    pub root_path: PathBuf,
}

pub struct Indexer {
    db_path: PathBuf,
    thumbnailer: Arc<dyn Thumbnailer>,
    thumb_max_edge: u32,
    embedder: Option<Arc<dyn Embedder>>,
    vectors: Option<Arc<VectorIndex>>,
    ingest_queue: WorkQueue<IndexTask>,
    scan_queue: WorkQueue<ScanTask>,
    stop: AtomicBool,
    progress: ProgressTracker,
    root_errors: RootErrorLimiter,
    persist_interval: Duration,
    last_persist: Mutex<Instant>,
    shutdown_timeout: Duration,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Indexer {
    /// Embeddings are computed only when both `embedder` and `vectors` are
    /// present.
    pub fn new(
        config: &Config,
        thumbnailer: Arc<dyn Thumbnailer>,
        embedder: Option<Arc<dyn Embedder>>,
        vectors: Option<Arc<VectorIndex>>,
    ) -> Self {
        let pipeline = &config.pipeline;
        Self {
            db_path: config.db_path.clone(),
            thumbnailer,
            thumb_max_edge: config.thumbnails.max_edge,
            embedder,
            vectors,
            ingest_queue: WorkQueue::new(pipeline.ingest_queue_max),
            scan_queue: WorkQueue::new(pipeline.scan_queue_max),
            stop: AtomicBool::new(false),
            progress: ProgressTracker::new(pipeline.recent_max),
            root_errors: RootErrorLimiter::new(pipeline.root_error_interval()),
            persist_interval: config.index.persist_interval(),
            last_persist: Mutex::new(Instant::now()),
            shutdown_timeout: pipeline.shutdown_timeout(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn embedder(&self) -> Option<&Arc<dyn Embedder>> {
        self.embedder.as_ref()
    }

    pub fn vectors(&self) -> Option<&Arc<VectorIndex>> {
        self.vectors.as_ref()
    }

    /// The embedder and index together, or nothing when either is missing.
    fn embedding_backend(&self) -> Option<(&dyn Embedder, &VectorIndex)> {
        match (&self.embedder, &self.vectors) {
            (Some(embedder), Some(vectors)) => Some((embedder.as_ref(), vectors.as_ref())),
            _ => None,
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` in short ticks. Returns false if stop was
    /// requested meanwhile.
    pub fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopping() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_TICK.min(deadline - now));
        }
    }

    /// Spawn the scanner and ingest threads.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.spawn_worker("lighthouse-scanner", |indexer| {
            indexer.run_worker("scanner", |indexer, db| indexer.scan_next(db, POP_TIMEOUT));
        })?;
        self.spawn_worker("lighthouse-ingest", |indexer| {
            indexer.run_worker("ingest", |indexer, db| indexer.ingest_next(db, POP_TIMEOUT));
        })?;
        tracing::info!(
            ingest_capacity = self.ingest_queue.capacity(),
            scan_capacity = self.scan_queue.capacity(),
            embeddings = self.embedding_backend().is_some(),
            "Indexer started"
        );
        Ok(())
    }

    /// Run `f` on a named thread that [`Indexer::stop`] will wait for.
    pub fn spawn_worker<F>(self: &Arc<Self>, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(Arc<Indexer>) + Send + 'static,
    {
        let indexer = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || f(indexer))?;
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        Ok(())
    }

    /// Loop `step` until stop, opening this thread's catalog connection on
    /// first use.
    pub fn run_worker(&self, role: &str, step: impl Fn(&Indexer, &Database) -> bool) {
        let mut db: Option<Database> = None;
        while !self.is_stopping() {
            if db.is_none() {
                match Database::open(&self.db_path) {
                    Ok(conn) => db = Some(conn),
                    Err(e) => {
                        tracing::error!(worker = role, error = %e, "Worker cannot open catalog");
                        self.sleep_unless_stopped(Duration::from_secs(1));
                        continue;
                    }
                }
            }
            if let Some(db) = db.as_ref() {
                step(self, db);
            }
        }
        tracing::debug!(worker = role, "Worker stopped");
    }

    /// Signal every worker, wait a bounded time for each, then flush the
    /// vector index.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);

        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();

        for handle in handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            let deadline = Instant::now() + self.shutdown_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::error!(worker = %name, "Worker panicked");
                }
            } else {
                tracing::warn!(worker = %name, "Worker did not stop in time, detaching");
            }
        }

        if let Some(vectors) = &self.vectors {
            if let Err(e) = vectors.persist() {
                tracing::error!(error = %e, "Failed to persist vector index on shutdown");
            }
        }
        tracing::info!("Indexer stopped");
    }

    /// Queue one file, blocking while the ingest queue is full.
    pub fn enqueue(&self, task: IndexTask) -> bool {
        self.ingest_queue.push(task, &self.stop)
    }

    /// Queue a root scan, blocking while the scan queue is full.
    pub fn enqueue_scan_root(&self, root_id: i64, root_path: &Path) -> bool {
        let task = ScanTask {
            root_id,
            root_path: root_path.to_path_buf(),
        };
        self.scan_queue.push(task, &self.stop)
    }

    /// Queue photos lacking an embedding for the active model without ever
    /// blocking; stops at the first full slot.
    pub fn enqueue_missing_embeddings(&self, db: &Database) -> Result<usize> {
        let Some((embedder, _)) = self.embedding_backend() else {
            return Ok(0);
        };
        if !embedder.is_available() {
            return Ok(0);
        }
        let free = self
            .ingest_queue
            .capacity()
            .saturating_sub(self.ingest_queue.len());
        if free == 0 {
            return Ok(0);
        }

        let mut enqueued = 0;
        for missing in db.photos_missing_embedding(embedder.model_id(), free)? {
            let task = IndexTask::new(missing.path, missing.root_id, missing.root_path);
            if !self.ingest_queue.try_push(task) {
                break;
            }
            enqueued += 1;
        }
        Ok(enqueued)
    }

    pub fn stats(&self) -> IndexerStats {
        self.progress
            .snapshot(self.scan_queue.len(), self.ingest_queue.len())
    }

    pub fn recent_activity(&self, limit: usize) -> Vec<IngestRecord> {
        self.progress.recent_activity(limit)
    }

    pub fn forget_root(&self, root_id: i64) {
        self.progress.forget_root(root_id);
    }

    /// Record a root-level error: offline when the root path itself is gone,
    /// otherwise just the message.
    fn persist_root_error(&self, db: &Database, root_id: i64, root_path: &Path, message: &str) {
        let result = if root_path.exists() {
            db.set_root_error(root_id, message)
        } else {
            db.set_root_offline(root_id, Some(message))
        };
        if let Err(e) = result {
            tracing::warn!(root_id, error = %e, "Failed to record root error");
        }
    }

    fn maybe_mark_scan_finished(&self, db: &Database, root_id: i64) {
        if !self.progress.take_scan_finished(root_id) {
            return;
        }
        match db.mark_root_scan_finished(root_id) {
            Ok(()) => tracing::info!(root_id, "Root scan finished"),
            Err(e) => tracing::warn!(root_id, error = %e, "Failed to mark scan finished"),
        }
    }

    /// Flush the vector index if the persist interval has elapsed.
    fn maybe_persist_vectors(&self) {
        let Some(vectors) = &self.vectors else {
            return;
        };
        let mut last = self.last_persist.lock().unwrap_or_else(|e| e.into_inner());
        if last.elapsed() < self.persist_interval {
            return;
        }
        if let Err(e) = vectors.persist() {
            tracing::warn!(error = %e, "Failed to persist vector index");
        }
        *last = Instant::now();
    }
}
