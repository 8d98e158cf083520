use anyhow::{bail, Result};
use std::time::Duration;

use crate::db::Database;
use crate::scanner::walk_images;

use super::{IndexTask, Indexer, ScanTask};

impl Indexer {
    /// Pop one scan task and run it. Returns false if none arrived within
    /// `timeout`.
    pub fn scan_next(&self, db: &Database, timeout: Duration) -> bool {
        let Some(task) = self.scan_queue.pop_timeout(timeout) else {
            return false;
        };
        self.run_scan(db, &task);
        true
    }

    fn run_scan(&self, db: &Database, task: &ScanTask) {
        match db.get_root(task.root_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::debug!(root_id = task.root_id, "Skipping scan of untracked root");
                return;
            }
            Err(e) => {
                tracing::warn!(root_id = task.root_id, error = %e, "Root lookup failed before scan");
            }
        }

        tracing::info!(root_id = task.root_id, path = %task.root_path.display(), "Scan started");
        let generation = self.progress.begin_scan(task.root_id, &task.root_path);

        if let Err(e) = self.enumerate_root(db, task, generation) {
            let failed_path = self
                .progress
                .scan_current_path(task.root_id)
                .unwrap_or_else(|| task.root_path.clone());
            let message = format!("Scan failed: {:#}", e);
            tracing::error!(
                root_id = task.root_id,
                path = %failed_path.display(),
                error = %e,
                "Scan failed"
            );
            self.progress.scan_error(task.root_id);
            self.progress.record_failure(task.root_id, &failed_path, &message);
            self.persist_root_error(db, task.root_id, &task.root_path, &message);
        }

        self.progress
            .end_scan(task.root_id, self.scan_queue.is_empty());
    }

    fn enumerate_root(&self, db: &Database, task: &ScanTask, generation: u64) -> Result<()> {
        db.begin_root_scan(task.root_id)?;
        if !task.root_path.exists() {
            bail!("Root path unavailable: {}", task.root_path.display());
        }

        let on_error = |err: &walkdir::Error| self.on_walk_error(db, task, err);
        for path in walk_images(&task.root_path, on_error) {
            self.progress.scan_found(task.root_id, &path);
            let queued = self.enqueue(IndexTask {
                path,
                root_id: task.root_id,
                root_path: task.root_path.clone(),
                scan: Some(generation),
            });
            if !queued {
                tracing::debug!(root_id = task.root_id, "Scan interrupted by shutdown");
                return Ok(());
            }
            self.progress.scan_enqueued(task.root_id);
        }

        db.mark_root_enumerated(task.root_id)?;
        self.progress.scan_enumerated(task.root_id);
        tracing::info!(root_id = task.root_id, "Root enumerated");
        self.maybe_mark_scan_finished(db, task.root_id);
        Ok(())
    }

    /// A directory inside the root could not be read. The walk continues.
    fn on_walk_error(&self, db: &Database, task: &ScanTask, err: &walkdir::Error) {
        let bad_path = err.path().unwrap_or(task.root_path.as_path());
        let message = format!("Scan path error: {} ({})", bad_path.display(), err);
        tracing::warn!(
            root_id = task.root_id,
            path = %bad_path.display(),
            error = %err,
            "Scan path error"
        );

        self.progress.scan_error(task.root_id);
        self.progress.record_failure(task.root_id, bad_path, &message);
        if self.root_errors.allow(task.root_id) {
            self.persist_root_error(db, task.root_id, &task.root_path, &message);
        }
    }
}
